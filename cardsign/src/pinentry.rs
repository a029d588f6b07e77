// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! PIN entry through a `pinentry` program.
//!
//! The program speaks the Assuan protocol on its standard input and output:
//! every request is a single line, every response ends with an `OK` or `ERR`
//! line, and data lines start with `D ` and are percent-escaped.

use std::{
    io::{self, BufRead, Read, Write},
    path::PathBuf,
    process::{Command, Stdio},
};

use zeroize::Zeroizing;

use crate::{
    credentials::{Pin, PinPrompt},
    error::CredentialError,
    job::CertificateIdentity,
};

// Assuan limits a line to 1000 bytes, including the line feed.
const LINE_CAPACITY: usize = 1000;

/// Prompts for the PIN with an external pinentry program.
#[derive(Debug, Clone)]
pub struct PinentryPrompt {
    program: PathBuf,
}

impl PinentryPrompt {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl PinPrompt for PinentryPrompt {
    fn prompt(&self, identity: &CertificateIdentity) -> Result<Pin, CredentialError> {
        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| {
                CredentialError::Prompt(format!(
                    "failed to start {}: {error}",
                    self.program.display()
                ))
            })?;

        let result = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => {
                Assuan::new(ZeroizingReader::new(stdout), stdin).get_pin(identity, &Terminal::current())
            }
            _ => Err(CredentialError::Prompt(
                "pinentry standard streams are unavailable".into(),
            )),
        };
        // The pipes are closed at this point, so pinentry exits on its own.
        if result.is_err() {
            let _ = child.kill();
        }
        if let Err(error) = child.wait() {
            tracing::warn!(%error, "Failed to reap the pinentry process");
        }

        result
    }
}

/// The terminal pinentry should use when it has no graphical display.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Terminal {
    name: Option<String>,
    kind: Option<String>,
}

impl Terminal {
    fn current() -> Self {
        let name = nix::unistd::ttyname(std::io::stdin())
            .ok()
            .and_then(|path| path.to_str().map(str::to_string));
        let kind = std::env::var("TERM").ok();
        Self { name, kind }
    }
}

/// A buffered reader that wipes its buffer when dropped.
///
/// The buffer holds the `D` line carrying the PIN.
struct ZeroizingReader<R> {
    inner: R,
    buffer: Zeroizing<Vec<u8>>,
    position: usize,
    filled: usize,
}

impl<R: Read> ZeroizingReader<R> {
    fn new(inner: R) -> Self {
        Self::with_capacity(LINE_CAPACITY, inner)
    }

    fn with_capacity(capacity: usize, inner: R) -> Self {
        Self {
            inner,
            buffer: Zeroizing::new(vec![0; capacity]),
            position: 0,
            filled: 0,
        }
    }
}

impl<R: Read> Read for ZeroizingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let len = available.len().min(out.len());
        out[..len].copy_from_slice(&available[..len]);
        self.consume(len);
        Ok(len)
    }
}

impl<R: Read> BufRead for ZeroizingReader<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.position >= self.filled {
            self.filled = self.inner.read(self.buffer.as_mut_slice())?;
            self.position = 0;
        }
        Ok(&self.buffer[self.position..self.filled])
    }

    fn consume(&mut self, amount: usize) {
        self.position = (self.position + amount).min(self.filled);
    }
}

/// The client half of an Assuan conversation.
struct Assuan<R, W> {
    reader: R,
    writer: W,
}

impl<R: BufRead, W: Write> Assuan<R, W> {
    fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    fn get_pin(
        &mut self,
        identity: &CertificateIdentity,
        terminal: &Terminal,
    ) -> Result<Pin, CredentialError> {
        // Greeting.
        self.response()?;

        if let Some(name) = &terminal.name {
            self.command(&format!("OPTION ttyname={name}"))?;
        }
        if let Some(kind) = &terminal.kind {
            self.command(&format!("OPTION ttytype={kind}"))?;
        }
        self.command("SETTITLE Code Sign")?;
        let description = format!(
            "Please enter the PIN for key container {}\non smart card {}\nin reader {}.",
            identity.cert_id, identity.card_name, identity.card_reader
        );
        self.command(&format!("SETDESC {}", escape(&description)))?;
        self.command("SETPROMPT PIN:")?;

        self.send("GETPIN")?;
        let pin = match self.response() {
            Ok(Some(data)) if !data.is_empty() => {
                let pin = std::str::from_utf8(&data).map_err(|_| {
                    CredentialError::Prompt("pinentry returned a PIN that is not UTF-8".into())
                })?;
                Pin::new(pin)
            }
            Ok(_) => return Err(CredentialError::Cancelled),
            Err(CredentialError::Prompt(message)) => {
                tracing::info!(%message, "PIN entry was not completed");
                return Err(CredentialError::Cancelled);
            }
            Err(error) => return Err(error),
        };

        if let Err(error) = self.command("BYE") {
            tracing::debug!(%error, "pinentry did not acknowledge BYE");
        }

        Ok(pin)
    }

    fn send(&mut self, line: &str) -> Result<(), CredentialError> {
        writeln!(self.writer, "{line}")
            .and_then(|_| self.writer.flush())
            .map_err(|error| CredentialError::Prompt(format!("failed to write to pinentry: {error}")))
    }

    fn command(&mut self, line: &str) -> Result<(), CredentialError> {
        self.send(line)?;
        self.response().map(|_| ())
    }

    // Read lines up to and including the final `OK` or `ERR`, returning the
    // decoded data lines, if any were sent.
    fn response(&mut self) -> Result<Option<Zeroizing<Vec<u8>>>, CredentialError> {
        let mut data: Option<Zeroizing<Vec<u8>>> = None;
        loop {
            let mut line = Zeroizing::new(String::with_capacity(LINE_CAPACITY));
            let read = self.reader.read_line(&mut line).map_err(|error| {
                CredentialError::Prompt(format!("failed to read from pinentry: {error}"))
            })?;
            if read == 0 {
                return Err(CredentialError::Prompt(
                    "pinentry closed the connection".into(),
                ));
            }
            let line = line.trim_end_matches(['\r', '\n']);

            if line == "OK" || line.starts_with("OK ") {
                return Ok(data);
            } else if let Some(message) = line.strip_prefix("ERR") {
                return Err(CredentialError::Prompt(message.trim().to_string()));
            } else if let Some(chunk) = line.strip_prefix("D ") {
                unescape_into(
                    chunk,
                    data.get_or_insert_with(|| Zeroizing::new(Vec::with_capacity(LINE_CAPACITY))),
                );
            } else if line.starts_with("INQUIRE") {
                self.send("END")?;
            }
            // Status (`S`) and comment (`#`) lines carry nothing we need.
        }
    }
}

/// Percent-escape `%` and control characters for an Assuan argument.
fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '%' || c.is_ascii_control() {
            escaped.push_str(&format!("%{:02X}", u32::from(c)));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

fn unescape_into(chunk: &str, out: &mut Vec<u8>) {
    let bytes = chunk.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = hex {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn identity() -> CertificateIdentity {
        CertificateIdentity::new("C1", "CardA", "Reader 1")
    }

    fn converse(responses: &str, terminal: &Terminal) -> (Result<Pin, CredentialError>, String) {
        let mut sent = vec![];
        // A small buffer makes every response span several reads.
        let reader = ZeroizingReader::with_capacity(7, Cursor::new(responses.as_bytes().to_vec()));
        let result = Assuan::new(reader, &mut sent)
            .get_pin(&identity(), terminal);
        (result, String::from_utf8(sent).expect("requests are UTF-8"))
    }

    #[test]
    fn escaping() {
        assert_eq!(escape("100% sure\nreally"), "100%25 sure%0Areally");
        assert_eq!(escape("Kartenleser \u{e4}"), "Kartenleser \u{e4}");

        let mut out = vec![];
        unescape_into("12%2534%0A", &mut out);
        assert_eq!(out, b"12%34\n");

        // A truncated escape is kept literally.
        let mut out = vec![];
        unescape_into("ab%4", &mut out);
        assert_eq!(out, b"ab%4");
    }

    #[test]
    fn pin_is_read_from_data_lines() {
        let responses = "OK Pleased to meet you\nOK\nOK\nOK\nS PIN_REPEATED\nD 12%2534\nOK\nOK closing connection\n";
        let (result, sent) = converse(responses, &Terminal::default());

        assert_eq!(result.expect("PIN").expose(), "12%34");
        assert_eq!(
            sent,
            "SETTITLE Code Sign\n\
             SETDESC Please enter the PIN for key container C1%0Aon smart card CardA%0Ain reader Reader 1.\n\
             SETPROMPT PIN:\n\
             GETPIN\n\
             BYE\n"
        );
    }

    #[test]
    fn terminal_options_are_sent() {
        let terminal = Terminal {
            name: Some("/dev/pts/3".into()),
            kind: Some("xterm".into()),
        };
        let responses = "OK\nOK\nOK\nOK\nOK\nOK\nD 1234\nOK\nOK\n";
        let (result, sent) = converse(responses, &terminal);

        assert_eq!(result.expect("PIN").expose(), "1234");
        assert!(sent.starts_with("OPTION ttyname=/dev/pts/3\nOPTION ttytype=xterm\n"));
    }

    #[test]
    fn cancel_and_empty_pin() {
        let cancelled = "OK\nOK\nOK\nOK\nERR 83886179 Operation cancelled <Pinentry>\n";
        assert!(matches!(
            converse(cancelled, &Terminal::default()).0,
            Err(CredentialError::Cancelled)
        ));

        let empty = "OK\nOK\nOK\nOK\nOK\nOK\n";
        assert!(matches!(
            converse(empty, &Terminal::default()).0,
            Err(CredentialError::Cancelled)
        ));
    }

    #[test]
    fn early_eof_is_a_prompt_failure() {
        assert!(matches!(
            converse("OK\nOK\n", &Terminal::default()).0,
            Err(CredentialError::Prompt(_))
        ));
    }

    #[test]
    fn inquiries_are_declined() {
        let responses = "OK\nOK\nOK\nOK\nINQUIRE QUALITY 1234\nD 1234\nOK\nOK\n";
        let (result, sent) = converse(responses, &Terminal::default());
        assert_eq!(result.expect("PIN").expose(), "1234");
        assert!(sent.contains("GETPIN\nEND\n"));
    }

    #[test]
    fn zeroizing_reader_reassembles_lines() -> io::Result<()> {
        let mut reader = ZeroizingReader::with_capacity(3, Cursor::new(b"D 1234\nOK\n".to_vec()));
        let mut line = String::new();
        reader.read_line(&mut line)?;
        assert_eq!(line, "D 1234\n");
        line.clear();
        reader.read_line(&mut line)?;
        assert_eq!(line, "OK\n");
        line.clear();
        assert_eq!(reader.read_line(&mut line)?, 0);
        Ok(())
    }

    #[test]
    fn missing_program() {
        let prompt = PinentryPrompt::new("/nonexistent/pinentry");
        assert!(matches!(
            prompt.prompt(&identity()),
            Err(CredentialError::Prompt(_))
        ));
    }
}
