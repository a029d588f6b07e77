// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Running the signing tool for a single job.
//!
//! The tool's standard output and standard error share one pipe, which the
//! orchestrator drains chunk by chunk through [`RunningJob::read`] and
//! [`RunningJob::decode`]. Once the pipe reports end-of-stream the job is
//! classified by [`RunningJob::finish`].

use std::{
    fmt,
    os::unix::process::ExitStatusExt,
    path::Path,
    process::Stdio,
};

use nix::{fcntl::OFlag, unistd::pipe2};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::unix::pipe,
    process::{Child, Command},
};
use zeroize::Zeroizing;

use crate::{
    decoder::OutputDecoder,
    job::{JobLog, JobState},
};

const READ_CHUNK: usize = 4096;

/// Environment handed to every signing tool so it writes UTF-8 in English.
const CHILD_ENVIRONMENT: [(&str, &str); 6] = [
    ("LANG", "C.UTF-8"),
    ("LC_ALL", "C.UTF-8"),
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONUTF8", "1"),
    ("DOTNET_CLI_UI_LANGUAGE", "en"),
    ("DOTNET_CLI_FORCE_UTF8_ENCODING", "1"),
];

/// How the PIN reaches the signing tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDelivery {
    /// The template references `%2`; the PIN is part of the arguments.
    Argument,
    /// The PIN is written to the tool's standard input as UTF-8.
    Stdin,
}

/// The argument vector for one signing tool invocation.
///
/// The arguments may contain the PIN and are zeroed when dropped.
pub struct CommandLine {
    args: Zeroizing<Vec<String>>,
    delivery: PinDelivery,
}

impl CommandLine {
    /// Expand a command line template for `path` and `pin`.
    ///
    /// Whitespace separates arguments and double quotes group them; `\"` is a
    /// literal quote. `%1` expands to the path, `%2` to the PIN, and `%` followed
    /// by any other character expands to that character. A `%` at the very end
    /// is dropped.
    pub fn build(template: &str, path: &str, pin: &str) -> Self {
        // Sized so expanding a placeholder never reallocates a buffer holding the PIN.
        let capacity =
            template.len() + template.matches('%').count() * path.len().max(pin.len());
        let mut args = Zeroizing::new(Vec::new());
        let mut current = Zeroizing::new(String::with_capacity(capacity));
        let mut in_argument = false;
        let mut quoted = false;
        let mut delivery = PinDelivery::Stdin;

        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\\' if chars.peek() == Some(&'"') => {
                    chars.next();
                    current.push('"');
                    in_argument = true;
                }
                '"' => {
                    quoted = !quoted;
                    in_argument = true;
                }
                '%' => match chars.next() {
                    Some('1') => {
                        current.push_str(path);
                        in_argument = true;
                    }
                    Some('2') => {
                        current.push_str(pin);
                        delivery = PinDelivery::Argument;
                        in_argument = true;
                    }
                    Some(other) => {
                        current.push(other);
                        in_argument = true;
                    }
                    None => {}
                },
                c if c.is_whitespace() && !quoted => {
                    if in_argument {
                        args.push(String::clone(&current));
                        current.clear();
                        in_argument = false;
                    }
                }
                c => {
                    current.push(c);
                    in_argument = true;
                }
            }
        }
        if in_argument {
            args.push(String::clone(&current));
        }

        Self { args, delivery }
    }

    /// The program to run, if the template named one.
    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    pub fn delivery(&self) -> PinDelivery {
        self.delivery
    }

    #[cfg(test)]
    fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Debug for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandLine")
            .field("program", &self.program())
            .field("arguments", &self.args.len().saturating_sub(1))
            .field("delivery", &self.delivery)
            .finish()
    }
}

/// A signing tool that has been started and whose output is being captured.
#[derive(Debug)]
pub struct RunningJob {
    index: usize,
    child: Child,
    output: pipe::Receiver,
    decoder: OutputDecoder,
    buffer: Box<[u8; READ_CHUNK]>,
}

/// Start the signing tool for the job at `index` of the queue.
///
/// `pin` is written to the tool's standard input unless the command line
/// already carries it. On failure the terminal state for the job is returned
/// and the reason is noted in `log`.
#[tracing::instrument(skip(command, pin, log), fields(program = command.program()))]
pub async fn start(
    index: usize,
    command: CommandLine,
    pin: &str,
    workdir: &Path,
    log: &mut JobLog,
) -> Result<RunningJob, JobState> {
    let Some(program) = command.program() else {
        log.note("The signing command is empty.");
        return Err(JobState::AppNotFound);
    };

    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(|error| {
        tracing::error!(%error, "Failed to create the output pipe");
        log.note(&format!("Failed to create the output pipe: {error}"));
        JobState::BrokenPipe
    })?;
    let stderr_end = write_end.try_clone().map_err(|error| {
        tracing::error!(%error, "Failed to duplicate the output pipe");
        log.note(&format!("Failed to create the output pipe: {error}"));
        JobState::BrokenPipe
    })?;
    let output = pipe::Receiver::from_owned_fd(read_end).map_err(|error| {
        tracing::error!(%error, "Failed to register the output pipe");
        log.note(&format!("Failed to create the output pipe: {error}"));
        JobState::BrokenPipe
    })?;

    let stdin = match command.delivery() {
        PinDelivery::Argument => Stdio::null(),
        PinDelivery::Stdin => Stdio::piped(),
    };
    let mut child = Command::new(program)
        .args(&command.args[1..])
        .envs(CHILD_ENVIRONMENT)
        .current_dir(workdir)
        .stdin(stdin)
        .stdout(Stdio::from(write_end))
        .stderr(Stdio::from(stderr_end))
        .spawn()
        .map_err(|error| {
            tracing::warn!(%error, "Failed to start the signing tool");
            log.note(&format!("Failed to start {program}: {error}"));
            JobState::AppNotFound
        })?;
    // The arguments may hold the PIN.
    drop(command);
    tracing::debug!(pid = child.id(), "Signing tool started");

    if let Some(mut stdin) = child.stdin.take() {
        let written = async {
            stdin.write_all(pin.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        drop(stdin);
        if let Err(error) = written {
            tracing::warn!(%error, "Failed to pass the PIN to the signing tool");
            log.note(&format!("Failed to pass the PIN to the signing tool: {error}"));
            if let Err(error) = child.kill().await {
                tracing::error!(%error, "Failed to stop the signing tool");
            }
            return Err(JobState::PinMissing);
        }
    }

    Ok(RunningJob {
        index,
        child,
        output,
        decoder: OutputDecoder::default(),
        buffer: Box::new([0; READ_CHUNK]),
    })
}

impl RunningJob {
    /// The queue index of the job this tool is running for.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Wait for the next chunk of output; zero means end-of-stream.
    ///
    /// This is cancel safe: no data is lost if the future is dropped.
    pub async fn read(&mut self) -> std::io::Result<usize> {
        self.output.read(self.buffer.as_mut_slice()).await
    }

    /// Decode the first `len` bytes of the last chunk into `log`.
    pub fn decode(&mut self, len: usize, log: &mut JobLog) -> bool {
        self.decoder.feed(&self.buffer[..len], log)
    }

    /// Wait for the tool to exit and classify the outcome.
    #[tracing::instrument(skip_all, fields(index = self.index))]
    pub async fn finish(mut self, log: &mut JobLog) -> JobState {
        match self.child.wait().await {
            Ok(status) if status.success() => {
                tracing::info!("Signing tool succeeded");
                JobState::Ok
            }
            Ok(status) => {
                tracing::warn!(%status, "Signing tool failed");
                if let Some(code) = status.code() {
                    log.note(&format!("Command failed with exit code {code}."));
                } else if let Some(signal) = status.signal() {
                    log.note(&format!("Command was terminated by signal {signal}."));
                }
                JobState::Fail
            }
            Err(error) => {
                tracing::error!(%error, "Failed to wait for the signing tool");
                log.note(&format!("Failed to wait for the command: {error}"));
                JobState::Fail
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workdir() -> std::path::PathBuf {
        std::env::temp_dir()
    }

    async fn run(template: &str, path: &str, pin: &str) -> (JobState, JobLog) {
        let mut log = JobLog::default();
        let command = CommandLine::build(template, path, pin);
        let mut running = match start(0, command, pin, &workdir(), &mut log).await {
            Ok(running) => running,
            Err(state) => return (state, log),
        };
        while let Ok(len @ 1..) = running.read().await {
            running.decode(len, &mut log);
        }
        let state = running.finish(&mut log).await;
        (state, log)
    }

    #[test]
    fn templates_expand_placeholders() {
        let command = CommandLine::build("signtool sign /f %1 /p %2", "/tmp/a.exe", "1234");
        assert_eq!(
            command.args(),
            ["signtool", "sign", "/f", "/tmp/a.exe", "/p", "1234"]
        );
        assert_eq!(command.delivery(), PinDelivery::Argument);

        let command = CommandLine::build("tool --pin-stdin %1", "/tmp/a b.exe", "1234");
        assert_eq!(command.args(), ["tool", "--pin-stdin", "/tmp/a b.exe"]);
        assert_eq!(command.delivery(), PinDelivery::Stdin);
    }

    #[test]
    fn templates_quote_and_escape() {
        let command = CommandLine::build(
            r#""/opt/sign tool/bin" --desc "100%% \"safe\"" %x %"#,
            "f",
            "p",
        );
        assert_eq!(
            command.args(),
            ["/opt/sign tool/bin", "--desc", "100% \"safe\"", "x"]
        );

        let command = CommandLine::build(r#"tool "" %1"#, "f", "p");
        assert_eq!(command.args(), ["tool", "", "f"]);

        assert_eq!(CommandLine::build("   ", "f", "p").program(), None);
    }

    #[test]
    fn trailing_percent_adds_no_argument() {
        let command = CommandLine::build("tool %1 %", "/tmp/a.exe", "1234");
        assert_eq!(command.args(), ["tool", "/tmp/a.exe"]);

        let command = CommandLine::build("tool %1%", "/tmp/a.exe", "1234");
        assert_eq!(command.args(), ["tool", "/tmp/a.exe"]);
    }

    #[test]
    fn repeated_placeholders_expand_every_time() {
        let command = CommandLine::build("tool %2%2 %1=%1", "f", "123456");
        assert_eq!(command.args(), ["tool", "123456123456", "f=f"]);
        assert_eq!(command.delivery(), PinDelivery::Argument);
    }

    #[test]
    fn debug_hides_arguments() {
        let command = CommandLine::build("tool %2", "f", "secret-pin");
        let debug = format!("{command:?}");
        assert!(!debug.contains("secret-pin"));
        assert!(debug.contains("tool"));
    }

    #[tokio::test]
    async fn exit_zero_is_ok() {
        let (state, log) = run("sh -c \"echo signed $0\" %1 %2", "/tmp/a.exe", "1234").await;
        assert_eq!(state, JobState::Ok);
        assert_eq!(log.as_str(), "signed /tmp/a.exe\r\n");
    }

    #[tokio::test]
    async fn stdout_and_stderr_are_merged_and_exit_code_noted() {
        let (state, log) = run(
            "sh -c \"echo out; echo err >&2; exit 3\" %2",
            "/tmp/a.exe",
            "1234",
        )
        .await;
        assert_eq!(state, JobState::Fail);
        assert!(log.as_str().starts_with("out\r\nerr\r\n"), "{}", log.as_str());
        assert!(log.as_str().ends_with("\r\nCommand failed with exit code 3."));
    }

    #[tokio::test]
    async fn pin_is_written_to_stdin() {
        let (state, log) = run("cat", "/tmp/a.exe", "12\u{e4}4").await;
        assert_eq!(state, JobState::Ok);
        assert_eq!(log.as_str(), "12\u{e4}4");
    }

    #[tokio::test]
    async fn child_gets_utf8_environment_and_workdir() {
        let (state, log) = run("sh -c \"echo $LC_ALL; pwd\" %2", "f", "p").await;
        assert_eq!(state, JobState::Ok);
        let expected = format!("C.UTF-8\r\n{}\r\n", workdir().canonicalize().unwrap().display());
        assert_eq!(log.as_str(), expected);
    }

    #[tokio::test]
    async fn missing_tool_is_app_not_found() {
        let (state, log) = run("/nonexistent/signtool %1 %2", "f", "p").await;
        assert_eq!(state, JobState::AppNotFound);
        assert!(log.as_str().contains("Failed to start /nonexistent/signtool"));

        let (state, _) = run("", "f", "p").await;
        assert_eq!(state, JobState::AppNotFound);
    }

    #[tokio::test]
    async fn killed_tool_fails() {
        let (state, log) = run("sh -c \"kill -9 $$\" %2", "f", "p").await;
        assert_eq!(state, JobState::Fail);
        assert!(log.as_str().contains("terminated by signal 9"));
    }
}
