// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The job submission protocol spoken between instances.
//!
//! A client sends exactly one frame and then closes its end of the channel. A
//! frame is a sequence of strings, each encoded as UTF-16 little-endian code
//! units and terminated by a 0x0000 unit:
//!
//! 1. CERT_ID - the key container identifier.
//! 2. CARD_NAME - the smart card name.
//! 3. CARD_READER - the reader holding the card.
//! 4. SIGN_COMMAND - the signing command line template.
//! 5. FILE... - zero or more paths to sign, until the channel is closed.
//!
//! There is no length prefix and no end marker; the end of the connection ends
//! the file list. No file is accepted before all four header strings arrived.

use std::{path::PathBuf, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::{ChannelError, ProtocolError},
    job::CertificateIdentity,
};

/// The maximum length of a single string, in UTF-16 code units.
pub const MAX_STRING_UNITS: usize = 4 * 1024;

const TERMINATOR: [u8; 2] = [0, 0];

/// Encode one string with its terminator.
pub fn encode_string(value: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity((value.len() + 1) * 2);
    for unit in value.encode_utf16() {
        buf.put_u16_le(unit);
    }
    buf.put_slice(&TERMINATOR);
    buf.freeze()
}

/// Everything a client hands over to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub identity: CertificateIdentity,
    pub sign_command: String,
    pub files: Vec<PathBuf>,
}

impl Submission {
    /// Build a submission, making every file path absolute.
    pub fn new(
        identity: CertificateIdentity,
        sign_command: impl Into<String>,
        files: &[PathBuf],
    ) -> std::io::Result<Self> {
        let files = files
            .iter()
            .map(std::path::absolute)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            identity,
            sign_command: sign_command.into(),
            files,
        })
    }

    /// The frame as a list of encoded strings, in transmission order.
    pub fn encode(&self) -> Result<Vec<Bytes>, ChannelError> {
        let mut strings = vec![
            encode_string(&self.identity.cert_id),
            encode_string(&self.identity.card_name),
            encode_string(&self.identity.card_reader),
            encode_string(&self.sign_command),
        ];
        for file in &self.files {
            let path = file
                .to_str()
                .ok_or_else(|| ChannelError::NonUnicodePath(file.clone()))?;
            strings.push(encode_string(path));
        }

        Ok(strings)
    }
}

/// One file decoded from a frame, bound to the frame's header.
#[derive(Debug, Clone)]
pub struct FileRequest {
    /// Shared by every file of the frame.
    pub identity: Arc<CertificateIdentity>,
    /// Shared by every file of the frame.
    pub sign_command: Arc<str>,
    pub path: PathBuf,
}

/// Which string the decoder expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    CertId,
    CardName,
    CardReader,
    SignCommand,
    File,
}

/// Reassembles a frame from chunks of arbitrary size.
///
/// A new decoder must be used for every connection.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    // Units already known not to be a terminator.
    scanned: usize,
    expect: Expect,
    identity: CertificateIdentity,
    header: Option<(Arc<CertificateIdentity>, Arc<str>)>,
    files: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            buffer: BytesMut::with_capacity(MAX_STRING_UNITS * 2),
            scanned: 0,
            expect: Expect::CertId,
            identity: CertificateIdentity::default(),
            header: None,
            files: 0,
        }
    }
}

impl FrameDecoder {
    /// Consume the next chunk of the connection.
    ///
    /// Every complete file path is handed to `sink` as soon as it is decoded,
    /// so files decoded before an error remain accepted.
    pub fn push<F>(&mut self, bytes: &[u8], mut sink: F) -> Result<(), ProtocolError>
    where
        F: FnMut(FileRequest),
    {
        self.buffer.extend_from_slice(bytes);
        while let Some(token) = self.next_token()? {
            match self.expect {
                Expect::CertId => {
                    self.identity.cert_id = token;
                    self.expect = Expect::CardName;
                }
                Expect::CardName => {
                    self.identity.card_name = token;
                    self.expect = Expect::CardReader;
                }
                Expect::CardReader => {
                    self.identity.card_reader = token;
                    self.expect = Expect::SignCommand;
                }
                Expect::SignCommand => {
                    let identity = Arc::new(std::mem::take(&mut self.identity));
                    tracing::debug!(%identity, "Received submission header");
                    self.header = Some((identity, Arc::from(token)));
                    self.expect = Expect::File;
                }
                Expect::File => {
                    if let Some((identity, sign_command)) = &self.header {
                        self.files += 1;
                        sink(FileRequest {
                            identity: identity.clone(),
                            sign_command: sign_command.clone(),
                            path: PathBuf::from(token),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    /// Check the state of the frame once the connection has closed.
    ///
    /// Returns the number of files received.
    pub fn finish(self) -> Result<usize, ProtocolError> {
        let headers = match self.expect {
            Expect::CertId => 0,
            Expect::CardName => 1,
            Expect::CardReader => 2,
            Expect::SignCommand => 3,
            Expect::File => 4,
        };
        if headers < 4 {
            return Err(ProtocolError::IncompleteHeader(headers));
        }
        if !self.buffer.is_empty() {
            return Err(ProtocolError::TrailingBytes(self.buffer.len()));
        }

        Ok(self.files)
    }

    // Split off the next terminated string, if the buffer holds one.
    fn next_token(&mut self) -> Result<Option<String>, ProtocolError> {
        let units = self.buffer.len() / 2;
        let found = self.buffer[self.scanned * 2..units * 2]
            .chunks_exact(2)
            .position(|unit| unit == TERMINATOR)
            .map(|offset| self.scanned + offset);

        let Some(length) = found else {
            self.scanned = units;
            if units > MAX_STRING_UNITS {
                return Err(ProtocolError::TokenTooLong(MAX_STRING_UNITS));
            }
            return Ok(None);
        };

        let token = self.buffer.split_to((length + 1) * 2);
        self.scanned = 0;
        let units = token[..length * 2]
            .chunks_exact(2)
            .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
            .collect::<Vec<_>>();

        String::from_utf16(&units)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidUtf16)
    }
}
