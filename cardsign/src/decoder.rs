// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Incremental decoding of signing tool output.
//!
//! Signing tools write UTF-8 in arbitrarily sized chunks, so a multi-byte
//! sequence may be split across reads. [`Utf8Decoder`] consumes one byte at a
//! time and keeps the partial sequence between calls. [`OutputDecoder`] builds on
//! it to append the decoded text to a [`JobLog`], normalizing line endings to
//! `\r\n` and enforcing the log size limit.

use crate::job::JobLog;

/// The result of feeding one byte to a [`Utf8Decoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// The byte was part of an incomplete sequence.
    More,
    /// The byte ended a malformed sequence.
    Invalid,
    /// A complete code point.
    Char(char),
}

/// A byte-at-a-time UTF-8 decoder.
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    code_point: u32,
    remaining: u8,
    length: u8,
}

impl Utf8Decoder {
    /// Consume one byte.
    ///
    /// A malformed sequence produces a single [`Decoded::Invalid`] and decoding
    /// resumes with the byte after the one that broke the sequence. Overlong
    /// encodings, UTF-16 surrogates and values above U+10FFFF are malformed.
    pub fn push(&mut self, byte: u8) -> Decoded {
        if self.remaining == 0 {
            let (code_point, remaining) = match byte {
                0x00..=0x7F => return Decoded::Char(char::from(byte)),
                _ if byte & 0xE0 == 0xC0 => (u32::from(byte & 0x1F), 1),
                _ if byte & 0xF0 == 0xE0 => (u32::from(byte & 0x0F), 2),
                _ if byte & 0xF8 == 0xF0 => (u32::from(byte & 0x07), 3),
                _ => return Decoded::Invalid,
            };
            self.code_point = code_point;
            self.remaining = remaining;
            self.length = remaining + 1;
            return Decoded::More;
        }

        if byte & 0xC0 != 0x80 {
            self.remaining = 0;
            return Decoded::Invalid;
        }
        self.code_point = (self.code_point << 6) | u32::from(byte & 0x3F);
        self.remaining -= 1;
        if self.remaining > 0 {
            return Decoded::More;
        }

        let shortest = match self.code_point {
            0..=0x7F => 1,
            0x80..=0x7FF => 2,
            0x800..=0xFFFF => 3,
            _ => 4,
        };
        if shortest != self.length {
            return Decoded::Invalid;
        }
        char::from_u32(self.code_point).map_or(Decoded::Invalid, Decoded::Char)
    }
}

/// Decodes a job's output stream into its [`JobLog`].
///
/// One decoder is used per job so partial sequences never leak between jobs.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    utf8: Utf8Decoder,
    last: Option<char>,
}

impl OutputDecoder {
    /// Decode `bytes` and append the result to `log`.
    ///
    /// A `\n` that does not directly follow a `\r` gets one inserted in front of
    /// it. NUL characters are dropped. Once the log is full the remaining bytes
    /// are discarded and a truncation notice is added, once.
    ///
    /// Returns whether anything was appended.
    pub fn feed(&mut self, bytes: &[u8], log: &mut JobLog) -> bool {
        let mut added = false;
        for &byte in bytes {
            if log.is_full() {
                break;
            }
            let c = match self.utf8.push(byte) {
                Decoded::More => continue,
                Decoded::Invalid => char::REPLACEMENT_CHARACTER,
                Decoded::Char(c) => c,
            };
            match c {
                '\n' if self.last != Some('\r') => log.record(&['\r', '\n']),
                '\0' => log.record(&[]),
                c => log.record(&[c]),
            }
            self.last = Some(c);
            added = true;
        }
        if added && log.is_full() {
            log.truncate_notice();
        }

        added
    }
}
