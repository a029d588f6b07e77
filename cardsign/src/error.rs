// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Errors raised by the orchestration core.
//!
//! Errors that only concern a single signing job never surface through these
//! types; they are recorded as a [`crate::job::JobState`] on the job instead.

use std::path::PathBuf;

use crate::job::JobState;

/// Failures of the local channel shared by the server and its clients.
///
/// These are process-wide and fatal: the caller reports them and exits.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ChannelError {
    /// Neither creating the channel nor connecting to an existing owner
    /// succeeded within the retry budget.
    #[error("failed to open channel {path}: {source}")]
    Open {
        /// The socket path that could not be opened.
        path: PathBuf,
        /// The last error encountered.
        #[source]
        source: std::io::Error,
    },

    /// The runtime directory holding the channel is accessible to other users.
    #[error("Other users have access to the runtime directory {0}")]
    InsecureRuntimeDirectory(PathBuf),

    /// Writing a frame to the server failed or was short.
    #[error("failed to write to channel: {0}")]
    Write(#[source] std::io::Error),

    /// Accepting a client connection failed.
    #[error("failed to listen for clients: {0}")]
    Listen(#[source] std::io::Error),

    /// Reading from a client connection failed.
    #[error("failed to read from channel: {0}")]
    Read(#[source] std::io::Error),

    /// A path could not be represented in the wire encoding.
    #[error("path {0} is not valid unicode")]
    NonUnicodePath(PathBuf),
}

/// Malformed input on a client connection.
///
/// The offending connection is dropped; the server keeps running.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A string grew beyond the maximum token size without a terminator.
    #[error("string exceeds {0} code units without a terminator")]
    TokenTooLong(usize),

    /// A string was not valid UTF-16.
    #[error("string is not valid UTF-16")]
    InvalidUtf16,

    /// The connection closed before the four header strings were received.
    #[error("connection closed after {0} of 4 header strings")]
    IncompleteHeader(usize),

    /// The connection closed in the middle of a string.
    #[error("connection closed with {0} bytes of an unterminated string")]
    TrailingBytes(usize),
}

/// Reasons a PIN could not be provided for a job.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CredentialError {
    /// The smart card is absent or did not report a coherent status.
    #[error("smart card in reader '{reader}' is unavailable: {reason}")]
    CardUnavailable {
        /// The reader that was queried.
        reader: String,
        /// Why the status check failed.
        reason: String,
    },

    /// The user dismissed the PIN prompt.
    #[error("PIN entry was cancelled")]
    Cancelled,

    /// The prompt itself could not be shown.
    #[error("PIN prompt failed: {0}")]
    Prompt(String),

    /// The provider rejected the PIN.
    #[error("the PIN was rejected by the provider")]
    Rejected,

    /// Encrypting or decrypting the cached PIN failed.
    #[error("failed to protect or unprotect the PIN: {0}")]
    Protection(#[from] openssl::error::ErrorStack),

    /// The cached PIN did not decrypt to a usable value.
    #[error("cached PIN is corrupt")]
    Corrupt,
}

impl CredentialError {
    /// The terminal state a job ends in when this error prevents it from running.
    pub fn job_state(&self) -> JobState {
        match self {
            Self::CardUnavailable { .. } | Self::Cancelled | Self::Prompt(_) => {
                JobState::PinMissing
            }
            Self::Rejected | Self::Protection(_) | Self::Corrupt => JobState::PinWrong,
        }
    }
}

/// Problems with the configuration file.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// No signing profile is configured.
    #[error("the configuration does not define any signing profile")]
    NoProfiles,

    /// A profile was requested that does not exist.
    #[error("no signing profile named '{0}'")]
    UnknownProfile(String),

    /// Two profiles share a name.
    #[error("signing profile '{0}' is defined more than once")]
    DuplicateProfile(String),

    /// A profile's signing command is blank.
    #[error("signing profile '{0}' has an empty sign_command")]
    EmptySignCommand(String),

    /// The PIN length bounds are inconsistent.
    #[error("min_pin_length ({min}) must be at least 1 and not exceed max_pin_length ({max})")]
    PinBounds {
        /// Configured minimum.
        min: usize,
        /// Configured maximum.
        max: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_map_to_pin_states() {
        assert_eq!(CredentialError::Cancelled.job_state(), JobState::PinMissing);
        assert_eq!(
            CredentialError::CardUnavailable {
                reader: "Reader1".into(),
                reason: "no card".into()
            }
            .job_state(),
            JobState::PinMissing
        );
        assert_eq!(CredentialError::Rejected.job_state(), JobState::PinWrong);
        assert_eq!(CredentialError::Corrupt.job_state(), JobState::PinWrong);
    }
}
