// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Signing jobs and the queue that orders them.
//!
//! A [`SigningJob`] binds one file to a [`CertificateIdentity`] and a signing
//! command template. Jobs are appended to the [`JobQueue`] in arrival order and
//! executed strictly one after another, oldest first.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

/// The maximum number of decoded code points kept in a job's output log.
pub const MAX_OUTPUT: usize = 1024 * 1024;

/// Separates the captured output from notes added by the orchestrator.
pub(crate) const SEPARATOR: &str =
    "\r\n--------------------------------------------------------------------------------";

/// Identifies one key container on one smart card reader.
///
/// Two identities are equal if all three fields match exactly (case-sensitive).
/// Jobs submitted together share a single identity through an [`Arc`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct CertificateIdentity {
    /// The key container (certificate) identifier.
    pub cert_id: String,
    /// The smart card name.
    pub card_name: String,
    /// The reader the card sits in.
    pub card_reader: String,
}

impl CertificateIdentity {
    pub fn new(
        cert_id: impl Into<String>,
        card_name: impl Into<String>,
        card_reader: impl Into<String>,
    ) -> Self {
        Self {
            cert_id: cert_id.into(),
            card_name: card_name.into(),
            card_reader: card_reader.into(),
        }
    }
}

impl fmt::Display for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} in {})",
            self.cert_id, self.card_name, self.card_reader
        )
    }
}

/// The processing state of a job.
///
/// [`JobState::Idle`] and [`JobState::Running`] are the only non-terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Ok,
    Fail,
    FileNotFound,
    BrokenPipe,
    AppNotFound,
    PinMissing,
    PinWrong,
}

impl JobState {
    /// Whether no further transition can happen from this state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Idle | Self::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "pending",
            Self::Running => "running",
            Self::Ok => "success",
            Self::Fail => "failed",
            Self::FileNotFound => "file not found",
            Self::BrokenPipe => "broken pipe",
            Self::AppNotFound => "app not found",
            Self::PinMissing => "pin missing",
            Self::PinWrong => "pin wrong",
        };
        f.write_str(text)
    }
}

/// The captured console output of a job.
///
/// At most [`MAX_OUTPUT`] decoded code points are kept. Notes appended by the
/// orchestrator (truncation, exit codes) do not count against the limit.
#[derive(Debug, Default, Clone)]
pub struct JobLog {
    text: String,
    code_points: usize,
    truncated: bool,
}

impl JobLog {
    /// Whether the log reached its size limit.
    pub fn is_full(&self) -> bool {
        self.code_points >= MAX_OUTPUT
    }

    /// Whether the truncation notice has been added.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Number of decoded code points accounted for so far.
    pub fn code_points(&self) -> usize {
        self.code_points
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// The log as UTF-16 code units, as handed to native text widgets.
    pub fn encode_utf16(&self) -> Vec<u16> {
        self.text.encode_utf16().collect()
    }

    // Account for one decoded code point, appending the characters it expanded to.
    pub(crate) fn record(&mut self, chars: &[char]) {
        self.text.extend(chars);
        self.code_points += 1;
    }

    pub(crate) fn truncate_notice(&mut self) {
        if !self.truncated {
            self.text.push_str(SEPARATOR);
            self.text.push_str("\r\nThe output has been truncated here.");
            self.truncated = true;
        }
    }

    pub(crate) fn note(&mut self, message: &str) {
        self.text.push_str(SEPARATOR);
        self.text.push_str("\r\n");
        self.text.push_str(message);
    }
}

/// A single file to sign with a given certificate.
#[derive(Debug)]
pub struct SigningJob {
    state: JobState,
    identity: Arc<CertificateIdentity>,
    sign_command: Arc<str>,
    path: PathBuf,
    output: JobLog,
    pin_confirmed: bool,
}

impl SigningJob {
    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn identity(&self) -> &Arc<CertificateIdentity> {
        &self.identity
    }

    /// The command line template; `%1` is the file and `%2` the PIN.
    pub fn sign_command(&self) -> &str {
        &self.sign_command
    }

    /// The absolute path of the file to sign.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn output(&self) -> &JobLog {
        &self.output
    }

    /// Whether the PIN used for this job had already been confirmed.
    pub fn pin_confirmed(&self) -> bool {
        self.pin_confirmed
    }

    pub(crate) fn output_mut(&mut self) -> &mut JobLog {
        &mut self.output
    }

    pub(crate) fn set_pin_confirmed(&mut self) {
        self.pin_confirmed = true;
    }

    // Terminal states are final; a job can only ever reach one of them.
    pub(crate) fn set_state(&mut self, state: JobState) {
        debug_assert!(
            !self.state.is_terminal(),
            "job {} moved from {} to {}",
            self.path.display(),
            self.state,
            state
        );
        if !self.state.is_terminal() {
            self.state = state;
        }
    }
}

/// The ordered list of all jobs this instance has accepted.
///
/// Jobs are never reordered or removed while the orchestrator runs.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: Vec<SigningJob>,
    cursor: usize,
}

impl JobQueue {
    /// Append a job for `path`, returning its index.
    ///
    /// The path is made absolute. If it does not name an existing file the job
    /// is still queued, but in the [`JobState::FileNotFound`] state so it is
    /// never started.
    pub fn enqueue(
        &mut self,
        identity: Arc<CertificateIdentity>,
        sign_command: Arc<str>,
        path: &Path,
    ) -> std::io::Result<usize> {
        let path = std::path::absolute(path)?;
        let state = if path.is_file() {
            JobState::Idle
        } else {
            tracing::warn!(?path, "File to sign does not exist");
            JobState::FileNotFound
        };
        self.jobs.push(SigningJob {
            state,
            identity,
            sign_command,
            path,
            output: JobLog::default(),
            pin_confirmed: false,
        });

        Ok(self.jobs.len() - 1)
    }

    /// Find the next idle job at or after the cursor and move the cursor to it.
    pub fn next_idle(&mut self) -> Option<usize> {
        let index = self.jobs[self.cursor.min(self.jobs.len())..]
            .iter()
            .position(|job| job.state == JobState::Idle)
            .map(|offset| self.cursor + offset)?;
        self.cursor = index;
        Some(index)
    }

    /// Whether any job is still waiting or running.
    pub fn has_unfinished(&self) -> bool {
        self.jobs.iter().any(|job| !job.state.is_terminal())
    }

    pub fn get(&self, index: usize) -> Option<&SigningJob> {
        self.jobs.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut SigningJob> {
        self.jobs.get_mut(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SigningJob> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// One line per job with its status and path.
    pub fn summary(&self) -> String {
        self.jobs
            .iter()
            .map(|job| format!("{:<14} {}\n", job.state.to_string(), job.path.display()))
            .collect()
    }
}
