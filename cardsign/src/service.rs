// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The signing server.
//!
//! A single task multiplexes everything the server waits on: the channel
//! listener, the connected client, the output of the running signing tool, the
//! idle timer and the shutdown request. Jobs are started strictly one at a time,
//! in the order they were queued.

use std::{
    future::pending,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    channel::{Connection, Listener},
    credentials::CredentialStore,
    error::ChannelError,
    job::{CertificateIdentity, JobQueue, JobState, SigningJob},
    protocol::FileRequest,
    runner::{self, CommandLine, RunningJob},
};

/// Receives notifications about queued jobs.
pub trait JobObserver {
    /// A job was appended to the queue.
    fn job_added(&mut self, _index: usize, _job: &SigningJob) {}

    /// A job changed its state.
    fn job_changed(&mut self, _index: usize, _job: &SigningJob) {}
}

/// Logs job transitions and prints the output of every finished job.
#[derive(Debug, Default)]
pub struct ConsoleObserver;

impl JobObserver for ConsoleObserver {
    fn job_added(&mut self, index: usize, job: &SigningJob) {
        tracing::info!(index, path = ?job.path(), state = %job.state(), "Job queued");
    }

    fn job_changed(&mut self, index: usize, job: &SigningJob) {
        tracing::info!(index, path = ?job.path(), state = %job.state(), "Job changed state");
        if job.state().is_terminal() {
            println!("==> {} [{}]", job.path().display(), job.state());
            let output = job.output().as_str();
            if !output.is_empty() {
                println!("{}", output.replace("\r\n", "\n"));
            }
        }
    }
}

/// Owns the job queue and the credential cache, and runs the jobs.
pub struct Orchestrator {
    queue: JobQueue,
    credentials: CredentialStore,
    observer: Box<dyn JobObserver>,
    running: Option<RunningJob>,
    workdir: PathBuf,
    idle_timeout: Option<Duration>,
    halting: bool,
}

impl Orchestrator {
    /// Create an orchestrator with an empty queue.
    ///
    /// Signing tools run in the directory holding this executable. With an
    /// `idle_timeout`, [`Orchestrator::run`] returns once nothing happened for
    /// that long.
    pub fn new(
        credentials: CredentialStore,
        observer: Box<dyn JobObserver>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let workdir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            queue: JobQueue::default(),
            credentials,
            observer,
            running: None,
            workdir,
            idle_timeout,
            halting: false,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Queue one file, notifying the observer.
    pub fn enqueue(
        &mut self,
        identity: Arc<CertificateIdentity>,
        sign_command: Arc<str>,
        path: &Path,
    ) -> io::Result<usize> {
        let index = self.queue.enqueue(identity, sign_command, path)?;
        if let Some(job) = self.queue.get(index) {
            self.observer.job_added(index, job);
        }
        Ok(index)
    }

    /// Queue the files this instance was invoked with.
    pub fn enqueue_local(
        &mut self,
        identity: CertificateIdentity,
        sign_command: &str,
        paths: &[PathBuf],
    ) -> io::Result<()> {
        let identity = Arc::new(identity);
        let sign_command: Arc<str> = Arc::from(sign_command);
        for path in paths {
            self.enqueue(identity.clone(), sign_command.clone(), path)?;
        }
        Ok(())
    }

    /// Start the next idle job unless one is already running.
    ///
    /// A job that cannot be started is moved to its terminal state and the next
    /// one is tried. Returns whether a job is now running.
    pub async fn advance(&mut self) -> bool {
        if self.running.is_some() || self.halting {
            return self.running.is_some();
        }
        while let Some(index) = self.queue.next_idle() {
            if self.start(index).await {
                return true;
            }
        }
        false
    }

    #[instrument(skip(self))]
    async fn start(&mut self, index: usize) -> bool {
        let Some(job) = self.queue.get(index) else {
            return false;
        };
        let identity = job.identity().clone();
        let template = job.sign_command().to_owned();
        let path = job.path().to_owned();

        let result = match path.to_str() {
            None => {
                self.note(index, "The file path is not valid unicode.");
                Err(JobState::FileNotFound)
            }
            Some(path) => match self.credentials.get_or_prompt(&identity) {
                Err(error) => {
                    self.note(index, &format!("No PIN available: {error}"));
                    Err(error.job_state())
                }
                Ok(pin) => {
                    let command = CommandLine::build(&template, path, pin.expose());
                    match self.queue.get_mut(index) {
                        Some(job) => {
                            job.set_pin_confirmed();
                            runner::start(index, command, pin.expose(), &self.workdir, job.output_mut())
                                .await
                        }
                        None => Err(JobState::Fail),
                    }
                }
            },
        };

        match result {
            Ok(running) => {
                self.running = Some(running);
                self.transition(index, JobState::Running);
                true
            }
            Err(state) => {
                self.transition(index, state);
                false
            }
        }
    }

    fn note(&mut self, index: usize, message: &str) {
        if let Some(job) = self.queue.get_mut(index) {
            job.output_mut().note(message);
        }
    }

    fn transition(&mut self, index: usize, state: JobState) {
        if let Some(job) = self.queue.get_mut(index) {
            job.set_state(state);
            self.observer.job_changed(index, job);
        }
    }

    fn accept_request(&mut self, request: FileRequest) {
        if let Err(error) = self.enqueue(request.identity, request.sign_command, &request.path) {
            tracing::error!(%error, path = ?request.path, "Failed to queue file");
        }
    }

    /// Serve clients and run jobs until shutdown.
    ///
    /// Cancelling `halt_token` stops accepting clients and removes the socket.
    /// The connected client, if any, is still read to the end and the running
    /// job is waited for, but no further job is started. The cached PINs are
    /// wiped before returning.
    #[instrument(skip_all, fields(socket = %listener.path().display()))]
    pub async fn run(
        &mut self,
        listener: Listener,
        halt_token: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut listener = Some(listener);
        let mut connection: Option<(Connection, tracing::Span)> = None;
        self.advance().await;

        loop {
            if self.halting && connection.is_none() && self.running.is_none() {
                break;
            }
            let idle = listener.is_some()
                && connection.is_none()
                && self.running.is_none()
                && !self.queue.has_unfinished();
            let idle_timeout = self.idle_timeout.filter(|_| idle);

            tokio::select! {
                _ = halt_token.cancelled(), if !self.halting => {
                    tracing::info!("Shutdown requested, no new clients will be accepted");
                    self.halting = true;
                    listener = None;
                    if self.running.is_some() {
                        tracing::info!("Waiting for the running job to complete");
                    }
                }
                result = accept(&listener), if connection.is_none() => {
                    match result {
                        Ok(Some(accepted)) => {
                            let span = tracing::info_span!(
                                "connection",
                                connection_id = %uuid::Uuid::now_v7(),
                                pid = accepted.pid()
                            );
                            span.in_scope(|| tracing::debug!("Client connected"));
                            connection = Some((accepted, span));
                        }
                        Ok(None) => {}
                        Err(error) => {
                            tracing::error!(%error, "Failed to accept client");
                        }
                    }
                }
                result = read_connection(&mut connection) => {
                    self.handle_connection(&mut connection, result);
                    self.advance().await;
                }
                result = read_output(&mut self.running) => {
                    match result {
                        Ok(len) if len > 0 => self.handle_output(len),
                        result => {
                            if let Err(error) = result {
                                tracing::warn!(%error, "Failed to read the signing tool output");
                            }
                            self.finish_running().await;
                            self.advance().await;
                        }
                    }
                }
                _ = sleep_if(idle_timeout) => {
                    tracing::info!("Idle timeout reached, shutting down");
                    self.halting = true;
                    listener = None;
                }
            }
        }

        drop(listener);
        self.credentials.clear();
        tracing::info!(jobs = self.queue.len(), "Server stopped");
        Ok(())
    }

    fn handle_connection(
        &mut self,
        connection: &mut Option<(Connection, tracing::Span)>,
        result: Result<usize, ChannelError>,
    ) {
        let Some((mut client, span)) = connection.take() else {
            return;
        };
        let entered = span.enter();
        match result {
            Ok(0) => match client.finish() {
                Ok(files) => tracing::info!(files, "Client submission complete"),
                Err(error) => tracing::warn!(%error, "Client sent a malformed frame"),
            },
            Ok(len) => match client.decode(len, |request| self.accept_request(request)) {
                Ok(()) => {
                    drop(entered);
                    *connection = Some((client, span));
                }
                Err(error) => tracing::warn!(%error, "Client sent a malformed frame; dropping connection"),
            },
            Err(error) => tracing::warn!(%error, "Client connection failed"),
        }
    }

    fn handle_output(&mut self, len: usize) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if let Some(job) = self.queue.get_mut(running.index()) {
            running.decode(len, job.output_mut());
        }
    }

    async fn finish_running(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let index = running.index();
        let state = match self.queue.get_mut(index) {
            Some(job) => running.finish(job.output_mut()).await,
            None => JobState::Fail,
        };
        self.transition(index, state);
    }
}

async fn accept(listener: &Option<Listener>) -> Result<Option<Connection>, ChannelError> {
    match listener {
        Some(listener) => listener.accept().await,
        None => pending().await,
    }
}

async fn read_connection(
    connection: &mut Option<(Connection, tracing::Span)>,
) -> Result<usize, ChannelError> {
    match connection {
        Some((connection, _)) => connection.read().await,
        None => pending().await,
    }
}

async fn read_output(running: &mut Option<RunningJob>) -> io::Result<usize> {
    match running {
        Some(running) => running.read().await,
        None => pending().await,
    }
}

async fn sleep_if(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => pending().await,
    }
}
