// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The local channel connecting invocations to the running server.
//!
//! The first invocation to grab the channel lock becomes the server and binds
//! the socket; every later invocation connects to it as a client, hands over
//! one [`Submission`] and exits.

use std::{
    fs::{DirBuilder, File, OpenOptions},
    io,
    os::unix::{
        ffi::OsStrExt,
        fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt},
    },
    path::{Path, PathBuf},
    time::Duration,
};

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
    sys::stat::Mode,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};
use tracing::instrument;

use crate::{
    error::{ChannelError, ProtocolError},
    protocol::{FileRequest, FrameDecoder, Submission},
};

/// Identifies the channel shared by all instances.
pub const CHANNEL_ID: &str = "3b8c1a4e-5d2f-4c17-9e6a-0f7d2b91c4a8";

const ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(100);
const READ_CHUNK: usize = 4096;

type PeerCheck = Box<dyn Fn(i32) -> io::Result<bool> + Send + Sync>;

/// The runtime directory used when none is configured.
///
/// This is `$XDG_RUNTIME_DIR/cardsign`, or a per-user directory in `/tmp`.
pub fn default_runtime_directory() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir).join("cardsign"),
        _ => PathBuf::from(format!("/tmp/cardsign-{}", nix::unistd::getuid())),
    }
}

/// The outcome of channel arbitration.
#[derive(Debug)]
pub enum Role {
    /// This instance owns the channel.
    Server(Listener),
    /// Another instance owns the channel.
    Client(Client),
}

/// Become the server or connect to the existing one.
///
/// Each attempt first tries to take the channel lock. The lock holder binds the
/// socket, replacing a stale one left behind by a crashed server. If another
/// instance holds the lock, its socket is connected to instead. An attempt can
/// fail while the other instance is starting up or shutting down, so up to
/// three attempts are made, 100 milliseconds apart.
#[instrument(err, skip_all, fields(runtime_directory = %runtime_directory.display()))]
pub async fn acquire(runtime_directory: &Path) -> Result<Role, ChannelError> {
    prepare_runtime_directory(runtime_directory)?;
    let socket_path = runtime_directory.join(format!("{CHANNEL_ID}.sock"));
    let lock_path = runtime_directory.join(format!("{CHANNEL_ID}.lock"));

    let mut last_error = io::Error::other("no attempt was made");
    for attempt in 1..=ATTEMPTS {
        if attempt > 1 {
            tokio::time::sleep(RETRY_DELAY).await;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&lock_path)
            .map_err(|source| ChannelError::Open {
                path: lock_path.clone(),
                source,
            })?;

        match Flock::lock(lock_file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => match bind(&socket_path) {
                Ok(listener) => {
                    tracing::info!(socket = ?socket_path, "Acting as the signing server");
                    return Ok(Role::Server(Listener {
                        listener,
                        path: socket_path,
                        peer_check: Box::new(verify_peer),
                        _lock: lock,
                    }));
                }
                Err(error) => {
                    tracing::warn!(attempt, %error, "Failed to bind the channel socket");
                    last_error = error;
                }
            },
            Err((_, Errno::EWOULDBLOCK)) => match UnixStream::connect(&socket_path).await {
                Ok(stream) => {
                    tracing::info!(socket = ?socket_path, "Forwarding to the running server");
                    return Ok(Role::Client(Client { stream }));
                }
                Err(error) => {
                    tracing::debug!(attempt, %error, "Channel is locked but not connectable");
                    last_error = error;
                }
            },
            Err((_, errno)) => {
                tracing::warn!(attempt, %errno, "Failed to lock the channel");
                last_error = errno.into();
            }
        }
    }

    Err(ChannelError::Open {
        path: socket_path,
        source: last_error,
    })
}

// Create the runtime directory, refusing one that other users can access.
fn prepare_runtime_directory(path: &Path) -> Result<(), ChannelError> {
    DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .map_err(|source| ChannelError::Open {
            path: path.to_owned(),
            source,
        })?;
    let metadata = std::fs::metadata(path).map_err(|source| ChannelError::Open {
        path: path.to_owned(),
        source,
    })?;
    if metadata.permissions().mode() & Mode::S_IRWXO.bits() != 0 {
        tracing::error!(mode = ?metadata.permissions(), "Runtime directory has dangerous permissions!");
        return Err(ChannelError::InsecureRuntimeDirectory(path.to_owned()));
    }

    Ok(())
}

fn bind(socket_path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(socket_path) {
        Ok(()) => tracing::debug!(socket = ?socket_path, "Removed stale socket"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }
    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    Ok(listener)
}

/// The server end of the channel.
///
/// The socket file is removed when the listener is dropped; the channel lock is
/// released right after.
pub struct Listener {
    listener: UnixListener,
    path: PathBuf,
    peer_check: PeerCheck,
    _lock: Flock<File>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("path", &self.path).finish()
    }
}

impl Listener {
    /// The socket clients connect to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the check deciding whether a peer process may submit files.
    #[cfg(test)]
    pub(crate) fn set_peer_check(
        &mut self,
        check: impl Fn(i32) -> io::Result<bool> + Send + Sync + 'static,
    ) {
        self.peer_check = Box::new(check);
    }

    /// Accept the next client.
    ///
    /// Connections from processes that are not running this executable are
    /// closed without reading from them, and `None` is returned.
    pub async fn accept(&self) -> Result<Option<Connection>, ChannelError> {
        let (stream, _) = self.listener.accept().await.map_err(ChannelError::Listen)?;
        let Some(pid) = stream.peer_cred().ok().and_then(|cred| cred.pid()) else {
            tracing::warn!("Peer process is unknown; dropping connection");
            return Ok(None);
        };

        match (self.peer_check)(pid) {
            Ok(true) => Ok(Some(Connection::new(stream, pid))),
            Ok(false) => {
                tracing::warn!(pid, "Peer is not an instance of this program; dropping connection");
                Ok(None)
            }
            Err(error) => {
                tracing::warn!(pid, %error, "Failed to identify the peer; dropping connection");
                Ok(None)
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(socket = ?self.path, "Successfully removed socket"),
            Err(error) => tracing::warn!(socket = ?self.path, %error, "Failed to remove socket"),
        }
    }
}

// Whether the process `pid` runs the same executable image as this process.
fn verify_peer(pid: i32) -> io::Result<bool> {
    let own = std::env::current_exe()?;
    let peer = std::fs::read_link(format!("/proc/{pid}/exe"))?;
    Ok(own.as_os_str().as_bytes() == peer.as_os_str().as_bytes())
}

/// An accepted, verified client connection carrying one frame.
#[derive(Debug)]
pub struct Connection {
    stream: UnixStream,
    pid: i32,
    decoder: FrameDecoder,
    buffer: Box<[u8; READ_CHUNK]>,
}

impl Connection {
    fn new(stream: UnixStream, pid: i32) -> Self {
        Self {
            stream,
            pid,
            decoder: FrameDecoder::default(),
            buffer: Box::new([0; READ_CHUNK]),
        }
    }

    /// The client's process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Wait for the next chunk; zero means the client closed the connection.
    ///
    /// This is cancel safe.
    pub async fn read(&mut self) -> Result<usize, ChannelError> {
        self.stream
            .read(self.buffer.as_mut_slice())
            .await
            .map_err(ChannelError::Read)
    }

    /// Decode the first `len` bytes of the last chunk, passing every complete
    /// file to `sink`.
    pub fn decode<F>(&mut self, len: usize, sink: F) -> Result<(), ProtocolError>
    where
        F: FnMut(FileRequest),
    {
        self.decoder.push(&self.buffer[..len], sink)
    }

    /// Finish the frame after the client closed the connection.
    ///
    /// Returns the number of files received.
    pub fn finish(self) -> Result<usize, ProtocolError> {
        self.decoder.finish()
    }
}

/// The client end of the channel.
#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
}

impl Client {
    /// Send one frame and wait for the server to take it.
    ///
    /// Every string is handed to the socket in a single write, which must
    /// accept it completely. The server identifies clients by their process, so
    /// this returns only once the server has closed the connection. A server
    /// that refused the connection shows up as a read error.
    #[instrument(err, skip_all, fields(files = submission.files.len()))]
    pub async fn submit(mut self, submission: &Submission) -> Result<(), ChannelError> {
        for string in submission.encode()? {
            let written = self
                .stream
                .write(&string)
                .await
                .map_err(ChannelError::Write)?;
            if written != string.len() {
                return Err(ChannelError::Write(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short write of {written} of {} bytes", string.len()),
                )));
            }
        }
        self.stream.shutdown().await.map_err(ChannelError::Write)?;
        tracing::debug!("Waiting for the server to take the submission");

        let mut buffer = [0_u8; 64];
        loop {
            let len = self
                .stream
                .read(&mut buffer)
                .await
                .map_err(ChannelError::Read)?;
            if len == 0 {
                break;
            }
            tracing::debug!(len, "Ignoring unexpected data from the server");
        }
        tracing::info!("Submitted files to the running server");

        Ok(())
    }
}
