//! Named channel transport.
//!
//! Channels are Unix stream sockets bound at predictable paths under the
//! runtime directory:
//! - **Well-known channel**: `{runtime_dir}/monitor.sock`, the coordinator's inbound queue
//! - **Worker channel**: `{runtime_dir}/{pid}.sock`, one per tracked worker process

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tokio::net::{UnixListener, UnixStream};

/// File name of the coordinator's well-known channel.
pub const WELL_KNOWN_CHANNEL: &str = "monitor.sock";

/// Path of the dedicated channel for worker `pid`.
pub fn worker_channel_path(runtime_dir: &Path, pid: i32) -> PathBuf {
    runtime_dir.join(format!("{pid}.sock"))
}

/// Create the runtime directory if it does not exist yet.
pub fn prepare_runtime_dir(runtime_dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(runtime_dir)?;
    tracing::debug!(dir = %runtime_dir.display(), "Runtime directory ready");
    Ok(())
}

/// Listening end of a named channel. Removes its socket file on drop, unless
/// another listener has since been bound at the same path.
#[derive(Debug)]
pub struct ChannelListener {
    path: PathBuf,
    listener: UnixListener,
    /// `(dev, ino)` of the socket file this listener created.
    file_id: (u64, u64),
}

impl ChannelListener {
    /// Bind a channel at `path`, replacing a stale socket file left by a
    /// previous run.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();

        if path.exists() {
            tracing::debug!(path = %path.display(), "Removing stale channel file");
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        let meta = std::fs::symlink_metadata(&path)?;
        tracing::trace!(path = %path.display(), "Bound channel");

        Ok(Self {
            path,
            listener,
            file_id: (meta.dev(), meta.ino()),
        })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        tracing::trace!(path = %self.path.display(), "Channel connection accepted");
        Ok(stream)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cleanup(&self) -> io::Result<()> {
        let meta = match std::fs::symlink_metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if (meta.dev(), meta.ino()) != self.file_id {
            tracing::debug!(path = %self.path.display(), "Channel file was rebound, leaving it");
            return Ok(());
        }
        tracing::debug!(path = %self.path.display(), "Removing channel file");
        std::fs::remove_file(&self.path)
    }
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove channel file");
        }
    }
}

/// Open the client end of the channel at `path`.
pub async fn connect(path: &Path) -> io::Result<UnixStream> {
    tracing::trace!(path = %path.display(), "Connecting to channel");
    UnixStream::connect(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn worker_channel_is_named_after_pid() {
        let path = worker_channel_path(Path::new("/run/procwatch"), 4321);
        assert_eq!(path, PathBuf::from("/run/procwatch/4321.sock"));
    }

    #[tokio::test]
    async fn bind_connect_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WELL_KNOWN_CHANNEL);

        let listener = ChannelListener::bind(&path).unwrap();
        assert!(path.exists());

        let mut client = connect(&path).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn bind_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = worker_channel_path(dir.path(), 77);
        std::fs::write(&path, b"stale").unwrap();

        let listener = ChannelListener::bind(&path).unwrap();
        assert_eq!(listener.path(), path.as_path());
        assert!(connect(&path).await.is_ok());
    }

    #[tokio::test]
    async fn dropping_replaced_listener_keeps_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = worker_channel_path(dir.path(), 5);

        let old = ChannelListener::bind(&path).unwrap();
        let new = ChannelListener::bind(&path).unwrap();
        drop(old);

        assert!(path.exists());
        let _client = connect(&path).await.unwrap();
        new.accept().await.unwrap();

        drop(new);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn prepare_runtime_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("nested/runtime");
        prepare_runtime_dir(&runtime).unwrap();
        prepare_runtime_dir(&runtime).unwrap();
        assert!(runtime.is_dir());
    }
}
