//! Unix domain socket server for IPC
//!
//! Each accepted connection is one channel: inbound lines are decoded into
//! commands for the coordinator, and every broadcast the coordinator emits
//! is written back as a line. Frames that fail to decode, including invalid
//! UTF-8 and frames over [`MAX_FRAME_BYTES`], are skipped without closing
//! the channel.

use crate::coordinator::{ClientChannel, CoordinatorHandle};
use anyhow::{Context, Result};
use std::io;
use std::path::Path;
use ticktrack_ipc::{decode_client_message, encode_line, MAX_FRAME_BYTES};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Bind the listening socket. A stale socket file at `path` is removed first.
pub fn bind(path: &Path) -> Result<UnixListener> {
    let _ = std::fs::remove_file(path);

    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind socket: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set socket permissions: {}", path.display()))?;
    }

    info!("IPC server listening on {}", path.display());
    Ok(listener)
}

pub async fn serve(listener: UnixListener, coordinator: CoordinatorHandle) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, coordinator).await {
                        error!("Error handling client: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
            }
        }
    }
}

async fn handle_client(stream: UnixStream, coordinator: CoordinatorHandle) -> Result<()> {
    let channel = coordinator.connect()?;
    let id = channel.id;
    let result = pump(stream, &coordinator, channel).await;
    // The coordinator may already be gone during shutdown.
    let _ = coordinator.disconnect(id);
    result
}

async fn pump(
    stream: UnixStream,
    coordinator: &CoordinatorHandle,
    channel: ClientChannel,
) -> Result<()> {
    let ClientChannel { id, mut updates } = channel;
    let (reader, mut writer) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(reader));

    loop {
        tokio::select! {
            frame = frames.next_frame() => match frame {
                Ok(Frame::Line(bytes)) => {
                    let line = match std::str::from_utf8(&bytes) {
                        Ok(line) => line,
                        Err(e) => {
                            debug!(channel = id, "Ignoring non UTF-8 frame: {}", e);
                            continue;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_client_message(line) {
                        Ok(message) => coordinator.send(id, message)?,
                        Err(e) => debug!(channel = id, "Ignoring malformed message: {}", e),
                    }
                }
                Ok(Frame::Oversized) => {
                    debug!(channel = id, "Ignoring frame over {} bytes", MAX_FRAME_BYTES);
                }
                Ok(Frame::Eof) => break,
                Err(e) => {
                    warn!(channel = id, "Error reading from client: {}", e);
                    break;
                }
            },
            update = updates.recv() => match update {
                Some(message) => {
                    let bytes = encode_line(&message)?;
                    if writer.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                // Coordinator dropped this channel
                None => break,
            },
        }
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// Frame contents without the trailing newline
    Line(Vec<u8>),
    /// Frame exceeded the size cap and was discarded
    Oversized,
    Eof,
}

/// Newline-delimited frame reader that never buffers more than
/// [`MAX_FRAME_BYTES`] of one frame.
///
/// Partial frames live in the reader between calls, so `next_frame` can be
/// dropped at its await point (e.g. by `select!`) without losing input.
struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    oversized: bool,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            oversized: false,
        }
    }

    async fn next_frame(&mut self) -> io::Result<Frame> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                // A trailing frame without newline still counts.
                if std::mem::take(&mut self.oversized) {
                    return Ok(Frame::Oversized);
                }
                if self.buf.is_empty() {
                    return Ok(Frame::Eof);
                }
                return Ok(Frame::Line(std::mem::take(&mut self.buf)));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            if !self.oversized {
                if self.buf.len() + chunk.len() > MAX_FRAME_BYTES {
                    self.oversized = true;
                    self.buf = Vec::new();
                } else {
                    self.buf.extend_from_slice(chunk);
                }
            }
            let used = newline.map_or(available.len(), |i| i + 1);
            self.inner.consume(used);

            if newline.is_some() {
                if std::mem::take(&mut self.oversized) {
                    return Ok(Frame::Oversized);
                }
                return Ok(Frame::Line(std::mem::take(&mut self.buf)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{spawn, CoordinatorSettings};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use ticktrack_ipc::{decode_server_message, RunState, ServerMessage, TaskUpdate};
    use tokio::io::{Lines, ReadHalf};
    use tokio::time::timeout;

    struct TestClient {
        lines: Lines<BufReader<ReadHalf<UnixStream>>>,
        writer: tokio::io::WriteHalf<UnixStream>,
    }

    impl TestClient {
        async fn connect(path: &Path) -> Self {
            let stream = UnixStream::connect(path).await.unwrap();
            let (reader, writer) = tokio::io::split(stream);
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send_raw(&mut self, line: &str) {
            self.send_bytes(line.as_bytes()).await;
        }

        async fn send_bytes(&mut self, bytes: &[u8]) {
            self.writer.write_all(bytes).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn next_update(&mut self) -> TaskUpdate {
            let line = timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for broadcast")
                .unwrap()
                .expect("server closed connection");
            let ServerMessage::TaskUpdate(update) = decode_server_message(&line).unwrap();
            update
        }
    }

    async fn start_server() -> (tempfile::TempDir, std::path::PathBuf, CoordinatorHandle) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticktrack.sock");
        let listener = bind(&path).unwrap();
        let (handle, _task) = spawn(CoordinatorSettings::default());
        tokio::spawn(serve(listener, handle.clone()));
        (dir, path, handle)
    }

    #[tokio::test]
    async fn broadcasts_reach_every_connected_client() {
        let (_dir, path, _handle) = start_server().await;

        let mut a = TestClient::connect(&path).await;
        a.send_raw(r#"{"type":"updateTasks","payload":[{"id":"A"},{"id":"B"}]}"#)
            .await;
        a.send_raw(r#"{"type":"setActiveTask","payload":{"id":"B"}}"#)
            .await;
        a.next_update().await;
        let selected = a.next_update().await;
        assert_eq!(selected.id.as_deref(), Some("B"));

        // A fresh client gets the current state as soon as it connects.
        let mut b = TestClient::connect(&path).await;
        assert_eq!(b.next_update().await, selected);

        a.send_raw(r#"{"type":"pauseTimer"}"#).await;
        let from_a = a.next_update().await;
        let from_b = b.next_update().await;
        assert_eq!(from_a, from_b);
        assert_eq!(
            from_a,
            TaskUpdate {
                id: Some("B".to_string()),
                timer: 0,
                run_state: RunState::Paused,
                total_worked: 0,
            }
        );
    }

    #[tokio::test]
    async fn malformed_lines_do_not_close_the_channel() {
        let (_dir, path, _handle) = start_server().await;

        let mut client = TestClient::connect(&path).await;
        client.send_raw("definitely not json").await;
        client.send_raw(r#"{"type":"updateTasks","payload":"A"}"#).await;
        client.send_raw("").await;
        client
            .send_raw(r#"{"type":"updateTasks","payload":[{"id":"A"}]}"#)
            .await;

        let update = client.next_update().await;
        assert_eq!(update.id, None);
        assert_eq!(update.total_worked, 0);
    }

    #[tokio::test]
    async fn invalid_utf8_does_not_close_the_channel() {
        let (_dir, path, _handle) = start_server().await;

        let mut client = TestClient::connect(&path).await;
        client.send_bytes(b"\xff\xfe garbage").await;
        client
            .send_raw(r#"{"type":"updateTasks","payload":[{"id":"A"}]}"#)
            .await;

        let update = client.next_update().await;
        assert_eq!(update.id, None);
        assert_eq!(update.run_state, RunState::Paused);
    }

    #[tokio::test]
    async fn oversized_frames_are_skipped() {
        let (_dir, path, _handle) = start_server().await;

        let mut client = TestClient::connect(&path).await;
        client
            .send_raw(r#"{"type":"updateTasks","payload":[{"id":"A"}]}"#)
            .await;
        client.next_update().await;

        let huge = format!(
            r#"{{"type":"updateTasks","payload":[{{"id":"{}"}}]}}"#,
            "x".repeat(MAX_FRAME_BYTES * 2)
        );
        client.send_raw(&huge).await;
        client
            .send_raw(r#"{"type":"setActiveTask","payload":{"id":"A"}}"#)
            .await;

        // The oversized update never reached the registry, so "A" is still there.
        let update = client.next_update().await;
        assert_eq!(update.id.as_deref(), Some("A"));
    }

    async fn read_all_frames(data: &[u8], capacity: usize) -> Vec<Frame> {
        let mut frames = FrameReader::new(BufReader::with_capacity(capacity, data));
        let mut out = Vec::new();
        loop {
            let frame = frames.next_frame().await.unwrap();
            if frame == Frame::Eof {
                return out;
            }
            out.push(frame);
        }
    }

    #[tokio::test]
    async fn frame_reader_splits_on_newlines_across_buffer_refills() {
        let frames = read_all_frames(b"first\n\nsecond\ntail", 4).await;
        assert_eq!(
            frames,
            vec![
                Frame::Line(b"first".to_vec()),
                Frame::Line(Vec::new()),
                Frame::Line(b"second".to_vec()),
                Frame::Line(b"tail".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn frame_reader_caps_buffered_bytes() {
        let mut data = vec![b'x'; MAX_FRAME_BYTES + 1];
        data.extend_from_slice(b"\nok\n");
        data.extend(std::iter::repeat(b'y').take(MAX_FRAME_BYTES + 5));

        let mut frames = FrameReader::new(BufReader::with_capacity(1024, &data[..]));
        assert_eq!(frames.next_frame().await.unwrap(), Frame::Oversized);
        assert!(frames.buf.capacity() <= MAX_FRAME_BYTES);
        assert_eq!(
            frames.next_frame().await.unwrap(),
            Frame::Line(b"ok".to_vec())
        );
        assert_eq!(frames.next_frame().await.unwrap(), Frame::Oversized);
        assert_eq!(frames.next_frame().await.unwrap(), Frame::Eof);
    }

    #[test]
    fn bind_replaces_stale_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticktrack.sock");
        std::fs::write(&path, b"stale").unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            bind(&path).unwrap();
        });

        use std::os::unix::fs::{FileTypeExt, PermissionsExt};
        let metadata = std::fs::metadata(&path).unwrap();
        assert!(metadata.file_type().is_socket());
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }
}
