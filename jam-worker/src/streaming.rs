//! File-streaming socket
//!
//! Each connection opens with a param-list handshake such as
//! `action=upload,fileId=kick,fileType=wav,length=2048;` and then carries raw
//! bytes in one direction. Rejections are answered with `error=<message>;`
//! before the socket is closed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use jam_protocol::ParamList;
use jam_utils::{JamError, Result};

use crate::process::WorkerEvent;

/// Longest handshake accepted before the terminator
pub const MAX_HANDSHAKE: u64 = 512;

/// How long a stream may sit without sending anything
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upload copy buffer
const CHUNK: usize = 64 * 1024;

lazy_static! {
    static ref FILE_ID: Regex = Regex::new(r"^\w+$").unwrap();
}

/// Whether `id` is usable as a file name under the sounds directory
pub fn is_valid_file_id(id: &str) -> bool {
    FILE_ID.is_match(id)
}

/// A validated handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamRequest {
    Upload {
        file_id: String,
        file_type: String,
        length: u64,
    },
    Download {
        file_id: String,
    },
}

impl StreamRequest {
    pub fn from_params(params: &ParamList) -> Result<Self> {
        let file_id = params
            .get("fileId")
            .filter(|id| is_valid_file_id(id))
            .ok_or_else(|| JamError::validation("fileId", "must match \\w+"))?
            .to_string();

        match params.get("action") {
            Some("upload") => {
                let file_type = params
                    .get("fileType")
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| JamError::validation("fileType", "required for upload"))?
                    .to_string();
                let length = params
                    .get("length")
                    .and_then(|l| l.parse::<u64>().ok())
                    .ok_or_else(|| JamError::validation("length", "must be a number"))?;
                Ok(Self::Upload {
                    file_id,
                    file_type,
                    length,
                })
            }
            Some("download") => Ok(Self::Download { file_id }),
            Some(other) => Err(JamError::validation("action", format!("unknown action {}", other))),
            None => Err(JamError::validation("action", "required")),
        }
    }
}

/// In-flight uploads: fileId to the stream that owns it
#[derive(Debug, Default)]
pub struct UploadGuard {
    active: Mutex<HashMap<String, u64>>,
}

impl UploadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `file_id` for `stream_id`; the claim is dropped with the permit
    pub fn acquire(self: &Arc<Self>, file_id: &str, stream_id: u64) -> Result<UploadPermit> {
        let mut active = self.active.lock();
        if active.contains_key(file_id) {
            return Err(JamError::UploadInProgress(file_id.to_string()));
        }
        active.insert(file_id.to_string(), stream_id);
        Ok(UploadPermit {
            guard: Arc::clone(self),
            file_id: file_id.to_string(),
            stream_id,
        })
    }

    pub fn is_active(&self, file_id: &str) -> bool {
        self.active.lock().contains_key(file_id)
    }

    fn release(&self, file_id: &str, stream_id: u64) {
        let mut active = self.active.lock();
        if active.get(file_id) == Some(&stream_id) {
            active.remove(file_id);
        }
    }
}

/// Exclusive right to write one fileId
#[derive(Debug)]
pub struct UploadPermit {
    guard: Arc<UploadGuard>,
    file_id: String,
    stream_id: u64,
}

impl Drop for UploadPermit {
    fn drop(&mut self) {
        self.guard.release(&self.file_id, self.stream_id);
    }
}

/// Accepts streaming connections for one session
pub struct FileServer {
    dir: PathBuf,
    guard: Arc<UploadGuard>,
    events: mpsc::Sender<WorkerEvent>,
    next_stream: AtomicU64,
    idle_timeout: Duration,
}

impl FileServer {
    pub fn new(dir: impl Into<PathBuf>, events: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            dir: dir.into(),
            guard: Arc::new(UploadGuard::new()),
            events,
            next_stream: AtomicU64::new(1),
            idle_timeout: IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let stream_id = self.next_stream.fetch_add(1, Ordering::Relaxed);
                    debug!("Stream {} opened from {}", stream_id, addr);
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle(stream, stream_id).await {
                            debug!("Stream {} ended: {}", stream_id, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Failed to accept stream: {}", e);
                }
            }
        }
    }

    async fn handle(&self, stream: TcpStream, stream_id: u64) -> Result<()> {
        let mut reader = BufReader::new(stream);

        let mut raw = Vec::new();
        let mut limited = (&mut reader).take(MAX_HANDSHAKE);
        tokio::time::timeout(self.idle_timeout, limited.read_until(b';', &mut raw))
            .await
            .map_err(|_| JamError::Timeout {
                operation: "stream handshake".into(),
                millis: self.idle_timeout.as_millis() as u64,
            })??;
        let params = ParamList::parse(&String::from_utf8_lossy(&raw));

        let request = match StreamRequest::from_params(&params) {
            Ok(request) => request,
            Err(e) => return reject(reader.get_mut(), e).await,
        };

        match request {
            StreamRequest::Upload {
                file_id,
                file_type,
                length,
            } => {
                let permit = match self.guard.acquire(&file_id, stream_id) {
                    Ok(permit) => permit,
                    Err(e) => return reject(reader.get_mut(), e).await,
                };
                debug!("Stream {} uploading {} ({}, {} bytes)", stream_id, file_id, file_type, length);

                let written = self.receive(&mut reader, &file_id, length).await;
                drop(permit);
                let bytes = written?;

                info!("Stored {} ({} bytes)", file_id, bytes);
                let _ = self
                    .events
                    .send(WorkerEvent::UploadComplete { file_id, bytes })
                    .await;
                Ok(())
            }
            StreamRequest::Download { file_id } => {
                let path = self.dir.join(&file_id);
                let mut file = match File::open(&path).await {
                    Ok(file) => file,
                    Err(_) => {
                        return reject(reader.get_mut(), JamError::FileNotFound(file_id)).await
                    }
                };
                let socket = reader.get_mut();
                let bytes = tokio::io::copy(&mut file, socket).await?;
                socket.shutdown().await?;
                debug!("Stream {} sent {} ({} bytes)", stream_id, file_id, bytes);
                Ok(())
            }
        }
    }

    /// Copy exactly `length` bytes into the sound file
    async fn receive(
        &self,
        reader: &mut BufReader<TcpStream>,
        file_id: &str,
        length: u64,
    ) -> Result<u64> {
        fs::create_dir_all(&self.dir).await?;
        let partial = self.dir.join(format!("{}.part", file_id));
        let mut file = File::create(&partial).await?;

        let copied = self.copy_body(reader, &mut file, length).await;
        let flushed = match copied {
            Ok(n) => file.flush().await.map(|_| n),
            Err(e) => Err(e),
        };
        drop(file);

        match flushed {
            Ok(n) if n == length => {
                fs::rename(&partial, self.dir.join(file_id)).await?;
                Ok(n)
            }
            Ok(n) => {
                let _ = fs::remove_file(&partial).await;
                warn!("Upload of {} cut short at {} of {} bytes", file_id, n, length);
                Err(JamError::ConnectionClosed)
            }
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                Err(e.into())
            }
        }
    }
}

impl FileServer {
    /// Copy up to `length` bytes, giving up when the sender goes quiet
    async fn copy_body(
        &self,
        reader: &mut BufReader<TcpStream>,
        file: &mut File,
        length: u64,
    ) -> std::io::Result<u64> {
        let mut buf = vec![0u8; CHUNK];
        let mut remaining = length;
        while remaining > 0 {
            let want = remaining.min(CHUNK as u64) as usize;
            let n = tokio::time::timeout(self.idle_timeout, reader.read(&mut buf[..want]))
                .await
                .map_err(|_| {
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "upload stalled")
                })??;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            remaining -= n as u64;
        }
        Ok(length - remaining)
    }
}

async fn reject(socket: &mut TcpStream, error: JamError) -> Result<()> {
    debug!("Rejecting stream: {}", error);
    socket
        .write_all(ParamList::error(&error).to_string().as_bytes())
        .await?;
    socket.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn start() -> (TempDir, std::net::SocketAddr, mpsc::Receiver<WorkerEvent>) {
        start_with_idle(IDLE_TIMEOUT).await
    }

    async fn start_with_idle(
        idle: Duration,
    ) -> (TempDir, std::net::SocketAddr, mpsc::Receiver<WorkerEvent>) {
        let dir = TempDir::new().unwrap();
        let (tx, rx) = mpsc::channel(16);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(FileServer::new(dir.path(), tx).with_idle_timeout(idle));
        tokio::spawn(server.serve(listener));
        (dir, addr, rx)
    }

    async fn read_reply(stream: &mut TcpStream) -> String {
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[test]
    fn test_handshake_validation() {
        let upload = ParamList::parse("action=upload,fileId=kick,fileType=wav,length=4;");
        assert_eq!(
            StreamRequest::from_params(&upload).unwrap(),
            StreamRequest::Upload {
                file_id: "kick".into(),
                file_type: "wav".into(),
                length: 4
            }
        );

        let bad_id = ParamList::parse("action=download,fileId=../x;");
        assert!(matches!(
            StreamRequest::from_params(&bad_id),
            Err(JamError::Validation { ref field, .. }) if field == "fileId"
        ));

        let no_type = ParamList::parse("action=upload,fileId=kick,length=4;");
        assert!(matches!(
            StreamRequest::from_params(&no_type),
            Err(JamError::Validation { ref field, .. }) if field == "fileType"
        ));

        let bad_len = ParamList::parse("action=upload,fileId=kick,fileType=wav,length=lots;");
        assert!(matches!(
            StreamRequest::from_params(&bad_len),
            Err(JamError::Validation { ref field, .. }) if field == "length"
        ));

        let unknown = ParamList::parse("action=stream,fileId=kick;");
        assert!(StreamRequest::from_params(&unknown).is_err());
    }

    #[test]
    fn test_guard_allows_one_upload_per_file() {
        let guard = Arc::new(UploadGuard::new());
        let first = guard.acquire("kick", 1).unwrap();
        assert!(matches!(
            guard.acquire("kick", 2),
            Err(JamError::UploadInProgress(_))
        ));
        assert!(guard.acquire("snare", 3).is_ok());

        drop(first);
        assert!(!guard.is_active("kick"));
        assert!(guard.acquire("kick", 4).is_ok());
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let (dir, addr, mut events) = start().await;

        let mut up = TcpStream::connect(addr).await.unwrap();
        up.write_all(b"action=upload,fileId=kick,fileType=wav,length=5;hello")
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            WorkerEvent::UploadComplete { file_id, bytes } => {
                assert_eq!(file_id, "kick");
                assert_eq!(bytes, 5);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(std::fs::read(dir.path().join("kick")).unwrap(), b"hello");

        let mut down = TcpStream::connect(addr).await.unwrap();
        down.write_all(b"action=download,fileId=kick;").await.unwrap();
        assert_eq!(read_reply(&mut down).await, "hello");
    }

    #[tokio::test]
    async fn test_second_upload_rejected_while_first_open() {
        let (_dir, addr, mut events) = start().await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first
            .write_all(b"action=upload,fileId=loop,fileType=wav,length=4;ab")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second
            .write_all(b"action=upload,fileId=loop,fileType=wav,length=4;")
            .await
            .unwrap();
        let reply = read_reply(&mut second).await;
        assert!(reply.starts_with("error="), "got {}", reply);
        assert!(reply.ends_with(';'));

        first.write_all(b"cd").await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            WorkerEvent::UploadComplete { bytes: 4, .. }
        ));

        let mut third = TcpStream::connect(addr).await.unwrap();
        third
            .write_all(b"action=upload,fileId=loop,fileType=wav,length=2;zz")
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            WorkerEvent::UploadComplete { bytes: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_silent_stream_is_dropped() {
        let (_dir, addr, _events) = start_with_idle(Duration::from_millis(100)).await;

        let mut idle = TcpStream::connect(addr).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), read_reply(&mut idle))
            .await
            .unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_upload_frees_the_file() {
        let (dir, addr, mut events) = start_with_idle(Duration::from_millis(100)).await;

        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled
            .write_all(b"action=upload,fileId=loop,fileType=wav,length=4;ab")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!dir.path().join("loop.part").exists());

        let mut retry = TcpStream::connect(addr).await.unwrap();
        retry
            .write_all(b"action=upload,fileId=loop,fileType=wav,length=2;zz")
            .await
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            WorkerEvent::UploadComplete { bytes: 2, .. }
        ));
        drop(stalled);
    }

    #[tokio::test]
    async fn test_short_upload_leaves_no_file() {
        let (dir, addr, mut events) = start().await;

        let mut up = TcpStream::connect(addr).await.unwrap();
        up.write_all(b"action=upload,fileId=cut,fileType=wav,length=100;abc")
            .await
            .unwrap();
        drop(up);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!dir.path().join("cut").exists());
        assert!(!dir.path().join("cut.part").exists());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_download_missing_file() {
        let (_dir, addr, _events) = start().await;
        let mut down = TcpStream::connect(addr).await.unwrap();
        down.write_all(b"action=download,fileId=nothing;").await.unwrap();
        let reply = read_reply(&mut down).await;
        assert!(reply.starts_with("error="));
    }

    #[tokio::test]
    async fn test_invalid_file_id_rejected() {
        let (_dir, addr, _events) = start().await;
        let mut down = TcpStream::connect(addr).await.unwrap();
        down.write_all(b"action=download,fileId=a/b;").await.unwrap();
        let reply = read_reply(&mut down).await;
        assert!(reply.contains("fileId"));
    }
}
