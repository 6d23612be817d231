//! File listing and download gated on ports found open by the current scan.

use std::io;
use std::path::{Component, Path, PathBuf};

use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::error::BridgeError;
use crate::session::ScanSession;
use crate::types::{BridgeRequest, SharedFile};

/// Serves files from a single shared directory.
///
/// A download is allowed only through a port present in the session's current
/// outcome. Port membership is used as an access token; the port itself is
/// never contacted.
#[derive(Clone)]
pub struct FileBridge {
    root: PathBuf,
    session: ScanSession,
}

/// An opened file ready to be streamed.
#[derive(Debug)]
pub struct FileDownload {
    pub name: String,
    pub size_bytes: u64,
    file: File,
}

impl FileDownload {
    /// Stream exactly `size_bytes` bytes in chunks.
    ///
    /// Read errors, and a file that ends before the size taken at open time,
    /// surface as `BridgeError::Transfer` so the consumer can abort the
    /// response instead of truncating silently. Bytes appended after open are
    /// not sent.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, BridgeError>> + Send {
        let expected = self.size_bytes;
        let name = self.name;
        let reader = ReaderStream::new(self.file);
        stream::unfold(Some((reader, 0u64)), move |state| {
            let name = name.clone();
            async move {
                let (mut reader, sent) = state?;
                if sent >= expected {
                    return None;
                }
                match reader.next().await {
                    Some(Ok(mut chunk)) => {
                        let remaining = expected - sent;
                        if chunk.len() as u64 > remaining {
                            chunk.truncate(remaining as usize);
                        }
                        let sent = sent + chunk.len() as u64;
                        Some((Ok(chunk), Some((reader, sent))))
                    }
                    Some(Err(e)) => Some((Err(transfer_failed(&name, e)), None)),
                    None => {
                        let e = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("file ended after {sent} of {expected} bytes"),
                        );
                        Some((Err(transfer_failed(&name, e)), None))
                    }
                }
            }
        })
    }
}

fn transfer_failed(name: &str, e: io::Error) -> BridgeError {
    warn!(file = %name, error = %e, "transfer failed mid-stream");
    BridgeError::Transfer(e)
}

impl FileBridge {
    pub fn new(root: impl Into<PathBuf>, session: ScanSession) -> Self {
        Self {
            root: root.into(),
            session,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Regular files directly inside the shared directory, sorted by name.
    /// Creates the directory when it does not exist yet.
    pub async fn list_files(&self) -> Result<Vec<SharedFile>, BridgeError> {
        fs::create_dir_all(&self.root).await?;
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            // Names that are not valid UTF-8 cannot be requested back over HTTP.
            if let Ok(name) = entry.file_name().into_string() {
                files.push(SharedFile {
                    name,
                    size_bytes: meta.len(),
                });
            }
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Open the requested file for streaming.
    ///
    /// The port check runs first: an unknown port is `ForbiddenPort` whatever
    /// the filename is.
    pub async fn download(&self, req: &BridgeRequest) -> Result<FileDownload, BridgeError> {
        if !self.session.is_port_open(req.port).await {
            return Err(BridgeError::ForbiddenPort(req.port));
        }
        let name = req.filename.as_deref().ok_or(BridgeError::NotFound)?;
        let path = self.resolve(name).await?;
        let file = File::open(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => BridgeError::NotFound,
            _ => BridgeError::Transfer(e),
        })?;
        let size_bytes = file.metadata().await.map_err(BridgeError::Transfer)?.len();
        Ok(FileDownload {
            name: name.to_string(),
            size_bytes,
            file,
        })
    }

    /// Map `name` to a regular file directly inside the shared directory.
    ///
    /// Anything other than a single plain path component is rejected, and the
    /// canonical path must still sit in the canonical root, which also catches
    /// symlinks pointing elsewhere.
    async fn resolve(&self, name: &str) -> Result<PathBuf, BridgeError> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(BridgeError::NotFound),
        }
        let root = fs::canonicalize(&self.root)
            .await
            .map_err(|_| BridgeError::NotFound)?;
        let candidate = fs::canonicalize(root.join(name))
            .await
            .map_err(|_| BridgeError::NotFound)?;
        if candidate.parent() != Some(root.as_path()) {
            return Err(BridgeError::NotFound);
        }
        let meta = fs::metadata(&candidate)
            .await
            .map_err(|_| BridgeError::NotFound)?;
        if !meta.is_file() {
            return Err(BridgeError::NotFound);
        }
        Ok(candidate)
    }
}
