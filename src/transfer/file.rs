use serde::Serialize;
use std::{
    fs::File,
    io::{Cursor, Read},
    path::{Path, PathBuf},
};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Name, size and content type of a file waiting to be uploaded.
/// Kept by the task for callbacks after the bytes have moved into a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub content_type: String,
}

/// Where the bytes of a file come from.
#[derive(Debug)]
pub enum FileSource {
    Path(PathBuf),
    Memory(Vec<u8>),
}

impl FileSource {
    pub fn open(self) -> std::io::Result<Box<dyn Read + Send>> {
        match self {
            FileSource::Path(path) => Ok(Box::new(File::open(path)?)),
            FileSource::Memory(bytes) => Ok(Box::new(Cursor::new(bytes))),
        }
    }
}

/// A file handle produced by a drop or a picker selection.
#[derive(Debug)]
pub struct UploadFile {
    pub info: FileInfo,
    pub source: FileSource,
}

impl UploadFile {
    /// Describes a file on disk. Metadata errors are not reported here: an
    /// unreadable file fails later, when its transfer tries to open it.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let content_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string();
        Self {
            info: FileInfo {
                name,
                size,
                content_type,
            },
            source: FileSource::Path(path.to_path_buf()),
        }
    }

    pub fn from_bytes(
        name: impl Into<String>,
        content_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Self {
        let name = name.into();
        let content_type = content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| {
                mime_guess::from_path(&name)
                    .first()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string())
            });
        Self {
            info: FileInfo {
                name,
                size: bytes.len() as u64,
                content_type,
            },
            source: FileSource::Memory(bytes),
        }
    }
}
