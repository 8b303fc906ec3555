//! File sentinel and received-file handles.
//!
//! A handler that wants to return a file does not read it into a `Value`;
//! it returns a [`FileSentinel`], which switches the dispatcher to the
//! `FileMeta`-plus-raw-body sub-protocol. On the receiving side the body is
//! streamed straight to disk and the caller gets a [`ReceivedFile`] pointing
//! at the saved path.

use std::path::{Path, PathBuf};

use wirecall_proto::FileMeta;

/// Marks a handler return value as "the file at this path".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSentinel {
    /// File to transmit.
    pub src_path: PathBuf,
    /// Destination path to request on the receiving side; the receiver
    /// chooses a temporary path when absent.
    pub dst_path: Option<PathBuf>,
}

impl FileSentinel {
    /// Send the file at `src_path`, letting the receiver pick a destination.
    #[must_use]
    pub fn new(src_path: impl Into<PathBuf>) -> Self {
        Self { src_path: src_path.into(), dst_path: None }
    }

    /// Send the file at `src_path`, asking the receiver to store it at
    /// `dst_path`.
    #[must_use]
    pub fn with_destination(src_path: impl Into<PathBuf>, dst_path: impl Into<PathBuf>) -> Self {
        Self { src_path: src_path.into(), dst_path: Some(dst_path.into()) }
    }
}

/// A file delivered by the peer, saved to the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Path of the file on the sending side.
    pub src_path: PathBuf,
    /// Where the body was written locally.
    pub path: PathBuf,
    /// Body size in bytes.
    pub size: u64,
}

impl ReceivedFile {
    /// Build the handle from a fully received `FileMeta` packet.
    ///
    /// Only valid once the engine has resolved `dst_path` and drained the
    /// body; the builder falls back to the source path if resolution never
    /// happened (it always has by the time the packet reaches a caller).
    #[must_use]
    pub(crate) fn from_meta(meta: &FileMeta) -> Self {
        let path = meta
            .dst_path
            .as_ref()
            .map_or_else(|| PathBuf::from(&meta.src_path), PathBuf::from);
        Self {
            src_path: PathBuf::from(&meta.src_path),
            path,
            size: meta.size.max(0) as u64,
        }
    }
}

/// Pick a collision-resistant temporary destination for an incoming file.
///
/// The name folds in the connection id and the frame's global id, both
/// unique at any moment, plus the original file name for readability.
pub(crate) fn temp_destination(connection_id: i32, global_id: i32, src_path: &str) -> PathBuf {
    let name = Path::new(src_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    std::env::temp_dir().join(format!("wirecall-{connection_id}-{global_id}-{name}"))
}
