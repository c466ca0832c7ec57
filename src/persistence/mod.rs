//! Durable storage binding for broker state.
//!
//! The broker engine treats the returned [`Persistence`] as an opaque handle.
//! This module only owns the lifecycle of the backing store: open, lock,
//! validate the on-disk header, and release.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32Hasher;
use fs2::FileExt;
use serde::Deserialize;
use thiserror::Error;
use tracing::{error, info, warn};

const HEADER_MAGIC: &[u8; 8] = b"RELAYDB\0";
const HEADER_VERSION: u32 = 1;
const HEADER_LEN: u64 = 32;
const HEADER_CRC_OFFSET: usize = 28;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("persistence file {0} is locked by another process")]
    Locked(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("persistence file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: BackendKind,
    pub file: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::File,
            file: PathBuf::from("./persist.db"),
        }
    }
}

impl PersistenceConfig {
    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            backend: BackendKind::File,
            file: path.into(),
        }
    }

    pub fn memory() -> Self {
        Self {
            backend: BackendKind::Memory,
            ..Self::default()
        }
    }
}

/// Open handle to the broker's durable store.
#[derive(Debug)]
pub struct Persistence {
    backend: Backend,
}

#[derive(Debug)]
enum Backend {
    File { path: PathBuf, file: File },
    Memory,
}

/// Open the backend selected by `config`.
///
/// Blocking. A file backend is locked exclusively for as long as the handle
/// lives.
pub fn open(config: &PersistenceConfig) -> Result<Persistence, PersistenceError> {
    let backend = match config.backend {
        BackendKind::Memory => {
            info!("using in-memory persistence");
            Backend::Memory
        }
        BackendKind::File => open_file(&config.file)?,
    };
    Ok(Persistence { backend })
}

fn open_file(path: &Path) -> Result<Backend, PersistenceError> {
    let io_err = |source: io::Error| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(io_err)?;

    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            return Err(PersistenceError::Locked(path.to_path_buf()));
        }
        // EWOULDBLOCK/EAGAIN on Linux and macOS.
        Err(e) if matches!(e.raw_os_error(), Some(11) | Some(35)) => {
            return Err(PersistenceError::Locked(path.to_path_buf()));
        }
        Err(e) => return Err(io_err(e)),
    }

    let len = file.metadata().map_err(io_err)?.len();
    if len == 0 {
        write_header(&mut file).map_err(io_err)?;
        info!(path = %path.display(), "created persistence file");
    } else if len < HEADER_LEN {
        return Err(PersistenceError::Corrupt {
            path: path.to_path_buf(),
            reason: "file too small to contain header".to_string(),
        });
    } else {
        validate_header(&mut file).map_err(|reason| match reason {
            HeaderFault::Io(source) => PersistenceError::Io {
                path: path.to_path_buf(),
                source,
            },
            HeaderFault::Invalid(reason) => PersistenceError::Corrupt {
                path: path.to_path_buf(),
                reason,
            },
        })?;
        info!(path = %path.display(), bytes = len, "opened persistence file");
    }

    Ok(Backend::File {
        path: path.to_path_buf(),
        file,
    })
}

fn encode_header() -> [u8; HEADER_LEN as usize] {
    let mut header = [0u8; HEADER_LEN as usize];
    header[..8].copy_from_slice(HEADER_MAGIC);
    header[8..12].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    let mut hasher = Crc32Hasher::new();
    hasher.update(&header[..HEADER_CRC_OFFSET]);
    header[HEADER_CRC_OFFSET..].copy_from_slice(&hasher.finalize().to_le_bytes());
    header
}

fn write_header(file: &mut File) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&encode_header())?;
    file.sync_all()
}

enum HeaderFault {
    Io(io::Error),
    Invalid(String),
}

fn validate_header(file: &mut File) -> Result<(), HeaderFault> {
    let mut header = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0)).map_err(HeaderFault::Io)?;
    file.read_exact(&mut header).map_err(HeaderFault::Io)?;

    if header[..8] != HEADER_MAGIC[..] {
        return Err(HeaderFault::Invalid("bad magic".to_string()));
    }

    let mut version = [0u8; 4];
    version.copy_from_slice(&header[8..12]);
    let version = u32::from_le_bytes(version);
    if version != HEADER_VERSION {
        return Err(HeaderFault::Invalid(format!(
            "unsupported format version {version}"
        )));
    }

    let mut stored = [0u8; 4];
    stored.copy_from_slice(&header[HEADER_CRC_OFFSET..]);
    let mut hasher = Crc32Hasher::new();
    hasher.update(&header[..HEADER_CRC_OFFSET]);
    if hasher.finalize() != u32::from_le_bytes(stored) {
        return Err(HeaderFault::Invalid("header checksum mismatch".to_string()));
    }

    Ok(())
}

impl Persistence {
    pub fn backend_kind(&self) -> BackendKind {
        match self.backend {
            Backend::File { .. } => BackendKind::File,
            Backend::Memory => BackendKind::Memory,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backend {
            Backend::File { path, .. } => Some(path),
            Backend::Memory => None,
        }
    }

    /// Flush and unlock the store. The lock is also dropped with the handle,
    /// but only this path reports sync failures.
    pub fn release(self) -> Result<(), PersistenceError> {
        match self.backend {
            Backend::Memory => Ok(()),
            Backend::File { path, file } => {
                let synced = file.sync_all();
                if let Err(e) = FileExt::unlock(&file) {
                    warn!(path = %path.display(), error = %e, "failed to unlock persistence file");
                }
                drop(file);
                match synced {
                    Ok(()) => {
                        info!(path = %path.display(), "released persistence file");
                        Ok(())
                    }
                    Err(source) => {
                        error!(path = %path.display(), error = %source, "persistence sync failed");
                        Err(PersistenceError::Io { path, source })
                    }
                }
            }
        }
    }
}
