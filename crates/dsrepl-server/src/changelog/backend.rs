//! Storage engines behind the changelog.
//!
//! The file engine keeps one append-only log per (domain, origin server):
//!
//! ```text
//! <root>/<hex(domain)>/<server_id>.log
//! frame := len:u32le | crc32(body):u32le | body (bincode StoredChange)
//! ```
//!
//! Every append is fsynced before it is acknowledged. Purge rewrites the log
//! through a temp file and an atomic rename.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::StoredChange;
use crate::csn::ServerId;
use crate::error::ReplError;

const LOG_EXTENSION: &str = "log";
const FRAME_HEADER_LEN: usize = 8;

/// Selects the changelog storage engine (`replication_db_implementation`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbImplementation {
    /// Durable, fsynced log files.
    #[default]
    File,
    /// Volatile, in-process only.
    Memory,
}

/// Persistence for a single (domain, origin) log. Called with the origin's
/// writer lock held.
pub trait ChangelogBackend: Send {
    /// Durably append one change.
    fn append(&mut self, change: &StoredChange) -> Result<(), ReplError>;

    /// Replace the stored contents with `retained` (after a purge).
    fn rewrite(&mut self, retained: &[Arc<StoredChange>]) -> Result<(), ReplError>;

    /// Flush anything buffered.
    fn flush(&mut self) -> Result<(), ReplError>;
}

/// Backend that keeps nothing outside the in-memory index.
#[derive(Debug, Default)]
pub struct MemoryBackend;

impl ChangelogBackend for MemoryBackend {
    fn append(&mut self, _change: &StoredChange) -> Result<(), ReplError> {
        Ok(())
    }

    fn rewrite(&mut self, _retained: &[Arc<StoredChange>]) -> Result<(), ReplError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReplError> {
        Ok(())
    }
}

/// Append-only log file for one (domain, origin).
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: File,
}

impl FileBackend {
    /// Open (creating if needed) the log at `path`.
    pub fn open(path: &Path) -> Result<Self, ReplError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    fn encode(change: &StoredChange) -> Result<Vec<u8>, ReplError> {
        let body = bincode::serialize(change)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Read every change stored at `path`, validating frame and record checksums.
    /// Any damage, including a torn final frame, is reported as an error string.
    pub fn read_all(path: &Path) -> Result<Vec<StoredChange>, String> {
        let mut contents = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut contents))
            .map_err(|e| format!("{}: {}", path.display(), e))?;

        let mut changes: Vec<StoredChange> = Vec::new();
        let mut offset = 0usize;
        while offset < contents.len() {
            if contents.len() - offset < FRAME_HEADER_LEN {
                return Err(format!(
                    "{}: truncated frame header at offset {}",
                    path.display(),
                    offset
                ));
            }
            let len = u32::from_le_bytes([
                contents[offset],
                contents[offset + 1],
                contents[offset + 2],
                contents[offset + 3],
            ]) as usize;
            let crc = u32::from_le_bytes([
                contents[offset + 4],
                contents[offset + 5],
                contents[offset + 6],
                contents[offset + 7],
            ]);
            let start = offset + FRAME_HEADER_LEN;
            if contents.len() - start < len {
                return Err(format!(
                    "{}: truncated frame body at offset {}",
                    path.display(),
                    offset
                ));
            }
            let body = &contents[start..start + len];
            if crc32fast::hash(body) != crc {
                return Err(format!(
                    "{}: frame checksum mismatch at offset {}",
                    path.display(),
                    offset
                ));
            }
            let change: StoredChange = bincode::deserialize(body)
                .map_err(|e| format!("{}: undecodable frame at offset {}: {}", path.display(), offset, e))?;
            if !change.record.validate_crc() {
                return Err(format!(
                    "{}: record {} failed checksum",
                    path.display(),
                    change.record.csn
                ));
            }
            if let Some(prev) = changes.last() {
                if change.record.csn <= prev.record.csn {
                    return Err(format!(
                        "{}: record {} stored after {}",
                        path.display(),
                        change.record.csn,
                        prev.record.csn
                    ));
                }
            }
            changes.push(change);
            offset = start + len;
        }
        Ok(changes)
    }
}

impl ChangelogBackend for FileBackend {
    fn append(&mut self, change: &StoredChange) -> Result<(), ReplError> {
        let frame = Self::encode(change)?;
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn rewrite(&mut self, retained: &[Arc<StoredChange>]) -> Result<(), ReplError> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let mut out = File::create(&tmp)?;
            for change in retained {
                out.write_all(&Self::encode(change)?)?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        if let Some(dir) = self.path.parent() {
            if let Ok(d) = File::open(dir) {
                let _ = d.sync_all();
            }
        }
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        debug!(path = %self.path.display(), retained = retained.len(), "changelog file compacted");
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ReplError> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// A log found on disk at startup.
pub(crate) struct DiscoveredLog {
    pub domain: String,
    pub server_id: ServerId,
    pub changes: Result<Vec<StoredChange>, String>,
}

/// Where the changelog lives.
#[derive(Debug, Clone)]
pub(crate) enum StorageRoot {
    Memory,
    File(PathBuf),
}

impl StorageRoot {
    pub fn new(implementation: DbImplementation, dir: &Path) -> Self {
        match implementation {
            DbImplementation::Memory => StorageRoot::Memory,
            DbImplementation::File => StorageRoot::File(dir.to_path_buf()),
        }
    }

    pub fn open_log(
        &self,
        domain: &str,
        server_id: ServerId,
    ) -> Result<Box<dyn ChangelogBackend>, ReplError> {
        match self {
            StorageRoot::Memory => Ok(Box::new(MemoryBackend)),
            StorageRoot::File(root) => Ok(Box::new(FileBackend::open(&log_path(
                root, domain, server_id,
            ))?)),
        }
    }

    pub fn discover(&self) -> Result<Vec<DiscoveredLog>, ReplError> {
        let root = match self {
            StorageRoot::Memory => return Ok(Vec::new()),
            StorageRoot::File(root) => root,
        };
        fs::create_dir_all(root)?;

        let mut found = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().into_owned();
            let domain = match decode_domain(&dir_name) {
                Some(d) => d,
                None => continue,
            };
            for log in fs::read_dir(entry.path())? {
                let path = log?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                    continue;
                }
                let server_id = match path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<ServerId>().ok())
                {
                    Some(id) => id,
                    None => continue,
                };
                found.push(DiscoveredLog {
                    domain: domain.clone(),
                    server_id,
                    changes: FileBackend::read_all(&path),
                });
            }
        }
        Ok(found)
    }
}

fn log_path(root: &Path, domain: &str, server_id: ServerId) -> PathBuf {
    root.join(encode_domain(domain))
        .join(format!("{}.{}", server_id, LOG_EXTENSION))
}

fn encode_domain(domain: &str) -> String {
    domain.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_domain(name: &str) -> Option<String> {
    if name.len() % 2 != 0 {
        return None;
    }
    let bytes: Option<Vec<u8>> = (0..name.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(name.get(i..i + 2)?, 16).ok())
        .collect();
    String::from_utf8(bytes?).ok()
}
