// SPDX-FileCopyrightText: 2025 The seedgate Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod ranges;
pub mod urn;

pub use ranges::RangeSet;
pub use urn::Sha1Urn;

use crate::errors::StorageError;

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};
use tracing::{event, Level};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Serialized hash tree for a shared file. Building trees happens elsewhere;
/// the upload side only streams what it is given.
pub trait HashTreeSource: fmt::Debug + Send + Sync {
    /// Base32 root hash, advertised in `X-Thex-URI`.
    fn root32(&self) -> String;
    /// The DIME-encoded tree as served to `N2X` requests.
    fn serialize(&self) -> Vec<u8>;
}

/// Download progress of a file that is still incomplete but already shared.
#[derive(Debug, Default)]
pub struct PartialProgress {
    available: Mutex<RangeSet>,
    downloading: AtomicBool,
}

impl PartialProgress {
    pub fn new(available: RangeSet, downloading: bool) -> Self {
        Self {
            available: Mutex::new(available),
            downloading: AtomicBool::new(downloading),
        }
    }

    pub fn available(&self) -> RangeSet {
        match self.available.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn add_available(&self, start: u64, end: u64) {
        match self.available.lock() {
            Ok(mut guard) => guard.add(start, end),
            Err(poisoned) => poisoned.into_inner().add(start, end),
        }
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::Acquire)
    }

    pub fn set_downloading(&self, downloading: bool) {
        self.downloading.store(downloading, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub enum Availability {
    Complete,
    Partial(Arc<PartialProgress>),
}

#[derive(Debug, Clone)]
pub struct FileDesc {
    pub index: u32,
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub urn: Sha1Urn,
    pub availability: Availability,
    pub hash_tree: Option<Arc<dyn HashTreeSource>>,
}

impl FileDesc {
    pub fn is_partial(&self) -> bool {
        matches!(self.availability, Availability::Partial(_))
    }

    pub fn partial_progress(&self) -> Option<&Arc<PartialProgress>> {
        match &self.availability {
            Availability::Partial(progress) => Some(progress),
            Availability::Complete => None,
        }
    }
}

/// The set of files this node serves, in index order.
#[derive(Debug, Default)]
pub struct Library {
    files: Vec<Arc<FileDesc>>,
    by_urn: HashMap<Sha1Urn, usize>,
}

impl Library {
    pub fn new(files: Vec<FileDesc>) -> Self {
        let mut library = Self::default();
        for file in files {
            library.by_urn.insert(file.urn, library.files.len());
            library.files.push(Arc::new(file));
        }
        library
    }

    /// Hashes every configured path on the blocking pool. Files that cannot
    /// be read are skipped and logged.
    pub async fn load(paths: &[PathBuf]) -> Self {
        let mut files = Vec::new();
        for path in paths {
            let owned = path.clone();
            let result = tokio::task::spawn_blocking(move || hash_file(&owned)).await;
            match result {
                Ok(Ok((size, urn))) => {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    event!(Level::DEBUG, path = ?path, size, %urn, "Shared file hashed");
                    files.push(FileDesc {
                        index: files.len() as u32,
                        name,
                        path: path.clone(),
                        size,
                        urn,
                        availability: Availability::Complete,
                        hash_tree: None,
                    });
                }
                Ok(Err(e)) => {
                    event!(Level::WARN, path = ?path, error = %e, "Skipping unreadable shared file");
                }
                Err(e) => {
                    event!(Level::ERROR, path = ?path, error = %e, "Hashing task failed");
                }
            }
        }
        event!(Level::INFO, count = files.len(), "Library loaded");
        Self::new(files)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FileDesc>> {
        self.files.iter()
    }

    /// Lookup for `/get/<index>/<name>`. The name must match as well.
    pub fn get(&self, index: u32, name: &str) -> Option<Arc<FileDesc>> {
        self.files
            .get(index as usize)
            .filter(|fd| fd.name == name)
            .cloned()
    }

    pub fn get_by_urn(&self, urn: &Sha1Urn) -> Option<Arc<FileDesc>> {
        self.by_urn.get(urn).map(|&i| self.files[i].clone())
    }
}

pub fn hash_file(path: &Path) -> Result<(u64, Sha1Urn), StorageError> {
    let mut file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(StorageError::NotAFile(path.to_path_buf()));
    }

    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
    }
    Ok((size, Sha1Urn::from_digest(hasher.finalize().into())))
}

/// Fills `buf` from `offset` without touching the file cursor, so one handle
/// can serve concurrent readers.
#[cfg(unix)]
pub fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
pub fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(())
}
