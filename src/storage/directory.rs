use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use super::{ObjectStore, TransportError};

/// [ObjectStore] on a (usually mounted remote) file system.
///
/// Buckets are sub-directories of the root, key segments nested directories.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        if root.is_relative() {
            log::warn!(target: "storage::directory", "store root is relative: {}", root.display());
        }

        Self { root }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Option<PathBuf> {
        let valid = |segment: &str| {
            !segment.is_empty() && segment != "." && segment != ".." && !segment.contains('\\')
        };
        if !valid(bucket) || !key.split('/').all(valid) {
            return None;
        }

        let mut path = self.root.join(bucket);
        path.extend(key.split('/'));
        Some(path)
    }
}

fn store(path: &Path, body: &mut dyn Read) -> io::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".partial");
    let tmp = path.with_file_name(tmp_name);

    match write_synced(&tmp, body).and_then(|written| fs::rename(&tmp, path).map(|_| written)) {
        Ok(written) => Ok(written),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_synced(path: &Path, body: &mut dyn Read) -> io::Result<u64> {
    let mut file = File::create(path)?;
    let written = io::copy(body, &mut file)?;
    file.sync_all()?;
    Ok(written)
}

impl ObjectStore for DirectoryStore {
    fn upload(&self, bucket: &str, key: &str, body: &mut dyn Read) -> Result<u64, TransportError> {
        let path = self
            .object_path(bucket, key)
            .ok_or_else(|| TransportError::InvalidKey(format!("{bucket}/{key}")))?;
        log::debug!(target: "storage::directory", "Storing {bucket}/{key} at {}", path.display());

        store(&path, body).map_err(|source| TransportError::Io {
            bucket: bucket.to_string(),
            key: key.to_string(),
            path,
            source,
        })
    }
}
