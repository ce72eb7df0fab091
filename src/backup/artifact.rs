use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::catalog::{Database, Server};

/// Local dump file of one database on one day.
///
/// Named `{server}_{database}_{YYYY-MM-DD}.sql` and uploaded as
/// `{server}/{database}/{file name}`. A second dump on the same day reuses the
/// name and overwrites the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    path: PathBuf,
    key: String,
}

impl Artifact {
    pub fn new(dump_dir: &Path, server: &Server, database: &Database, date: NaiveDate) -> Self {
        let file_name = format!(
            "{}_{}_{}.sql",
            server.name,
            database.name,
            date.format("%Y-%m-%d")
        );
        let key = format!("{}/{}/{file_name}", server.name, database.name);

        Self {
            path: dump_dir.join(file_name),
            key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Object key the artifact is uploaded to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Opens the artifact for writing, discarding previous content.
    pub fn create(&self) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        std::os::unix::fs::OpenOptionsExt::mode(&mut options, 0o600);

        options.open(&self.path)
    }
}
