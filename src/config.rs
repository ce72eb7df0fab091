//! Configuration file of the `db_backup` binary.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

use crate::credentials::{KeyError, KeyMaterial, DEFAULT_KEY_ENV};
use crate::storage::{DirectoryStore, ObjectStore, S3CliStore};

/// Settings read from the TOML configuration file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// JSON file holding servers and databases.
    pub catalog: PathBuf,
    /// Directory the dumps are written to before upload.
    pub dump_dir: PathBuf,
    /// Bucket receiving the dumps.
    pub bucket: String,
    /// Environment variable holding the base64 encoded password key.
    pub key_env: String,
    /// Where the dumps are uploaded to.
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            catalog: "/var/lib/db_backup/catalog.json".into(),
            dump_dir: "/tmp/dumps".into(),
            bucket: "database-backups".into(),
            key_env: DEFAULT_KEY_ENV.into(),
            store: StoreConfig::default(),
        }
    }
}

/// Object store receiving the dumps, selected with `kind`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// A directory tree, e.g. a mounted bucket. Buckets are directories below `root`.
    Directory { root: PathBuf },
    /// S3 through the `aws` command line client.
    S3 {
        #[serde(default = "default_aws_program")]
        program: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint_url: Option<String>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Directory {
            root: "/mnt/backups".into(),
        }
    }
}

fn default_aws_program() -> PathBuf {
    "aws".into()
}

impl StoreConfig {
    /// The configured store.
    pub fn object_store(&self) -> Box<dyn ObjectStore> {
        match self {
            Self::Directory { root } => Box::new(DirectoryStore::new(root)),
            Self::S3 {
                program,
                profile,
                region,
                endpoint_url,
            } => Box::new(
                S3CliStore::new()
                    .with_program(program)
                    .with_profile(profile.clone())
                    .with_region(region.clone())
                    .with_endpoint_url(endpoint_url.clone()),
            ),
        }
    }
}

/// The configuration is unusable. Nothing is backed up.
#[derive(Debug, Display, Error, From)]
pub enum ConfigError {
    #[display("reading config file {} failed: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[from]
    #[display("config file is malformed: {_0}")]
    Parse(toml::de::Error),
    #[display("bucket must not be empty")]
    EmptyBucket,
    #[from]
    #[display("password key unavailable: {_0}")]
    Key(KeyError),
}

impl Config {
    /// Reads the config at `path`.
    ///
    /// If it doesn't exist yet, a default config is written there and returned.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(target: "config", "Writing default config to {} because it doesn't exist yet", path.display());
                let config = Self::default();
                if let Err(e) = config.write(path) {
                    log::warn!(target: "config", "Writing default config to {} failed: {e}", path.display());
                }
                config
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if config.bucket.trim().is_empty() {
            return Err(ConfigError::EmptyBucket);
        }
        Ok(config)
    }

    fn write(&self, path: &Path) -> io::Result<()> {
        let content = toml::to_string_pretty(self).map_err(io::Error::other)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)
    }

    /// Loads the password key from the configured environment variable.
    pub fn key_material(&self) -> Result<KeyMaterial, ConfigError> {
        Ok(KeyMaterial::from_env(&self.key_env)?)
    }
}
