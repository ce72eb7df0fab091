//! The catalog of known servers and the databases they host.
//!
//! The catalog is only accessed through the [CatalogStore] trait.
//! [JsonCatalog] is the store used by the binary.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

mod json;
pub mod reconcile;

pub use json::JsonCatalog;
pub use reconcile::{converge, reconcile, Reconciliation};

/// Identifier of a [Server] record.
pub type ServerId = i64;
/// Identifier of a [Database] record.
pub type DatabaseId = i64;

/// A remote MySQL/MariaDB endpoint.
///
/// The proxy fields are stored flat. Use [Server::proxy] to obtain them, which
/// checks that either none or all of them are set.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Encrypted password, see [crate::credentials].
    #[serde(default, deserialize_with = "empty_as_none")]
    pub password: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub proxy_host: Option<String>,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub proxy_username: Option<String>,
    #[serde(default)]
    pub proxy_identity: Option<PathBuf>,
}

/// SSH jump host used to reach a [Server].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHop<'a> {
    pub host: &'a str,
    pub username: &'a str,
    pub identity: &'a Path,
}

/// A [Server] record is incomplete.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
#[display("server '{server}' is misconfigured: {problem}")]
pub struct InvalidServer {
    pub server: String,
    pub problem: &'static str,
}

impl Server {
    /// Checks the fields required to reach the server.
    pub fn validate(&self) -> Result<(), InvalidServer> {
        let problem = if self.name.is_empty() {
            "name is required"
        } else if self.host.is_empty() {
            "host is required"
        } else if self.port == 0 {
            "port is required"
        } else if self.username.is_empty() {
            "username is required"
        } else {
            return self.proxy().map(|_| ());
        };

        Err(self.invalid(problem))
    }

    /// The SSH hop if one is configured.
    pub fn proxy(&self) -> Result<Option<ProxyHop<'_>>, InvalidServer> {
        let identity = self
            .proxy_identity
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty());

        match (self.proxy_host.as_deref(), self.proxy_username.as_deref(), identity) {
            (None, None, None) => Ok(None),
            (Some(host), Some(username), Some(identity)) => Ok(Some(ProxyHop {
                host,
                username,
                identity,
            })),
            (Some(_), None, _) => Err(self.invalid("proxy_username is required")),
            (None, Some(_), _) => Err(self.invalid("proxy_host is required")),
            (_, _, None) => Err(self.invalid("proxy_identity is required")),
            (None, None, Some(_)) => Err(self.invalid("proxy_host is required")),
        }
    }

    fn invalid(&self, problem: &'static str) -> InvalidServer {
        InvalidServer {
            server: self.name.clone(),
            problem,
        }
    }
}

/// A logical database hosted on a [Server].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Database {
    pub id: DatabaseId,
    pub server_id: ServerId,
    pub name: String,
    /// Only databases with this flag are dumped.
    #[serde(default)]
    pub backup: bool,
    /// Space separated tables to dump. Empty means all tables.
    #[serde(default)]
    pub only_tables: String,
    /// Space separated tables to skip.
    #[serde(default)]
    pub exclude_tables: String,
    pub added: DateTime<Utc>,
    #[serde(default)]
    pub removed: Option<DateTime<Utc>>,
}

impl Database {
    /// Returns if the database was soft deleted.
    pub fn is_removed(&self) -> bool {
        !self.backup && self.removed.is_some()
    }

    pub fn only_tables(&self) -> impl Iterator<Item = &str> {
        self.only_tables.split_whitespace()
    }

    pub fn excluded_tables(&self) -> impl Iterator<Item = &str> {
        self.exclude_tables.split_whitespace()
    }
}

/// Errors of a [CatalogStore].
#[derive(Debug, Display, Error, From)]
pub enum CatalogError {
    /// Reading or writing the catalog file failed.
    #[display("accessing catalog file {} failed: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
    /// The catalog file isn't valid.
    #[from]
    #[display("catalog file is malformed: {_0}")]
    Malformed(serde_json::Error),
    /// No database with that id exists.
    #[display("database #{_0} does not exist")]
    UnknownDatabase(#[error(ignore)] DatabaseId),
    /// No server with that id exists.
    #[display("server #{_0} does not exist")]
    UnknownServer(#[error(ignore)] ServerId),
    /// A server record was rejected.
    #[from]
    InvalidServer(InvalidServer),
}

/// Persistence of servers and databases.
pub trait CatalogStore {
    /// All servers, ordered by name.
    fn list_servers(&self) -> Result<Vec<Server>, CatalogError>;

    /// All databases of a server, ordered ascending by name.
    fn list_databases(&self, server: ServerId) -> Result<Vec<Database>, CatalogError>;

    /// Records a newly observed database. Backups are disabled initially.
    fn create_database(&mut self, server: ServerId, name: &str) -> Result<Database, CatalogError>;

    /// Clears the backup flag and sets the removal timestamp.
    fn soft_delete_database(&mut self, id: DatabaseId) -> Result<(), CatalogError>;
}

fn empty_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: From<String>,
{
    let value: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()).map(T::from))
}
