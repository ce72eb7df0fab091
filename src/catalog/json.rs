use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;

use super::{CatalogError, CatalogStore, Database, DatabaseId, Server, ServerId};

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct CatalogFile {
    #[serde(default)]
    servers: Vec<Server>,
    #[serde(default)]
    databases: Vec<Database>,
}

/// [CatalogStore] kept in a single JSON document.
///
/// Every mutation rewrites the whole document: it's written to a temporary
/// sibling first and then renamed over the original.
#[derive(Debug, Default)]
pub struct JsonCatalog {
    path: Option<PathBuf>,
    data: CatalogFile,
}

impl JsonCatalog {
    /// Loads the catalog at `path`. A missing file is an empty catalog.
    ///
    /// Server records are not validated here; a misconfigured server only
    /// fails once a command is built for it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!(target: "catalog", "No catalog at {}, starting empty", path.display());
                CatalogFile::default()
            }
            Err(source) => return Err(CatalogError::Io { path, source }),
        };

        Ok(Self {
            path: Some(path),
            data,
        })
    }

    /// A catalog that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Adds or replaces a server record.
    pub fn upsert_server(&mut self, server: Server) -> Result<(), CatalogError> {
        server.validate()?;

        match self.data.servers.iter_mut().find(|s| s.id == server.id) {
            Some(existing) => *existing = server,
            None => self.data.servers.push(server),
        }
        self.persist()
    }

    /// Replaces a database record, e.g. to change its backup flag or table filters.
    pub fn update_database(&mut self, database: Database) -> Result<(), CatalogError> {
        let existing = self
            .data
            .databases
            .iter_mut()
            .find(|db| db.id == database.id)
            .ok_or(CatalogError::UnknownDatabase(database.id))?;
        *existing = database;

        self.persist()
    }

    fn persist(&self) -> Result<(), CatalogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_vec_pretty(&self.data)?;
        let tmp = path.with_extension("json.tmp");
        write_then_rename(&tmp, path, &json).map_err(|source| CatalogError::Io {
            path: path.clone(),
            source,
        })
    }
}

fn write_then_rename(tmp: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(tmp, contents)?;
    fs::rename(tmp, path)
}

impl CatalogStore for JsonCatalog {
    fn list_servers(&self) -> Result<Vec<Server>, CatalogError> {
        let mut servers = self.data.servers.clone();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    fn list_databases(&self, server: ServerId) -> Result<Vec<Database>, CatalogError> {
        let mut databases: Vec<_> = self
            .data
            .databases
            .iter()
            .filter(|db| db.server_id == server)
            .cloned()
            .collect();
        databases.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(databases)
    }

    fn create_database(&mut self, server: ServerId, name: &str) -> Result<Database, CatalogError> {
        if !self.data.servers.iter().any(|s| s.id == server) {
            return Err(CatalogError::UnknownServer(server));
        }

        let id = self.data.databases.iter().map(|db| db.id).max().unwrap_or(0) + 1;
        let database = Database {
            id,
            server_id: server,
            name: name.to_string(),
            backup: false,
            only_tables: String::new(),
            exclude_tables: String::new(),
            added: Utc::now(),
            removed: None,
        };
        self.data.databases.push(database.clone());
        self.persist()?;

        Ok(database)
    }

    fn soft_delete_database(&mut self, id: DatabaseId) -> Result<(), CatalogError> {
        let database = self
            .data
            .databases
            .iter_mut()
            .find(|db| db.id == id)
            .ok_or(CatalogError::UnknownDatabase(id))?;
        database.backup = false;
        database.removed = Some(Utc::now());

        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::server;

    #[test]
    fn databases_are_listed_sorted_by_name() {
        let mut catalog = JsonCatalog::in_memory();
        catalog.upsert_server(server("web")).unwrap();
        for name in ["zeta", "alpha", "mid"] {
            catalog.create_database(1, name).unwrap();
        }

        let names: Vec<_> = catalog
            .list_databases(1)
            .unwrap()
            .into_iter()
            .map(|db| db.name)
            .collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn soft_delete_clears_backup_and_sets_removed() {
        let mut catalog = JsonCatalog::in_memory();
        catalog.upsert_server(server("web")).unwrap();
        let db = catalog.create_database(1, "shop").unwrap();
        assert!(!db.backup);

        catalog.soft_delete_database(db.id).unwrap();

        let db = &catalog.list_databases(1).unwrap()[0];
        assert!(db.is_removed());
        assert!(matches!(
            catalog.soft_delete_database(42),
            Err(CatalogError::UnknownDatabase(42))
        ));
    }

    #[test]
    fn mutations_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");

        let mut catalog = JsonCatalog::open(&path).unwrap();
        catalog.upsert_server(server("web")).unwrap();
        catalog.create_database(1, "shop").unwrap();

        let reopened = JsonCatalog::open(&path).unwrap();
        assert_eq!(reopened.list_servers().unwrap().len(), 1);
        assert_eq!(reopened.list_databases(1).unwrap()[0].name, "shop");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn invalid_servers_are_rejected() {
        let mut catalog = JsonCatalog::in_memory();
        let mut srv = server("web");
        srv.proxy_host = Some("jump".into());

        assert!(matches!(
            catalog.upsert_server(srv),
            Err(CatalogError::InvalidServer(_))
        ));
    }

    #[test]
    fn open_keeps_misconfigured_servers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let mut srv = server("web");
        srv.proxy_host = Some("jump".into());
        let file = CatalogFile {
            servers: vec![srv],
            databases: Vec::new(),
        };
        fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        let catalog = JsonCatalog::open(&path).unwrap();
        let servers = catalog.list_servers().unwrap();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].validate().is_err());
    }
}
