//! Converges the recorded databases of a server with the ones it actually hosts.

use derive_more::{Display, Error, From};

use super::{CatalogError, CatalogStore, Database, DatabaseId, Server, ServerId};

/// Catalog mutations needed to match the live server.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Names to record as new databases.
    pub to_add: Vec<String>,
    /// Records to soft delete.
    pub to_remove: Vec<DatabaseId>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// The recorded databases violate an ordering or ownership assumption.
///
/// This hints at a corrupt catalog, so no diff is computed at all.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum CatalogInvariantError {
    #[display("databases of server #{server} are not sorted: '{previous}' is listed before '{next}'")]
    Unsorted {
        server: ServerId,
        previous: String,
        next: String,
    },
    #[display("database '{name}' (#{id}) is listed for server #{server} but belongs to #{owner}")]
    ForeignRecord {
        server: ServerId,
        id: DatabaseId,
        name: String,
        owner: ServerId,
    },
}

/// Computes which databases to add and which to remove.
///
/// `observed` may be in any order and contain duplicates. `recorded` has to be
/// the complete list of the server sorted ascending by name.
///
/// Already soft deleted records are never removed again. A name that is only
/// recorded as soft deleted counts as unknown and is added as a new record;
/// old records are never resurrected.
pub fn reconcile<I, S>(
    server: ServerId,
    observed: I,
    recorded: &[Database],
) -> Result<Reconciliation, CatalogInvariantError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    check_recorded(server, recorded)?;

    let mut observed: Vec<String> = observed.into_iter().map(Into::into).collect();
    observed.sort_unstable();
    observed.dedup();

    let to_add = observed
        .iter()
        .filter(|name| !has_live_record(recorded, name))
        .cloned()
        .collect();

    let to_remove = recorded
        .iter()
        .filter(|db| observed.binary_search(&db.name).is_err())
        .filter(|db| !db.is_removed())
        .map(|db| db.id)
        .collect();

    Ok(Reconciliation { to_add, to_remove })
}

fn check_recorded(server: ServerId, recorded: &[Database]) -> Result<(), CatalogInvariantError> {
    if let Some(db) = recorded.iter().find(|db| db.server_id != server) {
        return Err(CatalogInvariantError::ForeignRecord {
            server,
            id: db.id,
            name: db.name.clone(),
            owner: db.server_id,
        });
    }

    // equal names are fine: a re-appeared database has a second record
    match recorded.windows(2).find(|pair| pair[0].name > pair[1].name) {
        Some([previous, next]) => Err(CatalogInvariantError::Unsorted {
            server,
            previous: previous.name.clone(),
            next: next.name.clone(),
        }),
        _ => Ok(()),
    }
}

fn has_live_record(recorded: &[Database], name: &str) -> bool {
    let start = recorded.partition_point(|db| db.name.as_str() < name);
    recorded[start..]
        .iter()
        .take_while(|db| db.name == name)
        .any(|db| !db.is_removed())
}

/// Failure to converge the catalog of a single server.
#[derive(Debug, Display, Error, From)]
pub enum ReconcileError {
    #[from]
    #[display("catalog invariant violated: {_0}")]
    Invariant(CatalogInvariantError),
    #[from]
    #[display("catalog access failed: {_0}")]
    Catalog(CatalogError),
}

/// Reconciles `server` against the `observed` database names and applies the result.
///
/// On a dry run the [Reconciliation] is only logged.
pub fn converge<C>(
    catalog: &mut C,
    server: &Server,
    observed: Vec<String>,
    dry_run: bool,
) -> Result<Reconciliation, ReconcileError>
where
    C: CatalogStore + ?Sized,
{
    log::info!(target: "catalog::reconcile", "Checking {} for new databases", server.name);
    let recorded = catalog.list_databases(server.id)?;
    let diff = reconcile(server.id, observed, &recorded)?;

    for name in &diff.to_add {
        log::info!(target: "catalog::reconcile", "New database on {}: {name}", server.name);
        if !dry_run {
            catalog.create_database(server.id, name)?;
        }
    }

    for id in &diff.to_remove {
        let name = recorded
            .iter()
            .find(|db| db.id == *id)
            .map_or("?", |db| db.name.as_str());
        log::info!(target: "catalog::reconcile", "Removing database from {}: {name}", server.name);
        if !dry_run {
            catalog.soft_delete_database(*id)?;
        }
    }

    if diff.is_empty() {
        log::debug!(target: "catalog::reconcile", "Catalog of {} is up to date", server.name);
    }

    Ok(diff)
}
