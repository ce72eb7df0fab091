//! A complete run over all cataloged servers.
//!
//! First the catalog of every server is converged with the databases the
//! server actually hosts, then every database flagged for backup is dumped.
//! Failures are contained to the server or database they happened on.

use std::io;
use std::path::PathBuf;

use chrono::NaiveDate;
use derive_more::{Display, Error, From};

use crate::backup::{BackupError, BackupState, Orchestrator};
use crate::catalog::reconcile::ReconcileError;
use crate::catalog::{self, CatalogError, CatalogStore, Server};
use crate::remote::{self, Launcher, ListError};
use crate::storage::ObjectStore;

/// Options of a single [run].
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Stop after updating the database catalog.
    pub update_list_only: bool,
    /// Day the dumps are named after.
    pub date: NaiveDate,
}

/// A failure that only affected part of the run.
#[derive(Debug, Display, Error)]
pub enum Failure {
    #[display("listing databases on {server} failed: {source}")]
    Listing { server: String, source: ListError },
    #[display("updating catalog of {server} failed: {source}")]
    Reconcile {
        server: String,
        source: ReconcileError,
    },
    #[display("reading catalog of {server} failed: {source}")]
    Catalog { server: String, source: CatalogError },
    Backup(BackupError),
}

/// The run couldn't start at all.
#[derive(Debug, Display, Error, From)]
pub enum RunError {
    #[from]
    #[display("reading servers from catalog failed: {_0}")]
    Catalog(CatalogError),
    #[display("creating dump directory {} failed: {source}", path.display())]
    DumpDir { path: PathBuf, source: io::Error },
}

/// What a [run] did.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub servers: usize,
    /// Servers whose catalog is up to date.
    pub converged: usize,
    /// Databases uploaded (or that would have been on a dry run).
    pub backed_up: usize,
    pub failures: Vec<Failure>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Updates the catalog of every server and backs up the flagged databases.
///
/// Servers are processed one after another, and so are their databases.
pub fn run<C, L, O>(
    catalog: &mut C,
    orchestrator: &Orchestrator<'_, L, O>,
    options: RunOptions,
) -> Result<RunSummary, RunError>
where
    C: CatalogStore + ?Sized,
    L: Launcher,
    O: ObjectStore,
{
    let servers = catalog.list_servers()?;
    let mut summary = RunSummary {
        servers: servers.len(),
        ..Default::default()
    };

    let mut converged = Vec::with_capacity(servers.len());
    for server in &servers {
        match update_database_list(catalog, orchestrator, server) {
            Ok(()) => converged.push(server),
            Err(failure) => {
                log::error!(target: "driver", "{failure}");
                summary.failures.push(failure);
            }
        }
    }
    summary.converged = converged.len();

    if options.update_list_only {
        return Ok(summary);
    }

    orchestrator.prepare().map_err(|source| RunError::DumpDir {
        path: orchestrator.dump_dir().to_path_buf(),
        source,
    })?;

    for server in converged {
        log::info!(target: "driver", "Dumping databases in {}", server.name);
        let databases = match catalog.list_databases(server.id) {
            Ok(databases) => databases,
            Err(source) => {
                let failure = Failure::Catalog {
                    server: server.name.clone(),
                    source,
                };
                log::error!(target: "driver", "{failure}");
                summary.failures.push(failure);
                continue;
            }
        };

        for database in databases.iter().filter(|db| db.backup) {
            match orchestrator.backup(server, database, options.date) {
                Ok(outcome) => {
                    debug_assert!(matches!(
                        outcome.state,
                        BackupState::Cleaned | BackupState::Uploaded | BackupState::Pending
                    ));
                    summary.backed_up += 1;
                }
                Err(e) => {
                    log::error!(target: "driver", "{e}");
                    summary.failures.push(Failure::Backup(e));
                }
            }
        }
    }

    Ok(summary)
}

fn update_database_list<C, L, O>(
    catalog: &mut C,
    orchestrator: &Orchestrator<'_, L, O>,
    server: &Server,
) -> Result<(), Failure>
where
    C: CatalogStore + ?Sized,
    L: Launcher,
    O: ObjectStore,
{
    let observed = remote::list_databases(server, orchestrator.keys(), orchestrator.launcher())
        .map_err(|source| Failure::Listing {
            server: server.name.clone(),
            source,
        })?;

    catalog::converge(catalog, server, observed, orchestrator.is_dry_run())
        .map(|_| ())
        .map_err(|source| Failure::Reconcile {
            server: server.name.clone(),
            source,
        })
}
