//! Dumping a single database and shipping the dump to the object store.
//!
//! Every database runs through `Pending → Dumping → Dumped → Uploading →
//! Uploaded → Cleaned` once. Any failure ends in [BackupState::Failed] and
//! only affects that database. There are no retries: the dump file name is
//! stable for the day and is only deleted after a successful upload, so a run
//! can simply be repeated.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use derive_more::{Display, Error, From};

use crate::catalog::{Database, Server};
use crate::credentials::KeyMaterial;
use crate::remote::{self, BuildError, Launcher, Operation, ProcessError};
use crate::storage::{ObjectStore, TransportError};

mod artifact;

pub use artifact::Artifact;

/// Stage of a backup that can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Stage {
    #[display("building the dump command")]
    Build,
    #[display("dumping")]
    Dump,
    #[display("uploading")]
    Upload,
}

/// Progress of the backup of one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum BackupState {
    Pending,
    Dumping,
    Dumped,
    Uploading,
    Uploaded,
    Cleaned,
    #[display("Failed({_0})")]
    Failed(Stage),
}

/// Cause of a failed backup.
#[derive(Debug, Display, Error, From)]
pub enum BackupFailure {
    #[from]
    Build(BuildError),
    #[from]
    Process(ProcessError),
    #[from]
    Transport(TransportError),
    /// The local dump file couldn't be opened.
    #[display("accessing {} failed: {source}", path.display())]
    Artifact { path: PathBuf, source: io::Error },
}

/// Backup of a database failed at `stage`.
#[derive(Debug, Display, Error)]
#[display("backup of {server}/{database} failed while {stage}: {source}")]
pub struct BackupError {
    pub server: String,
    pub database: String,
    pub stage: Stage,
    pub source: BackupFailure,
}

/// Result of a backup that didn't fail.
#[derive(Debug)]
pub struct BackupOutcome {
    /// [BackupState::Cleaned] usually. [BackupState::Uploaded] if the local
    /// file couldn't be removed, [BackupState::Pending] on a dry run or for a
    /// database not flagged for backup.
    pub state: BackupState,
    pub artifact: Artifact,
    /// Bytes uploaded.
    pub bytes: u64,
    /// Removing the uploaded dump failed. The upload itself is fine.
    pub cleanup_error: Option<io::Error>,
}

/// Runs the backups of single databases.
pub struct Orchestrator<'k, L, O> {
    dump_dir: PathBuf,
    bucket: String,
    keys: &'k KeyMaterial,
    launcher: L,
    store: O,
    dry_run: bool,
}

impl<'k, L, O> Orchestrator<'k, L, O>
where
    L: Launcher,
    O: ObjectStore,
{
    pub fn new(
        dump_dir: impl Into<PathBuf>,
        bucket: impl Into<String>,
        keys: &'k KeyMaterial,
        launcher: L,
        store: O,
    ) -> Self {
        let dump_dir = dump_dir.into();
        if dump_dir.is_relative() {
            log::warn!(target: "backup::orchestrator", "dump_dir is relative: {}", dump_dir.display());
        }

        Self {
            dump_dir,
            bucket: bucket.into(),
            keys,
            launcher,
            store,
            dry_run: false,
        }
    }

    /// On a dry run commands are only logged: nothing is executed, uploaded or removed.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn dump_dir(&self) -> &Path {
        &self.dump_dir
    }

    pub fn keys(&self) -> &KeyMaterial {
        self.keys
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Creates the dump directory.
    pub fn prepare(&self) -> io::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        fs::create_dir_all(&self.dump_dir)
    }

    /// Backs up `database` of `server` with the dump named after `date`.
    ///
    /// A database not flagged for backup is left alone and stays
    /// [BackupState::Pending].
    pub fn backup(
        &self,
        server: &Server,
        database: &Database,
        date: NaiveDate,
    ) -> Result<BackupOutcome, BackupError> {
        let mut run = Run {
            server,
            database,
            state: BackupState::Pending,
        };
        let artifact = Artifact::new(&self.dump_dir, server, database, date);

        if !database.backup {
            log::debug!(target: "backup::orchestrator", "Skipping {}/{}: not flagged for backup", server.name, database.name);
            return Ok(BackupOutcome {
                state: run.state,
                artifact,
                bytes: 0,
                cleanup_error: None,
            });
        }

        let command = remote::build(server, Operation::DumpDatabase(database), self.keys)
            .map_err(|e| run.fail(Stage::Build, e))?;

        if self.dry_run {
            log::info!(target: "backup::orchestrator", "Would dump {} to {}: {command}", database.name, artifact.path().display());
            return Ok(BackupOutcome {
                state: run.state,
                artifact,
                bytes: 0,
                cleanup_error: None,
            });
        }

        run.advance(BackupState::Dumping);
        log::info!(target: "backup::orchestrator", "Dumping {} to {}", database.name, artifact.path().display());
        let file = artifact
            .create()
            .map_err(|source| run.fail(Stage::Dump, artifact_failure(&artifact, source)))?;
        // a failed dump leaves the partial file for inspection
        self.launcher
            .run_into(&command, file)
            .map_err(|e| run.fail(Stage::Dump, e))?;
        run.advance(BackupState::Dumped);

        run.advance(BackupState::Uploading);
        let bytes = self
            .upload(&artifact)
            .map_err(|e| run.fail(Stage::Upload, e))?;
        run.advance(BackupState::Uploaded);
        log::info!(target: "backup::orchestrator", "Uploaded {} bytes to {}/{}", bytes, self.bucket, artifact.key());

        let cleanup_error = match fs::remove_file(artifact.path()) {
            Ok(()) => {
                run.advance(BackupState::Cleaned);
                None
            }
            Err(e) => {
                log::warn!(target: "backup::orchestrator", "Removing uploaded dump {} failed: {e}", artifact.path().display());
                Some(e)
            }
        };

        Ok(BackupOutcome {
            state: run.state,
            artifact,
            bytes,
            cleanup_error,
        })
    }

    fn upload(&self, artifact: &Artifact) -> Result<u64, BackupFailure> {
        let mut file =
            File::open(artifact.path()).map_err(|source| artifact_failure(artifact, source))?;
        let bytes = self.store.upload(&self.bucket, artifact.key(), &mut file)?;
        Ok(bytes)
    }
}

fn artifact_failure(artifact: &Artifact, source: io::Error) -> BackupFailure {
    BackupFailure::Artifact {
        path: artifact.path().to_path_buf(),
        source,
    }
}

/// State machine of a single [Orchestrator::backup] call.
struct Run<'a> {
    server: &'a Server,
    database: &'a Database,
    state: BackupState,
}

impl Run<'_> {
    fn advance(&mut self, next: BackupState) {
        log::trace!(target: "backup::orchestrator", "{}/{}: {} -> {}", self.server.name, self.database.name, self.state, next);
        self.state = next;
    }

    fn fail(&mut self, stage: Stage, failure: impl Into<BackupFailure>) -> BackupError {
        self.advance(BackupState::Failed(stage));
        BackupError {
            server: self.server.name.clone(),
            database: self.database.name.clone(),
            stage,
            source: failure.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::io::{Read, Write};

    use super::*;
    use crate::catalog::tests::{database, server};
    use crate::remote::RemoteCommand;

    /// Writes the next canned dump into the artifact.
    struct FakeDump {
        dumps: RefCell<Vec<&'static str>>,
        fail: bool,
    }

    impl FakeDump {
        fn new(dumps: &[&'static str]) -> Self {
            Self {
                dumps: RefCell::new(dumps.iter().rev().copied().collect()),
                fail: false,
            }
        }
    }

    impl Launcher for FakeDump {
        fn output(&self, _: &RemoteCommand) -> Result<Vec<u8>, ProcessError> {
            unreachable!("backups never list")
        }

        fn run_into(&self, command: &RemoteCommand, mut stdout: File) -> Result<(), ProcessError> {
            let dump = self.dumps.borrow_mut().pop().unwrap_or_default();
            stdout.write_all(dump.as_bytes()).unwrap();
            if self.fail {
                return Err(ProcessError::Launch {
                    command: command.to_string(),
                    source: io::Error::other("connection refused"),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeStore {
        objects: RefCell<Vec<(String, String, Vec<u8>)>>,
        fail: Cell<bool>,
        /// Deleted while uploading, so the cleanup afterwards fails.
        vanishing: RefCell<Option<PathBuf>>,
    }

    impl ObjectStore for &FakeStore {
        fn upload(&self, bucket: &str, key: &str, body: &mut dyn Read) -> Result<u64, TransportError> {
            if self.fail.get() {
                return Err(TransportError::InvalidKey(key.to_string()));
            }
            if let Some(path) = self.vanishing.borrow().as_ref() {
                fs::remove_file(path).unwrap();
            }
            let mut data = Vec::new();
            body.read_to_end(&mut data).unwrap();
            let len = data.len() as u64;
            self.objects
                .borrow_mut()
                .push((bucket.to_string(), key.to_string(), data));
            Ok(len)
        }
    }

    fn keys() -> KeyMaterial {
        KeyMaterial::from_bytes([5; 32])
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn successful_backup_uploads_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys();
        let store = FakeStore::default();
        let orchestrator = Orchestrator::new(dir.path(), "bucket", &keys, FakeDump::new(&["-- dump"]), &store);

        let outcome = orchestrator
            .backup(&server("web"), &database(1, "shop"), date())
            .unwrap();

        assert_eq!(outcome.state, BackupState::Cleaned);
        assert_eq!(outcome.bytes, 7);
        assert!(!outcome.artifact.path().exists());
        let objects = store.objects.borrow();
        assert_eq!(objects[0].0, "bucket");
        assert_eq!(objects[0].1, "web/shop/web_shop_2024-05-01.sql");
        assert_eq!(objects[0].2, b"-- dump");
    }

    #[test]
    fn cleanup_failure_keeps_upload() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys();
        let store = FakeStore::default();
        *store.vanishing.borrow_mut() = Some(dir.path().join("web_shop_2024-05-01.sql"));
        let orchestrator = Orchestrator::new(dir.path(), "bucket", &keys, FakeDump::new(&["-- dump"]), &store);

        let outcome = orchestrator
            .backup(&server("web"), &database(1, "shop"), date())
            .unwrap();

        assert_eq!(outcome.state, BackupState::Uploaded);
        assert_eq!(
            outcome.cleanup_error.map(|e| e.kind()),
            Some(io::ErrorKind::NotFound)
        );
        assert_eq!(store.objects.borrow()[0].2, b"-- dump");
    }

    #[test]
    fn unflagged_database_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys();
        let store = FakeStore::default();
        let orchestrator = Orchestrator::new(dir.path(), "bucket", &keys, FakeDump::new(&[]), &store);
        let mut db = database(1, "shop");
        db.backup = false;

        let outcome = orchestrator.backup(&server("web"), &db, date()).unwrap();

        assert_eq!(outcome.state, BackupState::Pending);
        assert_eq!(outcome.bytes, 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(store.objects.borrow().is_empty());
    }

    #[test]
    fn upload_failure_keeps_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys();
        let store = FakeStore::default();
        store.fail.set(true);
        let orchestrator = Orchestrator::new(dir.path(), "bucket", &keys, FakeDump::new(&["data"]), &store);

        let err = orchestrator
            .backup(&server("web"), &database(1, "shop"), date())
            .unwrap_err();

        assert_eq!(err.stage, Stage::Upload);
        assert_eq!((err.server.as_str(), err.database.as_str()), ("web", "shop"));
        let path = dir.path().join("web_shop_2024-05-01.sql");
        assert_eq!(fs::read_to_string(path).unwrap(), "data");
    }

    #[test]
    fn dump_failure_keeps_partial_artifact_and_skips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys();
        let store = FakeStore::default();
        let mut launcher = FakeDump::new(&["partial"]);
        launcher.fail = true;
        let orchestrator = Orchestrator::new(dir.path(), "bucket", &keys, launcher, &store);

        let err = orchestrator
            .backup(&server("web"), &database(1, "shop"), date())
            .unwrap_err();

        assert_eq!(err.stage, Stage::Dump);
        assert!(matches!(err.source, BackupFailure::Process(_)));
        assert!(store.objects.borrow().is_empty());
        assert!(dir.path().join("web_shop_2024-05-01.sql").exists());
    }

    #[test]
    fn same_day_rerun_overwrites_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys();
        let store = FakeStore::default();
        store.fail.set(true);
        let orchestrator = Orchestrator::new(
            dir.path(),
            "bucket",
            &keys,
            FakeDump::new(&["a rather long first dump", "short"]),
            &store,
        );
        let (srv, db) = (server("web"), database(1, "shop"));

        orchestrator.backup(&srv, &db, date()).unwrap_err();
        orchestrator.backup(&srv, &db, date()).unwrap_err();

        let path = dir.path().join("web_shop_2024-05-01.sql");
        assert_eq!(fs::metadata(path).unwrap().len(), "short".len() as u64);
    }

    #[test]
    fn credential_failure_stops_before_dumping() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys();
        let store = FakeStore::default();
        let orchestrator = Orchestrator::new(dir.path(), "bucket", &keys, FakeDump::new(&[]), &store);
        let mut srv = server("web");
        srv.password = Some("v1:not base64!".into());

        let err = orchestrator
            .backup(&srv, &database(1, "shop"), date())
            .unwrap_err();

        assert_eq!(err.stage, Stage::Build);
        assert!(matches!(err.source, BackupFailure::Build(BuildError::Credential { .. })));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let keys = keys();
        let store = FakeStore::default();
        let orchestrator = Orchestrator::new(dir.path(), "bucket", &keys, FakeDump::new(&[]), &store)
            .with_dry_run(true);

        let outcome = orchestrator
            .backup(&server("web"), &database(1, "shop"), date())
            .unwrap();

        assert_eq!(outcome.state, BackupState::Pending);
        assert!(!outcome.artifact.path().exists());
        assert!(store.objects.borrow().is_empty());
    }
}
