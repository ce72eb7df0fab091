use std::fs::File;
use std::io;
use std::process::{ExitStatus, Output, Stdio};

use derive_more::{Display, Error, From};

use super::{build, BuildError, Operation, RemoteCommand};
use crate::catalog::Server;
use crate::credentials::KeyMaterial;

/// Executes [RemoteCommand]s.
pub trait Launcher {
    /// Runs the command to completion and returns its stdout.
    fn output(&self, command: &RemoteCommand) -> Result<Vec<u8>, ProcessError>;

    /// Runs the command to completion with stdout written to `stdout`.
    fn run_into(&self, command: &RemoteCommand, stdout: File) -> Result<(), ProcessError>;
}

/// Running an external command failed.
#[derive(Debug, Display, Error)]
pub enum ProcessError {
    /// The process couldn't be started.
    #[display("launching `{command}` failed: {source}")]
    Launch { command: String, source: io::Error },
    /// The process exited unsuccessfully.
    #[display("`{command}` failed with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

/// [Launcher] spawning local processes.
///
/// There is no timeout: a hanging `ssh` or `mysqldump` blocks the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl SystemLauncher {
    fn check(command: &RemoteCommand, output: io::Result<Output>) -> Result<Output, ProcessError> {
        let output = output.map_err(|source| ProcessError::Launch {
            command: command.to_string(),
            source,
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(ProcessError::Failed {
                command: command.to_string(),
                status: output.status,
                stderr: stderr.trim_end().into(),
            });
        }

        // relay stderr
        if !stderr.is_empty() {
            log::warn!(target: "remote::launcher", "{}: {}", command.program(), stderr.trim_end());
        }

        Ok(output)
    }
}

impl Launcher for SystemLauncher {
    fn output(&self, command: &RemoteCommand) -> Result<Vec<u8>, ProcessError> {
        log::trace!(target: "remote::launcher", "Running: {command}");
        let output = command.to_command().stdin(Stdio::null()).output();

        Self::check(command, output).map(|output| output.stdout)
    }

    fn run_into(&self, command: &RemoteCommand, stdout: File) -> Result<(), ProcessError> {
        log::trace!(target: "remote::launcher", "Running: {command}");
        let output = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .output();

        Self::check(command, output).map(|_| ())
    }
}

/// Listing the databases of a server failed.
#[derive(Debug, Display, Error, From)]
pub enum ListError {
    #[from]
    Build(BuildError),
    #[from]
    Process(ProcessError),
}

/// Asks `server` which user databases it hosts.
///
/// The client prints one name per line.
pub fn list_databases<L>(
    server: &Server,
    keys: &KeyMaterial,
    launcher: &L,
) -> Result<Vec<String>, ListError>
where
    L: Launcher + ?Sized,
{
    let command = build(server, Operation::ListDatabases, keys)?;
    let stdout = launcher.output(&command)?;

    let names = String::from_utf8_lossy(&stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect();

    Ok(names)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::catalog::tests::server;

    struct Canned {
        stdout: &'static [u8],
        seen: RefCell<Vec<Vec<String>>>,
    }

    impl Launcher for Canned {
        fn output(&self, command: &RemoteCommand) -> Result<Vec<u8>, ProcessError> {
            self.seen.borrow_mut().push(command.argv().to_vec());
            Ok(self.stdout.to_vec())
        }

        fn run_into(&self, _: &RemoteCommand, _: File) -> Result<(), ProcessError> {
            unreachable!("listing never dumps")
        }
    }

    #[test]
    fn listing_splits_lines() {
        let launcher = Canned {
            stdout: b"shop\nblog\r\n\nwiki data\n",
            seen: RefCell::default(),
        };

        let names = list_databases(&server("web"), &KeyMaterial::from_bytes([0; 32]), &launcher)
            .unwrap();

        assert_eq!(names, ["shop", "blog", "wiki data"]);
        assert_eq!(launcher.seen.borrow()[0][0], "mysql");
    }

    #[cfg(unix)]
    #[test]
    fn system_launcher_reports_exit_status() {
        let command = RemoteCommand {
            argv: vec!["sh".into(), "-c".into(), "echo broken >&2; exit 3".into()],
            redacted: "sh -c ...".into(),
        };

        match SystemLauncher.output(&command) {
            Err(ProcessError::Failed { status, stderr, .. }) => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn system_launcher_writes_stdout_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let command = RemoteCommand {
            argv: vec!["sh".into(), "-c".into(), "printf dump".into()],
            redacted: "sh -c ...".into(),
        };

        SystemLauncher
            .run_into(&command, File::create(&path).unwrap())
            .unwrap();

        assert_eq!(std::fs::read_to_string(path).unwrap(), "dump");
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let command = RemoteCommand {
            argv: vec!["db-backup-no-such-program".into()],
            redacted: "db-backup-no-such-program".into(),
        };

        assert!(matches!(
            SystemLauncher.output(&command),
            Err(ProcessError::Launch { .. })
        ));
    }
}
