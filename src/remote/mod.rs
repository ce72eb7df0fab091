//! Construction of the `mysql`/`mysqldump` invocations for a [Server].
//!
//! Commands are always argument vectors. If a server is reached through an
//! SSH hop the inner command is shell quoted into a single trailing argument,
//! since the remote side hands it to a shell.

use std::fmt;
use std::process::Command;

use derive_more::{Display, Error, From};

use crate::catalog::{Database, InvalidServer, Server};
use crate::credentials::{self, CredentialError, KeyMaterial};

mod launcher;

pub use launcher::{list_databases, Launcher, ListError, ProcessError, SystemLauncher};

/// Schemas of the server itself which are never cataloged.
const SYSTEM_SCHEMAS: &[&str] = &[
    "innodb",
    "mysql",
    "information_schema",
    "performance_schema",
    "sys",
    "tmp",
];

const REDACTED: &str = "********";

/// What to run on the server.
#[derive(Debug, Clone, Copy)]
pub enum Operation<'a> {
    /// Enumerate the user databases.
    ListDatabases,
    /// Dump a single database to stdout.
    DumpDatabase(&'a Database),
}

/// Errors while building a [RemoteCommand].
#[derive(Debug, Display, Error, From)]
pub enum BuildError {
    /// The server record is incomplete.
    #[from]
    InvalidServer(InvalidServer),
    /// The stored password couldn't be decrypted.
    #[display("decrypting password of server '{server}' failed: {source}")]
    Credential {
        server: String,
        source: CredentialError,
    },
}

/// A ready to run argument vector.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    argv: Vec<String>,
    redacted: String,
}

impl RemoteCommand {
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Arguments following the program.
    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// A [Command] ready to be spawned. Stdio isn't configured.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(self.program());
        command.args(self.args());
        command
    }
}

/// Renders the command with the password masked.
impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted)
    }
}

impl fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteCommand").field(&self.redacted).finish()
    }
}

/// Builds the command performing `operation` on `server`.
///
/// The password is decrypted only if the server has a non-empty one. Without it the
/// client tools fall back to their own configuration (e.g. `~/.my.cnf`).
pub fn build(
    server: &Server,
    operation: Operation<'_>,
    keys: &KeyMaterial,
) -> Result<RemoteCommand, BuildError> {
    server.validate()?;

    let password = server
        .password
        .as_deref()
        .filter(|encrypted| !encrypted.is_empty())
        .map(|encrypted| credentials::decrypt(encrypted, keys))
        .transpose()
        .map_err(|source| BuildError::Credential {
            server: server.name.clone(),
            source,
        })?;

    let argv = wrap(server, operation, password.as_deref().map(String::as_str))?;
    let redacted = wrap(server, operation, password.as_ref().map(|_| REDACTED))?;

    Ok(RemoteCommand {
        redacted: redacted.iter().map(|arg| shell_quote(arg)).collect::<Vec<_>>().join(" "),
        argv,
    })
}

fn wrap(
    server: &Server,
    operation: Operation<'_>,
    password: Option<&str>,
) -> Result<Vec<String>, InvalidServer> {
    let (program, args) = match operation {
        Operation::ListDatabases => ("mysql", list_args()),
        Operation::DumpDatabase(database) => ("mysqldump", dump_args(database)),
    };

    let mut inner = vec![
        program.to_string(),
        "--host".into(),
        server.host.clone(),
        "--port".into(),
        server.port.to_string(),
        "--user".into(),
        server.username.clone(),
    ];
    if let Some(password) = password {
        inner.push(format!("--password={password}"));
    }
    inner.extend(args);

    let Some(hop) = server.proxy()? else {
        return Ok(inner);
    };

    let remote = inner.iter().map(|arg| shell_quote(arg)).collect::<Vec<_>>().join(" ");
    Ok(vec![
        "ssh".into(),
        "-i".into(),
        hop.identity.to_string_lossy().into_owned(),
        "-o".into(),
        "BatchMode=yes".into(),
        format!("{}@{}", hop.username, hop.host),
        remote,
    ])
}

fn list_args() -> Vec<String> {
    let ignored = SYSTEM_SCHEMAS
        .iter()
        .map(|schema| format!("'{schema}'"))
        .collect::<Vec<_>>()
        .join(", ");

    vec![
        "--skip-column-names".into(),
        "--batch".into(),
        "--raw".into(),
        "--execute".into(),
        format!("SHOW DATABASES WHERE `Database` NOT IN({ignored})"),
    ]
}

fn dump_args(database: &Database) -> Vec<String> {
    let mut args = vec!["--single-transaction".to_string()];
    for table in database.excluded_tables() {
        args.push("--ignore-table".into());
        args.push(format!("{}.{table}", database.name));
    }
    args.push(database.name.clone());
    args.extend(database.only_tables().map(String::from));
    args
}

/// Quotes `arg` for a POSIX shell. Plain words are left as they are.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if plain {
        return arg.to_string();
    }

    format!("'{}'", arg.replace('\'', r"'\''"))
}
