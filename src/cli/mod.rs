use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long)]
    pub verbose: Option<LevelFilter>,

    /// Configuration file. A default one is written if it doesn't exist.
    #[arg(
        long,
        short = 'c',
        env = "DATABASE_BACKUP_CONFIG",
        default_value = "/etc/db_backup/config.toml"
    )]
    pub config: PathBuf,

    /// Simulative run: the catalog is not updated and nothing is dumped.
    #[arg(long)]
    pub dry_run: bool,

    /// Only update the database lists of the servers.
    #[arg(long)]
    pub update_list: bool,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Update the catalog and backup all flagged databases. (Default)
    #[default]
    Backup,
    /// Encrypt a server password read from stdin for storage in the catalog.
    EncryptPassword,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn backup_is_the_default_action() {
        let cli = Cli::parse_from(["db_backup", "--update-list", "--verbose", "debug"]);

        assert_eq!(cli.action.unwrap_or_default(), Action::Backup);
        assert!(cli.update_list);
        assert_eq!(cli.verbose, Some(LevelFilter::Debug));
    }

    #[test]
    fn encrypt_password_subcommand() {
        let cli = Cli::parse_from(["db_backup", "encrypt-password"]);

        assert_eq!(cli.action, Some(Action::EncryptPassword));
    }
}
