use std::io::{self, BufRead};
use std::process::ExitCode;

use chrono::Local;
use clap::Parser;

use db_backup_lib::backup::Orchestrator;
use db_backup_lib::catalog::JsonCatalog;
use db_backup_lib::cli::{Action, Cli};
use db_backup_lib::config::Config;
use db_backup_lib::credentials::{self, KeyMaterial};
use db_backup_lib::driver::{self, RunOptions};
use db_backup_lib::remote::SystemLauncher;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    let config = match Config::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Reading the config file failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    // without the key no server can be touched
    let keys = match config.key_material() {
        Ok(keys) => keys,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.action.unwrap_or_default() {
        Action::EncryptPassword => encrypt_password(&keys),
        Action::Backup => backup(&cli, &config, &keys),
    }
}

fn encrypt_password(keys: &KeyMaterial) -> ExitCode {
    let mut line = String::new();
    if let Err(e) = io::stdin().lock().read_line(&mut line) {
        log::error!("Reading the password from stdin failed: {e}");
        return ExitCode::FAILURE;
    }
    let password = line.trim_end_matches(['\r', '\n']);

    match credentials::encrypt(password, keys) {
        Ok(encrypted) => {
            println!("{encrypted}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Encrypting the password failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn backup(cli: &Cli, config: &Config, keys: &KeyMaterial) -> ExitCode {
    if cli.dry_run {
        log::warn!("Running in dry-run mode");
    }

    let mut catalog = match JsonCatalog::open(&config.catalog) {
        Ok(catalog) => catalog,
        Err(e) => {
            log::error!("Opening the catalog failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = Orchestrator::new(
        &config.dump_dir,
        &config.bucket,
        keys,
        SystemLauncher,
        config.store.object_store(),
    )
    .with_dry_run(cli.dry_run);

    let options = RunOptions {
        update_list_only: cli.update_list,
        date: Local::now().date_naive(),
    };

    match driver::run(&mut catalog, &orchestrator, options) {
        Ok(summary) => {
            log::info!(
                "Checked {} server(s), {} up to date, {} database(s) backed up, {} failure(s)",
                summary.servers,
                summary.converged,
                summary.backed_up,
                summary.failures.len()
            );
            if summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            log::error!("Backup run aborted: {e}");
            ExitCode::FAILURE
        }
    }
}
