//! Operator CLI for the store files.
//!
//! ```bash
//! edstore --data-dir /path/to/data status
//! edstore migrate
//! edstore set EDSMLastSystems "2010-01-01 00:00:00" --kind string
//! edstore get DBVer --kind int
//! ```

use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use edstore_core::db::migrations::current_version;
use edstore_core::{
    default_log_level, init_logging, latest_version, ConnectionFactory, DbError, LoggingConfig,
    SettingsStore, StoreConfig, DATA_DIR_ENV,
};
use log::error;

#[derive(Parser, Debug)]
#[command(name = "edstore", version, about = "Inspect and upgrade the SQLite stores")]
struct Args {
    /// Directory holding the store files
    #[arg(short = 'd', long, env = DATA_DIR_ENV, value_name = "DIR")]
    data_dir: PathBuf,

    /// Write logs to this absolute directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Log level when --log-dir is set
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Show schema and engine versions (upgrades the store first)
    Status,
    /// Apply pending schema steps and print what ran
    Migrate,
    /// Read one setting
    Get {
        key: String,
        #[arg(short, long, value_enum, default_value = "string")]
        kind: ValueKind,
    },
    /// Write one setting
    Set {
        key: String,
        value: String,
        #[arg(short, long, value_enum, default_value = "string")]
        kind: ValueKind,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ValueKind {
    Int,
    Double,
    Bool,
    String,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(log_dir) = &args.log_dir {
        let level = args.log_level.as_deref().unwrap_or(default_log_level());
        if let Err(err) = init_logging(&LoggingConfig::new(level, log_dir)) {
            eprintln!("logging disabled: {err}");
        }
    }

    let factory = ConnectionFactory::new(StoreConfig::new(&args.data_dir));
    match run(&factory, &args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("event=cli_command module=cli status=error error={err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug)]
enum CliError {
    Db(DbError),
    InvalidValue { value: String, kind: ValueKind },
}

impl Display for CliError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidValue { value, kind } => {
                write!(f, "`{value}` is not a valid {kind:?} value")
            }
        }
    }
}

impl From<DbError> for CliError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

fn run(factory: &ConnectionFactory, command: &CliCommand) -> Result<(), CliError> {
    match command {
        CliCommand::Status => {
            let conn = factory.open_primary()?;
            println!("data_dir={}", factory.config().data_dir().display());
            println!("schema_version={}", current_version(&conn));
            println!("latest_version={}", latest_version());
            println!("sqlite_version={}", edstore_core::engine_version());
        }
        CliCommand::Migrate => {
            factory.ensure_initialized()?;
            if let Some(report) = factory.migration_report() {
                println!("from={} to={}", report.from, report.to);
                println!("applied={:?}", report.applied);
                for failure in &report.tolerated {
                    println!("tolerated version={} error={}", failure.version, failure.error);
                }
                for backup in &report.backups {
                    println!("backup={}", backup.display());
                }
            }
        }
        CliCommand::Get { key, kind } => {
            let conn = factory.open_primary()?;
            let settings = conn.settings();
            if !settings.key_exists(key) {
                println!("{key} is not set");
                return Ok(());
            }
            let value = match kind {
                ValueKind::Int => settings.get_int(key, 0).to_string(),
                ValueKind::Double => settings.get_double(key, 0.0).to_string(),
                ValueKind::Bool => settings.get_bool(key, false).to_string(),
                ValueKind::String => settings.get_string(key, ""),
            };
            println!("{key}={value}");
        }
        CliCommand::Set { key, value, kind } => {
            let conn = factory.open_primary()?;
            let settings = conn.settings();
            match kind {
                ValueKind::Int => settings.put_int(key, parse_arg(value, *kind)?)?,
                ValueKind::Double => settings.put_double(key, parse_arg(value, *kind)?)?,
                ValueKind::Bool => settings.put_bool(key, parse_arg(value, *kind)?)?,
                ValueKind::String => settings.put_string(key, value)?,
            }
            println!("{key} updated");
        }
    }
    Ok(())
}

fn parse_arg<T: std::str::FromStr>(value: &str, kind: ValueKind) -> Result<T, CliError> {
    value.trim().parse().map_err(|_| CliError::InvalidValue {
        value: value.to_string(),
        kind,
    })
}
