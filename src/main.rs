//! Operator CLI: database upgrade, validation, backup and weight-proof
//! segment maintenance.
//!
//! Exit codes: 0 success, 2 validation detected an inconsistency, 1
//! operational error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use spacestore::block_store::BlockStore;
use spacestore::config::{get_db_path, load_config, store_options};
use spacestore::db_backup::backup_db;
use spacestore::db_upgrade::convert_v1_to_v2;
use spacestore::db_validate::validate_v2;
use spacestore::error::ChainStorageError;
use spacestore::telemetry::{init_tracing, TelemetryConfig};
use spacestore::transactional::TransactionalStore;
use spacestore::weight_proof::{build_segments, check_segments};

#[derive(Parser)]
#[command(name = "spacestore", about = "Consensus state store maintenance tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
    /// Weight-proof segment table maintenance
    WeightProof {
        #[command(subcommand)]
        command: WeightProofCommands,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Convert a v1 database into the v2 schema
    Upgrade {
        /// Input database (defaults to paths.db_path from config.toml)
        #[arg(long = "in")]
        in_path: Option<PathBuf>,
        /// Output database (defaults to the input path with v1 renamed v2)
        #[arg(long = "out")]
        out_path: Option<PathBuf>,
        /// Leave config.toml's paths.db_path entry untouched
        #[arg(long)]
        no_update_config: bool,
    },
    /// Check a v2 database for corruption
    Validate {
        #[arg(long = "in")]
        in_path: Option<PathBuf>,
        /// Also decode every block blob and cross-check it against its row
        #[arg(long)]
        validate_blocks: bool,
    },
    /// Online backup of a (possibly live) database
    Backup {
        #[arg(long = "in")]
        in_path: Option<PathBuf>,
        #[arg(long = "out")]
        out_path: Option<PathBuf>,
        /// Skip secondary indices on the destination
        #[arg(long)]
        no_indexes: bool,
    },
}

#[derive(Subcommand)]
enum WeightProofCommands {
    /// Populate missing sub-epoch segment rows
    Build {
        #[arg(long = "in")]
        in_path: Option<PathBuf>,
    },
    /// Verify every sub-epoch summary has a decodable segment row
    Check {
        #[arg(long = "in")]
        in_path: Option<PathBuf>,
    },
}

fn configured_db_path() -> Result<PathBuf, ChainStorageError> {
    let config = load_config()
        .map_err(|e| ChainStorageError::InvalidOperation(format!("cannot load config: {}", e)))?;
    let path = get_db_path(&config)
        .map_err(|e| ChainStorageError::InvalidOperation(e.to_string()))?;
    Ok(PathBuf::from(path))
}

fn resolve_in_path(in_path: Option<PathBuf>) -> Result<PathBuf, ChainStorageError> {
    match in_path {
        Some(path) => Ok(path),
        None => configured_db_path(),
    }
}

fn default_upgrade_out(in_path: &std::path::Path) -> PathBuf {
    let name = in_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    if name.contains("v1") {
        in_path.with_file_name(name.replace("v1", "v2"))
    } else {
        in_path.with_extension("v2.sqlite")
    }
}

/// Point config.toml's paths.db_path at the converted file.
fn update_config_db_path(new_path: &std::path::Path) -> Result<(), ChainStorageError> {
    let contents = std::fs::read_to_string("config.toml")?;
    let old_path = configured_db_path()?;
    let updated = contents.replace(
        &old_path.to_string_lossy().to_string(),
        &new_path.to_string_lossy(),
    );
    std::fs::write("config.toml", updated)?;
    println!("updated config.toml db_path: {}", new_path.display());
    Ok(())
}

async fn open_stores(
    path: &std::path::Path,
) -> Result<(Arc<TransactionalStore>, BlockStore), ChainStorageError> {
    let config = load_config().ok();
    let options = config
        .as_ref()
        .map(store_options)
        .unwrap_or_default();
    let pool = Arc::new(TransactionalStore::open(path, &options)?);
    let store = BlockStore::create(pool.clone()).await?;
    Ok((pool, store))
}

async fn run(cli: Cli) -> Result<ExitCode, ChainStorageError> {
    match cli.command {
        Commands::Db { command } => match command {
            DbCommands::Upgrade {
                in_path,
                out_path,
                no_update_config,
            } => {
                // only a fully-defaulted invocation rewrites the config
                let update_config =
                    in_path.is_none() && out_path.is_none() && !no_update_config;
                let in_path = resolve_in_path(in_path)?;
                let out_path = out_path.unwrap_or_else(|| default_upgrade_out(&in_path));
                convert_v1_to_v2(&in_path, &out_path).await?;
                if update_config {
                    update_config_db_path(&out_path)?;
                }
                println!("\nLEAVING PREVIOUS DB FILE UNTOUCHED {}\n", in_path.display());
                Ok(ExitCode::SUCCESS)
            }
            DbCommands::Validate {
                in_path,
                validate_blocks,
            } => {
                let in_path = resolve_in_path(in_path)?;
                let summary = validate_v2(&in_path, validate_blocks)?;
                println!(
                    "\nDATABASE IS VALID: {} ({} chain blocks, {} orphans)\n",
                    in_path.display(),
                    summary.main_chain_blocks,
                    summary.orphaned_blocks
                );
                Ok(ExitCode::SUCCESS)
            }
            DbCommands::Backup {
                in_path,
                out_path,
                no_indexes,
            } => {
                let in_path = resolve_in_path(in_path)?;
                let out_path = out_path.ok_or_else(|| {
                    ChainStorageError::InvalidOperation("--out is required for backup".into())
                })?;
                backup_db(&in_path, &out_path, no_indexes)?;
                println!("backup complete: {}", out_path.display());
                Ok(ExitCode::SUCCESS)
            }
        },
        Commands::WeightProof { command } => match command {
            WeightProofCommands::Build { in_path } => {
                let in_path = resolve_in_path(in_path)?;
                let (pool, store) = open_stores(&in_path).await?;
                let built = build_segments(&pool, &store).await?;
                println!("built {} sub-epoch segment rows", built);
                Ok(ExitCode::SUCCESS)
            }
            WeightProofCommands::Check { in_path } => {
                let in_path = resolve_in_path(in_path)?;
                let (pool, store) = open_stores(&in_path).await?;
                let (checked, problems) = check_segments(&pool, &store).await?;
                if problems.is_empty() {
                    println!("{} sub-epoch segment rows OK", checked);
                    Ok(ExitCode::SUCCESS)
                } else {
                    for hash in &problems {
                        eprintln!("missing or invalid segments for ses block {}", hash);
                    }
                    Ok(ExitCode::from(2))
                }
            }
        },
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing(TelemetryConfig::default()) {
        eprintln!("failed to initialize logging: {}", e);
    }
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            // validation inconsistencies get their own exit code
            if matches!(e, ChainStorageError::Corruption(_)) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
