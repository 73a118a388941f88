use std::io::{self, Write};
use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use chat_vault::config::TransferConfig;
use chat_vault::store::{PgVaultStore, run_migrations};
use chat_vault::transfer::codec::{self, SnapshotFormat, export_filename};
use chat_vault::transfer::{self, export};

#[derive(Parser, Debug)]
#[command(
    name = "vault-transfer",
    about = "Export or import Chat Vault snapshots against DATABASE_URL"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a snapshot of the whole dataset.
    Export {
        /// `zip` (default) or `json`.
        #[arg(long, default_value = "zip")]
        format: String,

        /// Destination file; defaults to a timestamped name in the current directory.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Merge a `.json` or `.zip` snapshot into the database and print the report.
    Import {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&database_url)
        .await?;
    run_migrations(&pool).await?;

    let store = PgVaultStore::new(pool);
    let config = TransferConfig::from_env();

    match args.command {
        Command::Export { format, output } => {
            let format: SnapshotFormat = match format.parse() {
                Ok(format) => format,
                Err(err) => {
                    writeln!(io::stderr(), "error: {err}")?;
                    std::process::exit(2);
                }
            };

            let exported_at = Utc::now();
            let snapshot = export::build_snapshot(&store, exported_at).await?;
            let bytes = codec::encode(&snapshot, format)?;
            let path =
                output.unwrap_or_else(|| PathBuf::from(export_filename(exported_at, format)));

            tokio::fs::write(&path, &bytes).await?;
            writeln!(
                io::stdout(),
                "wrote {} records to {} ({} bytes)",
                snapshot.data.record_total(),
                path.display(),
                bytes.len()
            )?;
        }
        Command::Import { file } => {
            let bytes = tokio::fs::read(&file).await?;
            let filename = file.to_string_lossy();
            let report = transfer::import_file(&store, &config, &filename, &bytes).await?;

            writeln!(io::stdout(), "{}", serde_json::to_string_pretty(&report)?)?;
            if report.summary.total_errors > 0 {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
