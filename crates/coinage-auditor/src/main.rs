//! Coinage Auditor - Consistency checks over exchange ledgers

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coinage_auditor::{
    AuditorConfig, DepositConfirmationChecker, JsonLinesConfirmations, JsonLinesDeposits,
    ProgressMarker, ProgressStore,
};

/// Coinage Auditor - Verify the exchange against what merchants saw
#[derive(Parser)]
#[command(name = "coinage-auditor")]
#[command(about = "Consistency checks for a Coinage exchange")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check merchant deposit confirmations against the exchange's deposits
    Deposits {
        /// Path to the auditor configuration file
        #[arg(long)]
        config: PathBuf,

        /// Ignore stored progress and audit from the first row
        #[arg(long)]
        restart: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinage_auditor=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Deposits { config, restart } => {
            let config = AuditorConfig::load(&config)?;
            let master = config.master()?;
            let currency = config.currency()?;
            let store = ProgressStore::new(config.progress_file.clone());

            let from = if restart {
                info!("Restarting deposit audit from row 0");
                ProgressMarker::default()
            } else {
                store.load()?
            };

            let confirmations = JsonLinesConfirmations::new(config.merchant_ledger.clone());
            let deposits = JsonLinesDeposits::open(&config.exchange_ledger)?;
            info!("Loaded {} exchange deposits", deposits.len());

            let checker =
                DepositConfirmationChecker::new(master, currency, &confirmations, &deposits);
            let report = checker.run(from)?;

            store.save(&report.progress)?;
            if !report.currency_mismatches.is_empty() {
                warn!(
                    "{} confirmations in a currency other than {}",
                    report.currency_mismatches.len(),
                    currency
                );
            }
            if report.missed_count > 0 {
                warn!(
                    "{} confirmations without exchange deposit ({})",
                    report.missed_count, report.missed_amount
                );
            }
            info!(
                "Checked {} rows, progress now at row {}",
                report.rows_checked, report.progress.last_row_id
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
