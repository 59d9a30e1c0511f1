use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use audit_ledger::audit::{
    AuditLedger, ChainHasher, ConcurrencyGuard, SecretStore, VerificationKind, VerificationReport,
    VerificationResult, Verifier,
};
use audit_ledger::database::Database;

/// Verify audit ledger hash-chain integrity
#[derive(Parser)]
#[command(name = "verify-audit-log")]
#[command(version)]
struct Cli {
    /// Database URL
    #[arg(long, env = "AUDIT_LEDGER_DATABASE_URL", default_value = "sqlite://audit-ledger.db")]
    database_url: String,

    /// Only verify this partition
    #[arg(short, long)]
    partition: Option<String>,

    /// Resume from the partition's cursor instead of scanning from the start
    #[arg(short, long, requires = "partition")]
    incremental: bool,

    /// Entries fetched per page
    #[arg(long, default_value_t = 500)]
    page_size: i64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "audit_ledger=debug" } else { "audit_ledger=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()),
        )
        .init();

    let db = Database::new(&cli.database_url).await?;
    db.run_migrations().await?;

    let secrets = SecretStore::new(db.pool().clone());
    let ledger = AuditLedger::new(&db, ChainHasher::new(secrets), ConcurrencyGuard::new());
    let verifier = Verifier::new(db.pool().clone(), ledger, cli.page_size);

    let (kind, outcome) = match (&cli.partition, cli.incremental) {
        (Some(partition), true) => (
            VerificationKind::Incremental,
            verifier.verify_incremental(partition).await,
        ),
        (partition, _) => (
            VerificationKind::Full,
            verifier.verify_full(partition.as_deref()).await,
        ),
    };
    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            let failed = VerificationResult::errored(e.to_string());
            if let Err(record_err) = verifier
                .record_run(kind, cli.partition.as_deref(), &failed)
                .await
            {
                error!("Failed to record verification run: {}", record_err);
            }
            return Err(e.into());
        }
    };
    info!(kind = kind.as_str(), intact = result.intact, "Verification finished");

    if !result.skipped {
        verifier
            .record_run(kind, cli.partition.as_deref(), &result)
            .await?;
    }

    print_result(&result, cli.json, cli.verbose)?;
    db.close().await;

    if !result.intact {
        error!("Audit ledger verification failed");
        std::process::exit(1);
    }

    Ok(())
}

fn print_result(result: &VerificationResult, json: bool, verbose: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&VerificationReport::from(result))?);
        return Ok(());
    }

    if result.skipped {
        println!("Skipped: another incremental verification holds this partition");
        return Ok(());
    }

    if result.intact {
        println!(
            "✓ Audit ledger intact: {} of {} entries verified",
            result.verified_entries, result.total_entries
        );
    } else {
        println!("✗ Audit ledger chain broken");
        if let Some(chain_break) = &result.chain_break {
            println!("  Partition: {}", chain_break.partition_key);
            println!("  Entry: {}", chain_break.entry_id);
            println!("  Kind: {:?}", chain_break.kind);
            if let (Some(expected), Some(actual)) = (&chain_break.expected, &chain_break.actual) {
                println!("  Expected: {}", expected);
                println!("  Actual:   {}", actual);
            }
        }
        if let Some(error) = &result.error {
            println!("  Error: {}", error);
        }
        println!("  Verified {} entries before the break", result.verified_entries);
    }

    if verbose && !result.encoding_matches.is_empty() {
        println!("\nLegacy encoding matches:");
        for (encoding, count) in &result.encoding_matches {
            println!("  {}: {}", encoding, count);
        }
    }

    Ok(())
}
