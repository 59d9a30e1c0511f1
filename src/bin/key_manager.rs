//! Key Management CLI Tool
//!
//! Lists and rotates the versioned HMAC secrets that seal the audit ledger.
//! Secret material is never printed back except for a freshly generated secret.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;

use audit_ledger::audit::SecretStore;
use audit_ledger::database::Database;

#[derive(Parser)]
#[command(name = "key-manager")]
#[command(about = "Audit ledger secret management tool")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database URL
    #[arg(long, env = "AUDIT_LEDGER_DATABASE_URL", default_value = "sqlite://audit-ledger.db")]
    database_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered secret versions
    List,

    /// Register a new secret version; existing versions stay untouched
    Rotate {
        /// New secret value (at least 32 bytes)
        #[arg(short, long, conflicts_with = "generate")]
        secret: Option<String>,

        /// Generate 32 random bytes, hex encoded
        #[arg(short, long)]
        generate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=warn".into()),
        )
        .init();

    let cli = Cli::parse();

    let db = Database::new(&cli.database_url).await?;
    db.run_migrations().await?;
    let secrets = SecretStore::new(db.pool().clone());

    match cli.command {
        Commands::List => {
            let versions = secrets.versions().await?;
            if versions.is_empty() {
                println!("No secret versions registered");
            } else {
                println!("Secret versions:");
                for info in versions {
                    println!("  v{} - created {}", info.version, info.created_at);
                }
            }
        }

        Commands::Rotate { secret, generate } => {
            let (secret, generated) = match (secret, generate) {
                (Some(secret), false) => (secret, false),
                (None, true) => (generate_secret(), true),
                _ => bail!("specify exactly one of --secret or --generate"),
            };

            let version = secrets.rotate(secret.as_bytes()).await?;
            println!("Secret rotated successfully:");
            println!("  New version: {}", version);
            if generated {
                println!("  Secret: {}", secret);
                println!("  Store this value securely; it is required to verify entries sealed with it.");
            }
        }
    }

    db.close().await;
    Ok(())
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
