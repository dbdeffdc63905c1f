//! Memoria - Consent-Governed Personal Record Vault
//!
//! Command-line front end for bundle management and retrieval.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use memoria::{
    bundle::{BundlePolicy, MeditateInput},
    consent::ConsentLevel,
    retrieval::RetrievalFilter,
    Context, MemoriaConfig, Vault,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memoria")]
#[command(author = "Memoria Contributors")]
#[command(version)]
#[command(about = "Consent-governed personal record vault")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MEMORIA_CONFIG")]
    config: Option<PathBuf>,

    /// Owner the commands act for
    #[arg(short, long, env = "MEMORIA_OWNER", default_value = "default")]
    owner: String,

    /// Print results and logs as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty bundle
    Create {
        /// Bundle name
        name: String,

        /// Consent level granted to meditated records
        #[arg(long, default_value = "full")]
        level: ConsentLevel,

        /// Delete records after this many days
        #[arg(long)]
        retention_days: Option<u32>,

        /// Downgrade FULL records to ANONYMIZED after this many days
        #[arg(long)]
        downgrade_after_days: Option<u32>,
    },

    /// Ingest text or a file into a bundle
    Meditate {
        /// Bundle name
        bundle: String,

        /// Text file to ingest
        #[arg(conflicts_with = "text")]
        file: Option<PathBuf>,

        /// Inline text to ingest
        #[arg(short, long)]
        text: Option<String>,

        /// Requested consent level; capped by the bundle policy
        #[arg(long)]
        level: Option<ConsentLevel>,
    },

    /// Remove records or labeled passages matching a pattern
    Purge {
        /// Bundle name
        bundle: String,

        /// Case-insensitive regex
        pattern: String,
    },

    /// Show bundle document and passage counts
    Status {
        /// Bundle name; all bundles when omitted
        bundle: Option<String>,
    },

    /// Retrieve passages for a query
    Retrieve {
        /// Query text
        query: String,

        /// Number of passages
        #[arg(short, long, default_value = "5")]
        k: usize,

        /// Restrict to a bundle
        #[arg(short, long)]
        bundle: Option<String>,

        /// Restrict to a source
        #[arg(short, long)]
        source: Vec<String>,
    },

    /// Export a bundle to a directory
    Export {
        /// Bundle name
        bundle: String,

        /// Target directory
        dir: PathBuf,

        /// Passphrase protecting the archive keys
        #[arg(long, env = "MEMORIA_EXPORT_PASSPHRASE")]
        passphrase: String,
    },

    /// Import a bundle from a directory
    Import {
        /// Archive directory
        dir: PathBuf,

        /// Passphrase protecting the archive keys
        #[arg(long, env = "MEMORIA_EXPORT_PASSPHRASE")]
        passphrase: String,
    },

    /// Apply retention and downgrade windows
    Retain,

    /// Rotate the active data key
    RotateKeys,

    /// Crypto-erase a retired data key and delete the records it protected
    EraseKey {
        /// Key id
        key_id: String,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("memoria={}", log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    // Load configuration
    let config = match &cli.config {
        Some(path) => MemoriaConfig::load(path)?,
        None => MemoriaConfig::default(),
    };

    if let Commands::Config { default } = cli.command {
        return show_config(if default { None } else { Some(&config) });
    }

    let secret = std::env::var(&config.crypto.master_key_env).with_context(|| {
        format!(
            "set {} to the vault master secret",
            config.crypto.master_key_env
        )
    })?;
    let vault = Vault::open(config, &secret).await?;
    let ctx = Context::new(cli.owner);
    let json = cli.json;

    match cli.command {
        Commands::Create {
            name,
            level,
            retention_days,
            downgrade_after_days,
        } => {
            let mut policy = BundlePolicy::new(level);
            policy.retention_days = retention_days;
            policy.downgrade_after_days = downgrade_after_days;
            let bundle = vault.create_bundle(&ctx, &name, policy).await?;
            vault.save().await?;
            print(json, &bundle, || format!("Created bundle '{}'", bundle.name))?;
        }
        Commands::Meditate {
            bundle,
            file,
            text,
            level,
        } => {
            let input = match (file, text) {
                (Some(path), _) => MeditateInput::File(path),
                (None, Some(text)) => MeditateInput::Text(text),
                (None, None) => anyhow::bail!("pass a file or --text"),
            };
            let report = match level {
                Some(level) => vault.meditate_at(&ctx, &bundle, input, level).await?,
                None => vault.meditate(&ctx, &bundle, input).await?,
            };
            vault.save().await?;
            print(json, &report, || {
                format!(
                    "{} record {} into '{}' ({} passages, consent {})",
                    if report.ingest.duplicate { "Re-ingested" } else { "Ingested" },
                    report.ingest.record_id,
                    report.bundle,
                    report.ingest.passages,
                    report.ingest.applied_level
                )
            })?;
        }
        Commands::Purge { bundle, pattern } => {
            let report = vault.purge(&ctx, &bundle, &pattern).await?;
            vault.save().await?;
            print(json, &report, || {
                format!(
                    "Purged '{}' from '{}': {} matched, {} records removed, {} passages removed",
                    report.pattern, bundle, report.matched, report.removed_records, report.removed_passages
                )
            })?;
        }
        Commands::Status { bundle } => {
            let names = match bundle {
                Some(name) => vec![name],
                None => vault
                    .list_bundles(&ctx)
                    .await
                    .into_iter()
                    .map(|b| b.name)
                    .collect(),
            };
            let mut statuses = Vec::new();
            for name in names {
                statuses.push(vault.status(&ctx, &name).await?);
            }
            print(json, &statuses, || {
                statuses
                    .iter()
                    .map(|s| {
                        format!(
                            "{}: {} documents, {} passages (consent {}, version {})",
                            s.name, s.documents, s.passages, s.policy.default_level, s.version
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Commands::Retrieve {
            query,
            k,
            bundle,
            source,
        } => {
            let filter = RetrievalFilter {
                sources: source,
                bundle,
                ..Default::default()
            };
            let passages = vault.retrieve(&ctx, &query, k, &filter).await;
            vault.save().await?;
            print(json, &passages, || {
                passages
                    .iter()
                    .enumerate()
                    .map(|(i, p)| {
                        format!(
                            "[{}] {:.4} {} {}\n{}",
                            i + 1,
                            p.score,
                            p.record_id,
                            p.label.as_deref().unwrap_or("-"),
                            p.text
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n")
            })?;
        }
        Commands::Export {
            bundle,
            dir,
            passphrase,
        } => {
            let manifest = vault.export(&ctx, &bundle, &dir, &passphrase).await?;
            vault.save().await?;
            print(json, &manifest, || {
                format!(
                    "Exported '{}' ({} records, {} passages) to {}",
                    manifest.bundle_name,
                    manifest.record_count,
                    manifest.passage_count,
                    dir.display()
                )
            })?;
        }
        Commands::Import { dir, passphrase } => {
            let bundle = vault.import(&ctx, &dir, &passphrase).await?;
            vault.save().await?;
            print(json, &bundle, || {
                format!(
                    "Imported '{}' ({} records)",
                    bundle.name,
                    bundle.record_ids.len()
                )
            })?;
        }
        Commands::Retain => {
            let report = vault.apply_retention(chrono::Utc::now()).await?;
            vault.save().await?;
            print(json, &report, || {
                format!(
                    "{} expired, {} downgraded, {} keys destroyed, {} records erased",
                    report.expired.len(),
                    report.downgraded.len(),
                    report.pruned_keys.len(),
                    report.erased.len()
                )
            })?;
        }
        Commands::RotateKeys => {
            let key_id = vault.rotate_keys(&ctx).await;
            vault.save().await?;
            print(json, &key_id, || format!("Active key is now {}", key_id))?;
        }
        Commands::EraseKey { key_id } => {
            let erased = vault.erase_key(&ctx, &key_id).await?;
            vault.save().await?;
            print(json, &erased, || {
                format!("Erased key {} and {} records", key_id, erased.len())
            })?;
        }
        Commands::Config { .. } => {}
    }

    Ok(())
}

fn print<T: Serialize>(json: bool, value: &T, human: impl FnOnce() -> String) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", human());
    }
    Ok(())
}

fn show_config(config: Option<&MemoriaConfig>) -> Result<()> {
    let config = config.cloned().unwrap_or_default();
    let toml = toml::to_string_pretty(&config)?;
    println!("{}", toml);
    Ok(())
}
