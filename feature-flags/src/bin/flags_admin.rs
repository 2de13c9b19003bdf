use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use common_types::FlagMap;
use feature_flags::store::{initial_flags, DefaultStore, SqliteFlagStore, INITIAL_FLAGS};

/// Maintenance commands for the flag defaults database.
/// These write straight to the store and send no change notifications.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://flags.db?mode=rwc")]
    database_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Insert any missing initial flags, leaving existing values alone
    Seed,
    /// Print every flag and its default
    List,
    /// Put every initial flag back to its initial value
    Reset,
    /// Overwrite defaults of existing flags, e.g. `set SITE_RELAUNCH=true BACKEND_V2=true`
    Set {
        #[arg(required = true, value_parser = parse_assignment)]
        flags: Vec<(String, bool)>,
    },
    /// Delete every flag that is not part of the initial set
    Cleanup,
    /// Add new flags, ignoring names that already exist
    Add {
        #[arg(required = true, value_parser = parse_assignment)]
        flags: Vec<(String, bool)>,
    },
}

fn parse_assignment(s: &str) -> Result<(String, bool), String> {
    let Some((name, value)) = s.split_once('=') else {
        return Err(format!("expected NAME=BOOL, got {s}"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing flag name in {s}"));
    }
    let value = value
        .trim()
        .parse::<bool>()
        .map_err(|_| format!("{} is not true or false", value.trim()))?;
    Ok((name.to_string(), value))
}

fn print_flags(flags: &FlagMap) {
    println!("\nCurrent flags in database:");
    for (name, value) in flags {
        println!("- {name}: {value}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let store = SqliteFlagStore::connect(&cli.database_url, 1, Duration::from_secs(5))
        .await
        .with_context(|| format!("failed to open {}", cli.database_url))?;

    match cli.command {
        Command::Seed => {
            let inserted = store.seed().await?;
            println!("Inserted {inserted} missing flag(s).");
        }
        Command::List => {}
        Command::Reset => {
            store.seed().await?;
            store.overwrite(&initial_flags()).await?;
            println!("Flags reset to their initial values.");
        }
        Command::Set { flags } => {
            let requested: FlagMap = flags.into_iter().collect();
            let written = store.overwrite(&requested).await?;
            let missing: Vec<&String> = requested
                .keys()
                .filter(|name| !written.contains(*name))
                .collect();
            if !missing.is_empty() {
                print_flags(&store.list().await?);
                bail!("unknown flag(s): {:?}", missing);
            }
            println!("Updated {} flag(s).", written.len());
        }
        Command::Cleanup => {
            let keep: Vec<&str> = INITIAL_FLAGS.iter().map(|(name, _)| *name).collect();
            let deleted = store.delete_except(&keep).await?;
            if deleted.is_empty() {
                println!("No obsolete flags found. Database is already clean.");
            } else {
                println!("Deleted {} obsolete flag(s):", deleted.len());
                for name in &deleted {
                    println!("- {name}");
                }
            }
        }
        Command::Add { flags } => {
            let added: FlagMap = flags.into_iter().collect();
            let inserted = store.insert_missing(&added).await?;
            println!("Added {inserted} flag(s).");
        }
    }

    print_flags(&store.list().await?);
    Ok(())
}
