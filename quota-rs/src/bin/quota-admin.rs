//! CLI tool for inspecting and repairing storage quotas
//!
//! # Usage
//!
//! ```bash
//! # Show a user's storage summary
//! quota-admin summary user-1 --config quota.toml
//!
//! # List a user's stored entities, optionally for one world
//! quota-admin details user-1 --world world-7
//!
//! # Replay ledger events the projections missed
//! quota-admin catch-up
//! quota-admin catch-up user-1
//!
//! # Show projection failures
//! quota-admin dead-letters
//!
//! # Create a user's ledger ahead of their first upload
//! quota-admin init user-1 --bytes 52428800
//! ```

use clap::{Parser, Subcommand};
use quota_rs::config::Config;
use quota_rs::event_store::EventStore;
use quota_rs::ledger::{UserId, WorldId};
use quota_rs::quota::{OperationContext, QuotaEnforcer};
use quota_rs::services::QuotaServices;
use quota_rs::settings::StaticAllocation;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "quota-admin")]
#[command(about = "Inspect and repair storage quotas", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "quota.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a user's storage summary
    Summary {
        /// User id
        user: String,
    },
    /// List a user's stored entities
    Details {
        /// User id
        user: String,
        /// Only entities in this world
        #[arg(short, long)]
        world: Option<String>,
    },
    /// Replay ledger events missing from the projections
    CatchUp {
        /// Only this user; all ledgers when omitted
        user: Option<String>,
    },
    /// List events whose projection failed
    DeadLetters,
    /// Initialize a user's ledger
    Init {
        /// User id
        user: String,
        /// Allocation in bytes, instead of the configured one
        #[arg(short, long)]
        bytes: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(Some(&cli.config))?;
    quota_rs::logging::init(&config.logging);

    let services = QuotaServices::connect(&config).await?;

    match cli.command {
        Commands::Summary { user } => {
            let user_id = UserId::new(&user);
            match services.projections.summary(&user_id).await? {
                Some(summary) => {
                    let head = services.store.current_version(&user_id).await?;
                    let checkpoint = services.projections.checkpoint(&user_id).await?;

                    println!("User:      {}", summary.user_id);
                    println!("Allocated: {} bytes", summary.allocated_bytes);
                    println!("Used:      {} bytes ({:.1}%)", summary.used_bytes, summary.usage_percent());
                    println!("Available: {} bytes", summary.available_bytes);
                    println!("Ledger:    v{} (projected to v{})", head, checkpoint);
                    if checkpoint < head {
                        println!("⚠️  Projections are behind; run `quota-admin catch-up {}`", user);
                    }
                }
                None => {
                    eprintln!("Error: No storage ledger for {}", user);
                    std::process::exit(1);
                }
            }
        }
        Commands::Details { user, world } => {
            let user_id = UserId::new(&user);
            let details = match world {
                Some(world) => {
                    services
                        .projections
                        .details_for_world(&user_id, &WorldId::new(world))
                        .await?
                }
                None => services.projections.details(&user_id).await?,
            };

            if details.is_empty() {
                println!("No stored entities found.");
            } else {
                println!("{:<20} {:<15} {:<30} {:>12}", "World", "Type", "Id", "Bytes");
                println!("{:-<80}", "");

                for detail in &details {
                    println!(
                        "{:<20} {:<15} {:<30} {:>12}",
                        detail.world_id, detail.entity_type, detail.entity_id, detail.size
                    );
                }

                let total: i64 = details.iter().map(|d| d.size).sum();
                println!("\nTotal: {} entities, {} bytes", details.len(), total);
            }
        }
        Commands::CatchUp { user: Some(user) } => {
            let applied = services.projections.catch_up(&UserId::new(&user)).await?;
            println!("✓ {} event(s) applied for {}", applied, user);
        }
        Commands::CatchUp { user: None } => {
            let report = services.projections.catch_up_all().await?;
            println!(
                "✓ {} ledger(s) checked, {} event(s) applied",
                report.streams, report.events_applied
            );
            for (user, error) in &report.failures {
                eprintln!("✗ {}: {}", user, error);
            }
            if !report.failures.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::DeadLetters => {
            let letters = services.projections.dead_letters().await?;

            if letters.is_empty() {
                println!("No dead letters.");
            } else {
                for letter in &letters {
                    println!(
                        "{}  {} v{}  {}",
                        letter.created_at, letter.user_id, letter.version, letter.error
                    );
                }
                println!("\nTotal: {} dead letter(s)", letters.len());
            }
        }
        Commands::Init { user, bytes } => {
            let mut allocation = StaticAllocation::from_config(&config.quota);
            if let Some(bytes) = bytes {
                allocation = allocation.with_override(user.as_str(), bytes);
            }

            let enforcer = QuotaEnforcer::new(services.store.clone(), Arc::new(allocation))
                .with_handler(services.projections.clone());

            let mut ctx = OperationContext::new(user.as_str());
            let ledger = enforcer.initialize(&mut ctx).await?;
            println!(
                "✓ Ledger for {} at v{}: {} of {} bytes used",
                user,
                ledger.version(),
                ledger.used_bytes(),
                ledger.allocated_bytes()
            );
        }
    }

    Ok(())
}
