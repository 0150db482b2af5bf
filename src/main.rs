//! # Town Hub CLI (`hub`)
//!
//! ```bash
//! hub --config ./config/hub.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `hub init` | Create the database, run migrations, seed declared sources |
//! | `hub sources` | List sources with schedule and connector status |
//! | `hub ingest` | Run due connectors |
//! | `hub monitor` | Run change detection |
//! | `hub search "<query>"` | Keyword hits for a town |
//! | `hub ask "<query>"` | Answer a query through the cache |
//! | `hub classify "<query>"` | Show the tiers a query searches |
//! | `hub cache purge` | Drop expired answers and lapsed claims |
//! | `hub serve` | Start the HTTP trigger server |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use town_hub::config;
use town_hub::hub::Hub;
use town_hub::ingest::{self, RunOptions};
use town_hub::monitor::{self, MonitorResponse};
use town_hub::search;
use town_hub::server;
use town_hub::sources;
use town_hub_core::models::Schedule;
use town_hub_core::{get_search_tiers, normalize_query};

/// Town Hub: keeps a municipal knowledge base fresh and answers questions
/// from it.
#[derive(Parser)]
#[command(name = "hub", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/hub.toml")]
    config: PathBuf,

    /// Log level for this crate when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and seed declared sources.
    ///
    /// Idempotent.
    Init,

    /// List sources with their schedule, due state, and connector status.
    Sources {
        #[arg(long)]
        town: Option<String>,
    },

    /// Run the connectors that are due.
    Ingest {
        #[arg(long)]
        town: Option<String>,

        /// Only sources on this schedule (hourly, daily, weekly).
        #[arg(long)]
        schedule: Option<String>,

        /// Run every matching source regardless of when it last succeeded.
        #[arg(long)]
        force: bool,

        /// Accepted for compatibility with the scheduled trigger; echoed only.
        #[arg(long)]
        generate: bool,
    },

    /// Check tracked pages for changes and discover new ones.
    Monitor {
        /// Town to check. All towns with active sources when omitted.
        #[arg(long)]
        town: Option<String>,

        #[arg(long, default_value = "cli")]
        trigger: String,
    },

    /// Keyword search over a town's documents.
    Search {
        query: String,

        #[arg(long)]
        town: String,
    },

    /// Answer a question for a town.
    Ask {
        query: String,

        #[arg(long)]
        town: String,
    },

    /// Print the normalized key and search tiers for a query.
    Classify { query: String },

    /// Answer cache maintenance.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Start the HTTP trigger server.
    Serve,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove expired entries and lapsed claims.
    Purge,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("town_hub={level},town_hub_core={level},warn")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    // Commands that don't require config
    if let Commands::Classify { query } = &cli.command {
        let tiers: Vec<&str> = get_search_tiers(query).iter().map(|t| t.as_str()).collect();
        println!("key:   {}", normalize_query(query));
        println!("tiers: {}", tiers.join(", "));
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let hub = Hub::open(cfg).await?;

    match cli.command {
        Commands::Init => {
            let seeded = sources::seed_sources(&hub).await?;
            println!("Database initialized successfully.");
            println!("Seeded {} source(s).", seeded);
        }
        Commands::Sources { town } => {
            sources::list_sources(&hub, town.as_deref()).await?;
        }
        Commands::Ingest {
            town,
            schedule,
            force,
            generate,
        } => {
            let schedule = match schedule.as_deref() {
                None => None,
                Some(s) => Some(Schedule::parse(s).ok_or_else(|| {
                    anyhow::anyhow!("unknown schedule '{}'. Must be hourly, daily, or weekly.", s)
                })?),
            };
            let options = RunOptions {
                town_id: town,
                schedule,
                force,
            };
            let summary = ingest::run_trigger(&hub, &options, generate).await?;
            println!(
                "{:<40} {:>8} {:>8} {:>7} {:>8}",
                "CONNECTOR", "UPSERTED", "SKIPPED", "ERRORS", "MS"
            );
            for r in &summary.results {
                println!(
                    "{:<40} {:>8} {:>8} {:>7} {:>8}",
                    format!("{}:{}", r.town_id, r.connector_id),
                    r.items_upserted,
                    r.items_skipped,
                    r.errors.len(),
                    r.duration_ms
                );
                for e in &r.errors {
                    println!("    [{}] {}", e.kind, e.message);
                }
            }
            println!(
                "Ran {} connector(s): {} upserted, {} skipped, {} error(s), {} deferred.",
                summary.connectors_run,
                summary.items_upserted,
                summary.items_skipped,
                summary.errors,
                summary.deferred
            );
        }
        Commands::Monitor { town, trigger } => {
            let report = match town.as_deref() {
                Some(town) => monitor::run_change_detection(&hub, town, &trigger).await?,
                None => monitor::run_all_towns(&hub, &trigger).await?,
            };
            let response = MonitorResponse::from_report(report);
            for url in &response.changed_urls {
                println!("changed  {}", url);
            }
            for url in &response.new_urls {
                println!("new      {}", url);
            }
            for e in &response.errors {
                println!("error    {}", e);
            }
            println!(
                "Checked {} URL(s): {} changed, {} new, {} error(s) in {} ms{}.",
                response.checked,
                response.changed,
                response.new_urls.len(),
                response.errors.len(),
                response.duration_ms,
                if response.deadline_reached {
                    " (deadline reached)"
                } else {
                    ""
                }
            );
        }
        Commands::Search { query, town } => {
            let hits = search::search(&hub, &town, &query).await?;
            if hits.is_empty() {
                println!("No results.");
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. [{:.2}] {} ({})",
                    i + 1,
                    hit.score,
                    hit.title.as_deref().unwrap_or("(untitled)"),
                    hit.tier.as_str()
                );
                println!("    {}", hit.canonical_url);
                println!("    {}", hit.snippet.trim());
            }
        }
        Commands::Ask { query, town } => {
            let answer = search::answer_query(&hub, &town, &query).await?;
            println!("{}", answer.answer_html);
            for source in &answer.sources {
                println!("  - {}", source.url);
            }
            if answer.cached {
                println!("(served from cache)");
            }
        }
        Commands::Cache {
            action: CacheAction::Purge,
        } => {
            let removed = hub.cache.purge_expired().await?;
            println!("Purged {} expired cache record(s).", removed);
        }
        Commands::Serve => {
            server::run_server(Arc::new(hub)).await?;
        }
        Commands::Classify { .. } => unreachable!(),
    }

    Ok(())
}
