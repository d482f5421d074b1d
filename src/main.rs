mod api;
mod config;
mod diff;
mod error;
mod listing;
mod monitor;
mod notify;
mod scheduler;
mod store;

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::signal;

use listing::{ListingFetcher, ListingSource};
use store::{TaskStore, UserStore};

#[derive(Parser)]
#[command(
    name = "listwatch",
    version,
    about = "Watches classifieds listing pages and reports new items"
)]
struct Cli {
    #[arg(short, long, default_value = "~/.listwatch/config.toml")]
    config: String,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    Init,
    Status,
    /// Fetch a listing page once and print what would be tracked
    Probe {
        url: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Init => {
            let path = config::init_config_dir().await?;
            tracing::info!("Initialized {}", path.display());
        }
        Commands::Run => run(&cli.config).await?,
        Commands::Status => status(&cli.config).await?,
        Commands::Probe { url, limit } => probe(&cli.config, &url, limit).await?,
    }
    Ok(())
}

async fn run(config_path: &str) -> Result<()> {
    let cfg = config::load(config_path)?;
    let db = store::Db::open(&cfg.storage.db_path)?;
    let fetcher = ListingFetcher::new(&cfg.fetcher)?;
    let notifier = notify::create_notifier(cfg.notify.webhook_url.as_deref())?;
    if cfg.notify.webhook_url.is_none() {
        tracing::warn!("No [notify] webhook_url set, new items are only logged");
    }

    let monitor = monitor::Monitor::new(
        Arc::new(db.tasks()),
        Arc::new(db.users()),
        Arc::new(fetcher),
        Arc::from(notifier),
        monitor::MonitorSettings::from_config(&cfg),
    );
    monitor.rehydrate(Utc::now()).await?;

    if !is_localhost(&cfg.api.bind) {
        tracing::warn!(
            "API bound to non-localhost '{}' without authentication",
            cfg.api.bind
        );
    }
    let state = api::AppState {
        monitor: monitor.clone(),
    };
    let listener = tokio::net::TcpListener::bind(&cfg.api.bind).await?;
    tracing::info!("listwatch listening on {}", cfg.api.bind);

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            signal::ctrl_c().await.ok();
        })
        .await?;
    monitor.shutdown();
    Ok(())
}

async fn status(config_path: &str) -> Result<()> {
    let cfg = config::load(config_path)?;
    let db = store::Db::open(&cfg.storage.db_path)?;
    let users = db.users().list_all().await?;
    let active = db.users().list_active(Utc::now()).await?.len();
    let tasks = db.tasks().list_all().await?;
    println!(
        "{} users ({active} active), {} tasks",
        users.len(),
        tasks.len()
    );
    for task in tasks {
        println!(
            "  #{} [{}] {} every {} min, tracking {} items",
            task.id,
            task.owner_id,
            task.name,
            task.cadence_minutes,
            task.last_seen_cursor.len()
        );
    }
    Ok(())
}

async fn probe(config_path: &str, url: &str, limit: usize) -> Result<()> {
    let cfg = config::load(config_path).unwrap_or_default();
    let fetcher = ListingFetcher::new(&cfg.fetcher)?;
    match fetcher.fetch(url, limit).await? {
        Some(items) => {
            for item in items {
                println!("{:>10}  {:<16} {}", item.id, item.price, item.location);
            }
        }
        None => println!("No listings found"),
    }
    Ok(())
}

fn is_localhost(bind: &str) -> bool {
    use std::net::IpAddr;

    let host = if let Some(inner) = bind.strip_prefix('[')
        && let Some(bracket_end) = inner.find(']')
    {
        &inner[..bracket_end]
    } else if let Some(colon) = bind.rfind(':') {
        &bind[..colon]
    } else {
        bind
    };

    if host == "localhost" {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}
