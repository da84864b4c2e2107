mod account_pool;
mod config;
mod csv_writer;
mod driver;
mod error;
mod excel_writer;
mod instagram;
mod models;
mod orchestrator;
mod paginator;
mod proxy_pool;
mod server;
mod store;
#[cfg(test)]
mod testing;

use anyhow::{anyhow, bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::account_pool::AccountPool;
use crate::config::AppConfig;
use crate::csv_writer::{csv_filename, CsvExporter};
use crate::excel_writer::{report_filename, ExcelExporter};
use crate::instagram::InstagramDriver;
use crate::models::{normalize_username, ReelLimit};
use crate::orchestrator::ScrapeOrchestrator;
use crate::paginator::Paginator;
use crate::proxy_pool::ProxyPool;
use crate::server::AppState;
use crate::store::SnapshotFile;

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    Scrape {
        username: String,
        max_reels: Option<u32>,
        out: PathBuf,
        csv: bool,
    },
    TestAccount {
        login: String,
    },
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    command: Command,
    config: Option<PathBuf>,
    headed: bool,
}

fn parse_args(args: &[String]) -> Result<Cli> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut headed = false;
    let mut csv = false;
    let mut max_reels = None;
    let mut out = PathBuf::from("data");

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--headed" => headed = true,
            "--csv" => csv = true,
            "--config" => {
                let value = iter.next().context("--config needs a file path")?;
                config = Some(PathBuf::from(value));
            }
            "--out" => {
                let value = iter.next().context("--out needs a directory")?;
                out = PathBuf::from(value);
            }
            "--max-reels" => {
                let value = iter.next().context("--max-reels needs a number")?;
                max_reels = Some(
                    value
                        .parse::<u32>()
                        .with_context(|| format!("Invalid --max-reels value '{}'", value))?,
                );
            }
            other if other.starts_with("--") => bail!("Unknown option '{}'", other),
            other => positional.push(other.to_string()),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None | Some("serve") => Command::Serve,
        Some("scrape") => Command::Scrape {
            username: positional.next().context("scrape needs a username")?,
            max_reels,
            out,
            csv,
        },
        Some("test-account") => Command::TestAccount {
            login: positional.next().context("test-account needs a login")?,
        },
        Some(other) => bail!("Unknown command '{}'", other),
    };

    Ok(Cli {
        command,
        config,
        headed,
    })
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_orchestrator(config: &AppConfig) -> Result<ScrapeOrchestrator<InstagramDriver>> {
    let dir = &config.storage.data_dir;
    let accounts = AccountPool::open(SnapshotFile::in_dir(dir, "accounts.json"))
        .context("Failed to load accounts")?;
    let proxies = ProxyPool::open(SnapshotFile::in_dir(dir, "proxies.json"))
        .context("Failed to load proxies")?;

    Ok(ScrapeOrchestrator::new(
        Arc::new(accounts),
        Arc::new(proxies),
        InstagramDriver::from_config(config),
        Paginator::from_config(&config.retry, &config.pagination),
    ))
}

async fn serve(config: &AppConfig, orchestrator: ScrapeOrchestrator<InstagramDriver>) -> Result<()> {
    let state = Arc::new(AppState {
        orchestrator,
        max_reels_limit: config.server.max_reels_limit,
    });
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!("Reels harvester listening on {}", config.server.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received, draining connections");
}

async fn scrape_once(
    config: &AppConfig,
    orchestrator: &ScrapeOrchestrator<InstagramDriver>,
    username: &str,
    max_reels: Option<u32>,
    out: &Path,
    csv: bool,
) -> Result<()> {
    let target = normalize_username(username).context("Not an Instagram username or profile link")?;
    if let Some(max) = max_reels {
        if max > config.server.max_reels_limit {
            bail!("--max-reels must be at most {}", config.server.max_reels_limit);
        }
    }

    let collection = orchestrator
        .run(&target, ReelLimit::from_request(max_reels))
        .await
        .map_err(|e| anyhow!("{} ({}: {})", e.message(), e.kind(), e))?;

    std::fs::create_dir_all(out)
        .with_context(|| format!("Failed to create output directory {}", out.display()))?;

    let xlsx_path = out.join(report_filename(&target));
    let mut excel_writer = ExcelExporter::new();
    excel_writer.write_reels(&collection.reels)?;
    excel_writer.save(&xlsx_path)?;

    if csv {
        let csv_path = out.join(csv_filename(&target));
        let mut csv_writer = CsvExporter::create(&csv_path)?;
        csv_writer.write_reels(&collection.reels)?;
        csv_writer.finalize()?;
        info!("CSV saved to {}", csv_path.display());
    }

    info!(
        "Scraping complete! Collected {} reels for {}. Data saved to {}",
        collection.reels.len(),
        target,
        xlsx_path.display()
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if cli.headed {
        config.browser.headless = false;
    }
    init_tracing(&config.logging.level);

    info!("Starting reels harvester");
    if !config.browser.headless {
        info!("Running in headed mode (browser visible)");
    }

    let orchestrator = build_orchestrator(&config)?;

    match cli.command {
        Command::Serve => serve(&config, orchestrator).await,
        Command::Scrape {
            username,
            max_reels,
            out,
            csv,
        } => scrape_once(&config, &orchestrator, &username, max_reels, &out, csv).await,
        Command::TestAccount { login } => {
            let report = orchestrator
                .test_account(&login)
                .await
                .map_err(|e| anyhow!("{} ({})", e.detail(), e.kind()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_arguments_means_serve() {
        let cli = parse_args(&[]).unwrap();
        assert_eq!(cli.command, Command::Serve);
        assert!(!cli.headed);
        assert_eq!(cli.config, None);
    }

    #[test]
    fn scrape_takes_options_in_any_order() {
        let cli = parse_args(&args(&[
            "--headed", "scrape", "natgeo", "--max-reels", "50", "--csv", "--out", "reports",
        ]))
        .unwrap();

        assert!(cli.headed);
        assert_eq!(
            cli.command,
            Command::Scrape {
                username: "natgeo".to_string(),
                max_reels: Some(50),
                out: PathBuf::from("reports"),
                csv: true,
            }
        );
    }

    #[test]
    fn test_account_needs_a_login() {
        assert!(parse_args(&args(&["test-account"])).is_err());
        let cli = parse_args(&args(&["test-account", "alice", "--config", "prod.toml"])).unwrap();
        assert_eq!(
            cli.command,
            Command::TestAccount {
                login: "alice".to_string()
            }
        );
        assert_eq!(cli.config, Some(PathBuf::from("prod.toml")));
    }

    #[test]
    fn rejects_unknown_input() {
        assert!(parse_args(&args(&["crawl"])).is_err());
        assert!(parse_args(&args(&["scrape", "x", "--max-reels", "many"])).is_err());
        assert!(parse_args(&args(&["--verbose"])).is_err());
    }
}
