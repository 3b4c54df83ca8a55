use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use paw_core::{ExtractionRule, FieldSelectors};
use paw_extract::{parse_base_url, CompiledRule, DEFAULT_SNIPPET_ITEMS};
use paw_storage::{HttpClientConfig, HttpFetcher};
use paw_sync::{PawConfig, RunError, SyncPipeline};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "paw")]
#[command(about = "Push Article Watcher: scrape a listing page, store new articles, push notifications")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once and exit with its status.
    Run,
    /// Run the pipeline on PAW_SYNC_CRON until Ctrl-C.
    Watch,
    /// Serve the web API (and the schedule when PAW_SCHEDULER_ENABLED=1).
    Serve,
    /// Fetch a page and print what a rule would extract.
    Preview {
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "article")]
        list: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        link: Option<String>,
        #[arg(long)]
        date: Option<String>,
    },
    /// Validate configuration and the rules file without touching the network.
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    match dispatch(cli.command.unwrap_or(Commands::Run)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "paw failed");
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());
    if std::env::var("PAW_LOG_JSON").is_ok_and(|v| v == "1") {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(command: Commands) -> Result<(), RunError> {
    match command {
        Commands::Run => {
            let summary = paw_sync::run_sync_once_from_env().await?;
            println!(
                "run complete: run_id={} scraped={} new={} notified={} failed={}",
                summary.run_id,
                summary.scraped,
                summary.new_count,
                summary.notify_attempts - summary.notify_failures,
                summary.notify_failures
            );
        }
        Commands::Watch => {
            let config = PawConfig::from_env()?;
            let pipeline = Arc::new(SyncPipeline::from_config(&config)?);
            let mut sched = paw_sync::build_scheduler(pipeline, &config.sync_cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "watching; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            let config = PawConfig::from_env()?;
            let sched = paw_sync::maybe_build_scheduler(&config).await?;
            if let Some(sched) = &sched {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started alongside web server");
            }
            paw_web::serve(&config).await?;
        }
        Commands::Preview {
            url,
            list,
            title,
            link,
            date,
        } => {
            let defaults = FieldSelectors::default();
            let rule = ExtractionRule {
                list_selector: list,
                fields: FieldSelectors {
                    title: title.unwrap_or(defaults.title),
                    link: link.unwrap_or(defaults.link),
                    date: date.unwrap_or(defaults.date),
                },
            };
            let compiled = CompiledRule::compile(&rule).context("compiling selectors")?;
            let base = parse_base_url(&url).context("parsing --url")?;
            let config = PawConfig::from_env()?;
            let fetcher = HttpFetcher::new(HttpClientConfig {
                timeout: config.http_timeout,
                user_agent: config.user_agent.clone(),
                ..Default::default()
            })?;
            let page = fetcher
                .fetch_text(uuid::Uuid::new_v4(), base.as_str())
                .await
                .map_err(|source| RunError::Fetch {
                    url: url.clone(),
                    source,
                })?;
            let preview = paw_extract::preview(&page.body, &base, &compiled, DEFAULT_SNIPPET_ITEMS);
            let out = serde_json::to_string_pretty(&preview).context("encoding preview")?;
            println!("{out}");
        }
        Commands::CheckConfig => {
            let config = PawConfig::from_env()?;
            config.validate_for_pipeline()?;
            let rules = config.load_rule_file()?;
            println!("target:    {}", config.resolve_target_url(&rules));
            println!("list:      {}", rules.rule.list_selector);
            println!(
                "fields:    title={:?} link={:?} date={:?}",
                rules.rule.fields.title, rules.rule.fields.link, rules.rule.fields.date
            );
            println!("store:     {}", config.store_url.as_deref().unwrap_or_default());
            println!("anon read: {}", config.anon_key.is_some());
            println!("cron:      {} (enabled={})", config.sync_cron, config.scheduler_enabled);
            println!("configuration ok");
        }
    }

    Ok(())
}
