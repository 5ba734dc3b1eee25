//! keepwarm CLI
//!
//! Keeps a cloud workstation signed in and its workspace warm.
//!
//! Usage:
//!   keepwarm                         # run every 30 minutes (IDX_INTERVAL_MINUTES)
//!   keepwarm --once                  # single run, then exit
//!   keepwarm --interval 45           # custom interval in minutes (minimum 5)
//!   keepwarm --prefix 9000-idx-me-   # workstation host prefix
//!
//! Settings are read from the environment and a `.env` file; flags win.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keepwarm::{ChromiumEngine, Config, Orchestrator, Scheduler, TelegramNotifier};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "keepwarm")]
#[command(about = "Keeps a cloud workstation signed in and its workspace warm")]
struct Cli {
    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Minutes between the start of consecutive cycles (minimum 5)
    #[arg(long, value_name = "MINUTES")]
    interval: Option<u64>,

    /// Workstation host prefix, e.g. 9000-idx-sherry-
    #[arg(long, env = "BASE_PREFIX")]
    prefix: Option<String>,

    /// Where the browser session is stored
    #[arg(long, value_name = "PATH", env = "KEEPWARM_SESSION_FILE")]
    session_file: Option<PathBuf>,

    /// Show the browser window
    #[arg(long)]
    headed: bool,

    /// Treat steps that could not be confirmed as failures
    #[arg(long)]
    strict: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(minutes) = self.interval {
            config.set_interval_minutes(minutes);
        }
        if let Some(prefix) = &self.prefix {
            config.base_prefix = prefix.clone();
        }
        if let Some(path) = &self.session_file {
            config.session_file = path.clone();
        }
        if self.headed {
            config.browser.headless = false;
        }
        if self.strict {
            config.strict = true;
        }
    }
}

fn init_logging() {
    use std::env;
    use tracing_appender::rolling;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    // KEEPWARM_LOG_DIR overrides the per-user data directory
    let log_dir = if let Ok(custom_dir) = env::var("KEEPWARM_LOG_DIR") {
        PathBuf::from(custom_dir)
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("keepwarm")
            .join("logs")
    };
    let _ = std::fs::create_dir_all(&log_dir);

    let file_appender = rolling::daily(&log_dir, "keepwarm.log");

    let _ = tracing_subscriber::registry()
        .with(
            // Respect RUST_LOG if provided, else default to info
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging();

    let mut config = Config::from_env();
    cli.apply(&mut config);
    info!(
        prefix = %config.base_prefix,
        session_file = %config.session_file.display(),
        interval_minutes = config.interval.as_secs() / 60,
        headless = config.browser.headless,
        strict = config.strict,
        "Starting keepwarm"
    );

    let engine = Arc::new(ChromiumEngine::new(config.browser.clone()));
    let notifier = Arc::new(
        TelegramNotifier::new(config.telegram.clone())
            .context("Failed to build the Telegram client")?,
    );
    let orchestrator =
        Orchestrator::new(config, engine).context("Failed to build the probe client")?;
    let mut scheduler = Scheduler::new(Arc::new(orchestrator), notifier);

    if cli.once {
        scheduler.run_cycle().await;
        info!("Single run finished");
    } else {
        scheduler.run_forever().await;
    }
    Ok(())
}
