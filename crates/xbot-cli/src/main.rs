mod logging;

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{Duration, Local, NaiveDate};
use clap::Parser;
use tracing::{error, info, warn};
use xbot_core::capture::load_followed_users;
use xbot_core::{
    Alerter, CancellationToken, Config, HttpFetcher, LarkAlerter, LogAlerter, Pipeline, RunOptions,
    RunResult, TelegramNotifier,
};

#[derive(Parser)]
#[command(name = "xbot", version, about = "Forward media from captured posts to a chat channel")]
struct Cli {
    /// Extra configuration file (TOML, JSON, YAML, ...)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Process one capture file instead of the lookback window
    #[arg(long, requires = "output")]
    capture: Option<PathBuf>,

    /// Output record for --capture
    #[arg(long, requires = "capture")]
    output: Option<PathBuf>,

    /// Days to look back in batch mode, today included
    #[arg(long, default_value_t = 8)]
    days: u32,

    /// Only forward posts by the users listed in this file
    #[arg(long)]
    users_file: Option<PathBuf>,
}

/// `<dir>/YYYY-MM/YYYY-MM-DD.json`
fn dated_path(dir: &Path, day: NaiveDate) -> PathBuf {
    dir.join(day.format("%Y-%m").to_string())
        .join(format!("{}.json", day.format("%Y-%m-%d")))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    let _guard = logging::init(&config.paths.log_dir, &config.log_level)?;

    if let Err(e) = run(&cli, &config) {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

fn run(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let credentials = config.credentials()?;
    let notifier = TelegramNotifier::new(&config.telegram.api_base, &credentials.bot_token, config.timeout())?;
    let fetcher = HttpFetcher::new(config.timeout())?;
    let alerter: Box<dyn Alerter> = match config.webhook_url() {
        Some(url) => Box::new(LarkAlerter::new(url, config.alert_timeout())?),
        None => {
            warn!("no webhook key configured, alerts go to the log only");
            Box::new(LogAlerter)
        }
    };

    let users = match cli.users_file.as_ref().or(config.paths.users_file.as_ref()) {
        Some(path) => {
            let users = load_followed_users(path)?;
            info!(file = %path.display(), users = users.len(), "user filter loaded");
            Some(users)
        }
        None => None,
    };

    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, finishing the current post...");
        handler_token.cancel();
    })?;

    let pipeline = Pipeline::new(config, credentials.chat_id, &fetcher, &notifier, alerter.as_ref())
        .with_cancel_token(token.clone());

    if let (Some(capture), Some(output)) = (&cli.capture, &cli.output) {
        let result = pipeline.run(&RunOptions {
            capture_file: capture.clone(),
            output_file: output.clone(),
            users,
        })?;
        report(&result);
        return Ok(());
    }

    let today = Local::now().date_naive();
    let mut total = RunResult::default();
    let mut failures = 0usize;
    for offset in 0..cli.days {
        if token.is_cancelled() {
            break;
        }
        let day = today - Duration::days(i64::from(offset));
        let capture_file = dated_path(&config.paths.capture_dir, day);
        if !capture_file.exists() {
            info!(file = %capture_file.display(), "no capture for this day, skipped");
            continue;
        }

        let options = RunOptions {
            capture_file,
            output_file: dated_path(&config.paths.output_dir, day),
            users: users.clone(),
        };
        match pipeline.run(&options) {
            Ok(result) => total.absorb(&result),
            Err(e) => {
                error!(day = %day, "run failed: {:#}", e);
                failures += 1;
            }
        }
    }

    report(&total);
    if failures > 0 {
        anyhow::bail!("{} of {} days failed", failures, cli.days);
    }
    Ok(())
}

fn report(result: &RunResult) {
    info!(
        inserted = result.inserted,
        downloaded = result.downloaded,
        uploaded = result.uploaded,
        failed = result.failed,
        terminal = result.terminal,
        cancelled = result.cancelled,
        "done"
    );
}
