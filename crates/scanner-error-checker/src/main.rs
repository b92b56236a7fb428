use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use scanner_core::config::Config;
use scanner_core::{logging, telegram::Bot};
use tokio_util::sync::CancellationToken;

mod app;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Invoked by systemd's OnFailure= hook to triage a crashed unit"
)]
struct Args {
    #[command(flatten)]
    cfg: Config,

    /// Base name of the binary whose failure we are handling.
    #[arg(long)]
    binary: String,

    /// Comma-separated base names whose logs should be shipped; defaults to
    /// the failed binary.
    #[arg(long)]
    logs: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (_log_handle, log_rx) = logging::init(&args.cfg.state_path, "error-checker", "debug")
        .context("logging setup failed")?;

    let cancel = CancellationToken::new();
    let bot = Arc::new(Bot::new(
        cancel.clone(),
        &args.cfg.telegram_token,
        args.cfg.telegram_channel_id,
    ));
    logging::spawn_forwarder(bot.clone(), log_rx, cancel.clone());

    let logs = args.logs.unwrap_or_else(|| args.binary.clone());
    let log_binaries: Vec<&str> = logs.split(',').map(str::trim).collect();

    let checker = app::Checker::new(args.cfg, bot, args.binary);
    checker.ship_logs(&log_binaries).await;
    checker.ship_dmesg().await;
    checker.handle_service_error(&app::exit_info_from_env()).await;

    // let the last notifier sends drain
    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    Ok(())
}
