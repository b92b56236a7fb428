use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use scanner_core::config::Config;
use scanner_core::{logging, telegram::Bot};
use tokio_util::sync::CancellationToken;
use tracing::error;

mod app;

#[derive(Parser, Debug)]
#[command(version, about = "Update daemon for the scanner device binaries")]
struct Args {
    #[command(flatten)]
    cfg: Config,

    /// Managed executables, checked in this order. All must live next to
    /// the updater itself.
    #[arg(
        long,
        env = "UPDATE_BINARIES",
        default_value = "barcode-scanner,error-checker,updater"
    )]
    binaries: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let (_log_handle, log_rx) =
        logging::init(&args.cfg.state_path, "updater", "info").context("logging setup failed")?;

    let cancel = CancellationToken::new();
    let bot = Arc::new(Bot::new(
        cancel.clone(),
        &args.cfg.telegram_token,
        args.cfg.telegram_channel_id,
    ));
    logging::spawn_forwarder(bot, log_rx, cancel.clone());

    let names: Vec<&str> = args.binaries.split(',').map(str::trim).collect();
    let updater = match app::Updater::new(cancel.clone(), &args.cfg, &names) {
        Ok(u) => u,
        Err(e) => {
            error!(error = %e, "updater setup failed");
            return Err(e);
        }
    };

    app::spawn_signal_handler(cancel.clone());
    updater.run().await;

    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    Ok(())
}
