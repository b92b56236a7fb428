use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use scanner_core::config::Config;
use scanner_core::{logging, telegram::Bot};
use tokio_util::sync::CancellationToken;

use barcode_scanner::app::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::parse();

    let (log_handle, log_rx) = logging::init(&cfg.state_path, "barcode-scanner", "info")
        .context("logging setup failed")?;

    let cancel = CancellationToken::new();
    let bot = Arc::new(Bot::new(
        cancel.clone(),
        &cfg.telegram_token,
        cfg.telegram_channel_id,
    ));
    logging::spawn_forwarder(bot.clone(), log_rx, cancel.clone());

    let app = App::new(cfg, cancel, bot, log_handle).context("app setup failed")?;
    app.run().await
}
