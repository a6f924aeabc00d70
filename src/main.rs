// src/main.rs
use dotenvy::dotenv;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use trailbot::config::AppConfig;
use trailbot::connectors::binance::BinanceClient;
use trailbot::connectors::paper::PaperTrader;
use trailbot::connectors::traits::ExecutionHandler;
use trailbot::core::engine::TradingEngine;
use trailbot::types::parse_symbol;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Malformed configuration is the only fatal startup condition.
    let config = AppConfig::new()?;
    config.validate()?;

    let file_appender = tracing_appender::rolling::daily("logs", "tradebot.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    println!("========================================");
    println!("       TRAILBOT - v{}", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!("Target: {}", config.symbol);
    println!(
        "Mode:   {}",
        if config.live_trading {
            "LIVE TRADING"
        } else {
            "PAPER TRADING"
        }
    );
    println!("========================================");

    let client = BinanceClient::new(&config)?;

    let execution: Box<dyn ExecutionHandler> = if config.live_trading {
        Box::new(BinanceClient::new(&config)?)
    } else {
        let (_, quote_asset) = parse_symbol(&config.symbol);
        Box::new(PaperTrader::new(&quote_asset, config.initial_balance))
    };

    info!(symbol = %config.symbol, live = config.live_trading, "starting trade bot");

    let mut engine = TradingEngine::new(config, client, execution);
    if let Err(e) = engine.run().await {
        eprintln!("Fatal engine error: {e}");
        std::process::exit(1);
    }

    Ok(())
}
