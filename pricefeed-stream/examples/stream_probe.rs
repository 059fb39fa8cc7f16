//! Probe a securities stream server.
//!
//! Run with: cargo run -p pricefeed-stream --example stream_probe -- <token> AAPL MSFT
//! Uses `PRICEFEED_WS_URL` when set.

use std::sync::Arc;
use std::time::{Duration, Instant};

use pricefeed_core::PriceUpdate;
use pricefeed_stream::{LifecycleEvent, StreamClient, StreamConfig, WsConnector};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let token = args.next().unwrap_or_else(|| "1".to_string());
    let tickers: Vec<String> = args.collect();

    let config = StreamConfig::from_env()?;
    println!("Testing stream connection to {}", config.endpoint);

    let client = StreamClient::spawn(config, Arc::new(WsConnector));
    let started = Instant::now();

    client.add_global_handler(Arc::new(move |update: &PriceUpdate| -> anyhow::Result<()> {
        println!(
            "  {:>5.1}s {} = {}",
            started.elapsed().as_secs_f64(),
            update.ticker,
            update.price
        );
        Ok(())
    }));

    let mut lifecycle = client.lifecycle();
    tokio::spawn(async move {
        while let Ok(event) = lifecycle.recv().await {
            match event {
                LifecycleEvent::StateChanged(state) => println!("  [STATE] {:?}", state),
                LifecycleEvent::ReconnectScheduled { attempt, delay } => {
                    println!("  [RETRY] attempt {} in {:?}", attempt, delay)
                }
                LifecycleEvent::RetriesExhausted { attempts } => {
                    println!("  [GAVE UP] after {} attempts", attempts)
                }
            }
        }
    });

    println!("\n1. Connecting...");
    client.connect(token).await?;
    println!("✓ Connected in {:?}", started.elapsed());

    println!("\n2. Subscribing to {:?}", tickers);
    let outcome = client.reconcile(tickers).await?;
    println!("✓ Subscribed {:?}", outcome.subscribed);

    println!("\n3. Waiting for prices (60 seconds)...");
    tokio::time::sleep(Duration::from_secs(60)).await;

    client.disconnect().await;
    println!("\nDone");
    Ok(())
}
