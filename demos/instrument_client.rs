//! Instrument RPC client example.
//!
//! Connects to `instrument_server`, lists its methods, drives the simulated
//! power supply and prints the notifications the server pushes back.
//!
//! Run with: cargo run --example instrument_client
//!
//! Requires: instrument_server running (SERVER_ADDR defaults to 127.0.0.1)
use labwire::{Params, RetryConfig, RpcClient, RpcConfig, RpcError};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_ansi(false)
        .with_line_number(true)
        .init();

    let address = std::env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());

    let config = RpcConfig::new(address, 6780)
        .with_request_timeout(Duration::from_secs(2))
        .with_retry(Some(RetryConfig::single_reconnect()));

    let client = RpcClient::connect(config).await?;
    println!("connected to {}", client.hostname().unwrap_or_default());

    for method in client.proxies() {
        println!("  {}", method.name());
    }

    client.register_callback("handle_event", |params: &Params| {
        println!("event: {:?} {:?}", params.args(), params.kwargs());
    });
    client.enable_notifications().await?;

    let psu = client.method("psu");
    let id: String = psu.attr("identify").call_as(Params::new()).await?;
    println!("instrument: {id}");

    psu.attr("set_voltage").call(Params::new().arg(12.0)).await?;
    psu.attr("enable").call(Params::new()).await?;

    match psu.attr("set_voltage").call(Params::new().arg(48.0)).await {
        Err(RpcError::ServerException { kind, message }) => {
            println!("rejected as expected ({kind}): {message}");
        }
        other => println!("unexpected: {other:?}"),
    }

    let volts: f64 = psu.attr("get_voltage").call_as(Params::new()).await?;
    println!("output: {volts} V");

    // Give the last notifications time to arrive
    tokio::time::sleep(Duration::from_millis(200)).await;
    client.disable_notifications().await?;

    Ok(())
}
