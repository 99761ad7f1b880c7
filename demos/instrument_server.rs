//! Instrument RPC server example.
//!
//! Exposes a simulated bench power supply as `psu.*` and pushes a
//! `handle_event` notification to registered clients whenever its output
//! changes.
//!
//! Run with: cargo run --example instrument_server
//!
//! Then in another terminal: cargo run --example instrument_client
use async_trait::async_trait;
use labwire::{MethodError, Params, RpcObject, RpcServer, ServerConfig};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const PORT: u16 = 6780;

struct PowerSupply {
    // ---
    state: Mutex<Output>,
    changes: mpsc::UnboundedSender<Output>,
}

#[derive(Debug, Clone, Copy)]
struct Output {
    voltage: f64,
    enabled: bool,
}

impl PowerSupply {
    // ---
    fn update(&self, f: impl FnOnce(&mut Output)) -> Output {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut state);
        let _ = self.changes.send(*state);
        *state
    }
}

#[async_trait]
impl RpcObject for PowerSupply {
    // ---
    fn methods(&self) -> Vec<String> {
        ["identify", "get_voltage", "set_voltage", "enable", "disable"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    async fn invoke(&self, method: &str, params: Params) -> Result<Value, MethodError> {
        // ---
        match method {
            "identify" => Ok(json!("Acme PSU-30, simulated")),
            "get_voltage" => {
                let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                Ok(json!(state.voltage))
            }
            "set_voltage" => {
                let volts: f64 = params.get(0, "volts")?;
                if !(0.0..=30.0).contains(&volts) {
                    return Err(MethodError::invalid_argument(format!(
                        "{volts} V is outside 0-30 V"
                    )));
                }
                let out = self.update(|s| s.voltage = volts);
                Ok(json!(out.voltage))
            }
            "enable" => Ok(json!(self.update(|s| s.enabled = true).enabled)),
            "disable" => Ok(json!(self.update(|s| s.enabled = false).enabled)),
            other => Err(MethodError::unsupported(other)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_ansi(false)
        .init();

    let server = RpcServer::bind(ServerConfig::default().with_port(PORT).with_name("psu-server")).await?;

    let (changes_tx, mut changes_rx) = mpsc::unbounded_channel();
    let psu = PowerSupply {
        state: Mutex::new(Output {
            voltage: 0.0,
            enabled: false,
        }),
        changes: changes_tx,
    };
    server.register_object("psu", Arc::new(psu)).await?;

    // Forward every output change to clients that asked for notifications
    let notifier = server.clone();
    tokio::spawn(async move {
        while let Some(out) = changes_rx.recv().await {
            let params = Params::new()
                .arg("output_changed")
                .kwarg("voltage", out.voltage)
                .kwarg("enabled", out.enabled);
            match notifier.notify_clients("handle_event", params).await {
                Ok(n) => println!("notified {n} client(s)"),
                Err(e) => eprintln!("notify failed: {e}"),
            }
        }
    });

    let handle = server.spawn()?;
    println!("psu-server listening on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    println!("Received Ctrl+C, shutting down...");
    server.shutdown();
    handle.await?;

    Ok(())
}
