//! Device-link discovery example.
//!
//! Broadcasts a discovery probe on the link port, lists every device that
//! answers and reads one register from each.
//!
//! Run with: cargo run --example link_discovery
//!
//! Set LINK_PORT to listen on a port other than 7968 (the well-known port
//! may need elevated rights or be taken by another arbiter).
use labwire::{packet_type, Arbiter, ArbiterConfig, DEFAULT_LINK_PORT};
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_ansi(false)
        .init();

    let port = std::env::var("LINK_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_LINK_PORT);

    let arbiter = Arbiter::start(ArbiterConfig::default().with_port(port)).await?;
    println!("arbiter listening on {}", arbiter.local_addr());

    let devices = arbiter.discover(Duration::from_secs(2)).await?;
    println!("found {} device(s)", devices.len());

    for (address, device) in devices.iter() {
        println!(
            "  {address}: {} {} {:?}",
            device.identity.vendor, device.identity.model, device.identity.extra
        );

        let target = SocketAddr::new(*address, DEFAULT_LINK_PORT);
        let reply = arbiter
            .request(target, packet_type::REGISTER_READ, vec![0x00, 0x00], Duration::from_millis(500))?
            .await;

        match reply {
            Ok(packet) => println!("    register 0x0000 = {:02x?}", &packet.body[..]),
            Err(e) => println!("    register read failed: {e}"),
        }
    }

    arbiter.stop().await;
    Ok(())
}
