//! Server-pushed notifications.
//!
//! The client binds a UDP socket on the interface it uses to reach the
//! server, registers `(address, port)` through `rpc_register`, and runs a
//! background task that hands every received event to the callback
//! registered under the event name. Events without a callback are dropped.

use super::{Inner, RpcClient};
use crate::protocol::{codec, Params};
use crate::{lock_ignore_poison, log_debug, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Handler for one notification event; receives the event's arguments.
pub type NotificationCallback = Arc<dyn Fn(&Params) + Send + Sync>;

pub(super) type CallbackMap = Arc<Mutex<HashMap<String, NotificationCallback>>>;

const MAX_DATAGRAM: usize = 64 * 1024;

pub(super) struct Listener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl RpcClient {
    // ---

    /// Start receiving notifications from the server.
    ///
    /// Returns the local address the server pushes to. Calling this again
    /// while enabled returns the existing address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or `rpc_register` fails.
    pub async fn enable_notifications(&self) -> Result<SocketAddr> {
        // ---
        if let Some(listener) = lock_ignore_poison(&self.inner.listener).as_ref() {
            return Ok(listener.addr);
        }

        let local = self.local_addr().await?;
        let socket = UdpSocket::bind((local.ip(), 0)).await?;
        let addr = socket.local_addr()?;

        self.call(
            "rpc_register",
            Params::new().arg(addr.ip().to_string()).arg(addr.port()),
        )
        .await?;

        let task = tokio::spawn(poll_events(socket, self.inner.callbacks.clone()));
        let previous = lock_ignore_poison(&self.inner.listener).replace(Listener { addr, task });
        if let Some(previous) = previous {
            previous.task.abort();
        }

        log_debug!("notifications enabled on {}", addr);
        Ok(addr)
    }

    /// Stop receiving notifications and unregister from the server.
    pub async fn disable_notifications(&self) -> Result<()> {
        // ---
        let Some(listener) = lock_ignore_poison(&self.inner.listener).take() else {
            return Ok(());
        };
        listener.task.abort();

        self.call(
            "rpc_unregister",
            Params::new().arg(listener.addr.ip().to_string()),
        )
        .await?;

        log_debug!("notifications disabled on {}", listener.addr);
        Ok(())
    }

    pub fn notifications_enabled(&self) -> bool {
        lock_ignore_poison(&self.inner.listener).is_some()
    }

    /// Run `callback` for every notification named `event`.
    ///
    /// Replaces any callback already registered for `event`.
    pub fn register_callback<F>(&self, event: &str, callback: F)
    where
        F: Fn(&Params) + Send + Sync + 'static,
    {
        lock_ignore_poison(&self.inner.callbacks).insert(event.to_string(), Arc::new(callback));
    }

    pub fn unregister_callback(&self, event: &str) -> bool {
        lock_ignore_poison(&self.inner.callbacks).remove(event).is_some()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(listener) = lock_ignore_poison(&self.listener).take() {
            listener.task.abort();
        }
    }
}

/// Pause after a failed receive; doubles per consecutive failure and gives
/// up after `MAX_FAILURES` in a row.
struct ReceiveBackoff {
    failures: u32,
}

impl ReceiveBackoff {
    // ---
    const INITIAL: Duration = Duration::from_millis(10);
    const MAX_DELAY: Duration = Duration::from_secs(1);
    const MAX_FAILURES: u32 = 10;

    fn new() -> Self {
        Self { failures: 0 }
    }

    /// Delay before the next receive, or `None` once the socket is given up on.
    fn failed(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures > Self::MAX_FAILURES {
            return None;
        }
        let delay = Self::INITIAL.saturating_mul(1 << (self.failures - 1).min(16));
        Some(delay.min(Self::MAX_DELAY))
    }

    fn succeeded(&mut self) {
        self.failures = 0;
    }
}

async fn poll_events(socket: UdpSocket, callbacks: CallbackMap) {
    // ---
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut backoff = ReceiveBackoff::new();

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => {
                backoff.succeeded();
                received
            }
            Err(e) => match backoff.failed() {
                Some(delay) => {
                    log_debug!("notification receive failed: {}", e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
                None => {
                    crate::log_error!("notification listener stopping: {}", e);
                    return;
                }
            },
        };

        let batch = codec::decode(&buf[..len]);
        for err in &batch.errors {
            crate::log_warn!("bad notification from {}: {}", from, err.reason);
        }

        for event in batch.requests {
            let callback = lock_ignore_poison(&callbacks).get(event.method()).cloned();
            let Some(callback) = callback else {
                log_debug!("no callback for event {}", event.method());
                continue;
            };

            let params = event.params();
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(params))).is_err() {
                crate::log_error!("callback for event {} panicked", event.method());
            }
        }
    }
}
