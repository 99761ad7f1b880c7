//! RPC server: object registry, request dispatch and client notifications.
mod connection;
mod handler;
mod registry;

pub use handler::{MethodTable, RpcObject};

use crate::protocol::{codec, ErrorObject, MethodError, Params, RpcRequest, RpcResponse};
use crate::{lock_ignore_poison, RemoteErrorKind, Result, RpcError, ServerConfig};
use futures::FutureExt;
use registry::MethodRegistry;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{watch, OnceCell};
use tokio::task::JoinHandle;

/// Serves registered objects to RPC clients over TCP.
///
/// Every exposed method of an object registered as `name` is callable as
/// `"<name>.<method>"`. Failures inside a method (errors and panics alike)
/// come back to the caller as error responses and never tear down the
/// connection.
///
/// A handful of built-in methods is always available:
///
/// | Method               | Result                                        |
/// |----------------------|-----------------------------------------------|
/// | `rpc_getMethods`     | sorted list of callable `object.method` names |
/// | `rpc_register`       | registers `(address, port)` for notifications |
/// | `rpc_unregister`     | removes the registration for `address`        |
/// | `rpc_getHostname`    | host name of the server machine               |
/// | `rpc_uptime`         | seconds since the server was bound            |
/// | `rpc_getPort`        | listening TCP port                            |
/// | `rpc_getConnections` | number of open client connections             |
/// | `rpc_isRunning`      | whether the server is still accepting calls   |
///
/// # Example
///
/// ```no_run
/// use labwire::{MethodError, MethodTable, Params, RpcServer, ServerConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> labwire::Result<()> {
/// let server = RpcServer::bind(ServerConfig::default().with_port(6780)).await?;
///
/// let psu = MethodTable::new().method("voltage", |_: Params| async {
///     Ok::<_, MethodError>(12.0)
/// });
/// server.register_object("psu", Arc::new(psu)).await?;
///
/// let handle = server.spawn()?;
/// # handle.await.ok();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    local_addr: SocketAddr,
    hostname: String,
    started: Instant,

    registry: MethodRegistry,

    // Notification listeners: one UDP port per client address
    listeners: Mutex<HashMap<IpAddr, u16>>,
    notify_socket: OnceCell<UdpSocket>,

    listener: Mutex<Option<TcpListener>>,
    connections: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl RpcServer {
    // ---

    /// Bind the listening socket.
    ///
    /// The server accepts no connections until [`spawn`](Self::spawn) is called.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::PortInUse`] if the port is taken, or the
    /// underlying I/O error.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        // ---
        let listener = TcpListener::bind((config.bind_address, config.port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => RpcError::PortInUse(config.port),
                _ => RpcError::Io(e),
            })?;
        let local_addr = listener.local_addr()?;

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        crate::log_info!("{}: listening on {}", config.name, local_addr);

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                local_addr,
                hostname,
                started: Instant::now(),
                registry: MethodRegistry::default(),
                listeners: Mutex::new(HashMap::new()),
                notify_socket: OnceCell::new(),
                listener: Mutex::new(Some(listener)),
                connections: AtomicUsize::new(0),
                shutdown_tx,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.inner.config.max_frame_size
    }

    /// Number of currently open client connections.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    fn connection_opened(&self) {
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_closed(&self) {
        self.inner.connections.fetch_sub(1, Ordering::SeqCst);
    }

    /// Expose `object` under `name`, replacing any object of the same name.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidParams`] for names that are empty, contain
    /// a `.` or start with `_`.
    pub async fn register_object(&self, name: &str, object: Arc<dyn RpcObject>) -> Result<()> {
        self.inner.registry.register(name, object).await
    }

    /// Stop exposing the object registered as `name`.
    ///
    /// Calls already running on it complete. Returns whether it was registered.
    pub async fn unregister_object(&self, name: &str) -> bool {
        self.inner.registry.unregister(name).await
    }

    /// Flattened list of callable methods, as returned by `rpc_getMethods`.
    pub async fn methods(&self) -> Vec<String> {
        self.inner.registry.method_names().await
    }

    /// Addresses registered for notifications.
    pub fn listeners(&self) -> Vec<SocketAddr> {
        lock_ignore_poison(&self.inner.listeners)
            .iter()
            .map(|(ip, port)| SocketAddr::new(*ip, *port))
            .collect()
    }

    /// Run one request. Returns `None` for notifications.
    pub async fn handle_request(&self, request: RpcRequest) -> Option<RpcResponse> {
        // ---
        let outcome = self.dispatch(request.method(), request.params().clone()).await;

        match request.id() {
            Some(id) => Some(match outcome {
                Ok(value) => RpcResponse::result(id, value),
                Err(error) => RpcResponse::error(Some(id), error),
            }),
            None => {
                if let Err(error) = outcome {
                    crate::log_debug!(
                        "{}: notification {} failed: {}",
                        self.name(),
                        request.method(),
                        error.message
                    );
                }
                None
            }
        }
    }

    async fn dispatch(&self, method: &str, params: Params) -> std::result::Result<Value, ErrorObject> {
        // ---
        if let Some(result) = self.builtin(method, &params).await {
            return result.map_err(|e| e.to_error_object());
        }

        let Some((object, member)) = self.inner.registry.resolve(method).await else {
            crate::log_warn!("{}: method not found: {}", self.name(), method);
            return Err(ErrorObject::method_not_found(method));
        };

        match AssertUnwindSafe(object.invoke(&member, params))
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => {
                crate::log_debug!("{}: {} failed: {}", self.name(), method, error);
                Err(error.to_error_object())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                crate::log_error!("{}: {} panicked: {}", self.name(), method, message);
                Err(MethodError::new(RemoteErrorKind::Panic, message).to_error_object())
            }
        }
    }

    async fn builtin(
        &self,
        method: &str,
        params: &Params,
    ) -> Option<std::result::Result<Value, MethodError>> {
        // ---
        let result = match method {
            "rpc_getMethods" => Ok(json!(self.methods().await)),
            "rpc_register" => self.rpc_register(params),
            "rpc_unregister" => self.rpc_unregister(params),
            "rpc_getHostname" => Ok(json!(self.inner.hostname)),
            "rpc_uptime" => Ok(json!(self.inner.started.elapsed().as_secs_f64())),
            "rpc_getPort" => Ok(json!(self.port())),
            "rpc_getConnections" => Ok(json!(self.connection_count())),
            "rpc_isRunning" => Ok(json!(self.is_running())),
            _ => return None,
        };
        Some(result)
    }

    fn rpc_register(&self, params: &Params) -> std::result::Result<Value, MethodError> {
        // ---
        let address: String = params.get(0, "address")?;
        let port: u16 = params.get(1, "port")?;
        let ip: IpAddr = address
            .parse()
            .map_err(|_| MethodError::invalid_argument(format!("bad address `{address}`")))?;

        lock_ignore_poison(&self.inner.listeners).insert(ip, port);
        crate::log_info!("{}: notifications registered for {}:{}", self.name(), ip, port);
        Ok(Value::Null)
    }

    fn rpc_unregister(&self, params: &Params) -> std::result::Result<Value, MethodError> {
        // ---
        let address: String = params.get(0, "address")?;
        let ip: IpAddr = address
            .parse()
            .map_err(|_| MethodError::invalid_argument(format!("bad address `{address}`")))?;

        let removed = lock_ignore_poison(&self.inner.listeners).remove(&ip).is_some();
        if removed {
            crate::log_info!("{}: notifications unregistered for {}", self.name(), ip);
        }
        Ok(Value::Bool(removed))
    }

    /// Push `event` to every registered notification listener.
    ///
    /// Delivery is a single UDP datagram per listener with no acknowledgment.
    /// Returns the number of listeners the datagram was handed off to.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be encoded or the sending socket
    /// cannot be bound. Per-listener send failures are only logged.
    pub async fn notify_clients(&self, event: &str, params: Params) -> Result<usize> {
        // ---
        let targets = self.listeners();
        if targets.is_empty() {
            return Ok(0);
        }

        let payload = codec::encode(&[RpcRequest::notification(event, params)], &[])?;
        let socket = self
            .inner
            .notify_socket
            .get_or_try_init(|| UdpSocket::bind((IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)))
            .await?;

        let mut delivered = 0;
        for target in targets {
            match socket.send_to(&payload, target).await {
                Ok(_) => delivered += 1,
                Err(e) => crate::log_warn!("{}: notify {} failed: {}", self.name(), target, e),
            }
        }
        Ok(delivered)
    }

    /// Start accepting connections on a background task.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidState`] if the server was already spawned
    /// or shut down.
    pub fn spawn(&self) -> Result<JoinHandle<()>> {
        // ---
        let listener = lock_ignore_poison(&self.inner.listener)
            .take()
            .ok_or_else(|| RpcError::InvalidState("server already spawned".into()))?;

        let server = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        Ok(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let _ = stream.set_nodelay(true);
                            let shutdown = server.inner.shutdown_tx.subscribe();
                            tokio::spawn(connection::serve(server.clone(), stream, peer, shutdown));
                        }
                        Err(e) => {
                            crate::log_warn!("{}: accept failed: {}", server.name(), e);
                        }
                    },
                    _ = shutdown.changed() => {}
                }
            }
            crate::log_info!("{}: stopped", server.name());
        }))
    }

    /// `true` until [`shutdown`](Self::shutdown) is called.
    pub fn is_running(&self) -> bool {
        !*self.inner.shutdown_tx.borrow()
    }

    /// Stop accepting connections and close every open connection.
    ///
    /// Requests being dispatched when this is called are abandoned and their
    /// connections closed without a response, so waiting callers see
    /// [`RpcError::ConnectionLost`].
    pub fn shutdown(&self) {
        // ---
        self.inner.shutdown_tx.send_replace(true);
        lock_ignore_poison(&self.inner.listener).take();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    // ---
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "method panicked".to_string()
    }
}
