//! RPC client implementation.
//!
//! [`RpcClient`] holds one TCP connection to a server. Calls are serialized on
//! that connection: a call sends its request and waits for the matching
//! response before the next call may use the socket, so responses always
//! arrive in request order. Callers that need parallelism open several
//! clients.
//!
//! Request ids come from a per-client counter that starts at 1 and never
//! repeats. A response whose id does not match the outstanding call (a late
//! answer to an earlier, timed-out call) is skipped.
//!
//! When the connection is reset mid-call, the client reconnects and resends
//! the request according to [`RpcConfig::retry_config`]. Timeouts are never
//! retried.
mod notifications;
mod proxy;

pub use notifications::NotificationCallback;
pub use proxy::RemoteMethod;

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{self, Instant};

use crate::protocol::codec::{self, read_frame, write_frame};
use crate::protocol::{Params, RpcRequest};
use crate::retry::retry_with_backoff;
use crate::{lock_ignore_poison, log_debug, Result, RpcConfig, RpcError};

/// Connection to one RPC server.
///
/// Cheap to clone (internally `Arc`-backed); clones share the connection.
///
/// # Example
///
/// ```no_run
/// use labwire::{Params, RpcClient, RpcConfig};
///
/// # async fn example() -> labwire::Result<()> {
/// let client = RpcClient::connect(RpcConfig::new("10.0.0.2", 6780)).await?;
///
/// let volts: f64 = client.call_as("psu.voltage", Params::new()).await?;
/// client.notify("psu.reset", Params::new()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    config: RpcConfig,
    conn: tokio::sync::Mutex<Option<TcpStream>>,
    next_id: AtomicU64,

    methods: Mutex<BTreeSet<String>>,
    hostname: Mutex<Option<String>>,

    callbacks: notifications::CallbackMap,
    listener: Mutex<Option<notifications::Listener>>,
}

impl RpcClient {
    // ---

    /// Connect to the server named in `config` and fetch its method list.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ServerNotFound`] if the server refuses, resets or
    /// does not answer the connection attempt.
    pub async fn connect(config: RpcConfig) -> Result<Self> {
        // ---
        let stream = open_connection(&config).await?;

        let client = Self {
            inner: Arc::new(Inner {
                config,
                conn: tokio::sync::Mutex::new(Some(stream)),
                next_id: AtomicU64::new(1),
                methods: Mutex::new(BTreeSet::new()),
                hostname: Mutex::new(None),
                callbacks: Arc::new(Mutex::new(HashMap::new())),
                listener: Mutex::new(None),
            }),
        };

        let hostname: String = client.call_as("rpc_getHostname", Params::new()).await?;
        *lock_ignore_poison(&client.inner.hostname) = Some(hostname);

        client.refresh().await?;
        Ok(client)
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Host name the server reported at connect time.
    pub fn hostname(&self) -> Option<String> {
        lock_ignore_poison(&self.inner.hostname).clone()
    }

    /// Re-read the server's method list.
    ///
    /// Uses [`RpcConfig::refresh_timeout`] instead of the regular call timeout.
    pub async fn refresh(&self) -> Result<Vec<String>> {
        // ---
        let timeout = self.inner.config.refresh_timeout;
        let value = self.call_with_timeout("rpc_getMethods", Params::new(), timeout).await?;
        let names: Vec<String> = serde_json::from_value(value)?;

        *lock_ignore_poison(&self.inner.methods) = names.iter().cloned().collect();
        log_debug!("refreshed method list: {} methods", names.len());
        Ok(names)
    }

    /// Method names cached by the last [`refresh`](Self::refresh).
    pub fn methods(&self) -> Vec<String> {
        lock_ignore_poison(&self.inner.methods).iter().cloned().collect()
    }

    pub fn has_method(&self, method: &str) -> bool {
        lock_ignore_poison(&self.inner.methods).contains(method)
    }

    /// Call `method` and wait for its result.
    ///
    /// # Errors
    ///
    /// - [`RpcError::MethodNotFound`] if the server does not expose `method`
    /// - [`RpcError::ServerException`] if the method failed on the server
    /// - [`RpcError::InvalidParams`] if the server rejected the arguments
    /// - [`RpcError::Timeout`] if no response arrived within the request timeout
    /// - [`RpcError::ConnectionLost`] if the connection dropped and could not
    ///   be re-established within the retry policy
    pub async fn call(&self, method: &str, params: Params) -> Result<Value> {
        self.call_with_timeout(method, params, self.inner.config.request_timeout)
            .await
    }

    /// Call `method` and deserialize its result.
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, params: Params) -> Result<T> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Call with an explicit response timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Value> {
        // ---
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let payload = codec::encode(&[RpcRequest::new(id, method, params)], &[])?;

        retry_with_backoff(self.inner.config.retry_config.as_ref(), || {
            let inner = self.inner.clone();
            let payload = payload.clone();
            async move {
                let mut conn = inner.conn.lock().await;
                exchange(&inner.config, &mut conn, method, id, &payload, timeout).await
            }
        })
        .await
    }

    /// Send `method` without waiting for (or receiving) a result.
    pub async fn notify(&self, method: &str, params: Params) -> Result<()> {
        // ---
        let payload = codec::encode(&[RpcRequest::notification(method, params)], &[])?;

        retry_with_backoff(self.inner.config.retry_config.as_ref(), || {
            let inner = self.inner.clone();
            let payload = payload.clone();
            async move {
                let mut conn = inner.conn.lock().await;
                let stream = ensure_connected(&inner.config, &mut conn).await?;
                if let Err(e) = write_frame(stream, &payload).await {
                    log_debug!("notify write failed: {}", e);
                    *conn = None;
                    return Err(RpcError::ConnectionLost);
                }
                Ok(())
            }
        })
        .await
    }

    /// A handle for calling `method` (and methods nested under it).
    pub fn method(&self, method: impl Into<String>) -> RemoteMethod {
        RemoteMethod::new(self.clone(), method.into())
    }

    /// One handle per method in the cached method list.
    pub fn proxies(&self) -> Vec<RemoteMethod> {
        self.methods().into_iter().map(|m| self.method(m)).collect()
    }

    /// Local address of the connection to the server, reconnecting if needed.
    async fn local_addr(&self) -> Result<SocketAddr> {
        let mut conn = self.inner.conn.lock().await;
        let stream = ensure_connected(&self.inner.config, &mut conn).await?;
        Ok(stream.local_addr()?)
    }

    /// Close the connection. The next call reconnects.
    pub async fn disconnect(&self) {
        self.inner.conn.lock().await.take();
    }
}

async fn open_connection(config: &RpcConfig) -> Result<TcpStream> {
    // ---
    let target = format!("{}:{}", config.address, config.port);

    let stream = match time::timeout(
        config.connect_timeout,
        TcpStream::connect((config.address.as_str(), config.port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(RpcError::ServerNotFound(format!("{target}: {e}"))),
        Err(_) => return Err(RpcError::ServerNotFound(format!("{target}: connect timed out"))),
    };
    stream.set_nodelay(true)?;

    let mut stream = stream;
    let hello = codec::encode_hello(&config.user_agent)?;
    write_frame(&mut stream, &hello)
        .await
        .map_err(|e| RpcError::ServerNotFound(format!("{target}: {e}")))?;

    log_debug!("connected to {}", target);
    Ok(stream)
}

async fn ensure_connected<'a>(
    config: &RpcConfig,
    conn: &'a mut Option<TcpStream>,
) -> Result<&'a mut TcpStream> {
    // ---
    if conn.is_none() {
        *conn = Some(open_connection(config).await?);
    }
    conn.as_mut().ok_or(RpcError::ConnectionLost)
}

/// Send one request and wait for its response on an exclusively held connection.
async fn exchange(
    config: &RpcConfig,
    conn: &mut Option<TcpStream>,
    method: &str,
    id: u64,
    payload: &Bytes,
    timeout: Duration,
) -> Result<Value> {
    // ---
    let stream = ensure_connected(config, conn).await?;

    if let Err(e) = write_frame(stream, payload).await {
        log_debug!("write of request {} failed: {}", id, e);
        *conn = None;
        return Err(RpcError::ConnectionLost);
    }

    let deadline = Instant::now() + timeout;

    loop {
        let frame = match time::timeout_at(deadline, read_frame(stream, config.max_frame_size)).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) | Ok(Err(RpcError::Io(_))) => {
                *conn = None;
                return Err(RpcError::ConnectionLost);
            }
            Ok(Err(e)) => {
                *conn = None;
                return Err(e);
            }
            Err(_) => {
                // A partially read frame would desynchronize the stream
                *conn = None;
                return Err(RpcError::Timeout);
            }
        };

        let batch = codec::decode(&frame);
        for err in batch.errors {
            crate::log_warn!("undecodable response: {}", err.reason);
        }

        for response in batch.responses {
            match response.id {
                Some(rid) if rid == id => {
                    return response.outcome.map_err(|e| e.into_rpc_error(method));
                }
                // The server could not read our request
                None => {
                    if let Err(e) = response.outcome {
                        return Err(e.into_rpc_error(method));
                    }
                }
                Some(rid) => log_debug!("skipping stale response {} (waiting for {})", rid, id),
            }
        }
    }
}
