//! Device-link arbiter.
//!
//! One [`Arbiter`] owns one UDP socket and multiplexes any number of
//! request/response exchanges over it. Each request that expects an answer
//! gets a correlation id from a bounded pool; the matching response, or a
//! timeout once the request's TTL has passed, is delivered to the caller
//! exactly once and the id goes back to the pool.
//!
//! The service loop is a single task that waits on three sources at once:
//! inbound datagrams, the outbound queue and a sweep timer for expired
//! entries. Public methods only touch the queue and the shared registry, so
//! they are safe to call from any task while the loop runs.
mod discovery;

pub use discovery::{DeviceIdentity, DiscoveredDevice, DiscoveryResult};

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::correlation::{CorrelationId, CorrelationRegistry};
use crate::protocol::{packet_type, LinkPacket};
use crate::{lock_ignore_poison, log_debug, ArbiterConfig, Result, RpcError};

/// Where the response (or failure) for one request is delivered.
pub type ResponseSink = oneshot::Sender<Result<LinkPacket>>;

/// Lifecycle of an [`Arbiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterState {
    Init,
    Running,
    Stopping,
    Stopped,
}

/// A packet waiting to be sent.
///
/// Without a sink the packet is a notification: it goes out with id 0 and
/// nothing is tracked for it.
#[derive(Debug)]
pub struct OutboundMessage {
    pub destination: SocketAddr,
    pub packet_type: u8,
    pub body: Bytes,
    pub ttl: Duration,
    pub sink: Option<ResponseSink>,
}

impl OutboundMessage {
    // ---

    pub fn request(
        destination: SocketAddr,
        packet_type: u8,
        body: impl Into<Bytes>,
        ttl: Duration,
        sink: ResponseSink,
    ) -> Self {
        Self {
            destination,
            packet_type,
            body: body.into(),
            ttl,
            sink: Some(sink),
        }
    }

    pub fn notification(destination: SocketAddr, packet_type: u8, body: impl Into<Bytes>) -> Self {
        Self {
            destination,
            packet_type,
            body: body.into(),
            ttl: Duration::ZERO,
            sink: None,
        }
    }
}

/// Response to a request queued with [`Arbiter::request`].
///
/// Resolves to the device's packet, [`RpcError::DeviceError`] if the device
/// answered with an error packet, [`RpcError::Timeout`] once the TTL has
/// passed, or [`RpcError::Shutdown`] if the arbiter stopped first.
#[derive(Debug)]
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<Result<LinkPacket>>,
}

impl PendingReply {
    /// Correlation id the request went out with.
    pub fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<LinkPacket>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RpcError::Shutdown)))
    }
}

/// A datagram ready for the wire.
struct Frame {
    destination: SocketAddr,
    id: CorrelationId,
    bytes: Bytes,
}

/// Periodic discovery driven by the service loop.
struct AutoDiscovery {
    interval: Duration,
    target: SocketAddr,
    probe: Bytes,
}

/// State shared between the public handle and the service loop.
#[derive(Default)]
struct Shared {
    registry: Mutex<CorrelationRegistry<ResponseSink>>,
    devices: Mutex<DiscoveryResult>,
}

/// Owner of the device-link socket.
///
/// Cheap to clone (internally `Arc`-backed).
///
/// # Example
///
/// ```no_run
/// use labwire::{packet_type, Arbiter, ArbiterConfig};
/// use std::time::Duration;
///
/// # async fn example() -> labwire::Result<()> {
/// let arbiter = Arbiter::start(ArbiterConfig::default()).await?;
///
/// let devices = arbiter.discover(Duration::from_secs(1)).await?;
/// for (address, device) in devices.iter() {
///     let reply = arbiter
///         .request(
///             (*address, 7968).into(),
///             packet_type::REGISTER_READ,
///             vec![0x00, 0x10],
///             Duration::from_millis(500),
///         )?
///         .await?;
///     println!("{} {}: {:?}", device.identity.vendor, device.identity.model, reply.body);
/// }
///
/// arbiter.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Arbiter {
    inner: Arc<Inner>,
}

struct Inner {
    config: ArbiterConfig,
    local_addr: SocketAddr,
    shared: Arc<Shared>,

    socket: Mutex<Option<Arc<UdpSocket>>>,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    state_tx: watch::Sender<ArbiterState>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Arbiter {
    // ---

    /// Bind the link socket and start the service loop.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::PortInUse`] if another process owns the port, or
    /// the underlying I/O error.
    pub async fn start(config: ArbiterConfig) -> Result<Self> {
        // ---
        let (state_tx, _) = watch::channel(ArbiterState::Init);

        let socket = UdpSocket::bind((config.bind_address, config.port))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => RpcError::PortInUse(config.port),
                _ => RpcError::Io(e),
            })?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;

        let auto_discovery = match config.discovery_interval {
            Some(interval) => {
                socket.set_broadcast(true)?;
                Some(AutoDiscovery {
                    interval,
                    target: SocketAddr::new(config.broadcast_address, config.device_port),
                    probe: LinkPacket::discovery_request().encode()?,
                })
            }
            None => None,
        };

        let shared = Arc::new(Shared::default());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(service_loop(
            socket.clone(),
            shared.clone(),
            outbound_rx,
            shutdown_rx,
            config.sweep_interval,
            config.max_datagram,
            auto_discovery,
        ));

        state_tx.send_replace(ArbiterState::Running);
        crate::log_info!("arbiter running on {}", local_addr);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                local_addr,
                shared,
                socket: Mutex::new(Some(socket)),
                outbound_tx,
                state_tx,
                shutdown_tx,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn state(&self) -> ArbiterState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ArbiterState> {
        self.inner.state_tx.subscribe()
    }

    /// Queue a packet for sending and return the id it goes out with.
    ///
    /// Requests (messages with a sink) are assigned a free correlation id
    /// immediately; notifications use id 0.
    ///
    /// # Errors
    ///
    /// - [`RpcError::IdPoolExhausted`] if every id is in flight; the message
    ///   is not queued
    /// - [`RpcError::InvalidPacket`] if the body is too large for one frame
    /// - [`RpcError::InvalidState`] if the TTL reaches past what the clock
    ///   can represent
    /// - [`RpcError::Shutdown`] if the arbiter is not running
    pub fn queue_message(&self, message: OutboundMessage) -> Result<CorrelationId> {
        // ---
        if self.state() != ArbiterState::Running {
            return Err(RpcError::Shutdown);
        }

        let OutboundMessage {
            destination,
            packet_type,
            body,
            ttl,
            sink,
        } = message;

        let id = match sink {
            Some(sink) => {
                let deadline = Instant::now()
                    .checked_add(ttl)
                    .ok_or_else(|| RpcError::InvalidState(format!("ttl {ttl:?} out of range")))?;
                // Size check first so an oversized body never holds an id
                LinkPacket::request(packet_type, CorrelationId::new(1), body.clone()).encode()?;
                lock_ignore_poison(&self.inner.shared.registry).allocate(deadline, sink)?
            }
            None => CorrelationId::NOTIFICATION,
        };

        let bytes = LinkPacket::request(packet_type, id, body).encode()?;

        if self
            .inner
            .outbound_tx
            .send(Frame {
                destination,
                id,
                bytes,
            })
            .is_err()
        {
            lock_ignore_poison(&self.inner.shared.registry).claim(id);
            return Err(RpcError::Shutdown);
        }

        Ok(id)
    }

    /// Send a request and get a handle to await its response.
    pub fn request(
        &self,
        destination: SocketAddr,
        packet_type: u8,
        body: impl Into<Bytes>,
        ttl: Duration,
    ) -> Result<PendingReply> {
        // ---
        let (tx, rx) = oneshot::channel();
        let id = self.queue_message(OutboundMessage::request(destination, packet_type, body, ttl, tx))?;
        Ok(PendingReply { id, rx })
    }

    /// Send a packet that expects no response.
    pub fn notify(&self, destination: SocketAddr, packet_type: u8, body: impl Into<Bytes>) -> Result<()> {
        self.queue_message(OutboundMessage::notification(destination, packet_type, body))
            .map(|_| ())
    }

    /// Number of requests awaiting a response or timeout.
    pub fn pending_count(&self) -> usize {
        lock_ignore_poison(&self.inner.shared.registry).len()
    }

    /// Whether `id` is free to be issued.
    pub fn is_id_available(&self, id: CorrelationId) -> bool {
        lock_ignore_poison(&self.inner.shared.registry).is_available(id)
    }

    /// Broadcast a discovery probe and collect answers for `window`.
    ///
    /// Returns every device known to this arbiter, including devices found
    /// by earlier scans that did not answer this time.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Shutdown`] if the arbiter is not running, or the
    /// I/O error from enabling broadcast on the socket.
    pub async fn discover(&self, window: Duration) -> Result<DiscoveryResult> {
        // ---
        let socket = lock_ignore_poison(&self.inner.socket)
            .clone()
            .ok_or(RpcError::Shutdown)?;
        socket.set_broadcast(true)?;
        drop(socket);

        self.send_probe(self.inner.config.broadcast_address)?;
        time::sleep(window).await;
        Ok(self.devices())
    }

    /// Probe a single address and wait up to `window` for it to answer.
    ///
    /// Returns the device if it answered this probe. An earlier entry for the
    /// address that was not refreshed within the window yields `None`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Shutdown`] if the arbiter is not running.
    pub async fn discover_at(&self, address: IpAddr, window: Duration) -> Result<Option<DiscoveredDevice>> {
        // ---
        let sent = Instant::now();
        self.send_probe(address)?;

        let deadline = time::Instant::now() + window;
        loop {
            let answered = lock_ignore_poison(&self.inner.shared.devices)
                .get(&address)
                .filter(|d| d.last_seen >= sent)
                .cloned();
            if answered.is_some() {
                return Ok(answered);
            }
            if time::Instant::now() >= deadline {
                return Ok(None);
            }
            time::sleep(self.inner.config.sweep_interval.min(window)).await;
        }
    }

    fn send_probe(&self, address: IpAddr) -> Result<()> {
        // ---
        let target = SocketAddr::new(address, self.inner.config.device_port);
        let probe = LinkPacket::discovery_request();
        self.notify(target, probe.packet_type, probe.body)?;
        log_debug!("discovery probe sent to {}", target);
        Ok(())
    }

    /// Snapshot of every device discovered so far.
    pub fn devices(&self) -> DiscoveryResult {
        lock_ignore_poison(&self.inner.shared.devices).clone()
    }

    /// Forget devices that have not answered a probe within `age`.
    ///
    /// Returns the addresses removed.
    pub fn prune_devices(&self, age: Duration) -> Vec<IpAddr> {
        let pruned = lock_ignore_poison(&self.inner.shared.devices).prune_older_than(age);
        if !pruned.is_empty() {
            log_debug!("pruned {} stale device(s)", pruned.len());
        }
        pruned
    }

    /// Forget every discovered device.
    pub fn clear_devices(&self) {
        lock_ignore_poison(&self.inner.shared.devices).clear();
    }

    /// Stop the service loop, close the socket and fail every pending request
    /// with [`RpcError::Shutdown`].
    ///
    /// Waits at most one poll interval for the loop to exit.
    pub async fn stop(&self) {
        // ---
        let running = self.inner.state_tx.send_if_modified(|state| {
            if *state == ArbiterState::Running {
                *state = ArbiterState::Stopping;
                true
            } else {
                false
            }
        });
        if !running {
            return;
        }

        self.inner.shutdown_tx.send_replace(true);

        let task = lock_ignore_poison(&self.inner.task).take();
        if let Some(mut task) = task {
            if time::timeout(self.inner.config.poll_interval, &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        lock_ignore_poison(&self.inner.socket).take();

        let pending = lock_ignore_poison(&self.inner.shared.registry).drain();
        for entry in pending {
            let _ = entry.sink.send(Err(RpcError::Shutdown));
        }

        self.inner.state_tx.send_replace(ArbiterState::Stopped);
        crate::log_info!("arbiter on {} stopped", self.inner.local_addr);
    }
}

impl Shared {
    // ---

    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        // ---
        let packet = match LinkPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                log_debug!("dropping datagram from {}: {}", from, e);
                return;
            }
        };

        if packet.is_discovery_response() {
            match DeviceIdentity::parse(&packet.body) {
                Some(identity) => {
                    log_debug!("discovered {} {} at {}", identity.vendor, identity.model, from);
                    lock_ignore_poison(&self.devices).record(from.ip(), identity, Instant::now());
                }
                None => log_debug!("malformed discovery response from {}", from),
            }
            return;
        }

        if packet.id.is_notification() {
            log_debug!(
                "unsolicited packet type {:#04x} from {}",
                packet.packet_type,
                from
            );
            return;
        }

        let entry = lock_ignore_poison(&self.registry).claim(packet.id);
        match entry {
            Some(entry) if packet.packet_type == packet_type::ERROR => {
                log_debug!("device {} reported an error for id {}", from, packet.id);
                let _ = entry.sink.send(Err(RpcError::DeviceError(packet)));
            }
            Some(entry) => {
                let _ = entry.sink.send(Ok(packet));
            }
            None => log_debug!("no pending request for id {} from {}", packet.id, from),
        }
    }

    fn sweep(&self, now: Instant) {
        // ---
        let expired = lock_ignore_poison(&self.registry).claim_expired(now);
        for entry in expired {
            log_debug!("request {} timed out", entry.id);
            let _ = entry.sink.send(Err(RpcError::Timeout));
        }
    }

    fn fail(&self, id: CorrelationId, error: RpcError) {
        let entry = lock_ignore_poison(&self.registry).claim(id);
        if let Some(entry) = entry {
            let _ = entry.sink.send(Err(error));
        }
    }
}

async fn service_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    mut shutdown_rx: watch::Receiver<bool>,
    sweep_interval: Duration,
    max_datagram: usize,
    auto_discovery: Option<AutoDiscovery>,
) {
    // ---
    let mut sweep = time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut buf = vec![0u8; max_datagram];

    let mut rediscover = auto_discovery.map(|auto| {
        let mut interval = time::interval(auto.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (interval, auto)
    });

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => shared.handle_datagram(&buf[..len], from),
                Err(e) => log_debug!("link receive failed: {}", e),
            },

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = socket.send_to(&frame.bytes, frame.destination).await {
                    crate::log_warn!("send to {} failed: {}", frame.destination, e);
                    shared.fail(frame.id, RpcError::Io(e));
                }
            },

            _ = sweep.tick() => shared.sweep(Instant::now()),

            Some(auto) = next_discovery(&mut rediscover) => {
                if let Err(e) = socket.send_to(&auto.probe, auto.target).await {
                    crate::log_warn!("discovery probe to {} failed: {}", auto.target, e);
                }
            },
        }
    }

    log_debug!("arbiter service loop exited");
}

/// Resolves when the next periodic probe is due; never resolves when periodic
/// discovery is off.
async fn next_discovery(
    rediscover: &mut Option<(time::Interval, AutoDiscovery)>,
) -> Option<&AutoDiscovery> {
    // ---
    match rediscover {
        Some((interval, auto)) => {
            interval.tick().await;
            Some(&*auto)
        }
        None => std::future::pending().await,
    }
}
