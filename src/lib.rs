//! Communication backbone for distributed laboratory instruments.
//!
//! Two subsystems live here:
//!
//! - an RPC runtime ([`RpcServer`], [`RpcClient`]) that exposes objects in one
//!   process to callers in another over length-framed JSON on TCP, with
//!   server-pushed notifications over UDP;
//! - a device-link [`Arbiter`] that owns a UDP socket, discovers devices by
//!   broadcast and multiplexes concurrent request/response exchanges over the
//!   socket using a bounded pool of correlation ids with TTL-based timeouts.
//!
//! Both are async and run on tokio.

mod macros;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod arbiter;
mod client;
mod correlation;
mod error;
pub mod protocol;
mod retry;
mod rpc_config;
mod server;

pub use arbiter::{
    // ---
    Arbiter,
    ArbiterState,
    DeviceIdentity,
    DiscoveredDevice,
    DiscoveryResult,
    OutboundMessage,
    PendingReply,
    ResponseSink,
};
pub use client::{NotificationCallback, RemoteMethod, RpcClient};
pub use correlation::{CorrelationEntry, CorrelationId, CorrelationRegistry};
pub use error::{RemoteErrorKind, Result, RpcError};
pub use protocol::{
    // ---
    packet_type,
    LinkPacket,
    MethodError,
    MethodErrorKind,
    Params,
    RpcRequest,
    RpcResponse,
};
pub use rpc_config::{
    // ---
    ArbiterConfig,
    RetryConfig,
    RpcConfig,
    ServerConfig,
    DEFAULT_LINK_PORT,
    DEFAULT_MAX_FRAME_SIZE,
};
pub use server::{MethodTable, RpcObject, RpcServer};

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Every mutex in this crate guards a map that stays consistent between
/// individual inserts and removes, so the state behind a poisoned lock is
/// still usable.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
