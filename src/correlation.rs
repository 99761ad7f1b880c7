//! Bounded correlation-id pool and pending-response registry.
//!
//! A [`CorrelationRegistry`] hands out small integer ids for in-flight
//! requests, remembers where each response must go and when it expires, and
//! takes the id back exactly once: either when the matching response is
//! claimed or when the entry is swept as expired. Both paths go through
//! [`CorrelationRegistry::claim`]-style removal, so a caller holding the
//! registry lock sees an entry at most once.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::{Result, RpcError};

/// Correlation identifier carried in a device-link packet header.
///
/// `0` is reserved for notifications and is never issued by a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(u8);

impl CorrelationId {
    /// Id used by fire-and-forget packets.
    pub const NOTIFICATION: CorrelationId = CorrelationId(0);

    /// Wrap a raw header value.
    pub fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw header value.
    pub fn get(self) -> u8 {
        self.0
    }

    /// Whether this id marks a notification (no response expected).
    pub fn is_notification(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// First id issued by a default registry.
pub const FIRST_ID: u8 = 1;

/// Last id issued by a default registry.
pub const LAST_ID: u8 = 254;

/// A live pending exchange.
#[derive(Debug)]
pub struct CorrelationEntry<S> {
    pub id: CorrelationId,
    pub deadline: Instant,
    pub sink: S,
}

/// Bounded id pool plus the map from id to pending response destination.
///
/// Free ids are reissued in FIFO order, so a just-retired id is the last one
/// to be handed out again. This keeps a late response to an expired id from
/// being matched to a fresh request for as long as possible.
///
/// The registry is not synchronized; owners wrap it in a mutex and perform
/// every claim under that lock.
pub struct CorrelationRegistry<S> {
    // ---
    available: VecDeque<u8>,
    entries: HashMap<u8, (Instant, S)>,
    capacity: usize,
}

impl<S> Default for CorrelationRegistry<S> {
    fn default() -> Self {
        Self::with_range(FIRST_ID, LAST_ID)
    }
}

impl<S> CorrelationRegistry<S> {
    // ---

    /// Registry issuing ids `1..=254`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry issuing ids `first..=last`; a `first` of 0 is raised to 1.
    pub fn with_range(first: u8, last: u8) -> Self {
        // ---
        let first = first.max(FIRST_ID);
        let available: VecDeque<u8> = (first..=last).collect();
        let capacity = available.len();

        Self {
            available,
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Take a free id and record where its response should go.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::IdPoolExhausted`] immediately when every id is in
    /// flight. The sink is dropped in that case.
    pub fn allocate(&mut self, deadline: Instant, sink: S) -> Result<CorrelationId> {
        // ---
        let raw = self.available.pop_front().ok_or(RpcError::IdPoolExhausted)?;
        self.entries.insert(raw, (deadline, sink));
        Ok(CorrelationId(raw))
    }

    /// Remove the entry for `id` and return its id to the pool.
    ///
    /// Returns `None` for unknown, already-claimed or notification ids.
    pub fn claim(&mut self, id: CorrelationId) -> Option<CorrelationEntry<S>> {
        // ---
        let (deadline, sink) = self.entries.remove(&id.0)?;
        self.available.push_back(id.0);
        Some(CorrelationEntry { id, deadline, sink })
    }

    /// Claim every entry whose deadline is at or before `now`.
    pub fn claim_expired(&mut self, now: Instant) -> Vec<CorrelationEntry<S>> {
        // ---
        let expired: Vec<u8> = self
            .entries
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|raw| self.claim(CorrelationId(raw)))
            .collect()
    }

    /// Claim every live entry, e.g. on shutdown.
    pub fn drain(&mut self) -> Vec<CorrelationEntry<S>> {
        // ---
        let ids: Vec<u8> = self.entries.keys().copied().collect();
        ids.into_iter()
            .filter_map(|raw| self.claim(CorrelationId(raw)))
            .collect()
    }

    /// Whether `id` is currently free to be issued.
    pub fn is_available(&self, id: CorrelationId) -> bool {
        self.available.contains(&id.0)
    }

    /// Whether `id` has a live entry.
    pub fn is_pending(&self, id: CorrelationId) -> bool {
        self.entries.contains_key(&id.0)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of ids this registry can have in flight at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Earliest deadline among live entries.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|(deadline, _)| *deadline).min()
    }
}
