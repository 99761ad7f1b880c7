use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// What a device reported about itself in its discovery response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    // ---
    pub vendor: String,
    pub model: String,
    /// Fields after the model, if the device sends any.
    pub extra: Vec<String>,
}

impl DeviceIdentity {
    // ---

    pub fn new(vendor: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            model: model.into(),
            extra: Vec::new(),
        }
    }

    /// Parse a `vendor,model[,...]` response body.
    ///
    /// Returns `None` unless both vendor and model are present.
    pub fn parse(body: &[u8]) -> Option<Self> {
        // ---
        let text = String::from_utf8_lossy(body);
        let mut fields = text.split(',').map(|f| f.trim().to_string());

        let vendor = fields.next().filter(|v| !v.is_empty())?;
        let model = fields.next().filter(|m| !m.is_empty())?;

        Some(Self {
            vendor,
            model,
            extra: fields.collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub identity: DeviceIdentity,
    /// When the device last answered a discovery probe.
    pub last_seen: Instant,
}

/// Devices that answered discovery, keyed by source address.
///
/// An address that answers again replaces its earlier entry. Addresses that
/// stop answering stay until [`Arbiter::prune_devices`](super::Arbiter::prune_devices)
/// or [`Arbiter::clear_devices`](super::Arbiter::clear_devices) removes them.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    devices: HashMap<IpAddr, DiscoveredDevice>,
}

impl DiscoveryResult {
    // ---

    pub(crate) fn record(&mut self, address: IpAddr, identity: DeviceIdentity, seen: Instant) {
        self.devices.insert(
            address,
            DiscoveredDevice {
                identity,
                last_seen: seen,
            },
        );
    }

    pub fn get(&self, address: &IpAddr) -> Option<&DiscoveredDevice> {
        self.devices.get(address)
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.devices.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IpAddr, &DiscoveredDevice)> {
        self.devices.iter()
    }

    /// Address to `(vendor, model)` pairs.
    pub fn identities(&self) -> HashMap<IpAddr, (String, String)> {
        self.devices
            .iter()
            .map(|(ip, d)| (*ip, (d.identity.vendor.clone(), d.identity.model.clone())))
            .collect()
    }

    /// Remove devices not seen within `age`; returns their addresses.
    pub fn prune_older_than(&mut self, age: Duration) -> Vec<IpAddr> {
        // ---
        let now = Instant::now();
        let stale: Vec<IpAddr> = self
            .devices
            .iter()
            .filter(|(_, d)| now.saturating_duration_since(d.last_seen) > age)
            .map(|(ip, _)| *ip)
            .collect();

        for ip in &stale {
            self.devices.remove(ip);
        }
        stale
    }

    pub(crate) fn clear(&mut self) {
        self.devices.clear();
    }
}
