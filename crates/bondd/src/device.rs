use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// A 48-bit device address, e.g. `AA:BB:CC:DD:EE:01`.
///
/// The address is the sole identity of a [`Device`]: equality, registry lookup
/// and removal all go through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; 6]);

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid device address: {0:?}")]
pub struct AddressParseError(String);

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| AddressParseError(s.to_string()))?;
            *byte = u8::from_str_radix(part, 16).map_err(|_| AddressParseError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(AddressParseError(s.to_string()));
        }
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A remote peer known to the local peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    address: Address,

    pub name: Option<String>,
    pub alias: Option<String>,

    pub paired: bool,
    pub trusted: bool,

    /// Reflects the latest connection event; not persisted by the transport.
    pub connected: bool,

    /// Service UUIDs advertised by the device. Grows after bonding as more
    /// services are resolved.
    pub service_uuids: BTreeSet<String>,

    /// Vendor/product identification. The transport may refuse to disclose it.
    pub vendor_info: Option<String>,
}

impl Device {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            name: None,
            alias: None,
            paired: false,
            trusted: false,
            connected: false,
            service_uuids: BTreeSet::new(),
            vendor_info: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Name to show an operator: alias, then name, then the address.
    pub fn display_name(&self) -> String {
        self.alias
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.name.as_deref().filter(|s| !s.is_empty()))
            .map(str::to_string)
            .unwrap_or_else(|| self.address.to_string())
    }

    /// Merge the fields present in `patch`, leaving the rest untouched.
    pub fn apply(&mut self, patch: DevicePatch) {
        if let Some(name) = patch.name {
            self.name = Some(name);
        }
        if let Some(alias) = patch.alias {
            self.alias = Some(alias);
        }
        if let Some(paired) = patch.paired {
            self.paired = paired;
        }
        if let Some(trusted) = patch.trusted {
            self.trusted = trusted;
        }
        if let Some(connected) = patch.connected {
            self.connected = connected;
        }
        if let Some(uuids) = patch.service_uuids {
            self.service_uuids = uuids;
        }
        if let Some(vendor_info) = patch.vendor_info {
            self.vendor_info = Some(vendor_info);
        }
    }
}

/// A partial update for a [`Device`]. `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub alias: Option<String>,
    pub paired: Option<bool>,
    pub trusted: Option<bool>,
    pub connected: Option<bool>,
    pub service_uuids: Option<BTreeSet<String>>,
    pub vendor_info: Option<String>,
}

impl DevicePatch {
    pub fn paired(mut self, paired: bool) -> Self {
        self.paired = Some(paired);
        self
    }

    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = Some(connected);
        self
    }

    pub fn service_uuids(mut self, uuids: BTreeSet<String>) -> Self {
        self.service_uuids = Some(uuids);
        self
    }

    pub fn name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn alias(mut self, alias: Option<String>) -> Self {
        self.alias = alias;
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
