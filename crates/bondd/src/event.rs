//! Semantic events decoded from raw transport property changes.
//!
//! Raw notifications (`RawChange`) are transport-level: a device address plus
//! the changed property names and values, in arrival order. The dispatcher
//! converts them into `SemanticEvent`s at the boundary; only the keys listed in
//! `PropertyKey` are acted upon, everything else is dropped.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::device::Address;

/// A batch of property changes for one device, as delivered by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub address: Address,
    pub changed: Vec<(String, Value)>,
}

impl RawChange {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            changed: Vec::new(),
        }
    }

    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changed.push((property.into(), value.into()));
        self
    }
}

/// Raw property names the pairing core reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::AsRefStr)]
pub enum PropertyKey {
    #[strum(serialize = "UUIDs")]
    Uuids,
    Connected,
    Paired,
}

/// Typed device events consumed by the pairing state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SemanticEvent {
    UuidsChanged {
        address: Address,
        uuids: BTreeSet<String>,
    },
    ConnectedChanged {
        address: Address,
        connected: bool,
    },
    PairedChanged {
        address: Address,
        paired: bool,
    },
}

impl SemanticEvent {
    pub fn address(&self) -> Address {
        match self {
            SemanticEvent::UuidsChanged { address, .. }
            | SemanticEvent::ConnectedChanged { address, .. }
            | SemanticEvent::PairedChanged { address, .. } => *address,
        }
    }
}

/// Decode one raw batch into semantic events, preserving entry order.
///
/// Unrecognized keys are skipped silently; recognized keys carrying a value of
/// the wrong type are logged and skipped without affecting the other entries.
pub fn decode(raw: &RawChange) -> Vec<SemanticEvent> {
    let address = raw.address;
    let mut events = Vec::with_capacity(raw.changed.len());

    for (property, value) in &raw.changed {
        let Ok(key) = PropertyKey::from_str(property) else {
            debug!("{}: ignoring property {}", address, property);
            continue;
        };

        let event = match key {
            PropertyKey::Uuids => {
                string_set(value).map(|uuids| SemanticEvent::UuidsChanged { address, uuids })
            }
            PropertyKey::Connected => value
                .as_bool()
                .map(|connected| SemanticEvent::ConnectedChanged { address, connected }),
            PropertyKey::Paired => value
                .as_bool()
                .map(|paired| SemanticEvent::PairedChanged { address, paired }),
        };

        match event {
            Some(event) => events.push(event),
            None => warn!(
                "{}: malformed value for {}: {}",
                address,
                key.as_ref(),
                value
            ),
        }
    }

    events
}

/// Interpret a JSON array of strings as a set.
pub fn string_set(value: &Value) -> Option<BTreeSet<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}
