use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Address;
use crate::device::Device;
use crate::device::DevicePatch;
use crate::error::Error;
use crate::error::Result;
use crate::event::string_set;
use crate::transport::Transport;
use crate::transport::TransportExt;
use crate::transport::property;

/// Capacity of the roster-change broadcast channel. Observers that fall
/// further behind receive `Lagged` and should re-read the roster.
const ROSTER_CHANNEL_SIZE: usize = 64;

/// Notification published after every successful roster mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterChange {
    Reloaded,
    Upserted(Address),
    Removed(Address),
}

/// A roster mutation recorded while a reload is in flight
#[derive(Debug, Clone)]
enum Mutation {
    Upsert(Address, DevicePatch),
    Remove(Address),
}

#[derive(Debug, Clone, Default)]
struct Roster {
    /// Devices in first-seen order
    devices: Vec<Device>,

    /// `Some` while `load` is fetching; replayed over the fetched devices
    journal: Option<Vec<Mutation>>,
}

impl Roster {
    fn apply(&mut self, mutation: Mutation) {
        if let Some(journal) = &mut self.journal {
            journal.push(mutation.clone());
        }
        match mutation {
            Mutation::Upsert(address, patch) => {
                match self.devices.iter_mut().find(|d| d.address() == address) {
                    Some(device) => device.apply(patch),
                    None => {
                        let mut device = Device::new(address);
                        device.apply(patch);
                        self.devices.push(device);
                    }
                }
            }
            Mutation::Remove(address) => self.devices.retain(|d| d.address() != address),
        }
    }

    /// The fetched devices with every mutation made since the fetch began
    /// replayed on top.
    fn reloaded(&self, fetched: &[Device]) -> Roster {
        let mut roster = Roster {
            devices: fetched.to_vec(),
            journal: None,
        };
        for mutation in self.journal.iter().flatten() {
            roster.apply(mutation.clone());
        }
        roster
    }
}

/// Address-keyed roster of known devices.
///
/// Readers load an immutable snapshot; writers swap in a modified copy, so
/// `list()` never observes a half-applied update and upserts from different
/// device flows never lose each other's fields.
pub struct Registry {
    /// Readers load the Arc, writers store a new one
    roster: ArcSwap<Roster>,

    /// One reload at a time
    reload: tokio::sync::Mutex<()>,

    changes: broadcast::Sender<RosterChange>,
}

impl Registry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(ROSTER_CHANNEL_SIZE);
        Self {
            roster: ArcSwap::new(Arc::default()),
            reload: tokio::sync::Mutex::new(()),
            changes,
        }
    }

    /// Subscribe to roster changes
    pub fn subscribe(&self) -> broadcast::Receiver<RosterChange> {
        self.changes.subscribe()
    }

    /// Replace the roster with what the transport currently knows.
    ///
    /// Individual property queries that fail leave that field at its default;
    /// the device is still added. Devices upserted or removed while the
    /// transport is being queried keep their newer state.
    pub async fn load(&self, transport: &dyn Transport) -> Result<()> {
        let _reload = self.reload.lock().await;

        self.roster.rcu(|roster| Roster {
            devices: roster.devices.clone(),
            journal: Some(Vec::new()),
        });

        let fetched = match fetch_all(transport).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.roster.rcu(|roster| Roster {
                    devices: roster.devices.clone(),
                    journal: None,
                });
                return Err(e);
            }
        };
        self.roster.rcu(|roster| roster.reloaded(&fetched));

        info!("Loaded {} known device(s)", fetched.len());
        self.publish(RosterChange::Reloaded);
        Ok(())
    }

    /// Create the device if absent, otherwise merge only the fields in `patch`.
    pub fn upsert(&self, address: Address, patch: DevicePatch) {
        self.roster.rcu(|roster| {
            let mut roster = Roster::clone(roster);
            roster.apply(Mutation::Upsert(address, patch.clone()));
            roster
        });
        debug!("{}: upserted {:?}", address, patch);
        self.publish(RosterChange::Upserted(address));
    }

    /// Delete the device. Removing an unknown address is a no-op.
    pub fn remove(&self, address: Address) {
        let previous = self.roster.rcu(|roster| {
            let mut roster = Roster::clone(roster);
            roster.apply(Mutation::Remove(address));
            roster
        });

        if previous.devices.iter().any(|d| d.address() == address) {
            info!("{}: removed from roster", address);
            self.publish(RosterChange::Removed(address));
        }
    }

    pub fn get(&self, address: Address) -> Option<Device> {
        self.roster
            .load()
            .devices
            .iter()
            .find(|d| d.address() == address)
            .cloned()
    }

    /// Snapshot of the roster in first-seen order
    pub fn list(&self) -> Vec<Device> {
        self.roster.load().devices.clone()
    }

    fn publish(&self, change: RosterChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

async fn fetch_all(transport: &dyn Transport) -> Result<Vec<Device>> {
    let addresses = transport.known_devices().await?;
    let mut devices = Vec::with_capacity(addresses.len());
    for address in addresses {
        devices.push(fetch_device(transport, address).await);
    }
    Ok(devices)
}

/// Query every property of one device, tolerating per-field failures.
async fn fetch_device(transport: &dyn Transport, address: Address) -> Device {
    let mut device = Device::new(address);

    device.name = tolerate(
        address,
        property::NAME,
        transport.optional_string_property(address, property::NAME).await,
    )
    .flatten();
    device.alias = tolerate(
        address,
        property::ALIAS,
        transport.optional_string_property(address, property::ALIAS).await,
    )
    .flatten();
    device.paired = tolerate(
        address,
        property::PAIRED,
        transport.bool_property(address, property::PAIRED).await,
    )
    .unwrap_or(false);
    device.trusted = tolerate(
        address,
        property::TRUSTED,
        transport.bool_property(address, property::TRUSTED).await,
    )
    .unwrap_or(false);
    device.connected = tolerate(
        address,
        property::CONNECTED,
        transport.bool_property(address, property::CONNECTED).await,
    )
    .unwrap_or(false);
    device.service_uuids = tolerate(
        address,
        property::UUIDS,
        transport.property(address, property::UUIDS).await,
    )
    .as_ref()
    .and_then(string_set)
    .unwrap_or_default();
    device.vendor_info = tolerate(
        address,
        property::MODALIAS,
        transport
            .optional_string_property(address, property::MODALIAS)
            .await,
    )
    .flatten();

    device
}

fn tolerate<T>(address: Address, field: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(Error::PropertyUnavailable { .. }) => {
            debug!("{}: {} unavailable", address, field);
            None
        }
        Err(e) => {
            warn!("{}: failed to query {}: {}", address, field, e);
            None
        }
    }
}
