//! BlueZ transport backend.
//!
//! Talks to `bluetoothd` over D-Bus through `bluer`. Property changes from
//! every device on the adapter are forwarded as raw batches; devices that
//! appear after subscribing get a watcher as soon as the adapter reports them.

use std::collections::HashMap;
use std::collections::HashSet;

use async_trait::async_trait;
use bluer::AdapterEvent;
use bluer::DeviceEvent;
use bluer::DeviceProperty;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Address;
use crate::error::Error;
use crate::error::Result;
use crate::event::RawChange;
use crate::transport::CHANGE_CHANNEL_SIZE;
use crate::transport::ChangeReceiver;
use crate::transport::Transport;
use crate::transport::property;

pub struct BluezTransport {
    /// Held so the D-Bus connection outlives the adapter handle
    _session: bluer::Session,
    adapter: bluer::Adapter,
}

impl BluezTransport {
    /// Connect to `bluetoothd` and open the named adapter, or the default one.
    pub async fn new(adapter_name: Option<&str>) -> Result<Self> {
        let session = bluer::Session::new().await.map_err(Error::transport)?;
        let adapter = match adapter_name {
            Some(name) => session.adapter(name).map_err(Error::transport)?,
            None => session.default_adapter().await.map_err(Error::transport)?,
        };
        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(Self {
            _session: session,
            adapter,
        })
    }

    fn device(&self, address: Address) -> Result<bluer::Device> {
        self.adapter
            .device(to_bluer(address))
            .map_err(|e| from_bluer(address, e))
    }
}

fn to_bluer(address: Address) -> bluer::Address {
    bluer::Address::new(address.octets())
}

fn from_bluer(address: Address, e: bluer::Error) -> Error {
    match e.kind {
        bluer::ErrorKind::NotFound => Error::NotFound(address),
        _ => Error::transport(e),
    }
}

fn uuid_array(uuids: HashSet<bluer::Uuid>) -> Value {
    let mut uuids: Vec<String> = uuids.into_iter().map(|u| u.to_string()).collect();
    uuids.sort();
    Value::from(uuids)
}

fn modalias_string(m: &bluer::Modalias) -> String {
    format_modalias(&m.source, m.vendor, m.product, m.device)
}

fn format_modalias(source: &str, vendor: u32, product: u32, device: u32) -> String {
    format!("{}:v{:04X}p{:04X}d{:04X}", source, vendor, product, device)
}

/// Raw name and value for the device properties bondd forwards
fn raw_property(prop: DeviceProperty) -> Option<(&'static str, Value)> {
    match prop {
        DeviceProperty::Name(name) => Some((property::NAME, Value::String(name))),
        DeviceProperty::Alias(alias) => Some((property::ALIAS, Value::String(alias))),
        DeviceProperty::Paired(paired) => Some((property::PAIRED, Value::Bool(paired))),
        DeviceProperty::Trusted(trusted) => Some((property::TRUSTED, Value::Bool(trusted))),
        DeviceProperty::Connected(connected) => {
            Some((property::CONNECTED, Value::Bool(connected)))
        }
        DeviceProperty::Uuids(uuids) => Some((property::UUIDS, uuid_array(uuids))),
        DeviceProperty::Modalias(m) => {
            Some((property::MODALIAS, Value::String(modalias_string(&m))))
        }
        _ => None,
    }
}

/// Forward one device's property changes until its event stream ends.
fn watch_device(
    adapter: &bluer::Adapter,
    addr: bluer::Address,
    tx: mpsc::Sender<RawChange>,
) -> Option<JoinHandle<()>> {
    let device = match adapter.device(addr) {
        Ok(device) => device,
        Err(e) => {
            warn!("{}: cannot watch device: {}", addr, e);
            return None;
        }
    };
    let address = Address::new(addr.0);

    Some(tokio::spawn(async move {
        let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("{}: failed to subscribe to device events: {}", address, e);
                return;
            }
        };
        tokio::pin!(events);

        while let Some(event) = events.next().await {
            #[allow(unreachable_patterns)]
            let prop = match event {
                DeviceEvent::PropertyChanged(prop) => prop,
                _ => continue,
            };
            let Some((name, value)) = raw_property(prop) else {
                continue;
            };
            if tx.send(RawChange::new(address).with(name, value)).await.is_err() {
                break;
            }
        }
        debug!("{}: device watcher exiting", address);
    }))
}

#[async_trait]
impl Transport for BluezTransport {
    async fn known_devices(&self) -> Result<Vec<Address>> {
        let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(Error::transport)?;
        Ok(addresses.into_iter().map(|a| Address::new(a.0)).collect())
    }

    async fn subscribe(&self) -> Result<ChangeReceiver> {
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_SIZE);
        let adapter = self.adapter.clone();
        let existing = adapter.device_addresses().await.map_err(Error::transport)?;

        tokio::spawn(async move {
            let events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Failed to subscribe to adapter events: {}", e);
                    return;
                }
            };

            let mut watchers: HashMap<bluer::Address, JoinHandle<()>> = HashMap::new();
            for addr in existing {
                if let Some(handle) = watch_device(&adapter, addr, tx.clone()) {
                    watchers.insert(addr, handle);
                }
            }

            tokio::pin!(events);
            while let Some(event) = events.next().await {
                match event {
                    AdapterEvent::DeviceAdded(addr) if !watchers.contains_key(&addr) => {
                        debug!("{}: device added", addr);
                        if let Some(handle) = watch_device(&adapter, addr, tx.clone()) {
                            watchers.insert(addr, handle);
                        }
                    }
                    AdapterEvent::DeviceRemoved(addr) => {
                        debug!("{}: device removed", addr);
                        if let Some(handle) = watchers.remove(&addr) {
                            handle.abort();
                        }
                    }
                    _ => {}
                }
                if tx.is_closed() {
                    break;
                }
            }

            // Dropping every sender ends the subscriber's stream
            warn!("Adapter {} event stream ended", adapter.name());
            for (_, handle) in watchers {
                handle.abort();
            }
        });

        Ok(rx)
    }

    async fn property(&self, address: Address, name: &str) -> Result<Value> {
        let device = self.device(address)?;
        let err = |e| from_bluer(address, e);

        let value = match name {
            property::NAME => device.name().await.map_err(err)?.map(Value::String),
            property::ALIAS => Some(Value::String(device.alias().await.map_err(err)?)),
            property::PAIRED => Some(Value::Bool(device.is_paired().await.map_err(err)?)),
            property::TRUSTED => Some(Value::Bool(device.is_trusted().await.map_err(err)?)),
            property::CONNECTED => Some(Value::Bool(device.is_connected().await.map_err(err)?)),
            property::UUIDS => device.uuids().await.map_err(err)?.map(uuid_array),
            property::MODALIAS => device
                .modalias()
                .await
                .map_err(err)?
                .map(|m| Value::String(modalias_string(&m))),
            _ => None,
        };

        value.ok_or_else(|| Error::PropertyUnavailable {
            address,
            property: name.to_string(),
        })
    }

    async fn bond(&self, address: Address) -> bool {
        let device = match self.device(address) {
            Ok(device) => device,
            Err(e) => {
                warn!("{}: cannot bond: {}", address, e);
                return false;
            }
        };
        match device.pair().await {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: pairing refused: {}", address, e);
                false
            }
        }
    }

    async fn forget(&self, address: Address) -> Result<()> {
        let addr = to_bluer(address);
        let known = self
            .adapter
            .device_addresses()
            .await
            .map_err(Error::transport)?;
        if !known.contains(&addr) {
            return Err(Error::NotFound(address));
        }
        self.adapter
            .remove_device(addr)
            .await
            .map_err(|e| from_bluer(address, e))
    }
}
