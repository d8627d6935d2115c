use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::device::Address;
use crate::error::Error;
use crate::error::Result;
use crate::event::RawChange;

/// Raw property names understood by every transport backend.
pub mod property {
    pub const NAME: &str = "Name";
    pub const ALIAS: &str = "Alias";
    pub const PAIRED: &str = "Paired";
    pub const TRUSTED: &str = "Trusted";
    pub const CONNECTED: &str = "Connected";
    pub const UUIDS: &str = "UUIDs";
    pub const MODALIAS: &str = "Modalias";
}

/// Receiving end of a transport's change stream. The stream ending means the
/// subscription dropped.
pub type ChangeReceiver = mpsc::Receiver<RawChange>;

/// Capacity for transport→dispatcher change channels
pub const CHANGE_CHANNEL_SIZE: usize = 256;

/// Abstraction over the wireless stack's device, property and event primitives.
///
/// This trait allows the pairing core to run against BlueZ or a mock for tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Addresses of every device the stack currently knows about
    async fn known_devices(&self) -> Result<Vec<Address>>;

    /// Subscribe to property changes for all devices
    async fn subscribe(&self) -> Result<ChangeReceiver>;

    /// Query one property of one device.
    ///
    /// Fails with [`Error::PropertyUnavailable`] when the stack refuses to
    /// disclose an optional value.
    async fn property(&self, address: Address, name: &str) -> Result<Value>;

    /// Request a bond. Refusal is reported as `false`, not as an error.
    async fn bond(&self, address: Address) -> bool;

    /// Remove the device and its bond from the stack.
    ///
    /// Fails with [`Error::NotFound`] if the address is not known.
    async fn forget(&self, address: Address) -> Result<()>;
}

/// Typed property helpers layered on [`Transport::property`].
#[async_trait]
pub trait TransportExt: Transport {
    async fn bool_property(&self, address: Address, name: &str) -> Result<bool> {
        let value = self.property(address, name).await?;
        value.as_bool().ok_or_else(|| Error::PropertyUnavailable {
            address,
            property: name.to_string(),
        })
    }

    async fn string_property(&self, address: Address, name: &str) -> Result<String> {
        match self.property(address, name).await? {
            Value::String(s) => Ok(s),
            _ => Err(Error::PropertyUnavailable {
                address,
                property: name.to_string(),
            }),
        }
    }

    /// Like [`TransportExt::string_property`], but a refused query yields `None`.
    async fn optional_string_property(
        &self,
        address: Address,
        name: &str,
    ) -> Result<Option<String>> {
        match self.string_property(address, name).await {
            Ok(s) => Ok(Some(s)),
            Err(Error::PropertyUnavailable { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<T: Transport + ?Sized> TransportExt for T {}
