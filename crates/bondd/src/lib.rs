pub mod api;
#[cfg(feature = "bluez")]
pub mod bluez;
pub mod config;
pub mod device;
mod dispatcher;
mod error;
pub mod event;
pub mod gateway;
mod manager;
pub mod pairing;
pub mod registry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use config::LogLevel;
pub use device::Address;
pub use device::Device;
pub use device::DevicePatch;
pub use dispatcher::Dispatcher;
pub use error::Error;
pub use error::Result;
pub use gateway::Confirmation;
pub use gateway::ConfirmationGateway;
pub use manager::Manager;
pub use manager::ManagerOptions;
pub use registry::Registry;
pub use registry::RosterChange;
pub use transport::Transport;
