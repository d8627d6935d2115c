//! Per-device pairing state machine.
//!
//! Each device address gets one `PairingMachine`. Events for that device are
//! handled one at a time and each handler runs to completion, including any
//! operator prompt and bond/forget round-trip, before the next event is looked
//! at. A disconnect that arrives mid-prompt is therefore applied after the
//! prompt's outcome.

use std::sync::Arc;

use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Address;
use crate::device::DevicePatch;
use crate::error::Error;
use crate::event::SemanticEvent;
use crate::gateway::Confirmation;
use crate::gateway::ConfirmationGateway;
use crate::gateway::pairing_prompt;
use crate::registry::Registry;
use crate::transport::Transport;
use crate::transport::TransportExt;
use crate::transport::property;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPhase {
    Idle,
    AwaitingConfirmation,
    Bonding,
}

/// Result of a completed confirm-then-bond cycle, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing beyond a registry update was needed
    Updated,
    AlreadyPaired,
    Bonded,
    BondFailed,
    Rejected,
}

pub struct PairingMachine {
    address: Address,
    phase: PairingPhase,
    transport: Arc<dyn Transport>,
    gateway: Arc<dyn ConfirmationGateway>,
    registry: Arc<Registry>,
}

impl PairingMachine {
    pub fn new(
        address: Address,
        transport: Arc<dyn Transport>,
        gateway: Arc<dyn ConfirmationGateway>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            address,
            phase: PairingPhase::Idle,
            transport,
            gateway,
            registry,
        }
    }

    pub fn phase(&self) -> PairingPhase {
        self.phase
    }

    fn enter(&mut self, phase: PairingPhase) {
        debug!("{}: {:?} -> {:?}", self.address, self.phase, phase);
        self.phase = phase;
    }

    /// Apply one event. Returns once every action it triggered has finished.
    pub async fn handle(&mut self, event: SemanticEvent) -> Outcome {
        debug_assert_eq!(event.address(), self.address);

        match event {
            SemanticEvent::UuidsChanged { uuids, .. } => {
                self.registry
                    .upsert(self.address, DevicePatch::default().service_uuids(uuids));
                Outcome::Updated
            }
            SemanticEvent::PairedChanged { paired, .. } => {
                if !paired {
                    info!("{}: bond cleared", self.address);
                }
                self.registry
                    .upsert(self.address, DevicePatch::default().paired(paired));
                Outcome::Updated
            }
            SemanticEvent::ConnectedChanged {
                connected: false, ..
            } => {
                self.registry
                    .upsert(self.address, DevicePatch::default().connected(false));
                Outcome::Updated
            }
            SemanticEvent::ConnectedChanged {
                connected: true, ..
            } => {
                self.registry
                    .upsert(self.address, DevicePatch::default().connected(true));
                self.on_connected().await
            }
        }
    }

    async fn on_connected(&mut self) -> Outcome {
        let paired = match self
            .transport
            .bool_property(self.address, property::PAIRED)
            .await
        {
            Ok(paired) => paired,
            Err(e) => {
                warn!("{}: failed to query pairing state: {}", self.address, e);
                return Outcome::Updated;
            }
        };

        if paired {
            self.refresh(true).await;
            return Outcome::AlreadyPaired;
        }

        self.enter(PairingPhase::AwaitingConfirmation);
        let display_name = self.display_name().await;
        let (title, message) = pairing_prompt(&display_name);
        info!("{}: asking operator to pair {}", self.address, display_name);
        let answer = self.gateway.confirm(&title, &message).await;

        let outcome = match answer {
            Confirmation::Yes => self.bond().await,
            Confirmation::No => self.reject().await,
        };
        self.enter(PairingPhase::Idle);
        outcome
    }

    async fn bond(&mut self) -> Outcome {
        self.enter(PairingPhase::Bonding);
        if self.transport.bond(self.address).await {
            info!("{}: bonded", self.address);
            let paired = self
                .transport
                .bool_property(self.address, property::PAIRED)
                .await
                .unwrap_or(true);
            self.refresh(paired).await;
            Outcome::Bonded
        } else {
            // The device stays known; a new connection may retry
            warn!("{}", Error::BondFailure(self.address));
            Outcome::BondFailed
        }
    }

    async fn reject(&mut self) -> Outcome {
        info!("{}: pairing rejected, forgetting device", self.address);
        match self.transport.forget(self.address).await {
            Ok(()) | Err(Error::NotFound(_)) => self.registry.remove(self.address),
            // Still known to the stack, so the roster keeps it too
            Err(e) => warn!("{}: forget failed: {}", self.address, e),
        }
        Outcome::Rejected
    }

    /// Write the current pairing state and names into the registry.
    async fn refresh(&self, paired: bool) {
        let name = self
            .transport
            .optional_string_property(self.address, property::NAME)
            .await
            .unwrap_or_default();
        let alias = self
            .transport
            .optional_string_property(self.address, property::ALIAS)
            .await
            .unwrap_or_default();
        self.registry.upsert(
            self.address,
            DevicePatch::default().paired(paired).name(name).alias(alias),
        );
    }

    async fn display_name(&self) -> String {
        if let Ok(Some(alias)) = self
            .transport
            .optional_string_property(self.address, property::ALIAS)
            .await
        {
            if !alias.is_empty() {
                return alias;
            }
        }
        self.registry
            .get(self.address)
            .map(|d| d.display_name())
            .unwrap_or_else(|| self.address.to_string())
    }
}
