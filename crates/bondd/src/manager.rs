use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::device::Address;
use crate::device::Device;
use crate::dispatcher::Dispatcher;
use crate::error::Error;
use crate::error::Result;
use crate::gateway::ConfirmationGateway;
use crate::registry::Registry;
use crate::registry::RosterChange;
use crate::transport::Transport;

/// Tunables for [`Manager`]
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Consecutive resubscription attempts before giving up
    pub resubscribe_attempts: u32,

    /// Delay before each resubscription attempt
    pub resubscribe_backoff: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            resubscribe_attempts: 3,
            resubscribe_backoff: Duration::from_secs(1),
        }
    }
}

/// bondd manager
///
/// Owns the device registry and the dispatcher, keeps the transport
/// subscription alive, and serves the display layer's requests.
pub struct Manager {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    options: ManagerOptions,
}

impl Manager {
    pub fn new(
        transport: Arc<dyn Transport>,
        gateway: Arc<dyn ConfirmationGateway>,
        options: ManagerOptions,
    ) -> Self {
        let registry = Arc::new(Registry::new());
        let dispatcher = Dispatcher::new(transport.clone(), gateway, registry.clone());
        Self {
            transport,
            registry,
            dispatcher,
            options,
        }
    }

    /// Load the roster from the transport
    pub async fn start(&self) -> Result<()> {
        self.registry.load(self.transport.as_ref()).await
    }

    /// Process transport changes until the subscription is lost for good.
    ///
    /// A dropped stream is retried after a backoff, reloading the roster to
    /// pick up whatever changed while unsubscribed. Only
    /// [`Error::TransportDisconnected`] is ever returned after the attempts run
    /// out; any other failure is returned immediately.
    pub async fn run(&self) -> Result<()> {
        info!("Manager starting");
        let mut attempts = 0;

        loop {
            let changes = match self.transport.subscribe().await {
                Ok(changes) => changes,
                Err(e) if attempts == 0 => return Err(e),
                Err(e) => {
                    warn!("Resubscribe failed: {}", e);
                    attempts += 1;
                    if attempts > self.options.resubscribe_attempts {
                        break;
                    }
                    tokio::time::sleep(self.options.resubscribe_backoff).await;
                    continue;
                }
            };

            let before = self.dispatcher.delivered();
            let result = self.dispatcher.run(changes).await;
            if self.dispatcher.delivered() > before {
                attempts = 0;
            }

            match result {
                Err(Error::TransportDisconnected) => {}
                other => return other,
            }

            attempts += 1;
            if attempts > self.options.resubscribe_attempts {
                break;
            }
            warn!(
                "Transport change stream dropped, resubscribing (attempt {}/{})",
                attempts, self.options.resubscribe_attempts
            );
            tokio::time::sleep(self.options.resubscribe_backoff).await;
            if let Err(e) = self.registry.load(self.transport.as_ref()).await {
                warn!("Failed to reload roster: {}", e);
            }
        }

        error!("Transport change stream lost");
        Err(Error::TransportDisconnected)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn list(&self) -> Vec<Device> {
        self.registry.list()
    }

    pub fn get(&self, address: Address) -> Option<Device> {
        self.registry.get(address)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RosterChange> {
        self.registry.subscribe()
    }

    /// Forget a device on operator request and drop it from the roster.
    ///
    /// Fails with [`Error::NotFound`] if the transport no longer knows the
    /// address; the roster entry is dropped in that case too.
    pub async fn remove_device(&self, address: Address) -> Result<()> {
        info!("{}: removal requested", address);
        let result = self.transport.forget(address).await;
        match &result {
            Ok(()) | Err(Error::NotFound(_)) => self.registry.remove(address),
            Err(_) => {}
        }
        result
    }

    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::RawChange;
    use crate::gateway::Confirmation;
    use crate::testing::MockTransport;
    use crate::testing::ScriptedGateway;
    use crate::testing::addr;
    use crate::testing::wait_until;

    fn manager(
        transport: &Arc<MockTransport>,
        gateway: &Arc<ScriptedGateway>,
        attempts: u32,
    ) -> Arc<Manager> {
        Arc::new(Manager::new(
            transport.clone(),
            gateway.clone(),
            ManagerOptions {
                resubscribe_attempts: attempts,
                resubscribe_backoff: Duration::from_millis(10),
            },
        ))
    }

    #[tokio::test]
    async fn test_scenario_unknown_device_accepted() {
        let transport = Arc::new(MockTransport::new());
        let gateway = Arc::new(ScriptedGateway::answering([Confirmation::Yes]));
        let manager = manager(&transport, &gateway, 0);
        manager.start().await.unwrap();
        assert!(manager.list().is_empty());

        let runner = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });
        transport.wait_subscribed(1).await;

        let device = addr(1);
        transport.add_device(device, &[("Alias", json!("Speaker")), ("Paired", json!(false))]);
        transport.emit(RawChange::new(device).with("Connected", true)).await;

        wait_until(|| manager.get(device).is_some_and(|d| d.paired)).await;
        assert_eq!(gateway.prompts()[0].0, "Pair Speaker?");
        assert_eq!(transport.bond_calls(), vec![device]);
        assert!(manager.list().iter().any(|d| d.address() == device));

        runner.abort();
    }

    #[tokio::test]
    async fn test_scenario_unknown_device_rejected() {
        let transport = Arc::new(MockTransport::new());
        let gateway = Arc::new(ScriptedGateway::answering([Confirmation::No]));
        let manager = manager(&transport, &gateway, 0);
        manager.start().await.unwrap();

        let runner = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });
        transport.wait_subscribed(1).await;

        let device = addr(1);
        transport.add_device(device, &[("Alias", json!("Speaker")), ("Paired", json!(false))]);
        transport.emit(RawChange::new(device).with("Connected", true)).await;

        wait_until(|| transport.forget_calls().len() == 1).await;
        wait_until(|| manager.get(device).is_none()).await;
        assert_eq!(transport.forget_calls(), vec![device]);
        assert!(transport.bond_calls().is_empty());

        runner.abort();
    }

    #[tokio::test]
    async fn test_known_paired_device_reconnect_no_prompt() {
        let transport = Arc::new(MockTransport::new());
        transport.add_device(addr(1), &[("Alias", json!("Mouse")), ("Paired", json!(true))]);
        let gateway = Arc::new(ScriptedGateway::new(Confirmation::No));
        let manager = manager(&transport, &gateway, 0);
        manager.start().await.unwrap();
        assert!(manager.get(addr(1)).unwrap().paired);

        let runner = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });
        transport.wait_subscribed(1).await;
        transport.emit(RawChange::new(addr(1)).with("Connected", true)).await;

        wait_until(|| manager.get(addr(1)).is_some_and(|d| d.connected)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gateway.prompts().is_empty());
        assert!(transport.forget_calls().is_empty());

        runner.abort();
    }

    #[tokio::test]
    async fn test_remove_device() {
        let transport = Arc::new(MockTransport::new());
        transport.add_device(addr(1), &[("Paired", json!(true))]);
        let gateway = Arc::new(ScriptedGateway::new(Confirmation::No));
        let manager = manager(&transport, &gateway, 0);
        manager.start().await.unwrap();
        let mut changes = manager.subscribe();

        manager.remove_device(addr(1)).await.unwrap();

        assert!(manager.get(addr(1)).is_none());
        assert!(!transport.knows(addr(1)));
        assert_eq!(changes.recv().await.unwrap(), RosterChange::Removed(addr(1)));
    }

    #[tokio::test]
    async fn test_remove_device_not_found() {
        let transport = Arc::new(MockTransport::new());
        let gateway = Arc::new(ScriptedGateway::new(Confirmation::No));
        let manager = manager(&transport, &gateway, 0);
        manager.registry().upsert(addr(4), Default::default());

        let result = manager.remove_device(addr(4)).await;

        assert!(matches!(result, Err(Error::NotFound(a)) if a == addr(4)));
        assert!(manager.get(addr(4)).is_none());
    }

    #[tokio::test]
    async fn test_resubscribes_then_gives_up() {
        let transport = Arc::new(MockTransport::new());
        let gateway = Arc::new(ScriptedGateway::new(Confirmation::No));
        let manager = manager(&transport, &gateway, 2);

        let runner = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });

        for n in 1..=3 {
            transport.wait_subscribed(n).await;
            transport.disconnect();
        }

        let result = runner.await.unwrap();
        assert!(matches!(result, Err(Error::TransportDisconnected)));
        assert_eq!(transport.subscribe_count(), 3);
    }

    #[tokio::test]
    async fn test_resubscribe_reloads_roster() {
        let transport = Arc::new(MockTransport::new());
        let gateway = Arc::new(ScriptedGateway::new(Confirmation::No));
        let manager = manager(&transport, &gateway, 1);

        let runner = tokio::spawn({
            let manager = manager.clone();
            async move { manager.run().await }
        });
        transport.wait_subscribed(1).await;

        transport.add_device(addr(5), &[("Paired", json!(true))]);
        transport.disconnect();
        transport.wait_subscribed(2).await;

        assert!(manager.get(addr(5)).is_some_and(|d| d.paired));
        runner.abort();
    }
}
