use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::device::Address;
use crate::error::Error;
use crate::error::Result;
use crate::event::RawChange;
use crate::event::SemanticEvent;
use crate::event::decode;
use crate::gateway::ConfirmationGateway;
use crate::pairing::PairingMachine;
use crate::registry::Registry;
use crate::registry::RosterChange;
use crate::transport::ChangeReceiver;
use crate::transport::Transport;

/// Channel from the dispatcher to one device's worker (unbounded - the
/// dispatcher must not block on a device stuck waiting for the operator)
type WorkerSender = mpsc::UnboundedSender<SemanticEvent>;

struct Worker {
    tx: WorkerSender,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    live: HashMap<Address, Worker>,

    /// Workers whose sender was dropped but which may still be draining their
    /// queue. A replacement for the same address waits for them to finish.
    retiring: HashMap<Address, JoinHandle<()>>,
}

impl Workers {
    fn retire(&mut self, address: Address) {
        if let Some(worker) = self.live.remove(&address) {
            debug!("{}: retiring worker", address);
            // Dropping the sender lets the worker finish what is queued and exit
            drop(worker.tx);
            self.retiring.insert(address, worker.handle);
        }
    }
}

/// Routes decoded property changes to per-device pairing machines.
///
/// Every device gets its own worker task and queue, so events for one device
/// are applied strictly in arrival order while devices progress independently.
/// A device's worker is retired once the device leaves the roster.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    gateway: Arc<dyn ConfirmationGateway>,
    registry: Arc<Registry>,
    workers: Mutex<Workers>,
    roster_changes: Mutex<broadcast::Receiver<RosterChange>>,

    /// Raw batches dispatched since creation
    delivered: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        gateway: Arc<dyn ConfirmationGateway>,
        registry: Arc<Registry>,
    ) -> Self {
        let roster_changes = registry.subscribe();
        Self {
            transport,
            gateway,
            registry,
            workers: Mutex::new(Workers::default()),
            roster_changes: Mutex::new(roster_changes),
            delivered: AtomicU64::new(0),
        }
    }

    /// Consume a change stream until it ends.
    ///
    /// The stream ending is never a clean exit: it always yields
    /// [`Error::TransportDisconnected`].
    pub async fn run(&self, mut changes: ChangeReceiver) -> Result<()> {
        while let Some(raw) = changes.recv().await {
            self.dispatch(raw);
        }
        Err(Error::TransportDisconnected)
    }

    /// Decode one raw batch and queue its events on the owning device's worker.
    pub fn dispatch(&self, raw: RawChange) {
        debug!("{}: {} changed propert(ies)", raw.address, raw.changed.len());
        self.delivered.fetch_add(1, Ordering::Relaxed);

        let events = decode(&raw);
        let mut workers = self.lock_workers();
        self.reap(&mut workers);
        for event in events {
            self.route(&mut workers, event);
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Number of devices with a live worker
    pub fn active_devices(&self) -> usize {
        let mut workers = self.lock_workers();
        self.reap(&mut workers);
        workers.live.len()
    }

    fn lock_workers(&self) -> MutexGuard<'_, Workers> {
        match self.workers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Retire workers for devices that left the roster and forget retired
    /// workers that have exited.
    fn reap(&self, workers: &mut Workers) {
        let mut changes = match self.roster_changes.lock() {
            Ok(rx) => rx,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            match changes.try_recv() {
                Ok(RosterChange::Removed(address)) => workers.retire(address),
                Ok(RosterChange::Upserted(_)) => {}
                Ok(RosterChange::Reloaded) | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    self.retire_absent(workers)
                }
                Err(_) => break,
            }
        }
        workers.retiring.retain(|_, handle| !handle.is_finished());
    }

    fn retire_absent(&self, workers: &mut Workers) {
        let absent: Vec<Address> = workers
            .live
            .keys()
            .copied()
            .filter(|address| self.registry.get(*address).is_none())
            .collect();
        for address in absent {
            workers.retire(address);
        }
    }

    fn route(&self, workers: &mut Workers, event: SemanticEvent) {
        let address = event.address();
        let event = match workers.live.get(&address) {
            Some(worker) => match worker.tx.send(event) {
                Ok(()) => return,
                // Worker is gone (it panicked); start a fresh one
                Err(mpsc::error::SendError(event)) => {
                    warn!("{}: worker exited, restarting", address);
                    workers.live.remove(&address);
                    event
                }
            },
            None => event,
        };

        let tx = self.spawn_worker(workers, address);
        // A freshly spawned worker holds its receiver until the sender drops
        let _ = tx.send(event);
    }

    fn spawn_worker(&self, workers: &mut Workers, address: Address) -> WorkerSender {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut machine = PairingMachine::new(
            address,
            self.transport.clone(),
            self.gateway.clone(),
            self.registry.clone(),
        );
        let previous = workers.retiring.remove(&address);

        let span = tracing::info_span!("device", %address);
        let handle = tokio::spawn(
            async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                while let Some(event) = rx.recv().await {
                    let outcome = machine.handle(event).await;
                    debug!("event handled: {:?}", outcome);
                }
            }
            .instrument(span),
        );

        debug!("{}: worker started", address);
        workers.live.insert(
            address,
            Worker {
                tx: tx.clone(),
                handle,
            },
        );
        tx
    }

    /// Stop every worker, abandoning any prompt still in flight.
    pub fn shutdown(&self) {
        let mut workers = self.lock_workers();
        info!("Stopping {} device worker(s)", workers.live.len());
        for (_, worker) in workers.live.drain() {
            worker.handle.abort();
        }
        for (_, handle) in workers.retiring.drain() {
            handle.abort();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
