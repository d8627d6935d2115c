//! Test doubles for the transport and confirmation seams.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::sync::mpsc;

use crate::device::Address;
use crate::error::Error;
use crate::error::Result;
use crate::event::RawChange;
use crate::gateway::Confirmation;
use crate::gateway::ConfirmationGateway;
use crate::transport::CHANGE_CHANNEL_SIZE;
use crate::transport::ChangeReceiver;
use crate::transport::Transport;
use crate::transport::property;

/// `AA:BB:CC:DD:EE:<n>`
pub fn addr(n: u8) -> Address {
    Address::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, n])
}

/// Poll `cond` until it holds, panicking after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<Address, BTreeMap<String, Value>>,
    bond_result: bool,
    bond_calls: Vec<Address>,
    forget_calls: Vec<Address>,
    subscriber: Option<mpsc::Sender<RawChange>>,
    subscribe_count: usize,
    paired_gate: Option<Arc<Notify>>,
    forget_error: Option<fn(Address) -> Error>,
    hide_paired_after_bond: bool,
}

/// In-memory transport. Devices are property maps; bonding flips `Paired`.
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                bond_result: true,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn add_device(&self, address: Address, properties: &[(&str, Value)]) {
        let props = properties
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        self.state().devices.insert(address, props);
    }

    pub fn set_property(&self, address: Address, name: &str, value: Value) {
        self.state()
            .devices
            .entry(address)
            .or_default()
            .insert(name.to_string(), value);
    }

    pub fn knows(&self, address: Address) -> bool {
        self.state().devices.contains_key(&address)
    }

    pub fn set_bond_result(&self, ok: bool) {
        self.state().bond_result = ok;
    }

    /// Make every `forget` fail with the given error, leaving the device known.
    pub fn set_forget_error(&self, make: fn(Address) -> Error) {
        self.state().forget_error = Some(make);
    }

    /// A successful bond leaves `Paired` unreadable instead of `true`.
    pub fn hide_paired_after_bond(&self) {
        self.state().hide_paired_after_bond = true;
    }

    pub fn bond_calls(&self) -> Vec<Address> {
        self.state().bond_calls.clone()
    }

    pub fn forget_calls(&self) -> Vec<Address> {
        self.state().forget_calls.clone()
    }

    pub fn subscribe_count(&self) -> usize {
        self.state().subscribe_count
    }

    /// Make `Paired` queries wait until the returned handle is notified.
    pub fn hold_paired_queries(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state().paired_gate = Some(gate.clone());
        gate
    }

    /// Deliver a raw batch to the current subscriber.
    pub async fn emit(&self, change: RawChange) {
        let tx = self.state().subscriber.clone();
        if let Some(tx) = tx {
            tx.send(change).await.unwrap();
        }
    }

    /// Drop the current subscription, ending its stream.
    pub fn disconnect(&self) {
        self.state().subscriber = None;
    }

    pub async fn wait_subscribed(&self, count: usize) {
        wait_until(|| self.subscribe_count() >= count).await;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn known_devices(&self) -> Result<Vec<Address>> {
        Ok(self.state().devices.keys().copied().collect())
    }

    async fn subscribe(&self) -> Result<ChangeReceiver> {
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_SIZE);
        let mut state = self.state();
        state.subscriber = Some(tx);
        state.subscribe_count += 1;
        Ok(rx)
    }

    async fn property(&self, address: Address, name: &str) -> Result<Value> {
        let gate = if name == property::PAIRED {
            self.state().paired_gate.clone()
        } else {
            None
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let state = self.state();
        let props = state.devices.get(&address).ok_or(Error::NotFound(address))?;
        props
            .get(name)
            .cloned()
            .ok_or_else(|| Error::PropertyUnavailable {
                address,
                property: name.to_string(),
            })
    }

    async fn bond(&self, address: Address) -> bool {
        let mut state = self.state();
        state.bond_calls.push(address);
        if !state.bond_result {
            return false;
        }
        let hide = state.hide_paired_after_bond;
        match state.devices.get_mut(&address) {
            Some(props) if hide => {
                props.remove(property::PAIRED);
                true
            }
            Some(props) => {
                props.insert(property::PAIRED.to_string(), Value::Bool(true));
                true
            }
            None => false,
        }
    }

    async fn forget(&self, address: Address) -> Result<()> {
        let mut state = self.state();
        state.forget_calls.push(address);
        if let Some(make) = state.forget_error {
            return Err(make(address));
        }
        state
            .devices
            .remove(&address)
            .map(|_| ())
            .ok_or(Error::NotFound(address))
    }
}

/// Gateway that answers from a script and records every prompt.
#[derive(Debug)]
pub struct ScriptedGateway {
    answers: Mutex<VecDeque<Confirmation>>,
    fallback: Confirmation,
    prompts: Mutex<Vec<(String, String)>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedGateway {
    /// Answers `fallback` once the script is exhausted.
    pub fn new(fallback: Confirmation) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            fallback,
            prompts: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn answering(answers: impl IntoIterator<Item = Confirmation>) -> Self {
        let gateway = Self::new(Confirmation::No);
        gateway.answers.lock().unwrap().extend(answers);
        gateway
    }

    /// Hold every answer until the returned handle is notified, once per prompt.
    pub fn gated(fallback: Confirmation) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let mut gateway = Self::new(fallback);
        gateway.gate = Some(gate.clone());
        (gateway, gate)
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfirmationGateway for ScriptedGateway {
    async fn confirm(&self, title: &str, message: &str) -> Confirmation {
        self.prompts
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string()));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback)
    }
}
