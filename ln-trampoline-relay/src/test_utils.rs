#![cfg(test)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use lightning::ln::types::{ChannelId, PaymentHash, PaymentPreimage, PaymentSecret};
use ln_trampoline_policy::{FailureMessage, HtlcRef, IncomingHtlc, TrampolinePolicy};
use mockall::mock;
use tokio::sync::{broadcast, mpsc};

use crate::config::RelayConfig;
use crate::dispatcher::{OutgoingPaymentEngine, OutgoingPaymentRequest};
use crate::events::{
    HopHint, IncomingPacket, NodeRelayPayload, OnionPacket, PaymentEvent, RelayEvent,
};
use crate::metrics::RelayMetrics;
use crate::relay::{RelayParams, TrampolineRelay};
use crate::settlement::{ChannelRegister, MemoryCommandStore, RelayCommand};
use crate::{BlockSource, BoxError};

/// Block height reported by the test chain view, matching the seed scenarios.
pub const TEST_HEIGHT: u32 = 600_000;

mock! {
    pub ChainView {}

    #[async_trait]
    impl BlockSource for ChainView {
        async fn current_height(&self) -> u32;
    }
}

pub fn static_block_source() -> Arc<dyn BlockSource> {
    let mut source = MockChainView::new();
    source.expect_current_height().returning(|| TEST_HEIGHT);
    Arc::new(source)
}

pub fn node_id(seed: u8) -> PublicKey {
    let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
    PublicKey::from_secret_key(&Secp256k1::new(), &sk)
}

pub fn channel_id(seed: u8) -> ChannelId {
    ChannelId([seed; 32])
}

pub fn htlc_ref(channel_seed: u8, htlc_id: u64) -> HtlcRef {
    HtlcRef {
        channel_id: channel_id(channel_seed),
        htlc_id,
    }
}

pub fn payment_secret(seed: u8) -> PaymentSecret {
    PaymentSecret([seed; 32])
}

pub fn preimage() -> PaymentPreimage {
    PaymentPreimage([7; 32])
}

pub fn test_payment_hash() -> PaymentHash {
    PaymentHash(sha256::Hash::hash(&preimage().0).to_byte_array())
}

pub fn make_htlc(
    channel_seed: u8,
    htlc_id: u64,
    amount_msat: u64,
    expiry: u32,
    payment_secret: Option<PaymentSecret>,
    total_amount_msat: u64,
) -> IncomingHtlc {
    IncomingHtlc {
        channel_id: channel_id(channel_seed),
        htlc_id,
        amount_msat,
        expiry,
        payment_hash: test_payment_hash(),
        payment_secret,
        total_amount_msat,
    }
}

pub fn make_payload(
    amount_to_forward_msat: u64,
    outgoing_cltv: u32,
    payment_secret: Option<PaymentSecret>,
    invoice_features: Option<lightning::ln::features::Bolt11InvoiceFeatures>,
    invoice_routing_info: Vec<Vec<HopHint>>,
) -> NodeRelayPayload {
    NodeRelayPayload {
        amount_to_forward_msat,
        outgoing_cltv,
        outgoing_node_id: node_id(0x42),
        payment_secret,
        invoice_features,
        invoice_routing_info,
    }
}

pub fn make_onion() -> OnionPacket {
    OnionPacket {
        version: 0,
        public_key: node_id(0x24),
        hop_data: vec![1, 2, 3, 4],
        hmac: [5; 32],
    }
}

pub fn make_packet(add: IncomingHtlc, payload: NodeRelayPayload) -> IncomingPacket {
    IncomingPacket {
        add,
        payload,
        next_onion: make_onion(),
    }
}

pub fn route_hint(seed: u8) -> HopHint {
    HopHint {
        node_id: node_id(seed),
        short_channel_id: seed as u64,
        fee_base_msat: 1000,
        fee_proportional_millionths: 10,
        cltv_expiry_delta: 80,
    }
}

pub fn test_policy() -> TrampolinePolicy {
    TrampolinePolicy {
        fee_base_msat: 1000,
        fee_proportional_millionths: 100,
        expiry_delta: 40,
    }
}

/// Polls a condition until it holds, failing the test if it doesn't within a second.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within timeout");
}

/// Channel register fake that records every command it receives.
#[derive(Default)]
pub struct RecordingRegister {
    commands: Mutex<Vec<RelayCommand>>,
    reject: bool,
}

impl RecordingRegister {
    /// A register that refuses every command, for exercising the durable retry path.
    pub fn rejecting() -> Self {
        RecordingRegister {
            commands: Mutex::new(Vec::new()),
            reject: true,
        }
    }

    pub fn commands(&self) -> Vec<RelayCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn fails(&self) -> Vec<(HtlcRef, FailureMessage)> {
        self.commands()
            .into_iter()
            .filter_map(|command| match command {
                RelayCommand::Fail { htlc, reason } => Some((htlc, reason)),
                RelayCommand::Fulfill { .. } => None,
            })
            .collect()
    }

    pub fn fulfills(&self) -> Vec<(HtlcRef, PaymentPreimage)> {
        self.commands()
            .into_iter()
            .filter_map(|command| match command {
                RelayCommand::Fulfill { htlc, preimage } => Some((htlc, preimage)),
                RelayCommand::Fail { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl ChannelRegister for RecordingRegister {
    async fn fail_htlc(
        &self,
        htlc: HtlcRef,
        reason: FailureMessage,
        _commit: bool,
    ) -> Result<(), BoxError> {
        if self.reject {
            return Err("channel unavailable".into());
        }
        self.commands
            .lock()
            .unwrap()
            .push(RelayCommand::Fail { htlc, reason });
        Ok(())
    }

    async fn fulfill_htlc(
        &self,
        htlc: HtlcRef,
        preimage: PaymentPreimage,
        _commit: bool,
    ) -> Result<(), BoxError> {
        if self.reject {
            return Err("channel unavailable".into());
        }
        self.commands
            .lock()
            .unwrap()
            .push(RelayCommand::Fulfill { htlc, preimage });
        Ok(())
    }
}

/// Payment engine fake that records requests and exposes the event sender handed to it, so
/// tests can play the downstream payment's lifecycle back to the relay.
#[derive(Default)]
pub struct TestPaymentEngine {
    requests: Mutex<Vec<OutgoingPaymentRequest>>,
    events: Mutex<Option<mpsc::Sender<PaymentEvent>>>,
    refuse: AtomicBool,
}

impl TestPaymentEngine {
    pub fn refusing() -> Self {
        let engine = TestPaymentEngine::default();
        engine.refuse.store(true, Ordering::Relaxed);
        engine
    }

    pub fn requests(&self) -> Vec<OutgoingPaymentRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn events(&self) -> mpsc::Sender<PaymentEvent> {
        self.events
            .lock()
            .unwrap()
            .clone()
            .expect("no payment was dispatched")
    }
}

#[async_trait]
impl OutgoingPaymentEngine for TestPaymentEngine {
    async fn send_payment(
        &self,
        request: OutgoingPaymentRequest,
        events: mpsc::Sender<PaymentEvent>,
    ) -> Result<(), BoxError> {
        if self.refuse.load(Ordering::Relaxed) {
            return Err("engine unavailable".into());
        }
        self.requests.lock().unwrap().push(request);
        *self.events.lock().unwrap() = Some(events);
        Ok(())
    }
}

/// Bundles a relay's collaborators with recording fakes, seeded with the usual test policy
/// (base 1000 msat, proportional 100 ppm, expiry delta 40, height 600_000).
pub struct TestHarness {
    pub engine: Arc<TestPaymentEngine>,
    pub register: Arc<RecordingRegister>,
    pub store: Arc<MemoryCommandStore>,
    pub params: Arc<RelayParams>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(Duration::from_secs(5), TestPaymentEngine::default())
    }

    pub fn with_mpp_timeout(mpp_timeout: Duration) -> Self {
        Self::build(mpp_timeout, TestPaymentEngine::default())
    }

    pub fn with_refusing_engine() -> Self {
        Self::build(Duration::from_secs(5), TestPaymentEngine::refusing())
    }

    fn build(mpp_timeout: Duration, engine: TestPaymentEngine) -> Self {
        let engine = Arc::new(engine);
        let register = Arc::new(RecordingRegister::default());
        let store = Arc::new(MemoryCommandStore::new());
        let (event_bus, _) = broadcast::channel(16);

        let config = RelayConfig {
            fee_base_msat: test_policy().fee_base_msat,
            fee_proportional_millionths: test_policy().fee_proportional_millionths,
            expiry_delta: test_policy().expiry_delta,
            max_payment_attempts: 5,
            ..RelayConfig::default()
        };
        let mut params = RelayParams::new(
            &config,
            static_block_source(),
            engine.clone(),
            register.clone(),
            store.clone(),
            event_bus,
            Arc::new(RelayMetrics::new()),
        );
        // Timeouts below one second can't be expressed in the config.
        params.mpp_timeout = mpp_timeout;

        TestHarness {
            engine,
            register,
            store,
            params: Arc::new(params),
        }
    }

    /// Spawns a relay instance for the test payment hash and returns its queue.
    pub fn spawn_relay(&self) -> mpsc::Sender<RelayEvent> {
        let (relay, events) = TrampolineRelay::new(0, test_payment_hash(), self.params.clone());
        tokio::spawn(relay.run());
        events
    }
}
