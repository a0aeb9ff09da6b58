use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lightning::ln::types::PaymentHash;
use tokio::sync::{mpsc, Mutex};
use tokio_util::task::TaskTracker;

use crate::events::{IncomingPacket, RelayEvent};
use crate::relay::{RelayParams, TrampolineRelay};

/// Routes incoming trampoline packets to per-payment relay instances, spawning a fresh
/// instance whenever a payment hash has no live relay. A payment hash can be relayed again
/// after its previous instance resolved: the next htlc simply starts a new set.
pub struct TrampolineRelayer {
    params: Arc<RelayParams>,
    relays: Arc<Mutex<HashMap<PaymentHash, mpsc::Sender<RelayEvent>>>>,
    tracker: TaskTracker,
    next_relay_id: AtomicU64,
}

impl TrampolineRelayer {
    pub fn new(params: Arc<RelayParams>) -> Self {
        TrampolineRelayer {
            params,
            relays: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            next_relay_id: AtomicU64::new(0),
        }
    }

    /// Hands an incoming htlc to the relay instance owning its payment hash.
    pub async fn relay(&self, packet: IncomingPacket) {
        let payment_hash = packet.add.payment_hash;
        let mut relays = self.relays.lock().await;

        let mut event = RelayEvent::Incoming(packet);
        if let Some(instance) = relays.get(&payment_hash) {
            match instance.send(event).await {
                Ok(()) => return,
                // The previous instance resolved and closed its queue; replace it.
                Err(send_error) => event = send_error.0,
            }
        }

        let relay_id = self.next_relay_id.fetch_add(1, Ordering::Relaxed);
        let (relay, instance) = TrampolineRelay::new(relay_id, payment_hash, Arc::clone(&self.params));

        let relays_by_hash = Arc::clone(&self.relays);
        self.tracker.spawn(async move {
            relay.run().await;

            // Drop the map entry unless a replacement instance already took the hash.
            let mut relays = relays_by_hash.lock().await;
            if relays
                .get(&payment_hash)
                .map(|instance| instance.is_closed())
                .unwrap_or(false)
            {
                relays.remove(&payment_hash);
            }
        });

        if instance.send(event).await.is_err() {
            log::error!("freshly spawned relay {relay_id} rejected its first htlc");
        }
        relays.insert(payment_hash, instance);
    }

    /// Stops accepting new payments and waits for the in-flight relays to resolve.
    pub async fn shutdown(&self) {
        self.relays.lock().await.clear();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
