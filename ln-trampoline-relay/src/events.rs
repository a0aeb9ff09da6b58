use bitcoin::secp256k1::PublicKey;
use lightning::ln::features::Bolt11InvoiceFeatures;
use lightning::ln::types::{ChannelId, PaymentHash, PaymentPreimage, PaymentSecret};
use ln_trampoline_policy::failure::PaymentFailure;
use ln_trampoline_policy::{FailureMessage, IncomingHtlc};
use tokio::sync::mpsc;

use crate::dispatcher::PaymentId;

/// An onion routing packet carried opaquely between trampoline nodes. The relay never peels
/// it, it only re-embeds the packet for the next hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnionPacket {
    pub version: u8,
    pub public_key: PublicKey,
    pub hop_data: Vec<u8>,
    pub hmac: [u8; 32],
}

/// A single hop of a BOLT 11 routing hint, as carried in the invoice data of a payment to a
/// non-trampoline recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HopHint {
    pub node_id: PublicKey,
    pub short_channel_id: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub cltv_expiry_delta: u16,
}

/// The decrypted inner onion payload instructing this node what to forward. Presence of
/// `invoice_features` signals that the next node is the final, non-trampoline recipient.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRelayPayload {
    pub amount_to_forward_msat: u64,
    pub outgoing_cltv: u32,
    pub outgoing_node_id: PublicKey,
    pub payment_secret: Option<PaymentSecret>,
    pub invoice_features: Option<Bolt11InvoiceFeatures>,
    pub invoice_routing_info: Vec<Vec<HopHint>>,
}

/// One incoming htlc of a trampoline payment, decrypted by the onion layer and handed to the
/// relay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingPacket {
    pub add: IncomingHtlc,
    pub payload: NodeRelayPayload,
    pub next_onion: OnionPacket,
}

/// Events reported by the multi-part aggregator for a payment set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AggregatorEvent {
    /// A part arrived after the set was already complete.
    ExtraPartReceived(IncomingHtlc),
    /// The set cannot complete; every part must be failed upstream with `failure`.
    Failed {
        failure: FailureMessage,
        parts: Vec<IncomingHtlc>,
    },
    /// The set is complete and the relay may forward.
    Succeeded { parts: Vec<IncomingHtlc> },
}

/// A settled part of the outgoing payment, as reported by the payment engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayedPart {
    pub channel_id: ChannelId,
    pub amount_msat: u64,
}

/// Events reported by the outgoing payment engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentEvent {
    /// A downstream node revealed the preimage. The payment may still be partially in flight.
    PreimageReceived {
        id: PaymentId,
        preimage: PaymentPreimage,
    },
    /// The payment fully settled downstream.
    Sent {
        id: PaymentId,
        preimage: PaymentPreimage,
        /// The htlcs the engine sent, with amounts including the routing fees paid.
        parts: Vec<RelayedPart>,
    },
    /// The payment failed terminally after exhausting its attempt budget.
    Failed {
        id: PaymentId,
        failures: Vec<PaymentFailure>,
    },
}

/// The tagged-union input of a relay instance's event queue. Collaborators never hold this
/// type directly; thin adapters translate their own event types into it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayEvent {
    Incoming(IncomingPacket),
    Aggregator(AggregatorEvent),
    Payment(PaymentEvent),
}

/// Notification published on the node's event bus once a payment has been fully relayed.
/// Both sides carry one entry per channel, with the amounts of that channel's htlcs summed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrampolinePaymentRelayed {
    pub payment_hash: PaymentHash,
    pub incoming_parts: Vec<RelayedPart>,
    pub outgoing_parts: Vec<RelayedPart>,
}

impl TrampolinePaymentRelayed {
    /// Builds the notification from the settled htlcs, summing amounts per channel on each
    /// side.
    pub fn new(
        payment_hash: PaymentHash,
        incoming_parts: Vec<RelayedPart>,
        outgoing_parts: Vec<RelayedPart>,
    ) -> Self {
        TrampolinePaymentRelayed {
            payment_hash,
            incoming_parts: sum_by_channel(incoming_parts),
            outgoing_parts: sum_by_channel(outgoing_parts),
        }
    }
}

/// Collapses per-htlc amounts into one entry per channel, keeping first-seen channel order.
fn sum_by_channel(parts: Vec<RelayedPart>) -> Vec<RelayedPart> {
    let mut summed: Vec<RelayedPart> = Vec::new();
    for part in parts {
        match summed.iter_mut().find(|p| p.channel_id == part.channel_id) {
            Some(entry) => entry.amount_msat = entry.amount_msat.saturating_add(part.amount_msat),
            None => summed.push(part),
        }
    }
    summed
}

/// Returns a sender the aggregator can report on, forwarding into the relay's own queue.
pub(crate) fn aggregator_adapter(events: mpsc::Sender<RelayEvent>) -> mpsc::Sender<AggregatorEvent> {
    let (tx, mut rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if events.send(RelayEvent::Aggregator(event)).await.is_err() {
                break;
            }
        }
    });
    tx
}

/// Returns a sender the outgoing payment engine can report on, forwarding into the relay's
/// own queue.
pub(crate) fn payment_adapter(events: mpsc::Sender<RelayEvent>) -> mpsc::Sender<PaymentEvent> {
    let (tx, mut rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if events.send(RelayEvent::Payment(event)).await.is_err() {
                break;
            }
        }
    });
    tx
}
