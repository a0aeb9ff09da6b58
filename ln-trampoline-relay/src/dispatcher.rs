use std::fmt::Display;

use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use lightning::ln::types::{PaymentHash, PaymentSecret};
use ln_trampoline_policy::budget::RouteParams;
use rand::Rng;
use tokio::sync::mpsc;

use crate::events::{HopHint, NodeRelayPayload, OnionPacket, PaymentEvent};
use crate::BoxError;

/// Identifier of one outgoing payment attempt set, scoped to this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PaymentId(pub u64);

impl PaymentId {
    pub fn new() -> Self {
        PaymentId(rand::random())
    }
}

impl Default for PaymentId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PaymentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The shape of the outgoing payment, decided by the inner payload's invoice fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutgoingPayment {
    /// A single htlc to a recipient that doesn't support multi-part payments, carrying the
    /// payload's secret (which may be absent) in the final payload.
    SinglePart { payment_secret: Option<PaymentSecret> },
    /// Multi-part payment to the next trampoline node. Bound by a freshly generated payment
    /// secret so that downstream nodes cannot correlate it with the incoming set, and carrying
    /// the re-encrypted trampoline onion for the next hop.
    MultiPartTrampoline {
        payment_secret: PaymentSecret,
        trampoline_onion: OnionPacket,
    },
    /// Multi-part payment directly to a non-trampoline recipient, using the payment secret and
    /// routing hints from its invoice.
    MultiPartDirect {
        payment_secret: PaymentSecret,
        routing_hints: Vec<Vec<HopHint>>,
    },
}

/// A fully specified outgoing payment handed to the payment engine. Built exactly once per
/// relay instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutgoingPaymentRequest {
    pub payment_id: PaymentId,
    pub payment_hash: PaymentHash,
    pub recipient: PublicKey,
    pub amount_msat: u64,
    pub expiry: u32,
    pub payment: OutgoingPayment,
    pub route_params: RouteParams,
    pub max_attempts: u32,
    /// Always false: persistence of the relay is the settlement path's responsibility.
    pub store_in_db: bool,
    /// Always false: the relay publishes its own event once upstream is fulfilled.
    pub publish_event: bool,
}

/// Builds the outgoing payment request for the completed incoming set. The variant is chosen
/// from the payload: no invoice features means the next node is another trampoline, invoice
/// features with multi-part support (and an invoice secret) allow splitting to the final
/// recipient, anything else degrades to a single part.
pub fn build_outgoing(
    payment_hash: PaymentHash,
    payload: &NodeRelayPayload,
    next_onion: OnionPacket,
    route_params: RouteParams,
    max_attempts: u32,
) -> OutgoingPaymentRequest {
    let payment = match &payload.invoice_features {
        None => OutgoingPayment::MultiPartTrampoline {
            payment_secret: fresh_payment_secret(),
            trampoline_onion: next_onion,
        },
        Some(features) => match (features.supports_basic_mpp(), payload.payment_secret) {
            (true, Some(payment_secret)) => OutgoingPayment::MultiPartDirect {
                payment_secret,
                routing_hints: payload.invoice_routing_info.clone(),
            },
            _ => OutgoingPayment::SinglePart {
                payment_secret: payload.payment_secret,
            },
        },
    };

    OutgoingPaymentRequest {
        payment_id: PaymentId::new(),
        payment_hash,
        recipient: payload.outgoing_node_id,
        amount_msat: payload.amount_to_forward_msat,
        expiry: payload.outgoing_cltv,
        payment,
        route_params,
        max_attempts,
        store_in_db: false,
        publish_event: false,
    }
}

fn fresh_payment_secret() -> PaymentSecret {
    let mut secret = [0u8; 32];
    rand::rng().fill(&mut secret[..]);
    PaymentSecret(secret)
}

/// The engine that actually sends the outgoing payment, injected into the relay so tests can
/// substitute it. The engine owns retries and the outbound timeout; it reports progress and
/// its terminal outcome on `events`.
#[async_trait]
pub trait OutgoingPaymentEngine: Send + Sync {
    async fn send_payment(
        &self,
        request: OutgoingPaymentRequest,
        events: mpsc::Sender<PaymentEvent>,
    ) -> Result<(), BoxError>;
}
