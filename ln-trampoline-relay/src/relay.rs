use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use lightning::ln::types::{PaymentHash, PaymentPreimage, PaymentSecret};
use ln_trampoline_policy::{budget, failure, FailureMessage, IncomingHtlc, TrampolinePolicy};
use tokio::sync::{broadcast, mpsc};

use crate::aggregator::{self, AggregatorHandle};
use crate::config::RelayConfig;
use crate::dispatcher::{self, OutgoingPaymentEngine, PaymentId};
use crate::events::{
    aggregator_adapter, payment_adapter, AggregatorEvent, NodeRelayPayload, OnionPacket,
    PaymentEvent, RelayEvent, RelayedPart, TrampolinePaymentRelayed,
};
use crate::metrics::RelayMetrics;
use crate::settlement::{self, ChannelRegister, PendingCommandStore, RelayCommand};
use crate::BlockSource;

/// Collaborator handles and policy shared by every relay instance on this node.
pub struct RelayParams {
    pub policy: TrampolinePolicy,
    /// Timeout before an incomplete incoming set is failed back, owned by the aggregator.
    pub mpp_timeout: Duration,
    pub max_payment_attempts: u32,
    pub block_source: Arc<dyn BlockSource>,
    pub engine: Arc<dyn OutgoingPaymentEngine>,
    pub register: Arc<dyn ChannelRegister>,
    pub store: Arc<dyn PendingCommandStore>,
    pub event_bus: broadcast::Sender<TrampolinePaymentRelayed>,
    pub metrics: Arc<RelayMetrics>,
}

impl RelayParams {
    /// Assembles relay parameters from a validated [`RelayConfig`] and the node's
    /// collaborator handles.
    pub fn new(
        config: &RelayConfig,
        block_source: Arc<dyn BlockSource>,
        engine: Arc<dyn OutgoingPaymentEngine>,
        register: Arc<dyn ChannelRegister>,
        store: Arc<dyn PendingCommandStore>,
        event_bus: broadcast::Sender<TrampolinePaymentRelayed>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        RelayParams {
            policy: config.policy(),
            mpp_timeout: config.mpp_timeout(),
            max_payment_attempts: config.max_payment_attempts,
            block_source,
            engine,
            register,
            store,
            event_bus,
            metrics,
        }
    }
}

/// State of a relay instance. `Starting` is the instant between instance creation and the
/// first htlc; the payment then moves through `Receiving` and `Sending` to `Terminal`.
enum RelayState {
    Starting,
    Receiving(Receiving),
    Sending(Sending),
    Terminal,
}

struct Receiving {
    parts: Vec<IncomingHtlc>,
    /// The payment secret shared by every part of the set. Htlcs carrying any other secret
    /// are failed individually and never join the set.
    secret: PaymentSecret,
    payload: NodeRelayPayload,
    next_onion: OnionPacket,
    aggregator: AggregatorHandle,
}

struct Sending {
    parts: Vec<IncomingHtlc>,
    amount_in_msat: u64,
    amount_out_msat: u64,
    outgoing_node: PublicKey,
    payment_id: PaymentId,
    /// Latched on the first preimage observation. Once set, upstream is never failed and
    /// never fulfilled again.
    fulfilled_upstream: bool,
}

/// A single-payment relay: aggregates the incoming htlc set, forwards it downstream once
/// complete, and settles every upstream htlc exactly once from the downstream outcome.
///
/// The instance processes one event at a time from its queue and never blocks outside of
/// queue reads; collaborators report back through adapters feeding the same queue.
pub struct TrampolineRelay {
    relay_id: u64,
    payment_hash: PaymentHash,
    params: Arc<RelayParams>,
    events_tx: mpsc::Sender<RelayEvent>,
    queue: mpsc::Receiver<RelayEvent>,
    state: RelayState,
}

impl TrampolineRelay {
    pub fn new(
        relay_id: u64,
        payment_hash: PaymentHash,
        params: Arc<RelayParams>,
    ) -> (Self, mpsc::Sender<RelayEvent>) {
        let (events_tx, queue) = mpsc::channel(32);
        let relay = TrampolineRelay {
            relay_id,
            payment_hash,
            params,
            events_tx: events_tx.clone(),
            queue,
            state: RelayState::Starting,
        };
        (relay, events_tx)
    }

    /// Runs the instance until the payment is resolved and the queue has drained. Late
    /// events that race with resolution are still answered (rejected) before the task ends.
    pub async fn run(mut self) {
        while let Some(event) = self.queue.recv().await {
            self.process(event).await;
        }
        log::debug!("relay {}: done", self.relay_id);
    }

    async fn process(&mut self, event: RelayEvent) {
        let state = std::mem::replace(&mut self.state, RelayState::Terminal);
        self.state = match state {
            RelayState::Starting => self.starting(event).await,
            RelayState::Receiving(receiving) => self.receiving(receiving, event).await,
            RelayState::Sending(sending) => self.sending(sending, event).await,
            RelayState::Terminal => {
                self.terminal(event).await;
                RelayState::Terminal
            }
        };

        if matches!(self.state, RelayState::Terminal) {
            // No new inputs once resolved; whatever is already queued still gets drained.
            self.queue.close();
        }
    }

    async fn starting(&mut self, event: RelayEvent) -> RelayState {
        match event {
            RelayEvent::Incoming(packet) => {
                let add = packet.add;
                let Some(secret) = add.payment_secret else {
                    log::debug!(
                        "relay {}: first htlc {} has no payment secret",
                        self.relay_id,
                        add.htlc_ref()
                    );
                    self.reject_htlc(&add).await;
                    return RelayState::Terminal;
                };

                let aggregator = aggregator::spawn(
                    self.payment_hash,
                    add.total_amount_msat,
                    self.params.mpp_timeout,
                    Arc::clone(&self.params.block_source),
                    aggregator_adapter(self.events_tx.clone()),
                );
                if let Err(e) = aggregator.feed(add.clone()).await {
                    log::warn!("relay {}: {e}", self.relay_id);
                }

                RelayState::Receiving(Receiving {
                    parts: vec![add],
                    secret,
                    payload: packet.payload,
                    next_onion: packet.next_onion,
                    aggregator,
                })
            }
            _ => {
                log::warn!("relay {}: event before the first htlc, ignoring", self.relay_id);
                RelayState::Starting
            }
        }
    }

    async fn receiving(&mut self, mut receiving: Receiving, event: RelayEvent) -> RelayState {
        match event {
            RelayEvent::Incoming(packet) => {
                match packet.add.payment_secret {
                    Some(secret) if secret == receiving.secret => {
                        receiving.parts.push(packet.add.clone());
                        if let Err(e) = receiving.aggregator.feed(packet.add).await {
                            log::warn!("relay {}: {e}", self.relay_id);
                        }
                    }
                    // A missing or mismatched secret fails only the offending htlc: it is a
                    // probe (or a broken sender), not part of the genuine set.
                    _ => self.reject_htlc(&packet.add).await,
                }
                RelayState::Receiving(receiving)
            }
            RelayEvent::Aggregator(AggregatorEvent::Failed { failure, parts }) => {
                receiving.aggregator.stop();
                log::info!(
                    "relay {}: incoming payment failed before completion: {failure}",
                    self.relay_id
                );
                for part in &parts {
                    if receiving
                        .parts
                        .iter()
                        .any(|p| p.htlc_ref() == part.htlc_ref())
                    {
                        self.fail_upstream(part, failure.clone()).await;
                    }
                }
                self.params
                    .metrics
                    .record_payment_relay_failed(failure.class_name());
                RelayState::Terminal
            }
            RelayEvent::Aggregator(AggregatorEvent::Succeeded { parts }) => {
                receiving.aggregator.stop();
                // The aggregator's accounting is authoritative: a late part may have raced
                // past the completed set and must not join it. Reject such parts here; the
                // aggregator's own extra-part report for them may never arrive once it is
                // stopped, and upstream fails are idempotent per htlc anyway.
                for part in &receiving.parts {
                    if !parts.iter().any(|p| p.htlc_ref() == part.htlc_ref()) {
                        self.reject_htlc(part).await;
                    }
                }
                self.dispatch(parts, receiving.payload, receiving.next_onion)
                    .await
            }
            RelayEvent::Aggregator(AggregatorEvent::ExtraPartReceived(add)) => {
                self.reject_htlc(&add).await;
                RelayState::Receiving(receiving)
            }
            RelayEvent::Payment(_) => {
                log::warn!(
                    "relay {}: payment event before anything was dispatched, ignoring",
                    self.relay_id
                );
                RelayState::Receiving(receiving)
            }
        }
    }

    /// Validates the sender's budget for the completed set and hands the outgoing payment to
    /// the engine. Runs at most once per instance: only the `Receiving` success path reaches
    /// it.
    async fn dispatch(
        &mut self,
        parts: Vec<IncomingHtlc>,
        payload: NodeRelayPayload,
        next_onion: OnionPacket,
    ) -> RelayState {
        let amount_in_msat: u64 = parts.iter().map(|p| p.amount_msat).sum();
        let Some(expiry_in) = parts.iter().map(|p| p.expiry).min() else {
            log::error!("relay {}: completed set has no parts", self.relay_id);
            return RelayState::Terminal;
        };

        if let Err(reason) = budget::validate_relay(
            &self.params.policy,
            amount_in_msat,
            expiry_in,
            payload.amount_to_forward_msat,
            payload.outgoing_cltv,
        ) {
            log::info!("relay {}: rejecting payment: {reason}", self.relay_id);
            self.fail_all(&parts, reason.clone()).await;
            self.params
                .metrics
                .record_payment_relay_failed(reason.class_name());
            return RelayState::Terminal;
        }

        let route_params = budget::route_params(
            &self.params.policy,
            amount_in_msat,
            expiry_in,
            payload.amount_to_forward_msat,
            payload.outgoing_cltv,
        );
        let request = dispatcher::build_outgoing(
            self.payment_hash,
            &payload,
            next_onion,
            route_params,
            self.params.max_payment_attempts,
        );
        let payment_id = request.payment_id;

        log::info!(
            "relay {}: relaying {} msat in as {} msat to {} (payment {payment_id})",
            self.relay_id,
            amount_in_msat,
            payload.amount_to_forward_msat,
            payload.outgoing_node_id
        );

        let events = payment_adapter(self.events_tx.clone());
        if let Err(e) = self.params.engine.send_payment(request, events).await {
            // The engine refusing to even start is a local problem; the sender's budget was
            // fine, so don't invite a pointless fee retry.
            log::error!("relay {}: payment engine refused dispatch: {e}", self.relay_id);
            self.fail_all(&parts, FailureMessage::TemporaryNodeFailure).await;
            self.params
                .metrics
                .record_payment_relay_failed(FailureMessage::TemporaryNodeFailure.class_name());
            return RelayState::Terminal;
        }

        RelayState::Sending(Sending {
            parts,
            amount_in_msat,
            amount_out_msat: payload.amount_to_forward_msat,
            outgoing_node: payload.outgoing_node_id,
            payment_id,
            fulfilled_upstream: false,
        })
    }

    async fn sending(&mut self, mut sending: Sending, event: RelayEvent) -> RelayState {
        match event {
            // The payment is committed downstream: any late htlc is rejected outright,
            // whatever secret it carries.
            RelayEvent::Incoming(packet) => {
                self.reject_htlc(&packet.add).await;
                RelayState::Sending(sending)
            }
            RelayEvent::Aggregator(AggregatorEvent::ExtraPartReceived(add)) => {
                self.reject_htlc(&add).await;
                RelayState::Sending(sending)
            }
            RelayEvent::Aggregator(_) => {
                log::warn!(
                    "relay {}: stale aggregator event after dispatch, ignoring",
                    self.relay_id
                );
                RelayState::Sending(sending)
            }
            RelayEvent::Payment(event) => {
                if payment_event_id(&event) != sending.payment_id {
                    log::warn!(
                        "relay {}: event for unknown payment {}, ignoring",
                        self.relay_id,
                        payment_event_id(&event)
                    );
                    return RelayState::Sending(sending);
                }

                match event {
                    PaymentEvent::PreimageReceived { preimage, .. } => {
                        self.fulfill_once(&mut sending, preimage).await;
                        RelayState::Sending(sending)
                    }
                    PaymentEvent::Sent {
                        preimage,
                        parts: outgoing_parts,
                        ..
                    } => {
                        self.fulfill_once(&mut sending, preimage).await;
                        let relayed = TrampolinePaymentRelayed::new(
                            self.payment_hash,
                            sending
                                .parts
                                .iter()
                                .map(|p| RelayedPart {
                                    channel_id: p.channel_id,
                                    amount_msat: p.amount_msat,
                                })
                                .collect(),
                            outgoing_parts,
                        );
                        let _ = self.params.event_bus.send(relayed);
                        self.params.metrics.record_payment_relayed();
                        RelayState::Terminal
                    }
                    PaymentEvent::Failed { failures, .. } => {
                        if sending.fulfilled_upstream {
                            // TODO: reconcile a partially settled outgoing payment whose
                            // remaining parts failed. For now the upstream set is already
                            // settled with the preimage and there is nothing sound to undo.
                            log::warn!(
                                "relay {}: payment {} failed after upstream was fulfilled",
                                self.relay_id,
                                sending.payment_id
                            );
                            return RelayState::Sending(sending);
                        }

                        let reason = failure::translate(
                            &failures,
                            sending.amount_in_msat,
                            sending.amount_out_msat,
                            &sending.outgoing_node,
                            &self.params.policy,
                        )
                        .unwrap_or(FailureMessage::TemporaryNodeFailure);
                        log::info!(
                            "relay {}: payment {} failed downstream, failing upstream with {reason}",
                            self.relay_id,
                            sending.payment_id
                        );
                        self.fail_all(&sending.parts, reason.clone()).await;
                        self.params
                            .metrics
                            .record_payment_relay_failed(reason.class_name());
                        RelayState::Terminal
                    }
                }
            }
        }
    }

    async fn terminal(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Incoming(packet) => self.reject_htlc(&packet.add).await,
            RelayEvent::Aggregator(AggregatorEvent::ExtraPartReceived(add)) => {
                self.reject_htlc(&add).await
            }
            _ => log::debug!("relay {}: event after resolution, ignoring", self.relay_id),
        }
    }

    /// Fails a single htlc that cannot belong to this payment, without touching the rest of
    /// the set.
    async fn reject_htlc(&self, add: &IncomingHtlc) {
        let height = self.params.block_source.current_height().await;
        self.fail_upstream(
            add,
            FailureMessage::IncorrectOrUnknownPaymentDetails {
                amount_msat: add.amount_msat,
                height,
            },
        )
        .await;
    }

    async fn fail_upstream(&self, add: &IncomingHtlc, reason: FailureMessage) {
        settlement::safe_send(
            self.params.store.as_ref(),
            self.params.register.as_ref(),
            RelayCommand::Fail {
                htlc: add.htlc_ref(),
                reason,
            },
        )
        .await;
    }

    async fn fail_all(&self, parts: &[IncomingHtlc], reason: FailureMessage) {
        for part in parts {
            self.fail_upstream(part, reason.clone()).await;
        }
    }

    /// Fulfills every upstream htlc with the preimage, exactly once per instance no matter
    /// how often the downstream payment reports it.
    async fn fulfill_once(&self, sending: &mut Sending, preimage: PaymentPreimage) {
        if sending.fulfilled_upstream {
            return;
        }

        for part in &sending.parts {
            settlement::safe_send(
                self.params.store.as_ref(),
                self.params.register.as_ref(),
                RelayCommand::Fulfill {
                    htlc: part.htlc_ref(),
                    preimage,
                },
            )
            .await;
        }
        sending.fulfilled_upstream = true;
    }
}

fn payment_event_id(event: &PaymentEvent) -> PaymentId {
    match event {
        PaymentEvent::PreimageReceived { id, .. } => *id,
        PaymentEvent::Sent { id, .. } => *id,
        PaymentEvent::Failed { id, .. } => *id,
    }
}
