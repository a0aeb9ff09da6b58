use std::sync::Arc;
use std::time::Duration;

use lightning::ln::types::PaymentHash;
use ln_trampoline_policy::{FailureMessage, IncomingHtlc, RelayError};
use tokio::sync::mpsc;
use tokio::{select, time};
use triggered::{Listener, Trigger};

use crate::events::AggregatorEvent;
use crate::BlockSource;

/// Handle to a running part aggregator. Dropping the handle does not stop the task; the relay
/// stops it explicitly once the set has resolved.
pub struct AggregatorHandle {
    parts: mpsc::Sender<IncomingHtlc>,
    stop: Trigger,
}

impl AggregatorHandle {
    /// Hands an incoming part to the aggregator. The part has already been checked against the
    /// set's payment secret by the relay.
    pub async fn feed(&self, htlc: IncomingHtlc) -> Result<(), RelayError> {
        self.parts
            .send(htlc)
            .await
            .map_err(|_| RelayError::ErrCollaboratorClosed("part aggregator".to_string()))
    }

    pub fn stop(&self) {
        self.stop.trigger();
    }
}

/// Spawns an aggregator that collects parts for `payment_hash` until they sum up to the total
/// the sender declared, the receive timeout expires, or a part contradicts the declared total.
/// Events are reported on `events`; parts arriving after completion are reported as extras.
pub fn spawn(
    payment_hash: PaymentHash,
    total_amount_msat: u64,
    timeout: Duration,
    block_source: Arc<dyn BlockSource>,
    events: mpsc::Sender<AggregatorEvent>,
) -> AggregatorHandle {
    let (parts_tx, parts_rx) = mpsc::channel(16);
    let (stop, listener) = triggered::trigger();

    tokio::spawn(run(
        payment_hash,
        total_amount_msat,
        timeout,
        block_source,
        events,
        parts_rx,
        listener,
    ));

    AggregatorHandle {
        parts: parts_tx,
        stop,
    }
}

async fn run(
    payment_hash: PaymentHash,
    total_amount_msat: u64,
    timeout: Duration,
    block_source: Arc<dyn BlockSource>,
    events: mpsc::Sender<AggregatorEvent>,
    mut parts_rx: mpsc::Receiver<IncomingHtlc>,
    listener: Listener,
) {
    let deadline = time::Instant::now() + timeout;
    let mut parts: Vec<IncomingHtlc> = Vec::new();
    let mut received_msat: u64 = 0;
    let mut complete = false;

    loop {
        select! {
            _ = listener.clone() => return,

            _ = time::sleep_until(deadline), if !complete => {
                log::debug!(
                    "payment {payment_hash:?} timed out with {received_msat} of {total_amount_msat} msat received"
                );
                let _ = events
                    .send(AggregatorEvent::Failed {
                        failure: FailureMessage::PaymentTimeout,
                        parts,
                    })
                    .await;
                return;
            }

            part = parts_rx.recv() => {
                let Some(part) = part else { return };

                if complete {
                    let _ = events.send(AggregatorEvent::ExtraPartReceived(part)).await;
                    continue;
                }

                // All parts must agree on the declared total; a contradicting part poisons
                // the whole set.
                if part.total_amount_msat != total_amount_msat {
                    let height = block_source.current_height().await;
                    parts.push(part);
                    let _ = events
                        .send(AggregatorEvent::Failed {
                            failure: FailureMessage::IncorrectOrUnknownPaymentDetails {
                                amount_msat: total_amount_msat,
                                height,
                            },
                            parts,
                        })
                        .await;
                    return;
                }

                received_msat = received_msat.saturating_add(part.amount_msat);
                parts.push(part);

                if received_msat >= total_amount_msat {
                    complete = true;
                    let _ = events
                        .send(AggregatorEvent::Succeeded {
                            parts: parts.clone(),
                        })
                        .await;
                }
            }
        }
    }
}
