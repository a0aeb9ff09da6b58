use bitcoin::secp256k1::PublicKey;

use crate::{FailureMessage, TrampolinePolicy};

/// Multiplier applied to the node fee to decide whether a sender already paid enough that a
/// local liquidity shortage should not be reported as a fee problem.
const DIRECT_CHANNEL_FEE_MULTIPLIER: u64 = 5;

/// Failures reported by the outgoing payment engine for a single payment attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentFailure {
    /// The attempt failed inside this node, before reaching any remote hop.
    Local(LocalFailure),
    /// A remote node failed the attempt with the given message.
    Remote {
        origin: PublicKey,
        failure: FailureMessage,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalFailure {
    RouteNotFound,
    BalanceTooLow,
    Other,
}

/// Maps the downstream failures of an outgoing payment to the single failure message reported
/// upstream. Returns `None` when there are no failures to translate.
///
/// `TrampolineFeeInsufficient` invites the sender to retry with a higher fee budget, which may
/// unlock indirect routes. `TemporaryNodeFailure` is reserved for the case where the sender
/// already paid generously and the bottleneck is local liquidity on a direct channel, so that
/// a retry with more fees would be useless.
pub fn translate(
    failures: &[PaymentFailure],
    amount_in_msat: u64,
    amount_out_msat: u64,
    outgoing_node: &PublicKey,
    policy: &TrampolinePolicy,
) -> Option<FailureMessage> {
    if failures.is_empty() {
        return None;
    }

    if let [PaymentFailure::Local(LocalFailure::BalanceTooLow)] = failures {
        let fee_margin_msat = amount_in_msat.saturating_sub(amount_out_msat);
        return if fee_margin_msat
            >= DIRECT_CHANNEL_FEE_MULTIPLIER * policy.node_fee(amount_out_msat)
        {
            Some(FailureMessage::TemporaryNodeFailure)
        } else {
            Some(FailureMessage::TrampolineFeeInsufficient)
        };
    }

    if failures
        .iter()
        .any(|f| matches!(f, PaymentFailure::Local(LocalFailure::RouteNotFound)))
    {
        return Some(FailureMessage::TrampolineFeeInsufficient);
    }

    let mut first_remote = None;
    for failure in failures {
        if let PaymentFailure::Remote { origin, failure } = failure {
            if origin == outgoing_node {
                return Some(failure.clone());
            }
            if first_remote.is_none() {
                first_remote = Some(failure.clone());
            }
        }
    }

    if let Some(failure) = first_remote {
        return Some(failure);
    }

    Some(FailureMessage::TemporaryNodeFailure)
}
