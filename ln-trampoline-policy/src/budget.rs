use crate::{validate_msat, FailureMessage, TrampolinePolicy};

/// Route constraints handed to the outgoing payment engine. The relay only ever spends the
/// fee and timelock budget the sender explicitly paid for, so the proportional fee bound is
/// always zero and the whole budget is expressed in the base fee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RouteParams {
    pub max_fee_base_msat: u64,
    pub max_fee_proportional_percent: u64,
    pub max_cltv: u32,
}

/// Checks that the sender's offered fee and timelock budget are sufficient for this node to
/// relay. Strict insufficiency fails: a payment offering exactly the node fee (or exactly the
/// expiry delta) is accepted.
pub fn validate_relay(
    policy: &TrampolinePolicy,
    amount_in_msat: u64,
    expiry_in: u32,
    amount_out_msat: u64,
    expiry_out: u32,
) -> Result<(), FailureMessage> {
    // Amounts above the supply cap cannot be genuine and would overflow the fee arithmetic.
    if validate_msat(amount_in_msat).is_err() || validate_msat(amount_out_msat).is_err() {
        return Err(FailureMessage::TrampolineFeeInsufficient);
    }

    if amount_in_msat < amount_out_msat
        || amount_in_msat - amount_out_msat < policy.node_fee(amount_out_msat)
    {
        return Err(FailureMessage::TrampolineFeeInsufficient);
    }

    if expiry_in < expiry_out || expiry_in - expiry_out < policy.expiry_delta {
        return Err(FailureMessage::TrampolineExpiryTooSoon);
    }

    Ok(())
}

/// Derives the route constraints for the outgoing payment from the budget left over once this
/// node's fee and expiry delta are taken. Only meaningful after [`validate_relay`] has passed,
/// which guarantees the subtractions cannot underflow.
pub fn route_params(
    policy: &TrampolinePolicy,
    amount_in_msat: u64,
    expiry_in: u32,
    amount_out_msat: u64,
    expiry_out: u32,
) -> RouteParams {
    RouteParams {
        max_fee_base_msat: amount_in_msat - amount_out_msat - policy.node_fee(amount_out_msat),
        max_fee_proportional_percent: 0,
        max_cltv: expiry_in - expiry_out - policy.expiry_delta,
    }
}
