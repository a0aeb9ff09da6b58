pub mod budget;
pub mod failure;

use std::error::Error;
use std::fmt::Display;

use lightning::ln::types::{ChannelId, PaymentHash, PaymentSecret};

/// The total supply of bitcoin expressed in millisatoshis.
const SUPPLY_CAP_MSAT: u64 = 21000000 * 100000000 * 1000;

/// Failure message bits defined by BOLT 4.
pub const PERM: u16 = 0x4000;
pub const NODE: u16 = 0x2000;
pub const UPDATE: u16 = 0x1000;

#[derive(Debug, PartialEq, Eq)]
pub enum RelayError {
    /// The htlc amount exceeds the bitcoin supply cap.
    ErrAmountExceedsSupply(u64),
    /// A collaborator channel was closed before the relay resolved.
    ErrCollaboratorClosed(String),
}

impl Error for RelayError {}

impl Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::ErrAmountExceedsSupply(amt) => {
                write!(f, "msat amount {amt} exceeds bitcoin supply")
            }
            RelayError::ErrCollaboratorClosed(name) => {
                write!(f, "collaborator {name} closed unexpectedly")
            }
        }
    }
}

/// A unique identifier for a htlc on a channel (payment hash may be repeated for mpp payments).
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub struct HtlcRef {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
}

impl Display for HtlcRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.htlc_id)
    }
}

/// An incoming htlc as surfaced by the channel layer, together with the outer payload fields
/// that bind it to a multi-part payment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingHtlc {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    pub amount_msat: u64,
    /// Absolute block height at which the htlc times out on chain.
    pub expiry: u32,
    pub payment_hash: PaymentHash,
    /// The payment secret from the outer payload. Absent on malformed or probing htlcs.
    pub payment_secret: Option<PaymentSecret>,
    /// The total amount the sender declared for the whole multi-part set.
    pub total_amount_msat: u64,
}

impl IncomingHtlc {
    pub fn htlc_ref(&self) -> HtlcRef {
        HtlcRef {
            channel_id: self.channel_id,
            htlc_id: self.htlc_id,
        }
    }
}

/// The node's advertised trampoline fee and timelock policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TrampolinePolicy {
    pub fee_base_msat: u64,
    pub fee_proportional_millionths: u64,
    /// The minimum difference between incoming and outgoing htlc expiries, in blocks.
    pub expiry_delta: u32,
}

impl Default for TrampolinePolicy {
    fn default() -> Self {
        TrampolinePolicy {
            fee_base_msat: 1000,
            fee_proportional_millionths: 100,
            expiry_delta: 144,
        }
    }
}

impl TrampolinePolicy {
    /// The fee this node charges for forwarding `amount_msat`, in msat. Integer arithmetic,
    /// truncating after the proportional division.
    pub fn node_fee(&self, amount_msat: u64) -> u64 {
        self.fee_base_msat + amount_msat * self.fee_proportional_millionths / 1_000_000
    }
}

/// BOLT 4 failure messages the relay emits upstream or forwards verbatim from downstream
/// nodes. Wire names are retained because they are protocol constants.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FailureMessage {
    IncorrectOrUnknownPaymentDetails { amount_msat: u64, height: u32 },
    PaymentTimeout,
    TemporaryNodeFailure,
    TemporaryChannelFailure,
    FeeInsufficient { amount_msat: u64 },
    UnknownNextPeer,
    TrampolineFeeInsufficient,
    TrampolineExpiryTooSoon,
}

impl FailureMessage {
    /// The BOLT 4 failure code for this message.
    pub fn failure_code(&self) -> u16 {
        match self {
            FailureMessage::IncorrectOrUnknownPaymentDetails { .. } => PERM | 15,
            FailureMessage::PaymentTimeout => 23,
            FailureMessage::TemporaryNodeFailure => NODE | 2,
            FailureMessage::TemporaryChannelFailure => UPDATE | 7,
            FailureMessage::FeeInsufficient { .. } => UPDATE | 12,
            FailureMessage::UnknownNextPeer => PERM | 10,
            FailureMessage::TrampolineFeeInsufficient => NODE | 51,
            FailureMessage::TrampolineExpiryTooSoon => NODE | 52,
        }
    }

    /// A stable name for the failure class, used to label relay metrics.
    pub fn class_name(&self) -> &'static str {
        match self {
            FailureMessage::IncorrectOrUnknownPaymentDetails { .. } => {
                "IncorrectOrUnknownPaymentDetails"
            }
            FailureMessage::PaymentTimeout => "PaymentTimeout",
            FailureMessage::TemporaryNodeFailure => "TemporaryNodeFailure",
            FailureMessage::TemporaryChannelFailure => "TemporaryChannelFailure",
            FailureMessage::FeeInsufficient { .. } => "FeeInsufficient",
            FailureMessage::UnknownNextPeer => "UnknownNextPeer",
            FailureMessage::TrampolineFeeInsufficient => "TrampolineFeeInsufficient",
            FailureMessage::TrampolineExpiryTooSoon => "TrampolineExpiryTooSoon",
        }
    }
}

impl Display for FailureMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureMessage::IncorrectOrUnknownPaymentDetails { amount_msat, height } => {
                write!(
                    f,
                    "incorrect_or_unknown_payment_details({amount_msat} msat, height {height})"
                )
            }
            FailureMessage::PaymentTimeout => write!(f, "mpp_timeout"),
            FailureMessage::TemporaryNodeFailure => write!(f, "temporary_node_failure"),
            FailureMessage::TemporaryChannelFailure => write!(f, "temporary_channel_failure"),
            FailureMessage::FeeInsufficient { amount_msat } => {
                write!(f, "fee_insufficient({amount_msat} msat)")
            }
            FailureMessage::UnknownNextPeer => write!(f, "unknown_next_peer"),
            FailureMessage::TrampolineFeeInsufficient => write!(f, "trampoline_fee_insufficient"),
            FailureMessage::TrampolineExpiryTooSoon => write!(f, "trampoline_expiry_too_soon"),
        }
    }
}

/// Validates that an msat amount doesn't exceed the total supply cap of bitcoin and casts to
/// i64 to be used in places where we're dealing with differences. Once we've validated that
/// we're below the supply cap, we can safely cast because the cap is well below [`i64::MAX`].
pub fn validate_msat(amount_msat: u64) -> Result<i64, RelayError> {
    debug_assert!(
        SUPPLY_CAP_MSAT < i64::MAX as u64,
        "supply cap: {SUPPLY_CAP_MSAT} overflows i64"
    );

    if amount_msat > SUPPLY_CAP_MSAT {
        return Err(RelayError::ErrAmountExceedsSupply(amount_msat));
    }

    Ok(i64::try_from(amount_msat).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_fee() {
        let policy = TrampolinePolicy {
            fee_base_msat: 1000,
            fee_proportional_millionths: 100,
            expiry_delta: 40,
        };

        // 1000 base + 950_000 * 100 / 1_000_000 = 1095.
        assert_eq!(policy.node_fee(950_000), 1095);
        assert_eq!(policy.node_fee(0), 1000);
        // Truncation after the division, no rounding.
        assert_eq!(policy.node_fee(9_999), 1000);
        assert_eq!(policy.node_fee(10_000), 1001);
    }

    #[test]
    fn test_validate_msat() {
        assert_eq!(validate_msat(21_000_000 * 100_000_000 * 1000).unwrap() as u64, SUPPLY_CAP_MSAT);
        assert!(matches!(
            validate_msat(SUPPLY_CAP_MSAT + 1),
            Err(RelayError::ErrAmountExceedsSupply(_))
        ));
    }

    #[test]
    fn test_failure_codes() {
        assert_eq!(FailureMessage::TemporaryNodeFailure.failure_code(), 0x2002);
        assert_eq!(FailureMessage::TrampolineFeeInsufficient.failure_code(), 0x2033);
        assert_eq!(FailureMessage::TrampolineExpiryTooSoon.failure_code(), 0x2034);
        assert_eq!(
            FailureMessage::IncorrectOrUnknownPaymentDetails {
                amount_msat: 0,
                height: 0
            }
            .failure_code(),
            0x400f
        );
        assert_eq!(FailureMessage::PaymentTimeout.failure_code(), 23);
    }
}
