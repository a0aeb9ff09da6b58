use std::time::Duration;

use ln_trampoline_policy::TrampolinePolicy;
use serde::{Deserialize, Serialize};

use crate::BoxError;

/// Default base fee charged per relayed payment, in msat.
pub const DEFAULT_FEE_BASE_MSAT: u64 = 1000;

/// Default proportional fee charged per relayed payment, in millionths of the forwarded amount.
pub const DEFAULT_FEE_PROPORTIONAL_MILLIONTHS: u64 = 100;

/// Default minimum difference between incoming and outgoing htlc expiries, in blocks.
pub const DEFAULT_EXPIRY_DELTA: u32 = 144;

/// Default attempt budget handed to the outgoing payment engine.
pub const DEFAULT_MAX_PAYMENT_ATTEMPTS: u32 = 5;

/// Default timeout before an incomplete multi-part set is failed back, in seconds.
pub const DEFAULT_MPP_TIMEOUT_SECONDS: u64 = 60;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub fee_base_msat: u64,
    pub fee_proportional_millionths: u64,
    pub expiry_delta: u32,
    pub max_payment_attempts: u32,
    pub mpp_timeout_seconds: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            fee_base_msat: DEFAULT_FEE_BASE_MSAT,
            fee_proportional_millionths: DEFAULT_FEE_PROPORTIONAL_MILLIONTHS,
            expiry_delta: DEFAULT_EXPIRY_DELTA,
            max_payment_attempts: DEFAULT_MAX_PAYMENT_ATTEMPTS,
            mpp_timeout_seconds: DEFAULT_MPP_TIMEOUT_SECONDS,
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), BoxError> {
        if self.expiry_delta == 0 {
            return Err("expiry_delta must be at least one block".into());
        }

        if self.max_payment_attempts == 0 {
            return Err("max_payment_attempts must be non-zero".into());
        }

        if self.mpp_timeout_seconds == 0 {
            return Err("mpp_timeout_seconds must be non-zero".into());
        }

        Ok(())
    }

    pub fn policy(&self) -> TrampolinePolicy {
        TrampolinePolicy {
            fee_base_msat: self.fee_base_msat,
            fee_proportional_millionths: self.fee_proportional_millionths,
            expiry_delta: self.expiry_delta,
        }
    }

    pub fn mpp_timeout(&self) -> Duration {
        Duration::from_secs(self.mpp_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RelayConfig;

    #[test]
    fn test_defaults_validate() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.policy().fee_base_msat, 1000);
        assert_eq!(config.mpp_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        let mut config = RelayConfig {
            expiry_delta: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());

        config.expiry_delta = 40;
        config.max_payment_attempts = 0;
        assert!(config.validate().is_err());

        config.max_payment_attempts = 5;
        config.mpp_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }
}
