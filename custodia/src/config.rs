// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use anyhow::{anyhow, Context as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::telegram::TelegramConfig;

/// The treasury wallet that funds all outbound withdrawals and referral
/// bonuses. `key_ref` is an opaque reference into the external keystore; the
/// engine never holds key material itself.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TreasuryConfig {
    pub address: String,
    pub key_ref: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EngineConfig {
    pub treasury: TreasuryConfig,

    // Thresholds, in smallest units.
    #[serde(default = "default_min_deposit")]
    pub min_deposit: u64,
    #[serde(default = "default_min_withdrawal")]
    pub min_withdrawal: u64,

    // Referral bonus rate in basis points (600 = 6%).
    #[serde(default = "default_referral_rate_bps")]
    pub referral_rate_bps: u32,

    // Days for the balance to double.
    #[serde(default = "default_growth_period_days")]
    pub growth_period_days: f64,

    // Decimal places of the display unit.
    #[serde(default = "default_unit_decimals")]
    pub unit_decimals: u32,

    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_confirm_poll_secs")]
    pub confirm_poll_secs: u64,
    #[serde(default = "default_rpc_max_elapsed_secs")]
    pub rpc_max_elapsed_secs: u64,

    // Cross-account parallelism bound for background sweeps.
    #[serde(default = "default_settlement_concurrency")]
    pub settlement_concurrency: usize,

    #[serde(default)]
    pub sweeps: SweepIntervals,

    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SweepIntervals {
    pub deposit_scan_secs: u64,
    pub balance_refresh_secs: u64,
    pub auto_withdrawal_secs: u64,
    pub auto_reinvest_secs: u64,
    pub reconcile_secs: u64,
    pub reminder_secs: u64,
}

impl Default for SweepIntervals {
    fn default() -> Self {
        Self {
            deposit_scan_secs: 120,
            balance_refresh_secs: 300,
            auto_withdrawal_secs: 600,
            auto_reinvest_secs: 600,
            reconcile_secs: 60,
            reminder_secs: 21_600,
        }
    }
}

fn default_min_deposit() -> u64 {
    100_000_000
}
fn default_min_withdrawal() -> u64 {
    1_000_000_000
}
fn default_referral_rate_bps() -> u32 {
    600
}
fn default_growth_period_days() -> f64 {
    10.0
}
fn default_unit_decimals() -> u32 {
    9
}
fn default_lock_timeout_secs() -> u64 {
    300
}
fn default_confirm_timeout_secs() -> u64 {
    90
}
fn default_confirm_poll_secs() -> u64 {
    2
}
fn default_rpc_max_elapsed_secs() -> u64 {
    30
}
fn default_settlement_concurrency() -> usize {
    8
}

impl EngineConfig {
    /// Load from a YAML or JSON file, decided by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {:?}", path))?;
        let config: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.treasury.address.is_empty() || self.treasury.key_ref.is_empty() {
            return Err(anyhow!("treasury address and key-ref must be configured"));
        }
        if self.growth_period_days <= 0.0 {
            return Err(anyhow!(
                "growth-period-days must be positive, got {}",
                self.growth_period_days
            ));
        }
        if self.referral_rate_bps > 10_000 {
            return Err(anyhow!(
                "referral-rate-bps {} exceeds 100%",
                self.referral_rate_bps
            ));
        }
        if self.confirm_poll_secs == 0 || self.confirm_poll_secs > self.confirm_timeout_secs {
            return Err(anyhow!(
                "confirm-poll-secs must be in 1..=confirm-timeout-secs"
            ));
        }
        if self.settlement_concurrency == 0 {
            return Err(anyhow!("settlement-concurrency must be at least 1"));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn confirm_poll_interval(&self) -> Duration {
        Duration::from_secs(self.confirm_poll_secs)
    }

    pub fn rpc_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.rpc_max_elapsed_secs)
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            treasury: TreasuryConfig {
                address: "TREASURY_ADDR".to_string(),
                key_ref: "treasury-key".to_string(),
            },
            min_deposit: default_min_deposit(),
            min_withdrawal: default_min_withdrawal(),
            referral_rate_bps: default_referral_rate_bps(),
            growth_period_days: default_growth_period_days(),
            unit_decimals: default_unit_decimals(),
            lock_timeout_secs: default_lock_timeout_secs(),
            confirm_timeout_secs: 2,
            confirm_poll_secs: 1,
            rpc_max_elapsed_secs: 1,
            settlement_concurrency: 4,
            sweeps: SweepIntervals::default(),
            telegram: TelegramConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_with_defaults() {
        let yaml = r#"
treasury:
  address: "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin"
  key-ref: "treasury"
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.min_withdrawal, 1_000_000_000);
        assert_eq!(config.referral_rate_bps, 600);
        assert_eq!(config.growth_period_days, 10.0);
        assert_eq!(config.lock_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_kebab_case_overrides() {
        let yaml = r#"
treasury:
  address: "addr"
  key-ref: "key"
min-withdrawal: 5000000000
referral-rate-bps: 250
growth-period-days: 14.0
sweeps:
  reconcile-secs: 30
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.min_withdrawal, 5_000_000_000);
        assert_eq!(config.referral_rate_bps, 250);
        assert_eq!(config.growth_period_days, 14.0);
        assert_eq!(config.sweeps.reconcile_secs, 30);
        // Unspecified sweep intervals keep their defaults.
        assert_eq!(config.sweeps.reminder_secs, 21_600);
    }

    #[test]
    fn test_validate_rejects_empty_treasury() {
        let mut config = EngineConfig::for_testing();
        config.treasury.address.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_rate() {
        let mut config = EngineConfig::for_testing();
        config.referral_rate_bps = 10_001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_period() {
        let mut config = EngineConfig::for_testing();
        config.growth_period_days = 0.0;
        assert!(config.validate().is_err());
    }
}
