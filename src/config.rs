//! Service configuration

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use crate::carrier::ghtk;
use crate::vnpay;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; the in-memory store is used without one
    pub database_url: Option<String>,
    pub port: u16,
    pub nats_url: Option<String>,
    /// Environment: development | staging | production
    pub environment: String,
    /// GHTK API token; the sandbox carrier is used without one (development only)
    pub ghtk_api_token: Option<String>,
    pub ghtk_base_url: String,
    /// Shared secret GHTK appends as `?hash=` to webhook calls
    pub ghtk_webhook_token: String,
    pub vnpay_tmn_code: String,
    pub vnpay_hash_secret: String,
    pub vnpay_pay_url: String,
    pub vnpay_return_url: String,
    pub voucher_reservation_ttl: Duration,
    pub shipment_poll_interval: Duration,
    pub reservation_sweep_interval: Duration,
    pub platform_commission_rate: Decimal,
}

fn optional(name: &str) -> Option<String> { std::env::var(name).ok().filter(|s| !s.is_empty()) }

fn seconds(name: &str, default: u64) -> Duration {
    Duration::from_secs(optional(name).and_then(|v| v.parse().ok()).filter(|s| *s > 0).unwrap_or(default))
}

impl Config {
    /// Require a secret env var: must be set and non-empty in non-development environments.
    fn require_secret(name: &str, environment: &str) -> Result<String, BoxError> {
        let val = match std::env::var(name) {
            Ok(v) => v,
            Err(_) => {
                if environment != "development" {
                    return Err(format!("{name} must be set in {environment} environment").into());
                }
                format!("dev-{name}-not-for-production")
            }
        };
        if val.is_empty() && environment != "development" {
            return Err(format!("{name} must not be empty in {environment} environment").into());
        }
        Ok(val)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, BoxError> {
        let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into());
        let is_development = environment == "development";

        let ghtk_api_token = optional("GHTK_API_TOKEN");
        if ghtk_api_token.is_none() && !is_development {
            return Err(format!("GHTK_API_TOKEN must be set in {environment} environment").into());
        }
        let platform_commission_rate = match optional("PLATFORM_COMMISSION_RATE") {
            Some(raw) => Decimal::from_str(&raw).map_err(|e| format!("PLATFORM_COMMISSION_RATE: {e}"))?,
            None => Decimal::new(5, 2),
        };
        if platform_commission_rate < Decimal::ZERO || platform_commission_rate > Decimal::ONE {
            return Err(format!("PLATFORM_COMMISSION_RATE {platform_commission_rate} must be within [0, 1]").into());
        }

        Ok(Self {
            database_url: optional("DATABASE_URL"),
            port: optional("PORT").and_then(|p| p.parse().ok()).unwrap_or(8083),
            nats_url: optional("NATS_URL"),
            ghtk_api_token,
            ghtk_base_url: optional("GHTK_BASE_URL").unwrap_or_else(|| {
                if is_development { ghtk::STAGING_URL.into() } else { ghtk::PRODUCTION_URL.into() }
            }),
            ghtk_webhook_token: Self::require_secret("GHTK_WEBHOOK_TOKEN", &environment)?,
            vnpay_tmn_code: Self::require_secret("VNPAY_TMN_CODE", &environment)?,
            vnpay_hash_secret: Self::require_secret("VNPAY_HASH_SECRET", &environment)?,
            vnpay_pay_url: optional("VNPAY_PAY_URL").unwrap_or_else(|| vnpay::SANDBOX_PAY_URL.into()),
            vnpay_return_url: optional("VNPAY_RETURN_URL").unwrap_or_else(|| "http://localhost:8083/payments/vnpay/return".into()),
            voucher_reservation_ttl: seconds("VOUCHER_RESERVATION_TTL_SECS", 900),
            shipment_poll_interval: seconds("SHIPMENT_POLL_INTERVAL_SECS", 300),
            reservation_sweep_interval: seconds("RESERVATION_SWEEP_INTERVAL_SECS", 60),
            platform_commission_rate,
            environment,
        })
    }

    pub fn is_development(&self) -> bool { self.environment == "development" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_falls_back_on_missing_or_zero() {
        assert_eq!(seconds("MARKETPLACE_TEST_UNSET_SECS", 42), Duration::from_secs(42));
        std::env::set_var("MARKETPLACE_TEST_ZERO_SECS", "0");
        assert_eq!(seconds("MARKETPLACE_TEST_ZERO_SECS", 60), Duration::from_secs(60));
        std::env::set_var("MARKETPLACE_TEST_SWEEP_SECS", "15");
        assert_eq!(seconds("MARKETPLACE_TEST_SWEEP_SECS", 60), Duration::from_secs(15));
    }

    #[test]
    fn test_secrets_required_outside_development() {
        assert!(Config::require_secret("MARKETPLACE_TEST_MISSING_SECRET", "production").is_err());
        let dev = Config::require_secret("MARKETPLACE_TEST_MISSING_SECRET", "development").unwrap();
        assert!(dev.starts_with("dev-"));
    }
}
