use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::calendar::offset_from_minutes;
use crate::model::{HOUR, MINUTE, Ms};

/// Business rules the reservation engine enforces.
#[derive(Debug, Clone)]
pub struct BookingPolicy {
    pub platform_fee_percent: Decimal,
    /// `None` disables the cap.
    pub max_active_bookings: Option<usize>,
    pub same_day_guard: bool,
    pub allow_price_override: bool,
    /// Offset used for weekday and calendar-day evaluation.
    pub utc_offset: FixedOffset,
    pub max_reschedules: u32,
    /// Reschedules are refused once the session is closer than this.
    pub reschedule_cutoff: Ms,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            platform_fee_percent: dec!(20.00),
            max_active_bookings: Some(5),
            same_day_guard: true,
            allow_price_override: false,
            utc_offset: Utc.fix(),
            max_reschedules: 2,
            reschedule_cutoff: 6 * HOUR,
        }
    }
}

/// Background expiry of bookings stuck before payment. Off unless enabled.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub approval_ttl: Ms,
    pub payment_ttl: Ms,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            approval_ttl: 24 * HOUR,
            payment_ttl: 30 * MINUTE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub policy: BookingPolicy,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl Display) -> Self {
        ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl Config {
    /// Read `SLOTBOOK_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = BookingPolicy::default();

        let platform_fee_percent: Decimal =
            parse_or(&lookup, "SLOTBOOK_PLATFORM_FEE_PERCENT", defaults.platform_fee_percent)?;
        if platform_fee_percent < Decimal::ZERO || platform_fee_percent > Decimal::ONE_HUNDRED {
            return Err(ConfigError::invalid(
                "SLOTBOOK_PLATFORM_FEE_PERCENT",
                &platform_fee_percent.to_string(),
                "must be between 0 and 100",
            ));
        }

        let max_active_bookings = match lookup("SLOTBOOK_MAX_ACTIVE_BOOKINGS") {
            None => defaults.max_active_bookings,
            Some(v) if v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("off") => None,
            Some(v) => Some(
                v.parse::<usize>()
                    .map_err(|e| ConfigError::invalid("SLOTBOOK_MAX_ACTIVE_BOOKINGS", &v, e))?,
            ),
        };

        let offset_minutes: i32 = parse_or(&lookup, "SLOTBOOK_UTC_OFFSET_MINUTES", 0)?;
        let utc_offset = offset_from_minutes(offset_minutes).ok_or_else(|| {
            ConfigError::invalid(
                "SLOTBOOK_UTC_OFFSET_MINUTES",
                &offset_minutes.to_string(),
                "offset out of range",
            )
        })?;

        let cutoff_minutes: i64 = parse_or(
            &lookup,
            "SLOTBOOK_RESCHEDULE_CUTOFF_MINUTES",
            defaults.reschedule_cutoff / MINUTE,
        )?;

        let policy = BookingPolicy {
            platform_fee_percent,
            max_active_bookings,
            same_day_guard: parse_or(&lookup, "SLOTBOOK_SAME_DAY_GUARD", defaults.same_day_guard)?,
            allow_price_override: parse_or(
                &lookup,
                "SLOTBOOK_ALLOW_PRICE_OVERRIDE",
                defaults.allow_price_override,
            )?,
            utc_offset,
            max_reschedules: parse_or(&lookup, "SLOTBOOK_MAX_RESCHEDULES", defaults.max_reschedules)?,
            reschedule_cutoff: cutoff_minutes * MINUTE,
        };

        let sweeper_defaults = SweeperConfig::default();
        let interval_secs: u64 = parse_or(
            &lookup,
            "SLOTBOOK_SWEEPER_INTERVAL_SECS",
            sweeper_defaults.interval.as_secs(),
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::invalid(
                "SLOTBOOK_SWEEPER_INTERVAL_SECS",
                "0",
                "must be at least one second",
            ));
        }
        let sweeper = SweeperConfig {
            enabled: parse_or(&lookup, "SLOTBOOK_SWEEPER_ENABLED", sweeper_defaults.enabled)?,
            interval: Duration::from_secs(interval_secs),
            approval_ttl: parse_or(
                &lookup,
                "SLOTBOOK_APPROVAL_TTL_MINUTES",
                sweeper_defaults.approval_ttl / MINUTE,
            )? * MINUTE,
            payment_ttl: parse_or(
                &lookup,
                "SLOTBOOK_PAYMENT_TTL_MINUTES",
                sweeper_defaults.payment_ttl / MINUTE,
            )? * MINUTE,
        };

        let metrics_port = match lookup("SLOTBOOK_METRICS_PORT") {
            None => None,
            Some(v) => Some(
                v.parse::<u16>()
                    .map_err(|e| ConfigError::invalid("SLOTBOOK_METRICS_PORT", &v, e))?,
            ),
        };

        Ok(Self {
            bind: lookup("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "SLOTBOOK_PORT", 7878)?,
            data_dir: PathBuf::from(lookup("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_connections: parse_or(&lookup, "SLOTBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "SLOTBOOK_COMPACT_THRESHOLD", 1000)?,
            metrics_port,
            policy,
            sweeper,
        })
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|e| ConfigError::invalid(key, &v, e)),
    }
}
