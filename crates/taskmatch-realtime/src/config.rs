//! Real-time coordination configuration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use taskmatch_core::offer::{DEFAULT_OFFER_WINDOW_SECS, MAX_OFFER_WINDOW_SECS};

/// A setting outside the range the components can run with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field} {reason}")]
pub struct InvalidConfig {
    pub field: &'static str,
    pub reason: String,
}

impl InvalidConfig {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), InvalidConfig> {
    if value == 0 {
        return Err(InvalidConfig::new(field, "must be greater than 0"));
    }
    Ok(())
}

fn non_negative(field: &'static str, value: f64) -> Result<(), InvalidConfig> {
    if !value.is_finite() || value < 0.0 {
        return Err(InvalidConfig::new(field, "must be a finite non-negative number"));
    }
    Ok(())
}

/// Channel Manager configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,

    /// First reconnection delay after an unexpected closure (milliseconds).
    pub initial_backoff_ms: u64,

    /// Upper bound for the reconnection delay (milliseconds).
    pub max_backoff_ms: u64,

    /// Random jitter added to each reconnection delay (milliseconds).
    pub backoff_jitter_ms: u64,

    /// Reconnection attempts before giving up and surfacing `Disconnected`.
    pub max_reconnect_attempts: u32,

    /// Capacity of the outbound frame queue; sends beyond it are dropped.
    pub outbound_queue: usize,
}

impl ChannelConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        positive("channel.heartbeat_interval_secs", self.heartbeat_interval_secs)?;
        positive("channel.initial_backoff_ms", self.initial_backoff_ms)?;
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(InvalidConfig::new(
                "channel.max_backoff_ms",
                "must not be below initial_backoff_ms",
            ));
        }
        positive("channel.outbound_queue", self.outbound_queue as u64)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            backoff_jitter_ms: 250,
            max_reconnect_attempts: 5,
            outbound_queue: 64,
        }
    }
}

/// Worker-side offer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfferConfig {
    /// Offer window when the alert does not carry one (seconds).
    pub window_secs: u64,

    /// Emit a countdown tick event every second while an offer is live.
    pub countdown_ticks: bool,

    /// How long a clock expiry waits for a late server confirmation before
    /// it is reported (seconds). Zero reports it at once.
    pub expiry_grace_secs: u64,
}

impl OfferConfig {
    pub fn expiry_grace(&self) -> Duration {
        Duration::from_secs(self.expiry_grace_secs)
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if !taskmatch_core::offer::is_valid_window(self.window_secs) {
            return Err(InvalidConfig::new(
                "offer.window_secs",
                format!("must be between 1 and {}", MAX_OFFER_WINDOW_SECS),
            ));
        }
        if self.expiry_grace_secs > self.window_secs {
            return Err(InvalidConfig::new(
                "offer.expiry_grace_secs",
                "must not exceed window_secs",
            ));
        }
        Ok(())
    }
}

impl Default for OfferConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_OFFER_WINDOW_SECS,
            countdown_ticks: true,
            expiry_grace_secs: 2,
        }
    }
}

/// Requester-side search configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Starting search radius in metres.
    pub min_radius_m: u32,

    /// Radius growth per escalation tick in metres.
    pub radius_step_m: u32,

    /// Radius ceiling in metres.
    pub max_radius_m: u32,

    /// Seconds between escalation ticks.
    pub escalation_interval_secs: u64,

    /// Give up after this many seconds without a match. Zero disables it.
    pub search_timeout_secs: u64,
}

impl SearchConfig {
    pub fn escalation_interval(&self) -> Duration {
        Duration::from_secs(self.escalation_interval_secs)
    }

    pub fn search_timeout(&self) -> Option<Duration> {
        (self.search_timeout_secs > 0).then(|| Duration::from_secs(self.search_timeout_secs))
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.min_radius_m > self.max_radius_m {
            return Err(InvalidConfig::new(
                "search.min_radius_m",
                "must not exceed max_radius_m",
            ));
        }
        positive("search.escalation_interval_secs", self.escalation_interval_secs)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            min_radius_m: 1_000,
            radius_step_m: 1_000,
            max_radius_m: 10_000,
            escalation_interval_secs: 30,
            search_timeout_secs: 300,
        }
    }
}

/// Active-task tracking configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Distance at which the worker is considered near the destination.
    pub arrival_radius_m: f64,

    /// Average travel speed used by the straight-line ETA estimate (m/s).
    pub average_speed_mps: f64,
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        non_negative("tracker.arrival_radius_m", self.arrival_radius_m)?;
        if !self.average_speed_mps.is_finite() || self.average_speed_mps <= 0.0 {
            return Err(InvalidConfig::new(
                "tracker.average_speed_mps",
                "must be a finite positive number",
            ));
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            arrival_radius_m: 100.0,
            average_speed_mps: 8.3,
        }
    }
}

/// Location Reporter configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Sampling interval in seconds.
    pub sample_interval_secs: u64,

    /// Minimum movement before a new sample is pushed (metres).
    pub min_displacement_m: f64,

    /// Minimum spacing of REST fallback posts while the channel is down.
    pub rest_fallback_interval_secs: u64,
}

impl LocationConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_secs(self.sample_interval_secs)
    }

    pub fn rest_fallback_interval(&self) -> Duration {
        Duration::from_secs(self.rest_fallback_interval_secs)
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        positive("location.sample_interval_secs", self.sample_interval_secs)?;
        non_negative("location.min_displacement_m", self.min_displacement_m)
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 5,
            min_displacement_m: 10.0,
            rest_fallback_interval_secs: 30,
        }
    }
}

/// All real-time settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub channel: ChannelConfig,
    pub offer: OfferConfig,
    pub search: SearchConfig,
    pub tracker: TrackerConfig,
    pub location: LocationConfig,
}

impl RealtimeConfig {
    /// Check every section. Components assume a validated config.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        self.channel.validate()?;
        self.offer.validate()?;
        self.search.validate()?;
        self.tracker.validate()?;
        self.location.validate()
    }
}
