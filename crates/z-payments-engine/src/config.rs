//! Engine configuration.

use std::time::Duration;

/// Tunables of the transaction engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a fresh idempotency reservation blocks other callers if no
    /// result is stored (default: 60s). Must exceed the gateway timeout.
    pub reservation_lease: Duration,

    /// How long a finalized result is replayed (default: 24h).
    pub result_retention: Duration,

    /// How long a caller waits for a concurrent holder of the same key before
    /// being told to retry (default: 2s).
    pub in_flight_wait: Duration,

    /// Poll interval while waiting on a concurrent holder (default: 100ms).
    pub in_flight_poll: Duration,

    /// Validity of a browser authorization code (default: 15 minutes).
    pub authorization_code_validity: Duration,

    /// Extra time after an authorization code expires before the pending
    /// browser transaction is reconciled (default: 15 minutes).
    pub pending_callback_grace: Duration,

    /// Age after which a non-browser `Pending` transaction is considered
    /// orphaned by a crashed holder (default: 5 minutes).
    pub stale_pending_after: Duration,

    /// Bank turnaround window for pre-notes (default: 3 days).
    pub ach_turnaround: Duration,

    /// Whether ACH debits require a verified payment method (default: true).
    pub require_verified_ach: bool,

    /// Recurring billing policy.
    pub billing: BillingPolicy,
}

/// Recurring billing policy.
#[derive(Debug, Clone)]
pub struct BillingPolicy {
    /// Subscriptions charged concurrently (default: 4).
    pub parallelism: usize,

    /// Gateway calls per merchant per minute (default: 90).
    pub rate_limit_per_minute: u32,

    /// Consecutive failures after which a `Pause` subscription is paused
    /// (default: 2).
    pub pause_after_failures: u32,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            parallelism: 4,
            rate_limit_per_minute: 90,
            pause_after_failures: 2,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reservation_lease: Duration::from_secs(60),
            result_retention: Duration::from_secs(24 * 60 * 60),
            in_flight_wait: Duration::from_secs(2),
            in_flight_poll: Duration::from_millis(100),
            authorization_code_validity: Duration::from_secs(15 * 60),
            pending_callback_grace: Duration::from_secs(15 * 60),
            stale_pending_after: Duration::from_secs(5 * 60),
            ach_turnaround: Duration::from_secs(3 * 24 * 60 * 60),
            require_verified_ach: true,
            billing: BillingPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let billing = BillingPolicy {
            parallelism: env_parse("BILLING_PARALLELISM")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.billing.parallelism),
            rate_limit_per_minute: env_parse("BILLING_RATE_LIMIT_PER_MINUTE")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.billing.rate_limit_per_minute),
            pause_after_failures: env_parse("BILLING_PAUSE_AFTER_FAILURES")
                .unwrap_or(defaults.billing.pause_after_failures),
        };

        Self {
            reservation_lease: env_secs("IDEMPOTENCY_LEASE_SECONDS")
                .unwrap_or(defaults.reservation_lease),
            result_retention: env_secs("IDEMPOTENCY_RETENTION_SECONDS")
                .unwrap_or(defaults.result_retention),
            in_flight_wait: env_millis("IDEMPOTENCY_WAIT_MS").unwrap_or(defaults.in_flight_wait),
            in_flight_poll: env_millis("IDEMPOTENCY_POLL_MS").unwrap_or(defaults.in_flight_poll),
            authorization_code_validity: env_secs("AUTHORIZATION_CODE_VALIDITY_SECONDS")
                .unwrap_or(defaults.authorization_code_validity),
            pending_callback_grace: env_secs("PENDING_CALLBACK_GRACE_SECONDS")
                .unwrap_or(defaults.pending_callback_grace),
            stale_pending_after: env_secs("STALE_PENDING_SECONDS")
                .unwrap_or(defaults.stale_pending_after),
            ach_turnaround: env_secs("ACH_TURNAROUND_SECONDS").unwrap_or(defaults.ach_turnaround),
            require_verified_ach: env_parse("REQUIRE_VERIFIED_ACH")
                .unwrap_or(defaults.require_verified_ach),
            billing,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse(name).map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse(name).map(Duration::from_millis)
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
