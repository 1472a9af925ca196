use std::net::IpAddr;
use std::time::Duration;

use ipnetwork::IpNetwork;

use crate::error::RejectionReason;
use crate::types::WebhookEnvelope;

/// Origin checks applied after the signature has been verified.
///
/// Both halves are optional: freshness runs only when `max_age` is set,
/// and the allow-list runs only when at least one network or a bearer
/// credential is configured. A configured allow-list fails closed —
/// an envelope matching no rule is denied, not admitted.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    /// Maximum accepted age of the signed timestamp.
    pub max_age: Option<Duration>,

    /// Tolerance added on both sides of the freshness window for clock
    /// skew between this host and the provider.
    pub clock_skew_tolerance: Duration,

    /// Source networks allowed to deliver webhooks.
    pub allowed_networks: Vec<IpNetwork>,

    /// Expected bearer credential, checked against the Authorization
    /// header.
    pub bearer_token: Option<String>,
}

impl OriginPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable freshness checking with the given window. The default
    /// provider window is 300 seconds.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_clock_skew_tolerance(mut self, tolerance: Duration) -> Self {
        self.clock_skew_tolerance = tolerance;
        self
    }

    /// Allow deliveries from a CIDR range, e.g. `"203.0.113.0/24"`.
    /// Invalid ranges are ignored rather than matched.
    pub fn with_allowed_network(mut self, cidr: &str) -> Self {
        if let Ok(network) = cidr.parse::<IpNetwork>() {
            self.allowed_networks.push(network);
        }
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Check the signed timestamp against the freshness window.
    ///
    /// Rejects when `|now - claimed| > max_age + skew`, defending against
    /// replay of old but otherwise validly-signed payloads.
    pub fn check_freshness(
        &self,
        claimed_timestamp_secs: u64,
        now_secs: u64,
    ) -> Result<(), RejectionReason> {
        let Some(max_age) = self.max_age else {
            return Ok(());
        };

        let window = max_age.as_secs() + self.clock_skew_tolerance.as_secs();
        let age = now_secs.abs_diff(claimed_timestamp_secs);
        if age > window {
            return Err(RejectionReason::StaleTimestamp);
        }
        Ok(())
    }

    /// Check the envelope's source against the allow-list.
    ///
    /// Admission requires either a source address inside a configured
    /// network or a matching bearer credential. With nothing configured
    /// the check is disabled.
    pub fn check_source(&self, envelope: &WebhookEnvelope) -> Result<(), RejectionReason> {
        if self.allowed_networks.is_empty() && self.bearer_token.is_none() {
            return Ok(());
        }

        if let Some(address) = envelope.source_address {
            if self.matches_network(&address) {
                return Ok(());
            }
        }

        if let Some(expected) = self.bearer_token.as_deref() {
            if let Some(header) = envelope.header("Authorization") {
                if let Some(presented) = header.strip_prefix("Bearer ") {
                    if presented == expected {
                        return Ok(());
                    }
                }
            }
        }

        Err(RejectionReason::OriginDenied)
    }

    /// Both checks in envelope order: freshness, then allow-list.
    pub fn validate(
        &self,
        envelope: &WebhookEnvelope,
        claimed_timestamp_secs: u64,
        now_secs: u64,
    ) -> Result<(), RejectionReason> {
        self.check_freshness(claimed_timestamp_secs, now_secs)?;
        self.check_source(envelope)
    }

    fn matches_network(&self, address: &IpAddr) -> bool {
        self.allowed_networks
            .iter()
            .any(|network| network.contains(*address))
    }
}
