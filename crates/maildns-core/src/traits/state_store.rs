// # State Store Trait
//
// Defines the hand-off between the one-shot initializer and the long-running
// watch loop.
//
// ## Purpose
//
// After a successful reconciliation the detected network identity is
// persisted, so that a (re)started watcher compares against what is
// actually published instead of re-deriving it. The store also carries the
// restart marker that tells a co-located liveness check to recycle the
// relay process after its incoming address moved.
//
// ## Document Format
//
// ```json
// {
//   "incoming_ip": "1.2.3.4",
//   "outbound_ip": "5.6.7.8",
//   "all_ips": ["1.2.3.4", "5.6.7.8"],
//   "updated_at": "2025-01-09T12:00:00Z"
// }
// ```
//
// `outbound_ip` is an empty string when no outbound address was detected.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

/// Network identity detected for the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedState {
    /// Address published in the A record
    pub incoming_ip: IpAddr,
    /// Address outbound mail leaves from, when known
    pub outbound_ip: Option<IpAddr>,
    /// Every address authorised in SPF
    pub all_ips: BTreeSet<IpAddr>,
}

impl DetectedState {
    /// Create a state; an empty `all_ips` set falls back to `{incoming_ip}`
    pub fn new(
        incoming_ip: IpAddr,
        outbound_ip: Option<IpAddr>,
        all_ips: impl IntoIterator<Item = IpAddr>,
    ) -> Self {
        let mut all_ips: BTreeSet<IpAddr> = all_ips.into_iter().collect();
        if all_ips.is_empty() {
            all_ips.insert(incoming_ip);
        }
        Self {
            incoming_ip,
            outbound_ip,
            all_ips,
        }
    }

    /// Address whose PTR should point at the relay
    pub fn ptr_ip(&self) -> IpAddr {
        self.outbound_ip.unwrap_or(self.incoming_ip)
    }
}

impl fmt::Display for DetectedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "incoming IP {}, outbound IP ", self.incoming_ip)?;
        match self.outbound_ip {
            Some(ip) => write!(f, "{}", ip)?,
            None => f.write_str("-")?,
        }
        let all: Vec<String> = self.all_ips.iter().map(ToString::to_string).collect();
        write!(f, ", all IPs [{}]", all.join(", "))
    }
}

/// Serialized form of [`DetectedState`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDocument {
    /// Incoming address, empty when unknown
    #[serde(default)]
    pub incoming_ip: String,
    /// Outbound address, empty when unknown
    #[serde(default)]
    pub outbound_ip: String,
    /// All authorised addresses
    #[serde(default)]
    pub all_ips: Vec<String>,
    /// Time the document was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl StateDocument {
    /// Document for a state, stamped with the current time
    pub fn from_state(state: &DetectedState) -> Self {
        Self {
            incoming_ip: state.incoming_ip.to_string(),
            outbound_ip: state
                .outbound_ip
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            all_ips: state.all_ips.iter().map(ToString::to_string).collect(),
            updated_at: Some(chrono::Utc::now()),
        }
    }

    /// Decode into a state
    ///
    /// Returns `None` when the incoming address is missing or unparseable.
    /// Unparseable entries elsewhere are dropped with a warning.
    pub fn into_state(self) -> Option<DetectedState> {
        let incoming_ip: IpAddr = self.incoming_ip.trim().parse().ok()?;

        let outbound_ip = match self.outbound_ip.trim() {
            "" => None,
            raw => match raw.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!("Ignoring invalid outbound_ip in state document: {}", raw);
                    None
                }
            },
        };

        let all_ips = self.all_ips.iter().filter_map(|raw| match raw.trim().parse() {
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!("Ignoring invalid address in state document: {}", raw);
                None
            }
        });

        Some(DetectedState::new(incoming_ip, outbound_ip, all_ips.collect::<Vec<_>>()))
    }
}

/// Trait for state store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
/// Writers are expected to be serialized by construction (initializer then
/// watcher), but readers in other processes may observe a document at any
/// moment, so writes must never expose a partial document.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last persisted state
    ///
    /// # Returns
    ///
    /// - `Ok(Some(state))`: A state with an incoming address
    /// - `Ok(None)`: Nothing persisted yet
    /// - `Err(Error)`: Storage error
    async fn load(&self) -> Result<Option<DetectedState>, crate::Error>;

    /// Persist a fully applied state
    async fn save(&self, state: &DetectedState) -> Result<(), crate::Error>;

    /// Signal the co-located relay process to restart
    async fn request_restart(&self) -> Result<(), crate::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(raw: &str) -> IpAddr {
        raw.parse().unwrap()
    }

    #[test]
    fn empty_all_ips_falls_back_to_incoming() {
        let state = DetectedState::new(ip("1.2.3.4"), None, Vec::new());
        assert_eq!(state.all_ips, BTreeSet::from([ip("1.2.3.4")]));
        assert_eq!(state.ptr_ip(), ip("1.2.3.4"));
    }

    #[test]
    fn display_summarizes_addresses() {
        let state = DetectedState::new(ip("1.2.3.4"), None, Vec::new());
        assert_eq!(
            state.to_string(),
            "incoming IP 1.2.3.4, outbound IP -, all IPs [1.2.3.4]"
        );

        let state = DetectedState::new(ip("1.2.3.4"), Some(ip("5.6.7.8")), vec![ip("5.6.7.8")]);
        assert_eq!(
            state.to_string(),
            "incoming IP 1.2.3.4, outbound IP 5.6.7.8, all IPs [5.6.7.8]"
        );
    }

    #[test]
    fn ptr_prefers_outbound() {
        let state = DetectedState::new(ip("1.2.3.4"), Some(ip("5.6.7.8")), Vec::new());
        assert_eq!(state.ptr_ip(), ip("5.6.7.8"));
    }

    #[test]
    fn document_encodes_missing_outbound_as_empty_string() {
        let state = DetectedState::new(ip("1.2.3.4"), None, vec![ip("1.2.3.4")]);
        let json = serde_json::to_value(StateDocument::from_state(&state)).unwrap();
        assert_eq!(json["incoming_ip"], "1.2.3.4");
        assert_eq!(json["outbound_ip"], "");
        assert_eq!(json["all_ips"], serde_json::json!(["1.2.3.4"]));
    }

    #[test]
    fn document_without_incoming_is_no_state() {
        let doc: StateDocument =
            serde_json::from_str(r#"{"incoming_ip":"","outbound_ip":"","all_ips":[]}"#).unwrap();
        assert!(doc.into_state().is_none());
    }

    #[test]
    fn document_decodes_and_drops_garbage() {
        let doc: StateDocument = serde_json::from_str(
            r#"{"incoming_ip":"1.2.3.4","outbound_ip":"nope","all_ips":["1.2.3.4","x","5.6.7.8"]}"#,
        )
        .unwrap();
        let state = doc.into_state().unwrap();
        assert_eq!(state.outbound_ip, None);
        assert_eq!(state.all_ips, BTreeSet::from([ip("1.2.3.4"), ip("5.6.7.8")]));
    }
}
