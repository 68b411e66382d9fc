// =============================================================================
// Shared types used across the Pulsar screening engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Canonical candlestick timeframes the engine understands.
///
/// Serialized by canonical string ("1m", "5m", …) everywhere: in trader rows,
/// in filter snippets, in the REST API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// All timeframes the engine subscribes to, shortest first.
    pub const ALL: [Timeframe; 7] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// Canonical string identifier, matching the exchange's interval names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
        }
    }

    /// Fixed bar duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 300_000,
            Self::M15 => 900_000,
            Self::M30 => 1_800_000,
            Self::H1 => 3_600_000,
            Self::H4 => 14_400_000,
            Self::D1 => 86_400_000,
        }
    }

    /// Parse a canonical timeframe string. Returns `None` for anything the
    /// engine does not subscribe to.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "5m" => Some(Self::M5),
            "15m" => Some(Self::M15),
            "30m" => Some(Self::M30),
            "1h" => Some(Self::H1),
            "4h" => Some(Self::H4),
            "1d" => Some(Self::D1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Timeframe {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Timeframe {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Timeframe::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown timeframe: {s}")))
    }
}

/// Subscription tier of the owning user. Drives start eligibility and quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
    Elite,
    Anonymous,
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        Self::Free
    }
}

impl SubscriptionTier {
    /// Whether this tier may start traders at all.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Pro | Self::Elite)
    }

    /// Maximum number of concurrently running traders per user.
    pub fn max_running_traders(&self) -> usize {
        match self {
            Self::Free | Self::Anonymous => 0,
            Self::Pro => 5,
            Self::Elite => 20,
        }
    }

    /// Maximum symbols evaluated in parallel within one trader's batch.
    pub fn max_concurrent_analysis(&self) -> usize {
        match self {
            Self::Free | Self::Anonymous => 1,
            Self::Pro => 3,
            Self::Elite => 5,
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pro => write!(f, "pro"),
            Self::Elite => write!(f, "elite"),
            Self::Anonymous => write!(f, "anonymous"),
        }
    }
}

/// Lifecycle state of a trader inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraderState {
    Loaded,
    Starting,
    Running,
    Stopping,
    Stopped,
    Errored,
}

impl Default for TraderState {
    fn default() -> Self {
        Self::Loaded
    }
}

impl std::fmt::Display for TraderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loaded => write!(f, "loaded"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_roundtrip() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::parse(tf.as_str()), Some(tf));
        }
    }

    #[test]
    fn timeframe_unknown_rejected() {
        assert_eq!(Timeframe::parse("2m"), None);
        assert_eq!(Timeframe::parse(""), None);
        assert_eq!(Timeframe::parse("1M"), None);
    }

    #[test]
    fn timeframe_durations_are_consistent() {
        assert_eq!(Timeframe::M1.duration_ms(), 60_000);
        assert_eq!(Timeframe::H1.duration_ms(), 60 * Timeframe::M1.duration_ms());
        assert_eq!(Timeframe::D1.duration_ms(), 24 * Timeframe::H1.duration_ms());
    }

    #[test]
    fn timeframe_serde_uses_canonical_string() {
        let json = serde_json::to_string(&Timeframe::M15).unwrap();
        assert_eq!(json, "\"15m\"");
        let back: Timeframe = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Timeframe::M15);
    }

    #[test]
    fn free_tier_cannot_start() {
        assert!(!SubscriptionTier::Free.can_start());
        assert!(!SubscriptionTier::Anonymous.can_start());
        assert!(SubscriptionTier::Pro.can_start());
        assert!(SubscriptionTier::Elite.can_start());
    }

    #[test]
    fn tier_quotas() {
        assert_eq!(SubscriptionTier::Free.max_running_traders(), 0);
        assert_eq!(SubscriptionTier::Pro.max_running_traders(), 5);
        assert_eq!(SubscriptionTier::Elite.max_running_traders(), 20);
        assert_eq!(SubscriptionTier::Pro.max_concurrent_analysis(), 3);
    }

    #[test]
    fn tier_serde_lowercase() {
        let t: SubscriptionTier = serde_json::from_str("\"elite\"").unwrap();
        assert_eq!(t, SubscriptionTier::Elite);
        assert_eq!(serde_json::to_string(&SubscriptionTier::Free).unwrap(), "\"free\"");
    }
}
