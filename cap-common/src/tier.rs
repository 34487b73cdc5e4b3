//! Cap levels (reputation tiers)
//!
//! Tiers form a strict total order:
//! NONE < GREEN < YELLOW < RED < BLACK < OSTRICH_FEATHER
//!
//! The derived `Ord` follows declaration order, so `a > b` means "a ranks above b".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reputation tier of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapLevel {
    None,
    Green,
    Yellow,
    Red,
    Black,
    OstrichFeather,
}

impl CapLevel {
    /// All tiers in ascending rank order
    pub const ALL: [CapLevel; 6] = [
        CapLevel::None,
        CapLevel::Green,
        CapLevel::Yellow,
        CapLevel::Red,
        CapLevel::Black,
        CapLevel::OstrichFeather,
    ];

    /// Lowest tier; authors at this rank never receive ad revenue
    pub const LOWEST: CapLevel = CapLevel::None;

    /// Database / wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CapLevel::None => "NONE",
            CapLevel::Green => "GREEN",
            CapLevel::Yellow => "YELLOW",
            CapLevel::Red => "RED",
            CapLevel::Black => "BLACK",
            CapLevel::OstrichFeather => "OSTRICH_FEATHER",
        }
    }

    /// Zero-based rank (NONE = 0)
    pub fn rank(&self) -> i64 {
        match self {
            CapLevel::None => 0,
            CapLevel::Green => 1,
            CapLevel::Yellow => 2,
            CapLevel::Red => 3,
            CapLevel::Black => 4,
            CapLevel::OstrichFeather => 5,
        }
    }

    /// Parse a tier name, case-insensitive
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Some(CapLevel::None),
            "GREEN" => Some(CapLevel::Green),
            "YELLOW" => Some(CapLevel::Yellow),
            "RED" => Some(CapLevel::Red),
            "BLACK" => Some(CapLevel::Black),
            "OSTRICH_FEATHER" => Some(CapLevel::OstrichFeather),
            _ => None,
        }
    }
}

impl Default for CapLevel {
    fn default() -> Self {
        CapLevel::None
    }
}

impl fmt::Display for CapLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CapLevel::parse(s).ok_or_else(|| crate::Error::InvalidInput(format!("Unknown cap level: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_matches_ordering() {
        for pair in CapLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].rank() < pair[1].rank());
        }
    }

    #[test]
    fn test_parse_round_trips_every_tier() {
        for tier in CapLevel::ALL {
            assert_eq!(CapLevel::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(CapLevel::parse("ostrich_feather"), Some(CapLevel::OstrichFeather));
        assert_eq!(CapLevel::parse("PURPLE"), None);
    }

    #[test]
    fn test_from_str_rejects_unknown() {
        assert!("MAGENTA".parse::<CapLevel>().is_err());
        assert_eq!("green".parse::<CapLevel>().unwrap(), CapLevel::Green);
    }

    #[test]
    fn test_serde_uses_screaming_snake_case() {
        let json = serde_json::to_string(&CapLevel::OstrichFeather).unwrap();
        assert_eq!(json, "\"OSTRICH_FEATHER\"");
        let back: CapLevel = serde_json::from_str("\"YELLOW\"").unwrap();
        assert_eq!(back, CapLevel::Yellow);
    }
}
