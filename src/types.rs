// =============================================================================
// Shared types used across the Argus analysis engine
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Timeframe
// =============================================================================

/// Candle aggregation timeframe. The set is closed; the wire strings
/// (`"1m"`, `"5m"`, ...) are part of the WebSocket and REST contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    D1,
}

impl Timeframe {
    /// Every supported timeframe, shortest first.
    pub const ALL: [Timeframe; 6] = [
        Timeframe::M1,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::D1,
    ];

    /// Bucket duration in milliseconds.
    pub fn duration_ms(self) -> i64 {
        match self {
            Timeframe::M1 => 60_000,
            Timeframe::M5 => 300_000,
            Timeframe::M15 => 900_000,
            Timeframe::M30 => 1_800_000,
            Timeframe::H1 => 3_600_000,
            Timeframe::D1 => 86_400_000,
        }
    }

    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::D1 => "1d",
        }
    }

    /// Start of the bucket containing `ts_ms`. Buckets are half-open
    /// `[start, start + duration)`, so a timestamp equal to a bucket end
    /// floors into the *next* bucket.
    pub fn bucket_start(self, ts_ms: i64) -> i64 {
        let dur = self.duration_ms();
        ts_ms.div_euclid(dur) * dur
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!("unknown timeframe: {other}")),
        }
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
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Market status
// =============================================================================

/// Exchange session status derived from the wall clock and the calendar.
/// Used as a hint by the cache policy and the tick gate; never authoritative
/// for data correctness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketStatus {
    Open,
    Closed,
    Weekend,
    Holiday,
    Pre,
    Post,
}

impl MarketStatus {
    pub fn is_open(self) -> bool {
        self == MarketStatus::Open
    }
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MarketStatus::Open => "OPEN",
            MarketStatus::Closed => "CLOSED",
            MarketStatus::Weekend => "WEEKEND",
            MarketStatus::Holiday => "HOLIDAY",
            MarketStatus::Pre => "PRE",
            MarketStatus::Post => "POST",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Bias
// =============================================================================

/// Directional verdict shared by analyzers, horizons, and the final decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bias {
    Bullish,
    Bearish,
    Neutral,
}

impl Bias {
    /// Lenient parse for values coming back from the language model.
    pub fn parse_lenient(s: &str) -> Option<Bias> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bullish" | "buy" | "long" | "up" => Some(Bias::Bullish),
            "bearish" | "sell" | "short" | "down" => Some(Bias::Bearish),
            "neutral" | "hold" | "flat" | "sideways" => Some(Bias::Neutral),
            _ => None,
        }
    }

    pub fn opposite(self) -> Bias {
        match self {
            Bias::Bullish => Bias::Bearish,
            Bias::Bearish => Bias::Bullish,
            Bias::Neutral => Bias::Neutral,
        }
    }
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Bias::Bullish => "Bullish",
            Bias::Bearish => "Bearish",
            Bias::Neutral => "Neutral",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Horizon
// =============================================================================

/// Analysis horizon within a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Horizon {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

impl Horizon {
    pub const ALL: [Horizon; 3] = [Horizon::ShortTerm, Horizon::MediumTerm, Horizon::LongTerm];

    pub fn as_str(self) -> &'static str {
        match self {
            Horizon::ShortTerm => "short_term",
            Horizon::MediumTerm => "medium_term",
            Horizon::LongTerm => "long_term",
        }
    }
}

impl std::fmt::Display for Horizon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tick
// =============================================================================

/// A single trade/quote update from the broker feed. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Broker's numeric instrument identifier.
    pub token: i64,
    /// Last traded price.
    pub price: f64,
    /// Volume as reported by the feed. Whether this is a cumulative daily
    /// figure or a per-tick delta is declared by the feed adapter, never
    /// inferred.
    pub volume_traded: f64,
    /// UTC millisecond epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
}
