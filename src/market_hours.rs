// =============================================================================
// Market Hours & Cache Policy
// =============================================================================
//
// Derives the exchange session status from the wall clock and the configured
// calendar, and decides live-vs-historical sourcing with a freshness TTL per
// (status, interval). The status is a hint: the tick gate and the cache use
// it, but data correctness never depends on it.
// =============================================================================

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use serde::Serialize;

use crate::runtime_config::CalendarConfig;
use crate::types::{MarketStatus, Timeframe};

// =============================================================================
// Source policy
// =============================================================================

/// Where a dataset should come from, and how long it stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceClass {
    Live,
    Recent,
    Historical,
}

/// Recommendation produced by [`MarketCalendar::source_for`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SourcePlan {
    pub source: SourceClass,
    pub ttl_seconds: u64,
}

// =============================================================================
// Calendar
// =============================================================================

/// Session calendar for a single exchange.
pub struct MarketCalendar {
    offset: FixedOffset,
    pre_open_minute: u32,
    open_minute: u32,
    close_minute: u32,
    post_close_minute: u32,
    holidays: Vec<NaiveDate>,
}

impl MarketCalendar {
    pub fn new(cfg: &CalendarConfig) -> Self {
        let offset = FixedOffset::east_opt(cfg.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));

        let holidays = cfg
            .holidays
            .iter()
            .filter_map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .collect();

        Self {
            offset,
            pre_open_minute: cfg.pre_open_minute,
            open_minute: cfg.open_minute,
            close_minute: cfg.close_minute,
            post_close_minute: cfg.post_close_minute,
            holidays,
        }
    }

    /// Session status at the given UTC millisecond epoch.
    pub fn status_at(&self, ts_ms: i64) -> MarketStatus {
        let local = match self.to_local(ts_ms) {
            Some(dt) => dt,
            None => return MarketStatus::Closed,
        };

        match local.weekday() {
            chrono::Weekday::Sat | chrono::Weekday::Sun => return MarketStatus::Weekend,
            _ => {}
        }

        if self.holidays.contains(&local.date_naive()) {
            return MarketStatus::Holiday;
        }

        let minute = local.hour() * 60 + local.minute();
        if minute >= self.open_minute && minute < self.close_minute {
            MarketStatus::Open
        } else if minute >= self.pre_open_minute && minute < self.open_minute {
            MarketStatus::Pre
        } else if minute >= self.close_minute && minute < self.post_close_minute {
            MarketStatus::Post
        } else {
            MarketStatus::Closed
        }
    }

    /// Current session status.
    pub fn status_now(&self) -> MarketStatus {
        self.status_at(Utc::now().timestamp_millis())
    }

    /// UTC millisecond epoch of the next session open at or after `ts_ms`.
    pub fn next_open(&self, ts_ms: i64) -> Option<i64> {
        let local = self.to_local(ts_ms)?;
        let mut date = local.date_naive();

        // If today's open is still ahead and today is a trading day, use it.
        let minute = local.hour() * 60 + local.minute();
        if minute >= self.open_minute || !self.is_trading_day(date) {
            date = date.succ_opt()?;
        }

        for _ in 0..30 {
            if self.is_trading_day(date) {
                let open = date
                    .and_hms_opt(self.open_minute / 60, self.open_minute % 60, 0)?
                    .and_local_timezone(self.offset)
                    .single()?;
                return Some(open.with_timezone(&Utc).timestamp_millis());
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// Live-vs-historical recommendation with TTL for a dataset request.
    ///
    /// TTL table (seconds), by status x interval, per the freshness contract:
    ///
    /// | interval | OPEN | otherwise |
    /// |----------|------|-----------|
    /// | 1m       | 60   | 3600      |
    /// | 5m       | 300  | 3600      |
    /// | 15m/30m  | 900  | 3600      |
    /// | 1h       | 3600 | 7200      |
    /// | 1d       | 3600 | 86400     |
    pub fn source_for(&self, interval: Timeframe, status: MarketStatus) -> SourcePlan {
        let ttl_seconds = match (status, interval) {
            (MarketStatus::Open, Timeframe::M1) => 60,
            (MarketStatus::Open, Timeframe::M5) => 300,
            (MarketStatus::Open, Timeframe::M15 | Timeframe::M30) => 900,
            (MarketStatus::Open, Timeframe::H1) => 3600,
            (MarketStatus::Open, Timeframe::D1) => 3600,
            (_, Timeframe::M1 | Timeframe::M5 | Timeframe::M15 | Timeframe::M30) => 3600,
            (_, Timeframe::H1) => 7200,
            (_, Timeframe::D1) => 86_400,
        };

        let source = match status {
            MarketStatus::Open => SourceClass::Live,
            MarketStatus::Pre | MarketStatus::Post => SourceClass::Recent,
            _ => SourceClass::Historical,
        };

        SourcePlan {
            source,
            ttl_seconds,
        }
    }

    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(
            date.weekday(),
            chrono::Weekday::Sat | chrono::Weekday::Sun
        ) && !self.holidays.contains(&date)
    }

    fn to_local(&self, ts_ms: i64) -> Option<DateTime<FixedOffset>> {
        let utc = Utc.timestamp_millis_opt(ts_ms).single()?;
        Some(utc.with_timezone(&self.offset))
    }
}
