//! Text encoding of finalized aggregates.
//!
//! Each aggregation pipeline renders its results as one human-readable line
//! with a fixed field order, and the storage side parses the same line back
//! with an anchored pattern. The three encodings are independent: a line
//! produced by one codec never decodes under another.
//!
//! Window bounds are rendered in a display offset (Asia/Seoul by default).
//! The offset only affects rendering; bucketing is always epoch arithmetic.

use std::num::ParseIntError;

use chrono::{
    DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::window::{FinalizedResult, Window};

pub const HOURLY_FORMAT: &str = "%Y-%m-%d %H:%M";
pub const DAILY_FORMAT: &str = "%Y-%m-%d";
pub const TIME_OF_DAY_FORMAT: &str = "%H:%M";

static HOURLY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*상품:\s*([^,]+?)\s*,\s*시간대:\s*([^~,]+?)\s*~\s*([^,]+?)\s*,\s*총매출:\s*(-?[0-9]+)\s*$")
        .expect("invalid hourly sales pattern")
});

static DAILY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*날짜:\s*([^,]+?)\s*,\s*카테고리:\s*([^,]+?)\s*,\s*일매출:\s*(-?[0-9]+)\s*$")
        .expect("invalid daily sales pattern")
});

static EVENT_COUNT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*이벤트:\s*([^,]+?)\s*,\s*시간:\s*([^~,]+?)\s*~\s*([^,]+?)\s*,\s*발생횟수:\s*(-?[0-9]+)\s*$")
        .expect("invalid event count pattern")
});

/// Default display offset: Asia/Seoul, which has no DST.
pub fn seoul() -> FixedOffset {
    FixedOffset::east_opt(9 * 3600).expect("+09:00 is a valid offset")
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{codec} result does not match the expected pattern: {line:?}")]
    Mismatch { codec: &'static str, line: String },
    #[error("invalid timestamp {text:?} in {codec} result: {source}")]
    Timestamp {
        codec: &'static str,
        text: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("invalid total {text:?} in {codec} result: {source}")]
    Number {
        codec: &'static str,
        text: String,
        #[source]
        source: ParseIntError,
    },
}

/// Selects the wire encoding of one aggregation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultCodec {
    HourlySales,
    DailySales,
    EventCount,
}

impl ResultCodec {
    pub fn name(&self) -> &'static str {
        match self {
            ResultCodec::HourlySales => "hourly-sales",
            ResultCodec::DailySales => "daily-sales",
            ResultCodec::EventCount => "event-count",
        }
    }

    pub fn encode(&self, result: &FinalizedResult, offset: &FixedOffset) -> String {
        match self {
            ResultCodec::HourlySales => HourlySales::from_result(result, offset).encode(),
            ResultCodec::DailySales => DailySales::from_result(result, offset).encode(),
            ResultCodec::EventCount => EventCount::from_result(result, offset).encode(),
        }
    }

    pub fn decode(&self, line: &str) -> Result<DecodedResult, CodecError> {
        Ok(match self {
            ResultCodec::HourlySales => DecodedResult::HourlySales(HourlySales::decode(line)?),
            ResultCodec::DailySales => DecodedResult::DailySales(DailySales::decode(line)?),
            ResultCodec::EventCount => DecodedResult::EventCount(EventCount::decode(line)?),
        })
    }
}

/// A result line parsed back into typed fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DecodedResult {
    HourlySales(HourlySales),
    DailySales(DailySales),
    EventCount(EventCount),
}

impl DecodedResult {
    /// The key dimension: product, category or event type.
    pub fn key(&self) -> &str {
        match self {
            DecodedResult::HourlySales(r) => &r.product,
            DecodedResult::DailySales(r) => &r.category,
            DecodedResult::EventCount(r) => &r.event_type,
        }
    }

    pub fn total(&self) -> i64 {
        match self {
            DecodedResult::HourlySales(r) => r.total_sales,
            DecodedResult::DailySales(r) => r.total_sales,
            DecodedResult::EventCount(r) => r.event_count,
        }
    }
}

/// `상품:{product}, 시간대:{start}~{end}, 총매출:{total}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlySales {
    pub product: String,
    pub window_start: NaiveDateTime,
    pub window_end: NaiveDateTime,
    pub total_sales: i64,
}

impl HourlySales {
    pub fn from_result(result: &FinalizedResult, offset: &FixedOffset) -> Self {
        Self {
            product: result.key.clone(),
            window_start: local_minute(result.window.start, offset),
            window_end: local_minute(result.window.end, offset),
            total_sales: result.value,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "상품:{}, 시간대:{}~{}, 총매출:{}",
            self.product,
            self.window_start.format(HOURLY_FORMAT),
            self.window_end.format(HOURLY_FORMAT),
            self.total_sales
        )
    }

    pub fn decode(line: &str) -> Result<Self, CodecError> {
        const CODEC: &str = "hourly-sales";
        let caps = captures(&HOURLY_PATTERN, CODEC, line)?;
        Ok(Self {
            product: caps[1].to_string(),
            window_start: parse_datetime(CODEC, &caps[2])?,
            window_end: parse_datetime(CODEC, &caps[3])?,
            total_sales: parse_total(CODEC, &caps[4])?,
        })
    }

    /// Maps the rendered bounds back to the UTC window they came from.
    pub fn window(&self, offset: &FixedOffset) -> Option<Window> {
        Some(Window {
            start: to_utc(&self.window_start, offset)?,
            end: to_utc(&self.window_end, offset)?,
        })
    }
}

/// `날짜:{date}, 카테고리:{category}, 일매출:{total}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySales {
    pub sales_date: NaiveDate,
    pub category: String,
    pub total_sales: i64,
}

impl DailySales {
    pub fn from_result(result: &FinalizedResult, offset: &FixedOffset) -> Self {
        Self {
            sales_date: result.window.start.with_timezone(offset).date_naive(),
            category: result.key.clone(),
            total_sales: result.value,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "날짜:{}, 카테고리:{}, 일매출:{}",
            self.sales_date.format(DAILY_FORMAT),
            self.category,
            self.total_sales
        )
    }

    pub fn decode(line: &str) -> Result<Self, CodecError> {
        const CODEC: &str = "daily-sales";
        let caps = captures(&DAILY_PATTERN, CODEC, line)?;
        let sales_date =
            NaiveDate::parse_from_str(&caps[1], DAILY_FORMAT).map_err(|source| CodecError::Timestamp {
                codec: CODEC,
                text: caps[1].to_string(),
                source,
            })?;
        Ok(Self {
            sales_date,
            category: caps[2].to_string(),
            total_sales: parse_total(CODEC, &caps[3])?,
        })
    }

    /// The epoch-aligned UTC day whose start renders as `sales_date`.
    pub fn window(&self, offset: &FixedOffset) -> Option<Window> {
        let midnight = self.sales_date.and_hms_opt(0, 0, 0)?.and_utc();
        let start = if midnight.with_timezone(offset).date_naive() == self.sales_date {
            midnight
        } else {
            midnight + Duration::days(1)
        };
        Some(Window::new(start, Duration::days(1)))
    }
}

/// `이벤트:{type}, 시간:{start}~{end}, 발생횟수:{count}`
///
/// Only the time of day is rendered, so the date cannot be recovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCount {
    pub event_type: String,
    pub window_start: NaiveTime,
    pub window_end: NaiveTime,
    pub event_count: i64,
}

impl EventCount {
    pub fn from_result(result: &FinalizedResult, offset: &FixedOffset) -> Self {
        Self {
            event_type: result.key.clone(),
            window_start: local_minute(result.window.start, offset).time(),
            window_end: local_minute(result.window.end, offset).time(),
            event_count: result.value,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "이벤트:{}, 시간:{}~{}, 발생횟수:{}",
            self.event_type,
            self.window_start.format(TIME_OF_DAY_FORMAT),
            self.window_end.format(TIME_OF_DAY_FORMAT),
            self.event_count
        )
    }

    pub fn decode(line: &str) -> Result<Self, CodecError> {
        const CODEC: &str = "event-count";
        let caps = captures(&EVENT_COUNT_PATTERN, CODEC, line)?;
        Ok(Self {
            event_type: caps[1].to_string(),
            window_start: parse_time(CODEC, &caps[2])?,
            window_end: parse_time(CODEC, &caps[3])?,
            event_count: parse_total(CODEC, &caps[4])?,
        })
    }
}

fn captures<'l>(pattern: &Regex, codec: &'static str, line: &'l str) -> Result<Captures<'l>, CodecError> {
    pattern.captures(line).ok_or_else(|| CodecError::Mismatch {
        codec,
        line: line.to_string(),
    })
}

fn parse_datetime(codec: &'static str, text: &str) -> Result<NaiveDateTime, CodecError> {
    NaiveDateTime::parse_from_str(text, HOURLY_FORMAT).map_err(|source| CodecError::Timestamp {
        codec,
        text: text.to_string(),
        source,
    })
}

fn parse_time(codec: &'static str, text: &str) -> Result<NaiveTime, CodecError> {
    NaiveTime::parse_from_str(text, TIME_OF_DAY_FORMAT).map_err(|source| CodecError::Timestamp {
        codec,
        text: text.to_string(),
        source,
    })
}

fn parse_total(codec: &'static str, text: &str) -> Result<i64, CodecError> {
    text.parse::<i64>().map_err(|source| CodecError::Number {
        codec,
        text: text.to_string(),
        source,
    })
}

// Rendered bounds carry minute precision.
fn local_minute(ts: DateTime<Utc>, offset: &FixedOffset) -> NaiveDateTime {
    let local = ts.with_timezone(offset).naive_local();
    local
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(local)
}

fn to_utc(local: &NaiveDateTime, offset: &FixedOffset) -> Option<DateTime<Utc>> {
    offset
        .from_local_datetime(local)
        .single()
        .map(|t| t.with_timezone(&Utc))
}
