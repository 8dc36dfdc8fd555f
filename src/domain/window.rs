// Time window resolution for telemetry queries
use crate::error::AggregatorError;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical time ranges understood by the upstream source. Data is served
/// pre-bucketed at these granularities only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeToken {
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "24h")]
    Hour24,
    #[serde(rename = "7d")]
    Day7,
    #[serde(rename = "30d")]
    Day30,
    #[serde(rename = "1y")]
    Year1,
}

impl RangeToken {
    pub fn parse(token: &str) -> Result<Self, AggregatorError> {
        match token {
            "1h" => Ok(RangeToken::Hour1),
            "24h" => Ok(RangeToken::Hour24),
            "7d" => Ok(RangeToken::Day7),
            "30d" => Ok(RangeToken::Day30),
            "1y" => Ok(RangeToken::Year1),
            other => Err(AggregatorError::InvalidRange(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RangeToken::Hour1 => "1h",
            RangeToken::Hour24 => "24h",
            RangeToken::Day7 => "7d",
            RangeToken::Day30 => "30d",
            RangeToken::Year1 => "1y",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            RangeToken::Hour1 => Duration::hours(1),
            RangeToken::Hour24 => Duration::hours(24),
            RangeToken::Day7 => Duration::days(7),
            RangeToken::Day30 => Duration::days(30),
            RangeToken::Year1 => Duration::days(365),
        }
    }

    /// Snap an arbitrary span to the nearest coarser upstream bucket.
    fn classify(span: Duration) -> Self {
        if span <= Duration::days(1) {
            RangeToken::Hour24
        } else if span <= Duration::days(7) {
            RangeToken::Day7
        } else if span <= Duration::days(30) {
            RangeToken::Day30
        } else {
            RangeToken::Year1
        }
    }
}

/// An absolute `[start, end)` query range, tagged with the upstream
/// granularity bucket it maps onto.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub range: RangeToken,
}

impl TimeWindow {
    /// Window ending at the current instant.
    pub fn ending_now(range: RangeToken) -> Self {
        Self::ending_at(range, Utc::now())
    }

    pub fn ending_at(range: RangeToken, end: DateTime<Utc>) -> Self {
        Self {
            start: end - range.duration(),
            end,
            range,
        }
    }

    /// Resolve an explicit calendar range, inclusive of both dates. The
    /// end instant is normalized to 23:59:59.999 of the end date, and the
    /// span is snapped to the upstream's bucket granularity. Multi-month
    /// ranges therefore lose precision against the requested dates; the
    /// upstream does not serve finer-grained exports.
    pub fn from_dates(start_date: NaiveDate, end_date: NaiveDate) -> Self {
        let start = start_date.and_time(NaiveTime::MIN).and_utc();
        let end_of_day = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap();
        let end = end_date.and_time(end_of_day).and_utc();
        Self {
            start,
            end,
            range: RangeToken::classify(end - start),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end - self.start).num_milliseconds() as f64 / 1000.0
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}
