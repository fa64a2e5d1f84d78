use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use clap::ValueEnum;
use regex::Regex;
use serde::{Serialize, Serializer};

use crate::error::StageError;

pub const PUBLICATION_INTERVAL_HOURS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cycle(DateTime<Utc>);

impl Cycle {
    pub fn snap_down(time: DateTime<Utc>) -> Self {
        let step = i64::from(PUBLICATION_INTERVAL_HOURS) * 3600;
        let secs = time.timestamp();
        let snapped = secs - secs.rem_euclid(step);
        Self(DateTime::from_timestamp(snapped, 0).unwrap_or(time))
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn retreat(&self) -> Self {
        Self(self.0 - Duration::hours(i64::from(PUBLICATION_INTERVAL_HOURS)))
    }

    pub fn advance(&self) -> Self {
        Self(self.0 + Duration::hours(i64::from(PUBLICATION_INTERVAL_HOURS)))
    }

    pub fn date_stamp(&self) -> String {
        self.0.format("%Y%m%d").to_string()
    }

    pub fn id(&self) -> String {
        self.0.format("%Y%m%d%H").to_string()
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for Cycle {
    type Err = StageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.len() != 10 || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(StageError::InvalidCycle(value.to_string()));
        }
        let date = NaiveDate::parse_from_str(&trimmed[..8], "%Y%m%d")
            .map_err(|_| StageError::InvalidCycle(value.to_string()))?;
        let hour: u32 = trimmed[8..]
            .parse()
            .map_err(|_| StageError::InvalidCycle(value.to_string()))?;
        if hour % PUBLICATION_INTERVAL_HOURS != 0 {
            return Err(StageError::InvalidCycle(value.to_string()));
        }
        let time = date
            .and_hms_opt(hour, 0, 0)
            .ok_or_else(|| StageError::InvalidCycle(value.to_string()))?;
        Ok(Self(time.and_utc()))
    }
}

impl Serialize for Cycle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    #[value(alias = "0p25")]
    Fine,
    #[value(alias = "0p50")]
    Medium,
    #[value(alias = "1p00")]
    Coarse,
}

impl Resolution {
    pub fn product(self) -> &'static str {
        match self {
            Resolution::Fine => "0p25",
            Resolution::Medium => "0p50",
            Resolution::Coarse => "1p00",
        }
    }

    pub fn km_per_pixel(self) -> u32 {
        match self {
            Resolution::Fine => 9,
            Resolution::Medium => 18,
            Resolution::Coarse => 27,
        }
    }

    pub fn from_config_lenient(value: &str) -> Self {
        match value.parse() {
            Ok(resolution) => resolution,
            Err(_) => {
                tracing::warn!(value, "unknown resolution in run config, using coarse");
                Resolution::Coarse
            }
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.product())
    }
}

impl FromStr for Resolution {
    type Err = StageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fine" | "0p25" => Ok(Resolution::Fine),
            "medium" | "0p50" => Ok(Resolution::Medium),
            "coarse" | "1p00" => Ok(Resolution::Coarse),
            _ => Err(StageError::InvalidResolution(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LeadInterval {
    pub start: u32,
    pub step: u32,
    pub end: u32,
}

impl LeadInterval {
    pub fn new(start: u32, step: u32, end: u32) -> Result<Self, StageError> {
        if step == 0 {
            return Err(StageError::InvalidInterval(format!(
                "{start} {step} {end}: step must be positive"
            )));
        }
        if start > end {
            return Err(StageError::InvalidInterval(format!(
                "{start} {step} {end}: start is after end"
            )));
        }
        Ok(Self { start, step, end })
    }

    pub fn hours(&self) -> impl Iterator<Item = u32> + '_ {
        (self.start..=self.end).step_by(self.step as usize)
    }
}

impl fmt::Display for LeadInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.start, self.step, self.end)
    }
}

impl FromStr for LeadInterval {
    type Err = StageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parts = value
            .split_whitespace()
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| StageError::InvalidInterval(value.to_string()))?;
        match parts.as_slice() {
            [start, step, end] => Self::new(*start, *step, *end),
            _ => Err(StageError::InvalidInterval(value.to_string())),
        }
    }
}

pub fn parse_interval_list(value: &str) -> Result<Vec<LeadInterval>, StageError> {
    let quoted = Regex::new(r#""([^"]*)""#)
        .map_err(|err| StageError::InvalidInterval(err.to_string()))?;
    let items: Vec<&str> = quoted
        .captures_iter(value)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if items.is_empty() {
        let bare = value.trim().trim_start_matches('(').trim_end_matches(')');
        if bare.trim().is_empty() {
            return Ok(Vec::new());
        }
        return Ok(vec![bare.parse()?]);
    }
    items.into_iter().map(str::parse).collect()
}

pub fn format_interval_list(intervals: &[LeadInterval]) -> String {
    let items = intervals
        .iter()
        .map(|interval| format!("\"{interval}\""))
        .collect::<Vec<_>>()
        .join(" ");
    format!("({items})")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidHours([bool; 24]);

impl ValidHours {
    pub fn contains(&self, hour: u32) -> bool {
        self.0.get(hour as usize).copied().unwrap_or(false)
    }
}

impl Default for ValidHours {
    fn default() -> Self {
        let mut hours = [false; 24];
        for hour in (0..24).step_by(PUBLICATION_INTERVAL_HOURS as usize) {
            hours[hour] = true;
        }
        Self(hours)
    }
}

impl fmt::Display for ValidHours {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hours = (0..24)
            .filter(|hour| self.0[*hour])
            .map(|hour| format!("{hour:02}"))
            .collect::<Vec<_>>()
            .join("|");
        write!(f, "{hours}")
    }
}

impl FromStr for ValidHours {
    type Err = StageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_matches('"');
        let mut hours = [false; 24];
        for part in trimmed.split(['|', ',']) {
            let hour: usize = part
                .trim()
                .parse()
                .map_err(|_| StageError::InvalidValidHours(value.to_string()))?;
            if hour >= 24 {
                return Err(StageError::InvalidValidHours(value.to_string()));
            }
            hours[hour] = true;
        }
        Ok(Self(hours))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
}

impl Bounds {
    pub fn contains(&self, other: &Bounds) -> bool {
        self.top >= other.top
            && self.bottom <= other.bottom
            && self.left <= other.left
            && self.right >= other.right
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn cycle_parse_and_display() {
        let cycle: Cycle = "2025073100".parse().unwrap();
        assert_eq!(cycle.to_string(), "2025073100");
        assert_eq!(cycle.date_stamp(), "20250731");
        assert_eq!(cycle.hour(), 0);
    }

    #[test]
    fn cycle_rejects_off_boundary_hour() {
        let err = "2025073103".parse::<Cycle>().unwrap_err();
        assert_matches!(err, StageError::InvalidCycle(_));
        let err = "20250731".parse::<Cycle>().unwrap_err();
        assert_matches!(err, StageError::InvalidCycle(_));
    }

    #[test]
    fn cycle_retreat_crosses_midnight() {
        let cycle: Cycle = "2025073100".parse().unwrap();
        assert_eq!(cycle.retreat().to_string(), "2025073018");
        assert_eq!(cycle.retreat().advance(), cycle);
    }

    #[test]
    fn cycle_snaps_down() {
        let time = Utc.with_ymd_and_hms(2025, 7, 31, 11, 59, 59).unwrap();
        assert_eq!(Cycle::snap_down(time).to_string(), "2025073106");
    }

    #[test]
    fn resolution_accepts_product_codes() {
        assert_eq!("0p25".parse::<Resolution>().unwrap(), Resolution::Fine);
        assert_eq!("COARSE".parse::<Resolution>().unwrap(), Resolution::Coarse);
        assert_eq!(Resolution::from_config_lenient("0p10"), Resolution::Coarse);
    }

    #[test]
    fn interval_list_round_trip() {
        let intervals = parse_interval_list(r#"("0 3 120" "126 6 237")"#).unwrap();
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[1], LeadInterval::new(126, 6, 237).unwrap());
        assert_eq!(format_interval_list(&intervals), r#"("0 3 120" "126 6 237")"#);
        assert_eq!(parse_interval_list("0 3 9").unwrap()[0].hours().count(), 4);
    }

    #[test]
    fn interval_rejects_zero_step() {
        assert_matches!(
            "0 0 9".parse::<LeadInterval>(),
            Err(StageError::InvalidInterval(_))
        );
    }

    #[test]
    fn valid_hours_parse() {
        let hours: ValidHours = "\"00|12\"".parse().unwrap();
        assert!(hours.contains(12));
        assert!(!hours.contains(6));
        assert_eq!(ValidHours::default().to_string(), "00|06|12|18");
    }
}
