use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use anyhow::{anyhow, Result};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A `HH:MM:SS.mmm` position on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timecode {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub milliseconds: u32,
}

impl Timecode {
    pub fn new(hours: u32, minutes: u32, seconds: u32, milliseconds: u32) -> Self {
        Self {
            hours,
            minutes,
            seconds,
            milliseconds,
        }
    }

    /// Parses `HH:MM:SS`, `HH:MM:SS.m..`, or the SRT comma form `HH:MM:SS,mmm`.
    ///
    /// Blank input is `Ok(None)`. Fractional digits are right-padded, so `.5`
    /// means 500 milliseconds.
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let normalized = raw.trim().replace(',', ".");
        if normalized.is_empty() {
            return Ok(None);
        }

        let captures = timecode_regex()
            .captures(&normalized)
            .ok_or_else(|| anyhow!("invalid timecode '{}'", raw.trim()))?;
        let field = |name: &str| -> u32 {
            captures
                .name(name)
                .and_then(|value| value.as_str().parse().ok())
                .unwrap_or(0)
        };
        let milliseconds = captures
            .name("millis")
            .map(|value| format!("{:0<3}", value.as_str()))
            .and_then(|padded| padded.parse().ok())
            .unwrap_or(0);

        Ok(Some(Self {
            hours: field("hour"),
            minutes: field("minute"),
            seconds: field("second"),
            milliseconds,
        }))
    }

    pub fn to_seconds(&self) -> f64 {
        f64::from(self.hours) * 3600.0
            + f64::from(self.minutes) * 60.0
            + f64::from(self.seconds)
            + f64::from(self.milliseconds) / 1000.0
    }

    /// Frame index at `fps`, rounded to the nearest frame.
    pub fn to_frame(&self, fps: f64) -> i64 {
        (self.to_seconds() * fps).round() as i64
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}.{:03}",
            self.hours, self.minutes, self.seconds, self.milliseconds
        )
    }
}

impl FromStr for Timecode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)?.ok_or_else(|| anyhow!("timecode must not be empty"))
    }
}

impl Serialize for Timecode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Timecode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Deserializes an optional timecode where `null` and `""` both mean "unset".
pub fn deserialize_optional_timecode<'de, D>(deserializer: D) -> Result<Option<Timecode>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        Some(text) => Timecode::parse(&text).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn timecode_regex() -> &'static Regex {
    static TIMECODE_RE: OnceLock<Regex> = OnceLock::new();
    TIMECODE_RE.get_or_init(|| {
        Regex::new(
            r"^(?P<hour>\d{2}):(?P<minute>\d{2}):(?P<second>\d{2})(?:\.(?P<millis>\d{1,3}))?$",
        )
        .expect("timecode regex should compile")
    })
}
