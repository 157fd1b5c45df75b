//! Training-time counters and duration strings such as `3ep` or `500ba`.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Progress counters for a run.
///
/// Counters only move forward; the one exception is restoring a checkpoint,
/// which replaces the whole value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub epoch: u64,
    /// Total batches completed across all epochs.
    pub batch: u64,
    /// Batches completed in the current epoch.
    pub batch_in_epoch: u64,
    pub sample: u64,
    pub token: u64,
}

impl Timestamp {
    pub fn to_next_batch(&self, samples: u64, tokens: u64) -> Self {
        Self {
            epoch: self.epoch,
            batch: self.batch + 1,
            batch_in_epoch: self.batch_in_epoch + 1,
            sample: self.sample + samples,
            token: self.token + tokens,
        }
    }

    pub fn to_next_epoch(&self) -> Self {
        Self {
            epoch: self.epoch + 1,
            batch_in_epoch: 0,
            ..*self
        }
    }

    pub fn get(&self, unit: TimeUnit) -> u64 {
        match unit {
            TimeUnit::Epoch => self.epoch,
            TimeUnit::Batch => self.batch,
            TimeUnit::Sample => self.sample,
            TimeUnit::Token => self.token,
        }
    }

    pub fn reached(&self, time: Time) -> bool {
        self.get(time.unit) >= time.value
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch={} batch={} batch_in_epoch={} sample={} token={}",
            self.epoch, self.batch, self.batch_in_epoch, self.sample, self.token
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeUnit {
    Epoch,
    Batch,
    Sample,
    Token,
}

impl TimeUnit {
    pub fn suffix(&self) -> &'static str {
        match self {
            TimeUnit::Epoch => "ep",
            TimeUnit::Batch => "ba",
            TimeUnit::Sample => "sp",
            TimeUnit::Token => "tok",
        }
    }
}

/// A point on one of the timestamp axes, e.g. `Time::epochs(3)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Time {
    pub value: u64,
    pub unit: TimeUnit,
}

impl Time {
    pub fn new(value: u64, unit: TimeUnit) -> Self {
        Self { value, unit }
    }

    pub fn epochs(value: u64) -> Self {
        Self::new(value, TimeUnit::Epoch)
    }

    pub fn batches(value: u64) -> Self {
        Self::new(value, TimeUnit::Batch)
    }

    pub fn samples(value: u64) -> Self {
        Self::new(value, TimeUnit::Sample)
    }

    pub fn tokens(value: u64) -> Self {
        Self::new(value, TimeUnit::Token)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.suffix())
    }
}

impl FromStr for Time {
    type Err = TrainingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid_time(trimmed))?;
        let (digits, suffix) = trimmed.split_at(split);
        if digits.is_empty() {
            return Err(invalid_time(trimmed));
        }
        let value: u64 = digits.parse().map_err(|_| invalid_time(trimmed))?;
        let unit = match suffix.to_ascii_lowercase().as_str() {
            "ep" => TimeUnit::Epoch,
            "ba" => TimeUnit::Batch,
            "sp" => TimeUnit::Sample,
            "tok" => TimeUnit::Token,
            _ => return Err(invalid_time(trimmed)),
        };
        Ok(Self { value, unit })
    }
}

impl TryFrom<String> for Time {
    type Error = TrainingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Time> for String {
    fn from(value: Time) -> Self {
        value.to_string()
    }
}

fn invalid_time(raw: &str) -> TrainingError {
    TrainingError::validation(vec![format!(
        "invalid time '{}' (expected <integer><ep|ba|sp|tok>)",
        raw
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_unit() {
        assert_eq!("3ep".parse::<Time>().unwrap(), Time::epochs(3));
        assert_eq!("250ba".parse::<Time>().unwrap(), Time::batches(250));
        assert_eq!("64sp".parse::<Time>().unwrap(), Time::samples(64));
        assert_eq!(" 1000TOK ".parse::<Time>().unwrap(), Time::tokens(1000));
    }

    #[test]
    fn rejects_malformed_durations() {
        for raw in ["", "ep", "10", "10 minutes", "-3ep", "1.5ep"] {
            assert!(raw.parse::<Time>().is_err(), "accepted {raw:?}");
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let json = serde_json::to_string(&Time::batches(7)).unwrap();
        assert_eq!(json, "\"7ba\"");
        let back: Time = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Time::batches(7));
    }

    #[test]
    fn counters_advance() {
        let ts = Timestamp::default().to_next_batch(4, 32).to_next_batch(4, 32);
        assert_eq!(ts.batch, 2);
        assert_eq!(ts.batch_in_epoch, 2);
        assert_eq!(ts.sample, 8);
        assert_eq!(ts.token, 64);

        let next = ts.to_next_epoch();
        assert_eq!(next.epoch, 1);
        assert_eq!(next.batch_in_epoch, 0);
        assert_eq!(next.batch, 2);
        assert!(next.reached(Time::epochs(1)));
        assert!(!next.reached(Time::batches(3)));
    }
}
