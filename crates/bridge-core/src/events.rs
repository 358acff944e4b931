use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of observation reported by the button firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Rising,
    Falling,
    StateSnapshot,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rising => "RISING",
            Self::Falling => "FALLING",
            Self::StateSnapshot => "STATE_SNAPSHOT",
        }
    }

    /// Level of the signal after this edge. Snapshots carry their own level.
    fn implied_state(&self) -> Option<u8> {
        match self {
            Self::Rising => Some(1),
            Self::Falling => Some(0),
            Self::StateSnapshot => None,
        }
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Only exact edge lines parse; `STATE_SNAPSHOT` is never emitted by the
/// firmware as an unsolicited line.
impl FromStr for EdgeKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RISING" => Ok(Self::Rising),
            "FALLING" => Ok(Self::Falling),
            _ => Err(()),
        }
    }
}

/// One immutable observation of the button, consumed by fan-out and dropped.
#[derive(Clone, Debug, PartialEq)]
pub struct ButtonEvent {
    pub kind: EdgeKind,
    pub state: u8,
    pub observed_at: DateTime<Utc>,
}

impl ButtonEvent {
    /// Classify one unsolicited device line. Anything other than an exact
    /// `RISING`/`FALLING` yields `None`.
    pub fn from_line(line: &str) -> Option<Self> {
        let kind: EdgeKind = line.parse().ok()?;
        Some(Self::edge(kind, Utc::now()))
    }

    pub fn edge(kind: EdgeKind, observed_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            state: kind.implied_state().unwrap_or_default(),
            observed_at,
        }
    }

    pub fn snapshot(state: u8, observed_at: DateTime<Utc>) -> Self {
        Self {
            kind: EdgeKind::StateSnapshot,
            state,
            observed_at,
        }
    }

    /// Seconds since the Unix epoch with sub-second precision, as carried on the wire.
    pub fn timestamp(&self) -> f64 {
        epoch_seconds(self.observed_at)
    }
}

pub fn epoch_seconds(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

/// Current wall-clock time as float epoch seconds.
pub fn now_epoch_seconds() -> f64 {
    epoch_seconds(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_lines_classify() {
        let rising = ButtonEvent::from_line("RISING").unwrap();
        assert_eq!(rising.kind, EdgeKind::Rising);
        assert_eq!(rising.state, 1);

        let falling = ButtonEvent::from_line("FALLING").unwrap();
        assert_eq!(falling.kind, EdgeKind::Falling);
        assert_eq!(falling.state, 0);
    }

    #[test]
    fn other_lines_are_discarded() {
        assert!(ButtonEvent::from_line("OK").is_none());
        assert!(ButtonEvent::from_line("1").is_none());
        assert!(ButtonEvent::from_line("rising").is_none());
        assert!(ButtonEvent::from_line(" RISING").is_none());
        assert!(ButtonEvent::from_line("STATE_SNAPSHOT").is_none());
        assert!(ButtonEvent::from_line("").is_none());
    }

    #[test]
    fn snapshot_keeps_its_level() {
        let ev = ButtonEvent::snapshot(1, Utc::now());
        assert_eq!(ev.kind, EdgeKind::StateSnapshot);
        assert_eq!(ev.state, 1);
    }

    #[test]
    fn timestamp_is_fractional_epoch_seconds() {
        let at = DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        let ev = ButtonEvent::edge(EdgeKind::Rising, at);
        assert!((ev.timestamp() - 1_700_000_000.25).abs() < 1e-6);
    }

    #[test]
    fn kind_serializes_screaming() {
        let json = serde_json::to_string(&EdgeKind::StateSnapshot).unwrap();
        assert_eq!(json, "\"STATE_SNAPSHOT\"");
        assert_eq!(EdgeKind::Falling.to_string(), "FALLING");
    }
}
