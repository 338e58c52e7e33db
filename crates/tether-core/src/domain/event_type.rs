//! EventType - event type 文字列のパーサー
//!
//! 文字列の文法は `name` または `name[p1,p2,...]`。
//! パースは境界（bind / trigger）で一度だけ行い、それより内側では
//! 生の文字列をパターンマッチしません。
//!
//! # 予約済みの name
//! - `delay[<duration>]`: `5` / `5s`（秒）、`500ms`（ミリ秒）
//! - `repeat`: 未実装（bind すると `UnsupportedEventKind`）

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::Duration;

use crate::error::EventError;

pub const UPDATE: &str = "update";
pub const DELAY: &str = "delay";
pub const REPEAT: &str = "repeat";

/// Vocabulary every registry starts with.
pub const DEFAULT_EVENT_TYPES: &[&str] = &[
    // window size & pos
    "resize",
    "move",
    // widget internal changes
    "configure",
    UPDATE,
    "draw",
    // mouse
    "mouse_move",
    "mouse_enter",
    "mouse_leave",
    "mouse_press",
    "mouse_release",
    "click",
    "double_click",
    // focus
    "focus_gain",
    "focus_loss",
    // keys
    "key_press",
    "key_release",
    "key_repeat",
    "char",
    // special
    DELAY,
    REPEAT,
];

/// A parsed event type string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventType {
    name: String,
    params: Vec<String>,
}

/// What a binding turns into once its event type is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Plain,
    Delay(Duration),
}

impl EventType {
    /// Parse `name` or `name[p1,p2,...]`.
    ///
    /// `name[]` has no params (not a single empty one).
    pub fn parse(s: &str) -> Self {
        let bracketed = s
            .strip_suffix(']')
            .and_then(|head| head.split_once('['));

        let Some((name, raw)) = bracketed else {
            return Self {
                name: s.to_string(),
                params: Vec::new(),
            };
        };

        let params = if raw.trim().is_empty() {
            Vec::new()
        } else {
            raw.split(',').map(|p| p.trim().to_string()).collect()
        };

        Self {
            name: name.to_string(),
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn has_params(&self) -> bool {
        !self.params.is_empty()
    }

    pub fn is_delay(&self) -> bool {
        self.name == DELAY
    }

    /// `name[*]`, the key that catches every parameterization of `name`.
    pub fn wildcard(&self) -> String {
        format!("{}[*]", self.name)
    }

    /// Decode the typed parameters of reserved kinds.
    pub fn decode(&self) -> Result<EventKind, EventError> {
        match self.name.as_str() {
            DELAY => {
                let raw = self.params.first().ok_or_else(|| EventError::InvalidDelay {
                    event_type: self.to_string(),
                    reason: "missing duration".to_string(),
                })?;
                let duration = parse_duration(raw).map_err(|reason| EventError::InvalidDelay {
                    event_type: self.to_string(),
                    reason,
                })?;
                Ok(EventKind::Delay(duration))
            }
            REPEAT => Err(EventError::UnsupportedEventKind(REPEAT.to_string())),
            _ => Ok(EventKind::Plain),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}[{}]", self.name, self.params.join(","))
        }
    }
}

impl FromStr for EventType {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

/// `"5"` / `"5s"` are seconds, `"500ms"` is milliseconds.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let (number, scale) = if let Some(ms) = raw.strip_suffix("ms") {
        (ms, 1_000.0)
    } else if let Some(s) = raw.strip_suffix('s') {
        (s, 1.0)
    } else {
        (raw, 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|e| format!("'{raw}' is not a number: {e}"))?;

    let span = std::time::Duration::try_from_secs_f64(value / scale)
        .map_err(|e| format!("'{raw}' is not a valid duration: {e}"))?;
    Duration::from_std(span).map_err(|e| format!("'{raw}' is out of range: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("click", "click", &[])]
    #[case("click[]", "click", &[])]
    #[case("click[ ]", "click", &[])]
    #[case("delay[500ms]", "delay", &["500ms"])]
    #[case("key_press[a,b]", "key_press", &["a", "b"])]
    #[case("key_press[a, b]", "key_press", &["a", "b"])]
    #[case("mouse_press[*]", "mouse_press", &["*"])]
    #[case("odd[x]y", "odd[x]y", &[])]
    fn parses_name_and_params(#[case] input: &str, #[case] name: &str, #[case] params: &[&str]) {
        let parsed = EventType::parse(input);
        assert_eq!(parsed.name(), name);
        assert_eq!(parsed.params(), params);
    }

    #[rstest]
    #[case("click")]
    #[case("click[]")]
    #[case("delay[0.5s]")]
    #[case("key_press[ a ,b]")]
    #[case("weird[,x]")]
    fn parsing_is_idempotent(#[case] input: &str) {
        let once = EventType::parse(input);
        let twice = EventType::parse(&once.to_string());
        assert_eq!(once, twice);
    }

    #[rstest]
    #[case("5", 5_000)]
    #[case("5s", 5_000)]
    #[case("0.01s", 10)]
    #[case("500ms", 500)]
    #[case("1.5", 1_500)]
    fn parses_durations(#[case] raw: &str, #[case] millis: i64) {
        assert_eq!(parse_duration(raw).unwrap().num_milliseconds(), millis);
    }

    #[rstest]
    #[case("abc")]
    #[case("-1s")]
    #[case("ms")]
    fn rejects_bad_durations(#[case] raw: &str) {
        assert!(parse_duration(raw).is_err());
    }

    #[test]
    fn decode_reserved_kinds() {
        assert_eq!(EventType::parse("click").decode().unwrap(), EventKind::Plain);
        assert_eq!(
            EventType::parse("delay[500ms]").decode().unwrap(),
            EventKind::Delay(Duration::milliseconds(500))
        );
        assert!(matches!(
            EventType::parse("repeat[1s]").decode(),
            Err(EventError::UnsupportedEventKind(_))
        ));
        assert!(matches!(
            EventType::parse("delay").decode(),
            Err(EventError::InvalidDelay { .. })
        ));
    }

    #[test]
    fn wildcard_key() {
        assert_eq!(EventType::parse("click").wildcard(), "click[*]");
        assert_eq!(EventType::parse("delay[1]").wildcard(), "delay[*]");
    }
}
