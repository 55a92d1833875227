//! Chat messages and their one-line record format.

use chrono::{Local, NaiveDateTime, SubsecRound};

use crate::error::LogError;
use crate::identity::Identity;

/// Wall-clock format used both on screen and on disk.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Width of a formatted timestamp.
const TIMESTAMP_LEN: usize = 19;

/// An immutable chat line: who said what, and when (to the second).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp: NaiveDateTime,
    pub identity: Identity,
    pub text: String,
}

impl Message {
    /// Stamp `text` with the current local time.
    pub fn new(identity: Identity, text: impl Into<String>) -> Result<Self, LogError> {
        Self::at(Local::now().naive_local(), identity, text)
    }

    /// Build a message with an explicit timestamp (truncated to seconds).
    pub fn at(
        timestamp: NaiveDateTime,
        identity: Identity,
        text: impl Into<String>,
    ) -> Result<Self, LogError> {
        let text = text.into();
        if text.contains(['\n', '\r']) {
            return Err(LogError::MalformedInput("embedded line break"));
        }
        Ok(Self {
            timestamp: timestamp.trunc_subsecs(0),
            identity,
            text,
        })
    }

    /// `"<timestamp> [<identity>] <text>"`
    pub fn render(&self) -> String {
        format!(
            "{} [{}] {}",
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.identity,
            self.text
        )
    }

    /// The stored form: the rendered line plus a newline.
    pub fn to_record(&self) -> String {
        let mut record = self.render();
        record.push('\n');
        record
    }

    /// Inverse of [`Message::render`]. A trailing newline is tolerated.
    pub fn parse_record(line: &str) -> Result<Self, LogError> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let malformed = || LogError::MalformedRecord(line.chars().take(80).collect());

        let stamp = line.get(..TIMESTAMP_LEN).ok_or_else(malformed)?;
        let timestamp =
            NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).map_err(|_| malformed())?;

        let rest = line[TIMESTAMP_LEN..]
            .strip_prefix(" [")
            .ok_or_else(malformed)?;
        let (identity, text) = rest.split_once("] ").ok_or_else(malformed)?;
        let identity = Identity::parse(identity).map_err(|_| malformed())?;

        Self::at(timestamp, identity, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    fn t1() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_milli_opt(14, 5, 7, 650)
            .unwrap()
    }

    fn id(s: &str) -> Identity {
        Identity::parse(s).unwrap()
    }

    #[test]
    fn render_format() {
        let msg = Message::at(t1(), id("chat01"), "hello").unwrap();
        assert_eq!(msg.render(), "2024-03-09 14:05:07 [chat01] hello");
        assert_eq!(msg.to_record(), "2024-03-09 14:05:07 [chat01] hello\n");
    }

    #[test]
    fn timestamp_truncated_to_seconds() {
        let msg = Message::at(t1(), id("chat01"), "x").unwrap();
        assert_eq!(msg.timestamp.nanosecond(), 0);
    }

    #[test]
    fn parse_record_inverts_render() {
        let msg = Message::at(t1(), id("chat02"), "hi [there] ] friend").unwrap();
        let back = Message::parse_record(&msg.to_record()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn parse_record_rejects_garbage() {
        for line in [
            "",
            "hello",
            "2024-03-09 14:05:07 chat01 hello",
            "2024-13-09 14:05:07 [chat01] hello",
            "2024-03-09 14:05:07 [bad id] hello",
            "2024-03-09 14:05:07 [chat01]",
        ] {
            assert!(Message::parse_record(line).is_err(), "{line:?}");
        }
    }

    #[test]
    fn rejects_line_breaks() {
        assert!(Message::at(t1(), id("chat01"), "two\nlines").is_err());
        assert!(Message::at(t1(), id("chat01"), "cr\r").is_err());
    }
}
