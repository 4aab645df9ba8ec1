//! Alarm model shared by the disk watcher and the monitor client.

use crate::wire::Timestamp;

/// Severity of an alarm update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum AlarmLevel {
    Warning = 0,
    Emergency = 1,
    Failure = 2,
}

/// Whether the alarm condition is currently active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum AlarmStatus {
    Off = 0,
    On = 1,
}

/// One state change of an identified alarm.
#[derive(Clone, PartialEq, prost::Message)]
pub struct AlarmUpdate {
    #[prost(string, tag = "1")]
    pub identification: String,
    #[prost(enumeration = "AlarmLevel", tag = "2")]
    pub level: i32,
    #[prost(enumeration = "AlarmStatus", tag = "3")]
    pub status: i32,
    #[prost(string, tag = "4")]
    pub description: String,
    #[prost(message, optional, tag = "5")]
    pub time: Option<Timestamp>,
}

/// Suppresses idempotent repetitions of an alarm: an update passes through
/// only when its (level, status, description) triple differs from the last
/// one seen. The comparison state is seeded so that an initial `Off` update
/// is swallowed while an initial `On` is reported.
#[derive(Default)]
pub struct AlarmSuppressor {
    last: Option<AlarmUpdate>,
}

impl AlarmSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(&mut self, update: AlarmUpdate) -> Option<AlarmUpdate> {
        let last = self.last.take().unwrap_or(AlarmUpdate {
            identification: update.identification.clone(),
            level: update.level,
            status: AlarmStatus::Off as i32,
            description: update.description.clone(),
            time: None,
        });

        let unchanged = last.level == update.level
            && last.status == update.status
            && last.description == update.description;

        self.last = Some(update.clone());
        if unchanged {
            None
        } else {
            Some(update)
        }
    }
}
