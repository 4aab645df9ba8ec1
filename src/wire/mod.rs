//! Frame wire protocol: the messages exchanged with trackers, written to
//! segment files and served to broadcast subscribers, plus the
//! length-delimited codec they all share.

pub mod codec;

use std::time::{Duration, SystemTime};

/// Wall-clock instant as seconds/nanos since the Unix epoch.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub secs: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}

impl Timestamp {
    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => Self {
                secs: d.as_secs() as i64,
                nanos: d.subsec_nanos() as i32,
            },
            Err(_) => Self::default(),
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        SystemTime::UNIX_EPOCH
            + Duration::from_secs(self.secs.max(0) as u64)
            + Duration::from_nanos(self.nanos.max(0) as u64)
    }
}

/// Detection error reported for one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ReadoutError {
    NoError = 0,
    IlluminationError = 1,
    ProcessOverflow = 2,
    ProcessTimeout = 3,
}

/// One detected tag inside a frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TagDetection {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(double, tag = "2")]
    pub x: f64,
    #[prost(double, tag = "3")]
    pub y: f64,
    #[prost(double, tag = "4")]
    pub theta: f64,
}

/// One frame detection readout as produced by a tracker.
///
/// `width`/`height` are only set on the first frame of a stream segment;
/// records fabricated on timeout carry neither payload nor timestamp.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FrameRecord {
    #[prost(int64, tag = "1")]
    pub frame_id: i64,
    #[prost(message, optional, tag = "2")]
    pub time: Option<Timestamp>,
    #[prost(int64, tag = "3")]
    pub timestamp_us: i64,
    #[prost(string, tag = "4")]
    pub producer_id: String,
    #[prost(int32, tag = "5")]
    pub width: i32,
    #[prost(int32, tag = "6")]
    pub height: i32,
    #[prost(int32, tag = "7")]
    pub quads: i32,
    #[prost(enumeration = "ReadoutError", tag = "8")]
    pub error: i32,
    #[prost(message, repeated, tag = "9")]
    pub tags: Vec<TagDetection>,
}

/// Stream kind announced by a `Header`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum HeaderType {
    Unspecified = 0,
    Network = 1,
    File = 2,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct Version {
    #[prost(uint32, tag = "1")]
    pub major: u32,
    #[prost(uint32, tag = "2")]
    pub minor: u32,
}

/// Leading message of both the broadcast stream and segment files.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(enumeration = "HeaderType", tag = "1")]
    pub kind: i32,
    #[prost(message, optional, tag = "2")]
    pub version: Option<Version>,
    #[prost(int32, tag = "3")]
    pub width: i32,
    #[prost(int32, tag = "4")]
    pub height: i32,
    #[prost(string, tag = "5")]
    pub previous: String,
}

/// Version of the broadcast stream format.
pub const NETWORK_VERSION: Version = Version { major: 0, minor: 5 };
/// Version of the on-disk segment format.
pub const FILE_VERSION: Version = Version { major: 0, minor: 2 };

/// Trailing message of a segment file, cross-linking to its successor.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Footer {
    #[prost(string, tag = "1")]
    pub next: String,
}

/// One line of a segment file: a record or the closing footer.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FileLine {
    #[prost(message, optional, tag = "1")]
    pub readout: Option<FrameRecord>,
    #[prost(message, optional, tag = "2")]
    pub footer: Option<Footer>,
}
