pub mod alarm;
pub mod broadcast;
pub mod config;
pub mod disk;
pub mod dispatch;
pub mod experiment;
pub mod export;
pub mod fsutil;
pub mod ingest;
pub mod merge;
pub mod monitor;
pub mod seglog;
pub mod supervisor;
pub mod task;
pub mod units;
pub mod video;
pub mod wire;
