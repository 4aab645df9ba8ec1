//! Disk headroom monitoring: free-space sampling, write-rate estimation
//! and the two-level disk alarm.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use prometheus::IntGauge;
use tokio_util::sync::CancellationToken;

use crate::alarm::{AlarmLevel, AlarmStatus, AlarmSuppressor, AlarmUpdate};
use crate::monitor::{DiskStatus, MonitorHandle};
use crate::units::{byte_size, human_duration, round_duration};
use crate::wire::Timestamp;

/// Identification of the disk headroom alarm.
pub const DISK_ALARM: &str = "tracking.disk_status";

const WARNING_HORIZON: Duration = Duration::from_secs(12 * 3600);
const EMERGENCY_HORIZON: Duration = Duration::from_secs(3600);

/// Returns (free, total) bytes of the filesystem holding `path`.
pub fn disk_size(path: &Path) -> Result<(i64, i64)> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("path {} contains a NUL byte", path.display()))?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path outlives the call and stat is a plain output struct.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(anyhow::Error::from(std::io::Error::last_os_error()))
            .with_context(|| format!("could not get available size for {}", path.display()));
    }

    let free = (stat.f_bavail as i64).saturating_mul(stat.f_frsize as i64);
    let total = (stat.f_blocks as i64).saturating_mul(stat.f_frsize as i64);
    Ok((free, total))
}

/// Estimates the mean write rate of a long-running process from free-byte
/// samples, discarding punctual external events: a sample deviating from
/// the smoothed mean by more than 50% resets the baseline and restarts the
/// estimation from that sample.
pub struct ByteRateEstimator {
    free_start_bytes: i64,
    start: SystemTime,
    mean: Option<f64>,
}

impl ByteRateEstimator {
    pub fn new(free_bytes: i64, start: SystemTime) -> Self {
        Self {
            free_start_bytes: free_bytes,
            start,
            mean: None,
        }
    }

    pub fn estimate(&mut self, free_bytes: i64, now: SystemTime) -> i64 {
        let elapsed = now
            .duration_since(self.start)
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let written = (self.free_start_bytes - free_bytes) as f64;
        let raw = if elapsed > 0.0 { written / elapsed } else { 0.0 };

        let Some(mean) = self.mean else {
            self.mean = Some(raw);
            return raw as i64;
        };

        // A NaN ratio (0/0) falls through to the smoothing branch.
        if ((raw - mean) / mean).abs() > 0.5 {
            // An external event moved the disk; restart the baseline and
            // report the last trusted estimate once.
            self.start = now;
            self.free_start_bytes = free_bytes;
            self.mean = None;
            return mean as i64;
        }

        let updated = mean + 0.8 * (raw - mean);
        self.mean = Some(updated);
        updated as i64
    }
}

/// Time until the disk limit is hit at the current write rate.
fn compute_eta(status: &DiskStatus, disk_limit: i64) -> Option<Duration> {
    if status.bytes_per_second <= 0 {
        return None;
    }
    let remaining = (status.free_bytes - disk_limit).max(0);
    Some(Duration::from_secs_f64(
        remaining as f64 / status.bytes_per_second as f64,
    ))
}

/// Builds the raw disk alarm state for one sample; idempotent repetitions
/// are filtered by the caller's [`AlarmSuppressor`].
pub fn compute_alarm(status: &DiskStatus, disk_limit: i64, now: SystemTime) -> AlarmUpdate {
    let eta = compute_eta(status, disk_limit);

    let mut update = AlarmUpdate {
        identification: DISK_ALARM.into(),
        level: AlarmLevel::Warning as i32,
        status: AlarmStatus::Off as i32,
        description: String::new(),
        time: Some(Timestamp::from_system_time(now)),
    };

    let Some(eta) = eta else { return update };

    if eta < WARNING_HORIZON {
        update.status = AlarmStatus::On as i32;
        update.description = format!(
            "low free disk space ( {} ), will stop in ~ {}",
            byte_size(status.free_bytes),
            human_duration(round_duration(eta, Duration::from_secs(600))),
        );
    }

    if eta < EMERGENCY_HORIZON {
        update.status = AlarmStatus::On as i32;
        update.level = AlarmLevel::Emergency as i32;
        update.description = format!(
            "critically low free disk space ( {} ), will stop in ~ {}",
            byte_size(status.free_bytes),
            human_duration(round_duration(eta, Duration::from_secs(60))),
        );
    }

    update
}

/// Periodically samples the experiment directory's filesystem, aborting
/// the experiment on a stat failure or when the free space drops under
/// the configured limit.
pub struct DiskWatcher {
    dir: PathBuf,
    disk_limit: i64,
    period: Duration,
    estimator: ByteRateEstimator,
    alarms: AlarmSuppressor,
    monitor: Option<MonitorHandle>,
    usage: Option<IntGauge>,
}

impl DiskWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        disk_limit: i64,
        period: Duration,
        estimator: ByteRateEstimator,
        monitor: Option<MonitorHandle>,
        usage: Option<IntGauge>,
    ) -> Self {
        Self {
            dir: dir.into(),
            disk_limit,
            period,
            estimator,
            alarms: AlarmSuppressor::new(),
            monitor,
            usage,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.period,
            self.period,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.poll_disk(SystemTime::now())?,
            }
        }
    }

    fn poll_disk(&mut self, now: SystemTime) -> Result<()> {
        let (free, total) = disk_size(&self.dir)?;
        let bps = self.estimator.estimate(free, now);

        if let Some(usage) = &self.usage {
            usage.set(total - free);
        }

        if free < self.disk_limit {
            bail!(
                "insufficient disk space: available: {} minimum: {}",
                byte_size(free),
                byte_size(self.disk_limit),
            );
        }

        let Some(monitor) = &self.monitor else {
            return Ok(());
        };

        let status = DiskStatus {
            free_bytes: free,
            total_bytes: total,
            bytes_per_second: bps,
        };
        let update = self
            .alarms
            .filter(compute_alarm(&status, self.disk_limit, now));
        monitor.push_disk_status(status, update);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: i64 = 1024 * 1024;

    #[test]
    fn test_disk_size_reads_filesystem() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (free, total) = disk_size(dir.path()).expect("statvfs");
        assert!(total >= free);
        assert!(free >= 0);

        let err = disk_size(&dir.path().join("does-not-exist")).expect_err("missing path");
        assert!(err.to_string().contains("could not get available size"));
    }

    #[test]
    fn test_estimator_converges_on_constant_rate() {
        let start = SystemTime::UNIX_EPOCH;
        let mut estimator = ByteRateEstimator::new(10 * MIB, start);

        let mut last = 0;
        for t in 1..=8u64 {
            let free = 10 * MIB - (50 * t as i64);
            last = estimator.estimate(free, start + Duration::from_secs(t));
        }
        assert!((last - 50).abs() <= 2, "estimate {last} should approach 50");
    }

    #[test]
    fn test_estimator_resets_on_external_event() {
        let start = SystemTime::UNIX_EPOCH;
        let mut estimator = ByteRateEstimator::new(10 * MIB, start);

        for t in 1..=8u64 {
            let free = 10 * MIB - (50 * t as i64);
            estimator.estimate(free, start + Duration::from_secs(t));
        }

        // A large deletion raises free space: the estimator returns its
        // previous estimate once and restarts its baseline.
        let jumped = estimator.estimate(100 * MIB, start + Duration::from_secs(9));
        assert!((jumped - 50).abs() <= 2, "previous estimate returned, got {jumped}");

        let mut last = 0;
        for t in 10..=16u64 {
            let free = 100 * MIB - 50 * (t as i64 - 9);
            last = estimator.estimate(free, start + Duration::from_secs(t));
        }
        assert!((last - 50).abs() <= 2, "estimate {last} should re-converge to 50");
    }

    #[test]
    fn test_alarm_ladder_warning_emergency_off() {
        let mut suppressor = AlarmSuppressor::new();
        let limit = 10 * MIB;
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(32);

        // ~6h to the limit: warning.
        let status = DiskStatus {
            free_bytes: 20 * MIB,
            total_bytes: 40 * MIB,
            bytes_per_second: 485,
        };
        let update = suppressor
            .filter(compute_alarm(&status, limit, now))
            .expect("warning update");
        assert_eq!(update.identification, DISK_ALARM);
        assert_eq!(update.level(), AlarmLevel::Warning);
        assert_eq!(update.status(), AlarmStatus::On);
        assert_eq!(
            update.description,
            "low free disk space ( 20.0 MiB ), will stop in ~ 6h0m",
        );

        // Nearly the same state a second later: suppressed.
        let status2 = DiskStatus {
            free_bytes: 20 * MIB - 485,
            ..status
        };
        assert!(suppressor
            .filter(compute_alarm(&status2, limit, now + Duration::from_secs(1)))
            .is_none());

        // Faster writes: emergency.
        let status3 = DiskStatus {
            free_bytes: 20 * MIB - 2 * 485,
            total_bytes: 40 * MIB,
            bytes_per_second: 3000,
        };
        let update = suppressor
            .filter(compute_alarm(&status3, limit, now + Duration::from_secs(2)))
            .expect("emergency update");
        assert_eq!(update.level(), AlarmLevel::Emergency);
        assert_eq!(update.status(), AlarmStatus::On);
        assert!(
            update
                .description
                .starts_with("critically low free disk space"),
            "{}",
            update.description,
        );
        assert!(
            update.description.ends_with("will stop in ~ 58m0s"),
            "{}",
            update.description,
        );

        // Writes stop entirely: back to off with an empty description.
        let status4 = DiskStatus {
            bytes_per_second: 0,
            ..status3
        };
        let update = suppressor
            .filter(compute_alarm(&status4, limit, now + Duration::from_secs(3)))
            .expect("off update");
        assert_eq!(update.level(), AlarmLevel::Warning);
        assert_eq!(update.status(), AlarmStatus::Off);
        assert!(update.description.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_fails_when_limit_exceeded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (free, _) = disk_size(dir.path()).expect("statvfs");

        let watcher = DiskWatcher::new(
            dir.path(),
            free + 1000 * 1024,
            Duration::from_millis(20),
            ByteRateEstimator::new(free, SystemTime::now()),
            None,
            None,
        );

        let cancel = CancellationToken::new();
        let result = tokio::time::timeout(Duration::from_millis(500), watcher.run(cancel))
            .await
            .expect("watcher should fail before the timeout");
        let err = result.expect_err("limit exceeded");
        assert!(err.to_string().contains("insufficient disk space"), "{err}");
    }
}
