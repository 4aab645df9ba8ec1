use std::collections::HashMap;
use std::time::SystemTime;

use anyhow::{bail, Result};

use crate::wire::FrameRecord;

/// Slave clock offset smoothing constant. Larger values propagate jitter,
/// smaller ones track slow drift too slowly.
const OFFSET_SMOOTHING: f64 = 0.2;

/// Last master record's (wall time, producer timestamp) pair, the anchor
/// for slave clock offset computation.
#[derive(Clone, Copy, Debug)]
pub struct SyncPoint {
    pub wall: SystemTime,
    pub timestamp_us: i64,
}

impl SyncPoint {
    /// Offset in microseconds a slave timestamp must be shifted by to land
    /// on the master clock.
    fn compute_offset(&self, wall: SystemTime, timestamp_us: i64) -> f64 {
        let elapsed_us = match wall.duration_since(self.wall) {
            Ok(d) => d.as_nanos() as f64 * 1.0e-3,
            Err(e) => -(e.duration().as_nanos() as f64) * 1.0e-3,
        };
        self.timestamp_us as f64 + elapsed_us - timestamp_us as f64
    }
}

/// The fixed producer contract for one experiment: the stride, the master
/// producer and the residue classes each producer may emit.
pub struct WorkloadBalance {
    fps: f64,
    stride: usize,
    master_id: String,
    residues_by_producer: HashMap<String, Vec<bool>>,

    sync_point: Option<SyncPoint>,
    offsets: HashMap<String, f64>,
}

impl WorkloadBalance {
    pub fn new(
        fps: f64,
        stride: usize,
        master_id: impl Into<String>,
        residues_by_producer: HashMap<String, Vec<bool>>,
    ) -> Self {
        Self {
            fps,
            stride,
            master_id: master_id.into(),
            residues_by_producer,
            sync_point: None,
            offsets: HashMap::new(),
        }
    }

    /// Contract for a single-node experiment: one producer owning every
    /// residue.
    pub fn single_node(fps: f64, producer_id: impl Into<String>) -> Self {
        let producer_id = producer_id.into();
        let mut residues = HashMap::new();
        residues.insert(producer_id.clone(), vec![true]);
        Self::new(fps, 1, producer_id, residues)
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn master_id(&self) -> &str {
        &self.master_id
    }

    pub fn producer_ids(&self) -> impl Iterator<Item = &str> {
        self.residues_by_producer.keys().map(String::as_str)
    }

    /// Validates the contract and resets the synchronization state.
    /// Every residue in [0, stride) must be claimed by exactly one
    /// producer.
    pub fn check(&mut self) -> Result<()> {
        if self.master_id.is_empty() {
            bail!("workload balance is missing a master producer id");
        }
        if self.fps <= 0.0 {
            bail!("workload balance requires a positive FPS, got {}", self.fps);
        }
        if self.residues_by_producer.len() > self.stride {
            bail!(
                "more producers ({}) than stride ({})",
                self.residues_by_producer.len(),
                self.stride,
            );
        }

        self.offsets.clear();
        self.sync_point = None;

        let mut owners: HashMap<usize, &str> = HashMap::new();
        for (producer, residues) in &self.residues_by_producer {
            if residues.len() != self.stride {
                bail!(
                    "invalid residue definition for producer {producer}: \
                     need {} entries, got {}",
                    self.stride,
                    residues.len(),
                );
            }
            for (residue, claimed) in residues.iter().enumerate() {
                if !claimed {
                    continue;
                }
                if let Some(other) = owners.get(&residue) {
                    bail!(
                        "producer {producer}: residue {residue} mod [{}] \
                         already produced by {other}",
                        self.stride,
                    );
                }
                owners.insert(residue, producer);
            }
        }

        for residue in 0..self.stride {
            if !owners.contains_key(&residue) {
                bail!("no producer set for residue {residue} mod [{}]", self.stride);
            }
        }

        Ok(())
    }

    fn residue_of(&self, frame_id: i64) -> usize {
        (frame_id.rem_euclid(self.stride as i64)) as usize
    }

    /// Validates one inbound frame against the contract and aligns slave
    /// timestamps onto the master clock. The frame's timestamp is rewritten
    /// in place for slave producers.
    pub fn check_frame(&mut self, frame: &mut FrameRecord) -> Result<()> {
        if frame.producer_id.is_empty() {
            bail!("received frame has no producer id");
        }
        let Some(residues) = self.residues_by_producer.get(&frame.producer_id) else {
            bail!("invalid producer id {}", frame.producer_id);
        };

        if self.stride == 1 {
            return Ok(());
        }

        let residue = self.residue_of(frame.frame_id);
        if !residues.get(residue).copied().unwrap_or(false) {
            bail!(
                "producer {} is not meant to produce frame {residue} mod [{}]",
                frame.producer_id,
                self.stride,
            );
        }

        let Some(wall) = frame.time.map(|t| t.to_system_time()) else {
            bail!("received frame has no wall time");
        };

        if frame.producer_id == self.master_id {
            self.sync_point = Some(SyncPoint {
                wall,
                timestamp_us: frame.timestamp_us,
            });
            return Ok(());
        }

        let Some(sync) = self.sync_point else {
            bail!("missing a first master frame to compute offset: dropping frame");
        };

        let raw = sync.compute_offset(wall, frame.timestamp_us);
        let offset = match self.offsets.get(&frame.producer_id) {
            Some(prev) => prev + OFFSET_SMOOTHING * (raw - prev),
            None => raw,
        };
        self.offsets.insert(frame.producer_id.clone(), offset);
        frame.timestamp_us += offset as i64;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Timestamp;
    use std::time::Duration;

    fn balance(stride: usize, defs: &[(&str, &[usize])]) -> WorkloadBalance {
        let mut residues = HashMap::new();
        for (producer, owned) in defs {
            let mut v = vec![false; stride];
            for &i in *owned {
                v[i] = true;
            }
            residues.insert(producer.to_string(), v);
        }
        WorkloadBalance::new(100.0, stride, defs[0].0, residues)
    }

    #[test]
    fn test_check_accepts_complete_coverage() {
        let mut wb = balance(2, &[("foo", &[0]), ("bar", &[1])]);
        assert!(wb.check().is_ok());
    }

    #[test]
    fn test_check_rejects_uncovered_residue() {
        let mut wb = balance(3, &[("foo", &[0]), ("bar", &[1])]);
        let err = wb.check().expect_err("missing residue 2");
        assert!(err.to_string().contains("no producer set"), "{err}");
    }

    #[test]
    fn test_check_rejects_double_claim() {
        let mut wb = balance(2, &[("foo", &[0, 1]), ("bar", &[1])]);
        let err = wb.check().expect_err("residue 1 claimed twice");
        assert!(err.to_string().contains("already produced"), "{err}");
    }

    #[test]
    fn test_check_rejects_more_producers_than_stride() {
        let mut wb = balance(1, &[("foo", &[0]), ("bar", &[])]);
        let err = wb.check().expect_err("two producers, stride one");
        assert!(err.to_string().contains("more producers"), "{err}");
    }

    #[test]
    fn test_slave_before_master_is_rejected() {
        let mut wb = balance(2, &[("foo", &[0]), ("bar", &[1])]);
        wb.check().expect("valid contract");

        let mut slave = FrameRecord {
            frame_id: 1,
            producer_id: "bar".into(),
            time: Some(Timestamp::from_system_time(SystemTime::now())),
            timestamp_us: 500,
            ..Default::default()
        };
        let err = wb.check_frame(&mut slave).expect_err("no sync point yet");
        assert!(err.to_string().contains("first master frame"), "{err}");
    }

    #[test]
    fn test_slave_timestamp_is_aligned_to_master_clock() {
        let mut wb = balance(2, &[("foo", &[0]), ("bar", &[1])]);
        wb.check().expect("valid contract");

        let base = SystemTime::now();
        let mut master = FrameRecord {
            frame_id: 0,
            producer_id: "foo".into(),
            time: Some(Timestamp::from_system_time(base)),
            timestamp_us: 1000,
            ..Default::default()
        };
        wb.check_frame(&mut master).expect("master frame");

        // Slave clock starts at 500 where the master expects 1000 + 10ms.
        let wall = base + Duration::from_millis(10);
        let mut slave = FrameRecord {
            frame_id: 1,
            producer_id: "bar".into(),
            time: Some(Timestamp::from_system_time(wall)),
            timestamp_us: 500 + 10_000,
            ..Default::default()
        };
        wb.check_frame(&mut slave).expect("slave frame");

        // First offset is applied unsmoothed: 1000 + 10000 - 10500 = 500.
        assert_eq!(slave.timestamp_us, 11_000);
    }

    #[test]
    fn test_offset_smoothing_converges() {
        let mut wb = balance(2, &[("foo", &[0]), ("bar", &[1])]);
        wb.check().expect("valid contract");

        let base = SystemTime::now();
        let period = Duration::from_millis(10);
        let mut emitted = Vec::new();

        for i in 0..40i64 {
            let wall = base + period * i as u32;
            let master_ts = 1000 + i * 10_000;
            if i % 2 == 0 {
                let mut f = FrameRecord {
                    frame_id: i,
                    producer_id: "foo".into(),
                    time: Some(Timestamp::from_system_time(wall)),
                    timestamp_us: master_ts,
                    ..Default::default()
                };
                wb.check_frame(&mut f).expect("master frame");
            } else {
                let mut f = FrameRecord {
                    frame_id: i,
                    producer_id: "bar".into(),
                    time: Some(Timestamp::from_system_time(wall)),
                    timestamp_us: master_ts - 700, // constant skew
                    ..Default::default()
                };
                wb.check_frame(&mut f).expect("slave frame");
                emitted.push((f.timestamp_us, master_ts));
            }
        }

        let (aligned, expected) = emitted.last().expect("slave frames");
        assert!(
            (aligned - expected).abs() <= 1,
            "converged timestamp {aligned} should match master clock {expected}",
        );
    }
}
