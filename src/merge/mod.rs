//! Multi-producer frame merging.
//!
//! Frames arrive unordered and jittered from one master and zero or more
//! slave producers, each owning a disjoint residue class of frame ids
//! modulo the stride. The merger re-emits them as a strictly monotone
//! sequence, rewriting slave timestamps onto the master clock and
//! fabricating a `ProcessTimeout` record for any id that stays missing
//! longer than its deadline.

mod balance;

pub use balance::{SyncPoint, WorkloadBalance};

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Result};
use prometheus::IntCounter;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::wire::{FrameRecord, ReadoutError, Timestamp};

/// Ids lagging further than this many strides behind the emission cursor
/// are evicted from the reorder buffer.
const MAX_LAG_STRIDES: i64 = 10;

/// Observable merger counters.
#[derive(Clone)]
pub struct MergeCounters {
    pub frames_tracked: IntCounter,
    pub frames_timed_out: IntCounter,
    pub frames_dropped: IntCounter,
}

impl MergeCounters {
    /// Counters not attached to any registry, for standalone use.
    pub fn unregistered() -> Self {
        Self {
            frames_tracked: IntCounter::new("frames_tracked", "frames merged cleanly")
                .expect("static counter opts"),
            frames_timed_out: IntCounter::new("frames_timed_out", "frames fabricated on timeout")
                .expect("static counter opts"),
            frames_dropped: IntCounter::new("frames_dropped", "frames dropped before emission")
                .expect("static counter opts"),
        }
    }
}

/// Merges the inbound multi-producer stream into `outbound`.
///
/// Returns when the inbound queue closes or the scope is cancelled; the
/// outbound queue closes when the sender is dropped on return. The i-th
/// emitted record has frame id `first_accepted + i`.
pub async fn merge_frames(
    cancel: CancellationToken,
    mut balance: WorkloadBalance,
    mut inbound: mpsc::Receiver<FrameRecord>,
    outbound: mpsc::Sender<FrameRecord>,
    counters: MergeCounters,
) -> Result<()> {
    balance.check()?;

    let stride = balance.stride() as i64;
    let between_frames = Duration::from_nanos((1.0e9 / balance.fps()) as u64);
    let timeout = between_frames * (2 * stride as u32 + 2);

    let mut next_to_emit: i64 = 0;
    let mut max_seen: i64 = -1;
    let mut deadlines: HashMap<i64, Instant> = HashMap::new();
    // Holds at most a handful of frames per producer; linear scans beat a
    // heap at stride <= 4.
    let mut buffer: Vec<FrameRecord> = Vec::with_capacity(10 * balance.stride());

    loop {
        let earliest = deadlines.values().min().copied();
        let sleep_target = earliest.unwrap_or_else(|| Instant::now() + timeout);

        let now;
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),

            frame = inbound.recv() => {
                let Some(mut frame) = frame else { return Ok(()) };

                if frame.frame_id > max_seen {
                    max_seen = frame.frame_id;
                }

                if let Err(e) = balance.check_frame(&mut frame) {
                    warn!(frame_id = frame.frame_id, error = %e, "workload balance error");
                    counters.frames_dropped.inc();
                    continue;
                }

                now = Instant::now();

                if deadlines.is_empty() {
                    next_to_emit = frame.frame_id;
                    for i in 1..=stride {
                        deadlines.insert(
                            next_to_emit + i,
                            now + between_frames * i as u32 + timeout,
                        );
                    }
                }

                if frame.frame_id < next_to_emit {
                    warn!(frame_id = frame.frame_id, "timeout already sent, dropping");
                    counters.frames_dropped.inc();
                    continue;
                }

                deadlines.remove(&frame.frame_id);
                deadlines.insert(frame.frame_id + stride, now + timeout);
                buffer.push(frame);
            }

            _ = tokio::time::sleep_until(sleep_target), if earliest.is_some() => {
                now = Instant::now();
            }
        }

        // Fill expired slots with fabricated timeout records.
        let end = (next_to_emit + stride).max(max_seen);
        for id in next_to_emit..end {
            let expired = deadlines.get(&id).is_some_and(|d| now >= *d);
            if !expired {
                continue;
            }
            warn!(frame_id = id, "marking frame as timed out");
            counters.frames_timed_out.inc();
            buffer.push(FrameRecord {
                frame_id: id,
                error: ReadoutError::ProcessTimeout as i32,
                time: Some(Timestamp::from_system_time(SystemTime::now())),
                ..Default::default()
            });
            deadlines.remove(&id);
            deadlines.insert(id + stride, now + timeout);
        }

        buffer.sort_by_key(|r| r.frame_id);

        // Emit the contiguous prefix starting at the cursor.
        while let Some(first) = buffer.first() {
            if first.frame_id < next_to_emit {
                error!(
                    next_frame_id = next_to_emit,
                    buffered_id = first.frame_id,
                    "inconsistent buffer state",
                );
                counters.frames_dropped.inc();
                buffer.remove(0);
                continue;
            }
            if first.frame_id > next_to_emit {
                break;
            }

            let mut record = buffer.remove(0);
            record.producer_id.clear();
            if record.error() == ReadoutError::NoError {
                counters.frames_tracked.inc();
            }

            if outbound.send(record).await.is_err() {
                bail!("merged frame output closed early");
            }
            deadlines.remove(&next_to_emit);
            next_to_emit += 1;
        }

        // Bound the buffer against pathological producers.
        let lag_floor = next_to_emit - MAX_LAG_STRIDES * stride;
        let before = buffer.len();
        buffer.retain(|r| r.frame_id >= lag_floor);
        let evicted = before - buffer.len();
        if evicted > 0 {
            warn!(evicted, lag_floor, "evicting stale frames from reorder buffer");
            counters.frames_dropped.inc_by(evicted as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn two_producer_balance(fps: f64) -> WorkloadBalance {
        let mut residues = HashMap::new();
        residues.insert("foo".to_string(), vec![true, false]);
        residues.insert("bar".to_string(), vec![false, true]);
        WorkloadBalance::new(fps, 2, "foo", residues)
    }

    fn frame(id: i64, producer: &str, wall: SystemTime, timestamp_us: i64) -> FrameRecord {
        FrameRecord {
            frame_id: id,
            producer_id: producer.into(),
            time: Some(Timestamp::from_system_time(wall)),
            timestamp_us,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unknown_producer_is_dropped() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let counters = MergeCounters::unregistered();
        let dropped = counters.frames_dropped.clone();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(merge_frames(
            cancel.clone(),
            two_producer_balance(1000.0),
            in_rx,
            out_tx,
            counters,
        ));

        let now = SystemTime::now();
        in_tx
            .send(frame(0, "intruder", now, 0))
            .await
            .expect("send");
        in_tx.send(frame(0, "foo", now, 1000)).await.expect("send");

        let first = out_rx.recv().await.expect("merged frame");
        assert_eq!(first.frame_id, 0);
        assert!(first.producer_id.is_empty());
        assert_eq!(dropped.get(), 1);

        drop(in_tx);
        handle.await.expect("join").expect("merge result");
    }

    #[tokio::test]
    async fn test_wrong_residue_is_dropped() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let counters = MergeCounters::unregistered();
        let dropped = counters.frames_dropped.clone();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(merge_frames(
            cancel.clone(),
            two_producer_balance(1000.0),
            in_rx,
            out_tx,
            counters,
        ));

        let now = SystemTime::now();
        // Residue 1 belongs to bar, not to the master.
        in_tx.send(frame(1, "foo", now, 1000)).await.expect("send");
        in_tx.send(frame(0, "foo", now, 1000)).await.expect("send");

        let first = out_rx.recv().await.expect("merged frame");
        assert_eq!(first.frame_id, 0);
        assert_eq!(dropped.get(), 1);

        drop(in_tx);
        handle.await.expect("join").expect("merge result");
    }

    #[tokio::test]
    async fn test_gap_is_fabricated_as_timeout() {
        let fps = 500.0;
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let counters = MergeCounters::unregistered();
        let timed_out = counters.frames_timed_out.clone();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(merge_frames(
            cancel.clone(),
            two_producer_balance(fps),
            in_rx,
            out_tx,
            counters,
        ));

        let base = SystemTime::now();
        let period = Duration::from_nanos((1.0e9 / fps) as u64);
        in_tx.send(frame(0, "foo", base, 1000)).await.expect("send");
        // Frame 1 (bar's residue) never arrives; frame 2 does.
        in_tx
            .send(frame(2, "foo", base + 2 * period, 1000 + 2 * period.as_micros() as i64))
            .await
            .expect("send");

        let mut ids = Vec::new();
        for _ in 0..3 {
            let r = out_rx.recv().await.expect("merged frame");
            ids.push((r.frame_id, r.error()));
        }
        assert_eq!(
            ids,
            vec![
                (0, ReadoutError::NoError),
                (1, ReadoutError::ProcessTimeout),
                (2, ReadoutError::NoError),
            ],
        );
        assert_eq!(timed_out.get(), 1);

        drop(in_tx);
        handle.await.expect("join").expect("merge result");
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_merger() {
        let (_in_tx, in_rx) = mpsc::channel::<FrameRecord>(1);
        let (out_tx, _out_rx) = mpsc::channel(1);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(merge_frames(
            cancel.clone(),
            two_producer_balance(1000.0),
            in_rx,
            out_tx,
            MergeCounters::unregistered(),
        ));

        cancel.cancel();
        handle.await.expect("join").expect("merge result");
    }
}
