//! Non-blocking 1→N fan-out between the merger and its consumers.

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::wire::FrameRecord;

/// Copies every input record to each output queue with a non-blocking
/// send; an output that would block misses that record without slowing
/// the others. All outputs close when the input closes.
pub async fn dispatch_frames(
    cancel: CancellationToken,
    mut incoming: mpsc::Receiver<FrameRecord>,
    outgoing: Vec<mpsc::Sender<FrameRecord>>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),

            record = incoming.recv() => {
                let Some(record) = record else { return Ok(()) };
                for out in &outgoing {
                    let _ = out.try_send(record.clone());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64) -> FrameRecord {
        FrameRecord {
            frame_id: id,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_all_outputs_receive_each_record() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatch_frames(cancel, in_rx, vec![a_tx, b_tx]));

        for id in 0..3 {
            in_tx.send(record(id)).await.expect("send");
        }
        drop(in_tx);
        handle.await.expect("join").expect("dispatch result");

        for rx in [&mut a_rx, &mut b_rx] {
            for id in 0..3 {
                assert_eq!(rx.recv().await.expect("record").frame_id, id);
            }
            assert!(rx.recv().await.is_none(), "output closed with input");
        }
    }

    #[tokio::test]
    async fn test_full_output_drops_without_blocking_the_other() {
        let (in_tx, in_rx) = mpsc::channel(8);
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(dispatch_frames(cancel, in_rx, vec![slow_tx, fast_tx]));

        for id in 0..4 {
            in_tx.send(record(id)).await.expect("send");
        }
        drop(in_tx);
        handle.await.expect("join").expect("dispatch result");

        // The slow subscriber only kept the first record.
        assert_eq!(slow_rx.recv().await.expect("record").frame_id, 0);
        assert!(slow_rx.recv().await.is_none());

        // The fast one saw everything.
        for id in 0..4 {
            assert_eq!(fast_rx.recv().await.expect("record").frame_id, id);
        }
    }
}
