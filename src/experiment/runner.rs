//! Experiment orchestration.
//!
//! A master node wires listener → merger → dispatcher → {writer,
//! broadcaster} plus the video pipeline, disk watcher and monitor client
//! around the local tracker child; a slave node only supervises its
//! tracker. Two cancellation scopes drive teardown: the tracker scope is
//! derived from the experiment's outer cancellation, while the "other"
//! scope is independent and only cancelled once the tracker has exited,
//! so downstream subtasks can drain its final output.

use std::os::fd::{FromRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Error, Result};
use tokio::net::unix::pipe;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broadcast::Broadcaster;
use crate::disk::DiskWatcher;
use crate::export::health::HealthMetrics;
use crate::ingest::FrameListener;
use crate::merge::{merge_frames, MergeCounters};
use crate::monitor::{MonitorClient, MonitorHandle, TrackingDeclaration};
use crate::seglog::SegmentedWriter;
use crate::task::TaskSet;
use crate::video::VideoPipeline;
use crate::wire::Timestamp;

use super::env::{hostname, ExperimentEnv, ExperimentLog};
use super::slaves;

/// Subtasks whose early return ends the experiment.
const CRITICAL_TASKS: [&str; 7] = [
    "local-tracker",
    "frame-listener",
    "frame-merger",
    "frame-dispatcher",
    "writer",
    "video",
    "disk-watcher",
];

/// Queue depths between subtasks.
const LISTENER_QUEUE: usize = 100;
const MERGED_QUEUE: usize = 10;
const WRITER_QUEUE: usize = 200;
const BROADCAST_QUEUE: usize = 10;

/// Listener and broadcaster close graces.
const LISTENER_GRACE: Duration = Duration::from_millis(100);
const BROADCASTER_GRACE: Duration = Duration::from_secs(1);

/// Segment rotation period of the frame log.
const SEGMENT_PERIOD: Duration = Duration::from_secs(2 * 3600);

/// Runs one experiment to completion, returning its log. `cancel` is the
/// outer, user-driven stop signal.
pub async fn run_experiment(
    env: ExperimentEnv,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
) -> ExperimentLog {
    if let Some(h) = &health {
        h.experiment_running.set(1);
    }

    let result = if env.node.is_master() {
        run_master(&env, health.as_deref(), cancel).await
    } else {
        run_slave_node(&env, cancel).await
    };

    if let Some(h) = &health {
        h.experiment_running.set(0);
    }

    let log = env.teardown(result.as_ref().err());
    match &result {
        Err(e) => error!(error = %e, "experiment failed"),
        Ok(()) => info!("experiment done"),
    }
    log
}

/// Handles for supervising a started tracker child: the pid arrives once
/// the child is spawned, `done` fires when it has exited.
struct TrackerWatch {
    pid_rx: oneshot::Receiver<u32>,
    done: CancellationToken,
}

/// An anonymous pipe between the tracker's stdout and the video
/// pipeline. The orchestrator keeps the write end: the pipeline only
/// sees EOF when the orchestrator closes it, after the tracker has been
/// reaped, never in a race with the tracker's own exit.
fn video_pipe() -> Result<(pipe::Receiver, OwnedFd)> {
    let mut fds = [0i32; 2];
    // SAFETY: pipe2 fills the two fds on success; both are owned below.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(anyhow::Error::from(std::io::Error::last_os_error()))
            .context("creating tracker stdout pipe");
    }
    // SAFETY: fresh fds from pipe2, each wrapped exactly once.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    let receiver = pipe::Receiver::from_owned_fd(read).context("registering pipe read end")?;
    Ok((receiver, write))
}

/// Spawns the tracker child as the "local-tracker" subtask. A clean exit
/// is normal completion; any non-zero status is an error.
fn start_tracker(
    env: &ExperimentEnv,
    tasks: &mut TaskSet,
    stdout: Stdio,
) -> Result<TrackerWatch> {
    let mut command = tokio::process::Command::new(&env.daemon.tracker.command);
    command.args(env.tracker_args());
    command.stdin(Stdio::null());
    command.stdout(stdout);

    let stderr = std::fs::File::create(env.tracker_stderr_path())
        .context("creating tracker stderr file")?;
    command.stderr(Stdio::from(stderr));

    let mut child = command
        .spawn()
        .with_context(|| format!("starting tracker {}", env.daemon.tracker.command))?;

    let (pid_tx, pid_rx) = oneshot::channel();
    let done = CancellationToken::new();
    let done_child = done.clone();

    tasks.spawn("local-tracker", async move {
        let _exit_signal = done_child.drop_guard();
        if let Some(pid) = child.id() {
            let _ = pid_tx.send(pid);
        }
        let status = child.wait().await.context("waiting for tracker")?;
        if !status.success() {
            anyhow::bail!("tracker exited with {status}");
        }
        Ok(())
    });

    Ok(TrackerWatch { pid_rx, done })
}

/// Waits for tracker-scope cancellation, interrupts the tracker and
/// escalates to SIGKILL after `grace`.
async fn watch_tracker(watch: TrackerWatch, tracker_cancel: CancellationToken, grace: Duration) {
    let Ok(pid) = watch.pid_rx.await else { return };

    tracker_cancel.cancelled().await;
    if watch.done.is_cancelled() {
        return;
    }

    // The tracker may have crashed right before the signal; the pid stays
    // valid because the child is not reaped until the local-tracker
    // subtask waits on it.
    // SAFETY: plain kill(2) on a pid this process spawned.
    unsafe { libc::kill(pid as i32, libc::SIGINT) };

    tokio::select! {
        _ = watch.done.cancelled() => {}
        _ = tokio::time::sleep(grace) => {
            warn!(grace = ?grace, "killing tracker, did not terminate in time");
            // SAFETY: as above.
            unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        }
    }
}

async fn run_master(
    env: &ExperimentEnv,
    health: Option<&HealthMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let tracker_cancel = cancel.child_token();
    let other_cancel = CancellationToken::new();
    let killing_grace = env.killing_grace();
    let mut tasks = TaskSet::new();

    // Queues between the subtasks.
    let (inbound_tx, inbound_rx) = mpsc::channel(LISTENER_QUEUE);
    let (merged_tx, merged_rx) = mpsc::channel(MERGED_QUEUE);
    let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE);
    let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE);

    let fps = env.config.fps();
    let idle = Duration::from_secs_f64(3.0 / fps);

    // Everything fallible happens before any subtask starts, so a setup
    // failure never leaks running tasks. Bind failures are fatal.
    let listener =
        FrameListener::bind(env.daemon.ports.frames, LISTENER_GRACE, inbound_tx).await?;
    let broadcaster =
        Broadcaster::bind(env.daemon.ports.broadcast, idle, BROADCASTER_GRACE).await?;
    let balance = env.config.workload_balance()?;
    let writer = SegmentedWriter::new(env.path("tracking.frames"), SEGMENT_PERIOD);
    let video = VideoPipeline::new(env.video_config())?;
    let (video_input, video_tx) = video_pipe()?;
    let tracker_stdout = Stdio::from(
        video_tx
            .try_clone()
            .context("duplicating tracker stdout pipe")?,
    );

    // Monitor client, when a stream host is configured.
    let monitor: Option<MonitorHandle> = match env.monitor_address() {
        Some(address) => {
            let declaration = TrackingDeclaration {
                hostname: hostname(),
                experiment_name: env.config.experiment_name.clone(),
                stream_server: env.config.stream.host.clone().unwrap_or_default(),
                since: Some(Timestamp::from_system_time(SystemTime::now())),
            };
            let (client, handle) = MonitorClient::new(address, declaration);
            let monitor_cancel = other_cancel.clone();
            tasks.spawn("monitor", async move { client.run(monitor_cancel).await });
            Some(handle)
        }
        None => None,
    };

    let counters = health
        .map(HealthMetrics::merge_counters)
        .unwrap_or_else(MergeCounters::unregistered);

    let watcher = DiskWatcher::new(
        &env.experiment_dir,
        env.daemon.disk.limit_bytes,
        env.daemon.disk.poll_interval,
        env.rate_estimator(),
        monitor.clone(),
        health.map(|h| h.disk_used_bytes.clone()),
    );

    // Start all subtasks.
    {
        let c = other_cancel.clone();
        tasks.spawn("disk-watcher", async move { watcher.run(c).await });
    }
    {
        let c = other_cancel.clone();
        tasks.spawn("frame-listener", async move { listener.run(c).await });
    }
    {
        let c = other_cancel.clone();
        tasks.spawn("frame-merger", async move {
            merge_frames(c, balance, inbound_rx, merged_tx, counters).await
        });
    }
    {
        let c = other_cancel.clone();
        tasks.spawn("frame-dispatcher", async move {
            crate::dispatch::dispatch_frames(c, merged_rx, vec![writer_tx, broadcast_tx]).await
        });
    }
    tasks.spawn("writer", async move { writer.run(writer_rx).await });
    {
        let c = other_cancel.clone();
        tasks.spawn("broadcaster", async move {
            broadcaster.run(c, broadcast_rx).await
        });
    }

    // Slaves must be started before the local tracker.
    slaves::start_slaves(env).await;

    // Tracker child, its termination watcher, and the stdout pipe feeding
    // the video pipeline. A spawn failure becomes the local-tracker
    // subtask's error so teardown runs the same path.
    tasks.spawn("video", async move { video.run(video_input).await });

    match start_tracker(env, &mut tasks, tracker_stdout) {
        Ok(watch) => {
            tokio::spawn(watch_tracker(watch, tracker_cancel.clone(), killing_grace));
        }
        Err(e) => {
            let message = format!("{e:#}");
            tasks.spawn("local-tracker", async move { Err(anyhow!(message)) });
        }
    }

    // Wait for the first critical completion. The local tracker finishing
    // cleanly is normal completion; anything else is a failure.
    let (name, err) = tasks.wait_any(&CRITICAL_TASKS).await;
    let mut failure: Option<Error> = match (name, err) {
        ("local-tracker", None) => None,
        (name, None) => Some(anyhow!("critical task {name} exited early without an error")),
        (_, Some(e)) => Some(e.context(format!("critical task {name}"))),
    };

    if let (Some(monitor), Some(e)) = (&monitor, &failure) {
        monitor.fatal(e);
    }

    // Tear down: slaves first, then the local tracker.
    slaves::stop_slaves(env).await;
    tracker_cancel.cancel();

    if let Some(e) = tasks.wait_for("local-tracker").await {
        if let Some(monitor) = &monitor {
            monitor.fatal(&e);
        }
        failure = Some(match failure {
            Some(first) => first.context(format!("{e:#}")),
            None => e,
        });
    }

    // The tracker is gone: closing the pipe's write end delivers EOF to
    // the video pipeline once any buffered frames are drained.
    drop(video_tx);

    // Only now stop the downstream subtasks so they drain the tracker's
    // final output.
    other_cancel.cancel();
    tasks.wait_all(killing_grace).await;

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn run_slave_node(env: &ExperimentEnv, cancel: CancellationToken) -> Result<()> {
    let mut tasks = TaskSet::new();
    let killing_grace = env.killing_grace();

    let watch = start_tracker(env, &mut tasks, Stdio::null())?;
    tokio::spawn(watch_tracker(watch, cancel.clone(), killing_grace));

    info!("slave tracker started");
    match tasks.wait_for("local-tracker").await {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
