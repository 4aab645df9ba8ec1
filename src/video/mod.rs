//! Video pipeline: pipes the tracker's header-framed raw RGB stream
//! through three encoder child processes (encode → save, and optionally
//! encode → stream) while keeping a frame-matching file that maps the
//! pipeline's own sequence numbers to tracker frame ids.

mod encoder;

pub use encoder::EncoderCommand;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::fsutil::filename_without_overwrite;
use crate::units::byte_size;

/// Size of the per-frame header: (frame id, width, height) as LE u64.
const FRAME_HEADER_LEN: usize = 24;

/// Header read failures tolerated before giving up; sized to survive a
/// partial tracker restart mid-frame.
const MAX_HEADER_ERRORS: u64 = 1920 * 1024 * 3 * 30;

/// Consecutive frame-body copy failures tolerated before aborting.
const MAX_COPY_ERRORS: u32 = 3;

/// SIGKILL grace for each encoder child on shutdown.
const CHILD_GRACE: Duration = Duration::from_millis(500);

const PRESETS: [&str; 9] = [
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

const TUNES: [&str; 6] = [
    "film",
    "animation",
    "grain",
    "stillimage",
    "fastdecode",
    "zerolatency",
];

/// Static configuration of one experiment's video pipeline.
#[derive(Clone, Debug)]
pub struct VideoConfig {
    pub encoder_command: String,
    pub base_dir: PathBuf,
    pub hostname: String,
    pub fps: f64,
    pub period: Duration,
    pub bitrate_kb: u32,
    pub max_bitrate_kb: u32,
    /// Streaming destination; `None` disables the stream child.
    pub destination: Option<String>,
    pub channel: String,
    pub preset: String,
    pub tune: String,
}

impl VideoConfig {
    pub fn check(&self) -> Result<()> {
        if !PRESETS.contains(&self.preset.as_str()) {
            bail!("unknown quality '{}'", self.preset);
        }
        if !TUNES.contains(&self.tune.as_str()) {
            bail!("unknown tune '{}'", self.tune);
        }
        if self.fps <= 0.0 {
            bail!("video pipeline requires a positive FPS, got {}", self.fps);
        }
        Ok(())
    }

    fn encode_args(&self, resolution: &str) -> Vec<String> {
        let vbr = format!("{}k", self.bitrate_kb);
        let maxbr = format!("{}k", self.max_bitrate_kb);
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            "rawvideo".into(),
            "-vcodec".into(),
            "rawvideo".into(),
            "-pixel_format".into(),
            "rgb24".into(),
            "-video_size".into(),
            resolution.into(),
            "-framerate".into(),
            format!("{:.6}", self.fps),
            "-i".into(),
            "-".into(),
            "-c:v:0".into(),
            "libx264".into(),
            "-g".into(),
            format!("{}", (2.0 * self.fps) as i64),
            "-keyint_min".into(),
            format!("{}", self.fps as i64),
            "-b:v".into(),
            vbr.clone(),
            "-maxrate".into(),
            maxbr,
            "-bufsize".into(),
            vbr,
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-s".into(),
            resolution.into(),
            "-preset".into(),
            self.preset.clone(),
            "-tune".into(),
            self.tune.clone(),
            "-f".into(),
            "flv".into(),
            "-".into(),
        ]
    }

    fn save_args(&self, movie: &Path) -> Vec<String> {
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            "flv".into(),
            "-i".into(),
            "-".into(),
            "-vcodec".into(),
            "copy".into(),
            movie.to_string_lossy().into_owned(),
        ]
    }

    fn stream_args(&self) -> Option<Vec<String>> {
        let destination = self.destination.as_deref()?;
        Some(vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
            "-f".into(),
            "flv".into(),
            "-i".into(),
            "-".into(),
            "-vcodec".into(),
            "copy".into(),
            format!(
                "rtmp://{destination}/{}/{}.flv",
                self.channel, self.hostname
            ),
        ])
    }
}

/// Per-segment output paths, each instantiated without overwriting.
struct SegmentFiles {
    movie: PathBuf,
    frame_matching: PathBuf,
    encode_log: PathBuf,
    save_log: PathBuf,
    stream_log: PathBuf,
}

impl SegmentFiles {
    fn instantiate(base_dir: &Path) -> Result<Self> {
        let pick = |name: &str| -> Result<PathBuf> {
            let (path, _) = filename_without_overwrite(&base_dir.join(name))?;
            Ok(path)
        };
        Ok(Self {
            movie: pick("stream.mp4")?,
            frame_matching: pick("stream.frame-matching.txt")?,
            encode_log: pick("encoding.log")?,
            save_log: pick("save.log")?,
            stream_log: pick("streaming.log")?,
        })
    }
}

/// One running segment: three children, the tee task and the
/// frame-matching file.
struct ActiveSegment {
    encode: EncoderCommand,
    save: EncoderCommand,
    stream: Option<EncoderCommand>,
    encode_stdin: ChildStdin,
    copy_task: JoinHandle<u64>,
    frame_matching: std::fs::File,
}

impl ActiveSegment {
    async fn stop(mut self) {
        info!("stopping video tasks");
        // Closing encode's stdin cascades EOF down the chain.
        drop(self.encode_stdin);

        self.encode.wait_or_kill(CHILD_GRACE).await;
        self.save.wait_or_kill(CHILD_GRACE).await;
        if let Some(mut stream) = self.stream.take() {
            stream.wait_or_kill(CHILD_GRACE).await;
        }

        match self.copy_task.await {
            Ok(written) => info!(written = %byte_size(written as i64), "segment data transferred"),
            Err(e) => warn!(error = %e, "segment copy task failed"),
        }
    }
}

/// Copies the encoded stream to the save child and, when streaming, to
/// the stream child. Stream write errors are ignored so a broken RTMP
/// destination cannot stall saving.
async fn tee_copy(
    mut src: ChildStdout,
    mut save: ChildStdin,
    mut stream: Option<ChildStdin>,
) -> u64 {
    let mut buf = vec![0u8; 32 * 1024];
    let mut total = 0u64;

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "could not read encoded stream");
                break;
            }
        };

        if let Err(e) = save.write_all(&buf[..n]).await {
            warn!(error = %e, "could not transfer data between video tasks");
            break;
        }
        if let Some(s) = &mut stream {
            let _ = s.write_all(&buf[..n]).await;
        }
        total += n as u64;
    }

    total
}

pub struct VideoPipeline {
    config: VideoConfig,
    resolution: Option<(u64, u64)>,
}

impl VideoPipeline {
    pub fn new(config: VideoConfig) -> Result<Self> {
        config.check()?;
        Ok(Self {
            config,
            resolution: None,
        })
    }

    fn start_segment(&self, width: u64, height: u64) -> Result<ActiveSegment> {
        let files = SegmentFiles::instantiate(&self.config.base_dir)?;
        let frame_matching = std::fs::File::create(&files.frame_matching)
            .with_context(|| format!("creating {}", files.frame_matching.display()))?;

        let resolution = format!("{width}x{height}");
        let mut encode = EncoderCommand::spawn(
            &self.config.encoder_command,
            &self.config.encode_args(&resolution),
            &files.encode_log,
        )?;
        let mut save = EncoderCommand::spawn(
            &self.config.encoder_command,
            &self.config.save_args(&files.movie),
            &files.save_log,
        )?;
        let mut stream = match self.config.stream_args() {
            Some(args) => Some(EncoderCommand::spawn(
                &self.config.encoder_command,
                &args,
                &files.stream_log,
            )?),
            None => None,
        };

        let encode_stdin = encode.take_stdin()?;
        let encode_stdout = encode.take_stdout()?;
        let save_stdin = save.take_stdin()?;
        let stream_stdin = match &mut stream {
            Some(s) => Some(s.take_stdin()?),
            None => None,
        };
        let copy_task = tokio::spawn(tee_copy(encode_stdout, save_stdin, stream_stdin));

        if let Some(destination) = &self.config.destination {
            info!(%destination, "starting streaming");
        }
        info!(movie = %files.movie.display(), "starting saving");

        Ok(ActiveSegment {
            encode,
            save,
            stream,
            encode_stdin,
            copy_task,
            frame_matching,
        })
    }

    /// Consumes the tracker's muxed video stream until EOF. Encoder
    /// children start lazily on the first frame of each segment and are
    /// restarted after every rotation period.
    pub async fn run<R>(mut self, mut input: R) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut segment: Option<ActiveSegment> = None;
        let mut current_frame = 0u64;
        let mut next_rotation = Instant::now() + self.config.period;
        let mut header_errors = 0u64;
        let mut copy_errors = 0u32;

        let result = loop {
            match input.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break Ok(()),
                Err(e) => {
                    if header_errors == 0 {
                        warn!(error = %e, "cannot read frame header");
                    }
                    header_errors += 1;
                    if header_errors >= MAX_HEADER_ERRORS {
                        break Err(anyhow::anyhow!(
                            "could not read the frame header for more than \
                             {MAX_HEADER_ERRORS} times",
                        ));
                    }
                    continue;
                }
            }

            if header_errors != 0 {
                warn!(repeats = header_errors, "header read error repeated");
                header_errors = 0;
            }

            let actual_id = u64::from_le_bytes(header[0..8].try_into().expect("8 bytes"));
            let width = u64::from_le_bytes(header[8..16].try_into().expect("8 bytes"));
            let height = u64::from_le_bytes(header[16..24].try_into().expect("8 bytes"));

            if width == 0 || height == 0 {
                warn!(frame_id = actual_id, width, height, "invalid frame dimensions");
                continue;
            }

            match self.resolution {
                None => self.resolution = Some((width, height)),
                Some(expected) if expected != (width, height) => {
                    warn!(
                        frame_id = actual_id,
                        width,
                        height,
                        expected = ?expected,
                        "resolution changed mid-stream, dropping frame",
                    );
                    let skipped = tokio::io::copy(
                        &mut (&mut input).take(3 * width * height),
                        &mut tokio::io::sink(),
                    )
                    .await;
                    if skipped.is_err() {
                        break Ok(());
                    }
                    continue;
                }
                Some(_) => {}
            }

            if segment.is_none() {
                match self.start_segment(width, height) {
                    Ok(s) => {
                        segment = Some(s);
                        current_frame = 0;
                        next_rotation = Instant::now() + self.config.period;
                    }
                    Err(e) => break Err(e.context("could not start stream tasks")),
                }
            }
            let active = segment.as_mut().expect("segment started above");

            if let Err(e) = writeln!(active.frame_matching, "{current_frame} {actual_id}") {
                break Err(e).context("writing frame matching entry");
            }

            let body_len = 3 * width * height;
            let copied =
                tokio::io::copy(&mut (&mut input).take(body_len), &mut active.encode_stdin).await;

            match copied {
                Ok(n) if n == body_len => copy_errors = 0,
                outcome => {
                    let detail = match outcome {
                        Ok(n) => format!("short frame: {n} of {body_len} bytes"),
                        Err(e) => e.to_string(),
                    };
                    warn!(frame_id = actual_id, error = %detail, "cannot copy frame");
                    copy_errors += 1;
                    if copy_errors >= MAX_COPY_ERRORS {
                        break Err(anyhow::anyhow!("stop after encode copy error: {detail}"));
                    }
                    // Restart the children from the next frame.
                    if let Some(active) = segment.take() {
                        active.stop().await;
                    }
                }
            }

            current_frame += 1;

            if Instant::now() >= next_rotation {
                info!(period = ?self.config.period, "creating new film segment");
                if let Some(active) = segment.take() {
                    active.stop().await;
                }
                info!(frames = current_frame, "segment written");
            }
        };

        if let Some(active) = segment.take() {
            active.stop().await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> VideoConfig {
        VideoConfig {
            encoder_command: "ffmpeg".into(),
            base_dir: dir.to_path_buf(),
            hostname: "node-a".into(),
            fps: 8.0,
            period: Duration::from_secs(7200),
            bitrate_kb: 2000,
            max_bitrate_kb: 4000,
            destination: None,
            channel: "olympus".into(),
            preset: "fast".into(),
            tune: "film".into(),
        }
    }

    #[test]
    fn test_check_rejects_unknown_preset_and_tune() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(dir.path());
        cfg.preset = "warp-speed".into();
        assert!(cfg.check().is_err());

        let mut cfg = config(dir.path());
        cfg.tune = "opera".into();
        assert!(cfg.check().is_err());

        assert!(config(dir.path()).check().is_ok());
    }

    #[test]
    fn test_encode_args_shape() {
        let dir = tempfile::tempdir().expect("tempdir");
        let args = config(dir.path()).encode_args("1920x1080");

        let find = |flag: &str| -> &str {
            let at = args.iter().position(|a| a == flag).expect(flag);
            &args[at + 1]
        };

        assert_eq!(find("-video_size"), "1920x1080");
        assert_eq!(find("-b:v"), "2000k");
        assert_eq!(find("-maxrate"), "4000k");
        assert_eq!(find("-g"), "16", "GOP is twice the FPS");
        assert_eq!(find("-keyint_min"), "8");
        assert_eq!(find("-pix_fmt"), "yuv420p");
        assert_eq!(find("-preset"), "fast");
        assert_eq!(find("-tune"), "film");
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[test]
    fn test_stream_args_only_with_destination() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(dir.path());
        assert!(cfg.stream_args().is_none());

        cfg.destination = Some("monitor.example.com".into());
        let args = cfg.stream_args().expect("stream args");
        assert_eq!(
            args.last().map(String::as_str),
            Some("rtmp://monitor.example.com/olympus/node-a.flv"),
        );
    }

    /// A stand-in encoder that copies stdin to stdout regardless of its
    /// arguments, standing in for the real encoder binary.
    fn fake_encoder(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-encoder");
        std::fs::write(&path, "#!/bin/sh\nexec cat\n").expect("write script");
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path.to_string_lossy().into_owned()
    }

    fn frame(id: u64, width: u64, height: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(FRAME_HEADER_LEN + (3 * width * height) as usize);
        data.extend_from_slice(&id.to_le_bytes());
        data.extend_from_slice(&width.to_le_bytes());
        data.extend_from_slice(&height.to_le_bytes());
        data.extend(std::iter::repeat(0xa5u8).take((3 * width * height) as usize));
        data
    }

    #[tokio::test]
    async fn test_pipeline_writes_frame_matching_and_exits_on_eof() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config(dir.path());
        cfg.encoder_command = fake_encoder(dir.path());

        let pipeline = VideoPipeline::new(cfg).expect("pipeline");

        let mut input = Vec::new();
        input.extend_from_slice(&frame(100, 4, 2));
        input.extend_from_slice(&frame(102, 4, 2));
        // A frame at a different resolution is dropped, not fatal.
        input.extend_from_slice(&frame(103, 8, 2));
        input.extend_from_slice(&frame(104, 4, 2));

        pipeline
            .run(std::io::Cursor::new(input))
            .await
            .expect("pipeline result");

        let matching = std::fs::read_to_string(
            dir.path().join("stream.frame-matching.0000.txt"),
        )
        .expect("frame matching file");
        assert_eq!(matching, "0 100\n1 102\n2 104\n");
    }
}
