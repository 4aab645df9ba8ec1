//! Segmented compressed frame log.
//!
//! Records are appended to a gzip stream alongside an uncompressed shadow
//! file that exists only while the segment is in flight. Each segment
//! starts with a `Header` carrying the dimensions of its first record and
//! the previous segment's basename, and ends with a `Footer` naming its
//! successor. Rotation is timer-driven but the swap happens on the next
//! incoming record, so the fresh header always sees real dimensions.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::BytesMut;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tracing::info;

use crate::fsutil::filename_without_overwrite;
use crate::wire::codec;
use crate::wire::{FileLine, Footer, FrameRecord, Header, HeaderType, FILE_VERSION};

/// Prefix of the in-flight shadow copy, deleted on clean close.
const SHADOW_PREFIX: &str = "uncompressed-";

pub struct SegmentedWriter {
    basename: PathBuf,
    period: Duration,
    last_name: Option<PathBuf>,
    current: Option<OpenSegment>,
}

struct OpenSegment {
    gzip: GzEncoder<File>,
    shadow: File,
    shadow_path: PathBuf,
}

fn shadow_path_for(path: &Path) -> PathBuf {
    let base = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match path.parent() {
        Some(parent) => parent.join(format!("{SHADOW_PREFIX}{base}")),
        None => PathBuf::from(format!("{SHADOW_PREFIX}{base}")),
    }
}

fn basename_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl SegmentedWriter {
    pub fn new(basename: impl Into<PathBuf>, period: Duration) -> Self {
        Self {
            basename: basename.into(),
            period,
            last_name: None,
            current: None,
        }
    }

    /// Writes every incoming record until the queue closes, rotating
    /// segments on the configured period. Any I/O error aborts.
    pub async fn run(mut self, mut incoming: mpsc::Receiver<FrameRecord>) -> Result<()> {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.period,
            self.period,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let (mut next_name, _) = filename_without_overwrite(&self.basename)
            .context("finding a unique segment name")?;
        let mut close_next = false;

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => close_next = true,

                record = incoming.recv() => {
                    let Some(record) = record else { break Ok(()) };

                    if let Err(e) = self.write_line(&record, &next_name) {
                        break Err(e);
                    }

                    if !close_next {
                        continue;
                    }
                    close_next = false;
                    match self.rotate() {
                        Ok(name) => next_name = name,
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        let close_result = self.close_files(None);
        result.and(close_result)
    }

    fn open_segment(&mut self, path: &Path, width: i32, height: i32) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("creating segment {}", path.display()))?;
        let shadow_path = shadow_path_for(path);
        let shadow = File::create(&shadow_path)
            .with_context(|| format!("creating shadow {}", shadow_path.display()))?;

        let mut segment = OpenSegment {
            gzip: GzEncoder::new(file, Compression::default()),
            shadow,
            shadow_path,
        };

        let header = Header {
            kind: HeaderType::File as i32,
            version: Some(FILE_VERSION),
            width,
            height,
            previous: self
                .last_name
                .as_deref()
                .map(basename_of)
                .unwrap_or_default(),
        };
        let encoded = codec::encode_delimited(&header);
        segment.gzip.write_all(&encoded).context("writing header")?;
        segment
            .shadow
            .write_all(&encoded)
            .context("writing shadow header")?;

        info!(
            compressed = %path.display(),
            uncompressed = %segment.shadow_path.display(),
            "destination files",
        );

        self.last_name = Some(path.to_path_buf());
        self.current = Some(segment);
        Ok(())
    }

    fn write_line(&mut self, record: &FrameRecord, next_name: &Path) -> Result<()> {
        if self.current.is_none() {
            self.open_segment(next_name, record.width, record.height)?;
        }

        // Per-record stripping happens on the written copy only.
        let mut stripped = record.clone();
        stripped.producer_id.clear();
        stripped.quads = 0;
        stripped.width = 0;
        stripped.height = 0;

        let line = FileLine {
            readout: Some(stripped),
            footer: None,
        };
        let encoded = codec::encode_delimited(&line);

        let segment = self.current.as_mut().expect("segment opened above");
        segment.gzip.write_all(&encoded).context("writing record")?;
        segment
            .shadow
            .write_all(&encoded)
            .context("writing shadow record")?;
        Ok(())
    }

    /// Closes the current segment pointing at a freshly instantiated
    /// successor name, which the next record will open.
    fn rotate(&mut self) -> Result<PathBuf> {
        let (next_name, _) = filename_without_overwrite(&self.basename)
            .context("finding a unique segment name")?;
        self.close_files(Some(&next_name))?;
        Ok(next_name)
    }

    fn close_files(&mut self, next: Option<&Path>) -> Result<()> {
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };

        let line = FileLine {
            readout: None,
            footer: Some(Footer {
                next: next.map(basename_of).unwrap_or_default(),
            }),
        };
        let encoded = codec::encode_delimited(&line);
        segment.gzip.write_all(&encoded).context("writing footer")?;
        segment
            .shadow
            .write_all(&encoded)
            .context("writing shadow footer")?;

        segment.gzip.finish().context("closing gzip stream")?;
        segment
            .shadow
            .sync_all()
            .context("closing shadow file")?;
        drop(segment.shadow);

        std::fs::remove_file(&segment.shadow_path).with_context(|| {
            format!("removing shadow {}", segment.shadow_path.display())
        })?;
        Ok(())
    }
}

/// Decodes a compressed segment back into its header and lines.
pub fn read_segment(path: &Path) -> Result<(Header, Vec<FileLine>)> {
    use std::io::Read;

    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .with_context(|| format!("decompressing {}", path.display()))?;

    let mut buf = BytesMut::from(data.as_slice());
    let header: Header = codec::try_decode(&mut buf)?
        .with_context(|| format!("{} has no header", path.display()))?;

    let mut lines = Vec::new();
    while let Some(line) = codec::try_decode::<FileLine>(&mut buf)? {
        lines.push(line);
    }
    Ok((header, lines))
}
