//! Replay stream writer.
//!
//! Captures interactive traffic of one session into a gzip-compressed
//! framed file for later playback.
//!
//! Frame format (uncompressed):
//! 1. 4 bytes, milliseconds from first write, u32 big-endian
//! 2. 1 byte, frame type (1 = stdout, 2 = stderr, 3 = window size)
//! 3. payload
//!    - stdout / stderr: 4 bytes length (u32 BE), then the bytes
//!    - window size: 4 bytes width, 4 bytes height (u32 BE)

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};

const DIR_PERM: u32 = 0o750;
const FILE_PERM: u32 = 0o640;

pub const FRAME_STDOUT: u8 = 1;
pub const FRAME_STDERR: u8 = 2;
pub const FRAME_WINDOW_SIZE: u8 = 3;

/// Best-effort replay tap for a single session.
///
/// Created inactive with a deterministic filename; nothing touches
/// the filesystem until `activate` has been called and the first
/// frame arrives. Writes never return an error to the caller: a
/// failing disk marks the writer failed and later frames
/// short-circuit. `close` is idempotent.
pub struct ReplayWriter {
    filename: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    active: bool,
    failed: bool,
    wrote: bool,
    closed: bool,
    t0: Option<Instant>,
    out: Option<GzEncoder<File>>,
}

impl ReplayWriter {
    pub fn new(filename: PathBuf) -> Self {
        Self {
            filename,
            inner: Mutex::new(Inner {
                active: false,
                failed: false,
                wrote: false,
                closed: false,
                t0: None,
                out: None,
            }),
        }
    }

    /// Arms the writer. Recording may be decided late (after pty
    /// negotiation), so construction and activation are separate.
    pub fn activate(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed {
            debug!("replay writer activated: {}", self.filename.display());
            inner.active = true;
        }
    }

    /// Whether any frame has been written. Sessions that never
    /// produced a frame leave no file behind.
    pub fn is_activated(&self) -> bool {
        self.inner.lock().unwrap().wrote
    }

    pub fn write_stdout(&self, p: &[u8]) {
        self.write(FRAME_STDOUT, 0, 0, p);
    }

    pub fn write_stderr(&self, p: &[u8]) {
        self.write(FRAME_STDERR, 0, 0, p);
    }

    pub fn write_window_size(&self, width: u32, height: u32) {
        self.write(FRAME_WINDOW_SIZE, width, height, &[]);
    }

    /// Flushes and closes the underlying stream. A double close is a
    /// no-op.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        if let Some(gz) = inner.out.take() {
            if let Err(e) = gz.finish() {
                warn!(
                    "failed to finish replay file {}: {}",
                    self.filename.display(),
                    e
                );
            }
        }
    }

    /// An adapter implementing `std::io::Write` that feeds stdout
    /// frames, for tees over writer-shaped sinks.
    pub fn stdout_writer(self: std::sync::Arc<Self>) -> ReplayStreamWriter {
        ReplayStreamWriter {
            writer: self,
            frame: FRAME_STDOUT,
        }
    }

    /// Same as [`stdout_writer`](Self::stdout_writer) for stderr.
    pub fn stderr_writer(self: std::sync::Arc<Self>) -> ReplayStreamWriter {
        ReplayStreamWriter {
            writer: self,
            frame: FRAME_STDERR,
        }
    }

    fn write(&self, frame: u8, width: u32, height: u32, p: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.active || inner.failed || inner.closed {
            return;
        }

        if inner.out.is_none() {
            match self.open_output() {
                Ok(gz) => {
                    inner.out = Some(gz);
                    inner.t0 = Some(Instant::now());
                }
                Err(e) => {
                    warn!(
                        "failed to create replay file {}: {}",
                        self.filename.display(),
                        e
                    );
                    inner.failed = true;
                    return;
                }
            }
        }

        let ts = inner
            .t0
            .map(|t0| t0.elapsed().as_millis().min(u32::MAX as u128) as u32)
            .unwrap_or(0);

        let mut buf = Vec::with_capacity(13 + p.len());
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.push(frame);
        match frame {
            FRAME_WINDOW_SIZE => {
                buf.extend_from_slice(&width.to_be_bytes());
                buf.extend_from_slice(&height.to_be_bytes());
            }
            _ => {
                buf.extend_from_slice(&(p.len() as u32).to_be_bytes());
                buf.extend_from_slice(p);
            }
        }

        let out = inner.out.as_mut().unwrap();
        if let Err(e) = out.write_all(&buf) {
            warn!(
                "failed to write replay frame to {}: {}",
                self.filename.display(),
                e
            );
            inner.failed = true;
            return;
        }
        inner.wrote = true;
    }

    fn open_output(&self) -> std::io::Result<GzEncoder<File>> {
        if let Some(parent) = self.filename.parent() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(DIR_PERM);
            }
            builder.create(parent)?;
        }
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(FILE_PERM);
        }
        let file = opts.open(&self.filename)?;
        Ok(GzEncoder::new(file, Compression::default()))
    }
}

/// `std::io::Write` view over one frame type of a [`ReplayWriter`].
pub struct ReplayStreamWriter {
    writer: std::sync::Arc<ReplayWriter>,
    frame: u8,
}

impl Write for ReplayStreamWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(self.frame, 0, 0, buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum Frame {
        Stdout(u32, Vec<u8>),
        Stderr(u32, Vec<u8>),
        WindowSize(u32, u32, u32),
    }

    fn decode_frames(path: &std::path::Path) -> Vec<Frame> {
        let mut raw = Vec::new();
        GzDecoder::new(File::open(path).unwrap())
            .read_to_end(&mut raw)
            .unwrap();
        let mut frames = Vec::new();
        let mut i = 0;
        while i < raw.len() {
            let ts = u32::from_be_bytes(raw[i..i + 4].try_into().unwrap());
            let kind = raw[i + 4];
            i += 5;
            match kind {
                FRAME_WINDOW_SIZE => {
                    let w = u32::from_be_bytes(raw[i..i + 4].try_into().unwrap());
                    let h = u32::from_be_bytes(raw[i + 4..i + 8].try_into().unwrap());
                    i += 8;
                    frames.push(Frame::WindowSize(ts, w, h));
                }
                FRAME_STDOUT | FRAME_STDERR => {
                    let len = u32::from_be_bytes(raw[i..i + 4].try_into().unwrap()) as usize;
                    let payload = raw[i + 4..i + 4 + len].to_vec();
                    i += 4 + len;
                    if kind == FRAME_STDOUT {
                        frames.push(Frame::Stdout(ts, payload));
                    } else {
                        frames.push(Frame::Stderr(ts, payload));
                    }
                }
                other => panic!("unknown frame type {}", other),
            }
        }
        frames
    }

    #[test]
    fn test_frames_roundtrip_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("2018").join("03").join("09").join("0000002a");
        let rw = ReplayWriter::new(path.clone());
        rw.activate();
        rw.write_window_size(120, 40);
        rw.write_stdout(b"hello");
        rw.write_stderr(b"oops");
        rw.write_window_size(80, 24);
        rw.close();

        let frames = decode_frames(&path);
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], Frame::WindowSize(_, 120, 40)));
        assert!(matches!(&frames[1], Frame::Stdout(_, p) if p == b"hello"));
        assert!(matches!(&frames[2], Frame::Stderr(_, p) if p == b"oops"));
        assert!(matches!(frames[3], Frame::WindowSize(_, 80, 24)));

        // timestamps are non-decreasing
        let ts: Vec<u32> = frames
            .iter()
            .map(|f| match f {
                Frame::Stdout(t, _) | Frame::Stderr(t, _) | Frame::WindowSize(t, _, _) => *t,
            })
            .collect();
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_inactive_writer_touches_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("replay");
        let rw = ReplayWriter::new(path.clone());
        rw.write_stdout(b"dropped");
        rw.close();
        assert!(!path.exists());
        assert!(!rw.is_activated());
    }

    #[test]
    fn test_activation_without_write_creates_no_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("replay");
        let rw = ReplayWriter::new(path.clone());
        rw.activate();
        rw.close();
        assert!(!path.exists());
        assert!(!rw.is_activated());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("replay");
        let rw = ReplayWriter::new(path.clone());
        rw.activate();
        rw.write_stdout(b"x");
        rw.close();
        rw.close();
        assert!(rw.is_activated());
        // writes after close are dropped
        rw.write_stdout(b"late");
        let frames = decode_frames(&path);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_stream_writer_adapters() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("replay");
        let rw = Arc::new(ReplayWriter::new(path.clone()));
        rw.activate();
        rw.clone().stdout_writer().write_all(b"out").unwrap();
        rw.clone().stderr_writer().write_all(b"err").unwrap();
        rw.close();

        let frames = decode_frames(&path);
        assert!(matches!(&frames[0], Frame::Stdout(_, p) if p == b"out"));
        assert!(matches!(&frames[1], Frame::Stderr(_, p) if p == b"err"));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("deep").join("replay");
        let rw = ReplayWriter::new(path.clone());
        rw.activate();
        rw.write_stdout(b"x");
        rw.close();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, FILE_PERM);
    }
}
