//! Capture, encode and deliver video samples to one outbound track.
//!
//! A pipeline owns an external encoder process and four stages running in
//! a `JoinSet`: frame feed, sample read, encoder diagnostics and stats.
//! All stages observe one `CancellationToken`. Once it fires, the stages
//! get a grace period to finish, then the encoder is killed and the track
//! is removed from its connection.

use crate::config::Resolution;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::media::Sample;

pub const FRAME_RATE: u32 = 30;
pub const FRAME_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / FRAME_RATE as u64);
pub const SAMPLE_DURATION: Duration = Duration::from_millis(33);
const STATS_INTERVAL: Duration = Duration::from_secs(5);
const MAX_IVF_FRAME: usize = 16 * 1024 * 1024;

/// How the encoder's output stream is cut into samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// One sample per IVF frame.
    Ivf,
    /// Fixed-size reads, for pass-through encoders.
    Chunked(usize),
}

#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
    pub framing: Framing,
}

impl EncoderCommand {
    /// Realtime VP8 from raw RGB24 on stdin to IVF on stdout.
    pub fn vp8(resolution: Resolution) -> Self {
        let size = resolution.to_string();
        let rate = FRAME_RATE.to_string();
        let args = [
            "-hide_banner",
            "-f", "rawvideo",
            "-pixel_format", "rgb24",
            "-video_size", size.as_str(),
            "-framerate", rate.as_str(),
            "-i", "pipe:0",
            "-c:v", "libvpx",
            "-deadline", "realtime",
            "-cpu-used", "4",
            "-b:v", "1M",
            "-maxrate", "1M",
            "-bufsize", "2M",
            "-qmin", "4",
            "-qmax", "48",
            "-keyint_min", "30",
            "-g", "30",
            "-error-resilient", "1",
            "-auto-alt-ref", "0",
            "-lag-in-frames", "0",
            "-an",
            "-f", "ivf",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self {
            program: "ffmpeg".to_string(),
            args,
            framing: Framing::Ivf,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureKind {
    /// Grab an X display.
    X11 { display: String },
    /// Synthetic moving bars.
    TestPattern,
}

#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub resolution: Resolution,
    pub capture: CaptureKind,
    pub encoder: EncoderCommand,
    /// Time stages get to notice cancellation before the encoder is killed.
    pub grace: Duration,
    /// Consecutive capture or read failures before the pipeline gives up.
    pub max_consecutive_failures: u32,
}

impl MediaSettings {
    pub fn new(resolution: Resolution, capture: CaptureKind) -> Self {
        Self {
            resolution,
            capture,
            encoder: EncoderCommand::vp8(resolution),
            grace: Duration::from_secs(1),
            max_consecutive_failures: 100,
        }
    }

    pub fn frame_source(&self) -> Result<Box<dyn FrameSource>> {
        Ok(match &self.capture {
            CaptureKind::X11 { display } => Box::new(X11Grab::spawn(display, self.resolution)?),
            CaptureKind::TestPattern => Box::new(TestPattern::new(self.resolution)),
        })
    }
}

/// Produces packed RGB24 frames.
#[async_trait]
pub trait FrameSource: Send {
    async fn capture(&mut self) -> Result<Vec<u8>>;
}

/// Reads frames from a long-running `ffmpeg -f x11grab` process.
pub struct X11Grab {
    _child: Child,
    stdout: ChildStdout,
    frame_len: usize,
}

impl X11Grab {
    pub fn spawn(screen: &str, resolution: Resolution) -> Result<Self> {
        let mut child = Command::new("ffmpeg")
            .args(["-hide_banner", "-loglevel", "error", "-f", "x11grab"])
            .args(["-video_size", &resolution.to_string()])
            .args(["-framerate", &FRAME_RATE.to_string()])
            .args(["-i", screen])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io("spawn screen capture", e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Media("screen capture has no stdout".into()))?;
        info!(screen, %resolution, "screen capture started");
        Ok(Self {
            _child: child,
            stdout,
            frame_len: resolution.frame_len(),
        })
    }
}

#[async_trait]
impl FrameSource for X11Grab {
    async fn capture(&mut self) -> Result<Vec<u8>> {
        let mut frame = vec![0u8; self.frame_len];
        self.stdout
            .read_exact(&mut frame)
            .await
            .map_err(|e| Error::io("read captured frame", e))?;
        Ok(frame)
    }
}

pub struct TestPattern {
    resolution: Resolution,
    tick: u32,
}

impl TestPattern {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution, tick: 0 }
    }
}

#[async_trait]
impl FrameSource for TestPattern {
    async fn capture(&mut self) -> Result<Vec<u8>> {
        const BARS: [[u8; 3]; 7] = [
            [255, 255, 255],
            [255, 255, 0],
            [0, 255, 255],
            [0, 255, 0],
            [255, 0, 255],
            [255, 0, 0],
            [0, 0, 255],
        ];
        let Resolution { width, height } = self.resolution;
        let mut frame = Vec::with_capacity(self.resolution.frame_len());
        for _ in 0..height {
            for x in 0..width {
                let bar = ((x + self.tick) * BARS.len() as u32 / width) as usize % BARS.len();
                frame.extend_from_slice(&BARS[bar]);
            }
        }
        self.tick = (self.tick + 4) % width;
        Ok(frame)
    }
}

/// Destination of encoded samples, usually an outbound WebRTC track.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write_sample(&self, sample: &Sample) -> Result<()>;

    /// Detach the sink from its connection.
    async fn remove(&self) -> Result<()>;
}

/// Splits an encoder output stream into sample payloads.
pub struct SampleReader<R> {
    inner: R,
    framing: Framing,
    header_read: bool,
}

impl<R: AsyncRead + Unpin> SampleReader<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        Self {
            inner,
            framing,
            header_read: false,
        }
    }

    /// Next payload, `None` at end of stream.
    pub async fn next(&mut self) -> io::Result<Option<Bytes>> {
        match self.framing {
            Framing::Chunked(size) => {
                let mut buf = vec![0u8; size];
                let n = self.inner.read(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some(buf.into()))
            }
            Framing::Ivf => {
                if !self.header_read {
                    let mut header = [0u8; 32];
                    if !read_or_eof(&mut self.inner, &mut header).await? {
                        return Ok(None);
                    }
                    if &header[0..4] != b"DKIF" {
                        return Err(io::Error::new(io::ErrorKind::InvalidData, "not an IVF stream"));
                    }
                    self.header_read = true;
                }

                let mut frame_header = [0u8; 12];
                if !read_or_eof(&mut self.inner, &mut frame_header).await? {
                    return Ok(None);
                }
                let size = u32::from_le_bytes([
                    frame_header[0],
                    frame_header[1],
                    frame_header[2],
                    frame_header[3],
                ]) as usize;
                if size > MAX_IVF_FRAME {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("IVF frame of {size} bytes"),
                    ));
                }
                let mut frame = vec![0u8; size];
                self.inner.read_exact(&mut frame).await?;
                Ok(Some(frame.into()))
            }
        }
    }
}

/// `read_exact` that reports a clean end of stream as `false`.
async fn read_or_eof<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Consecutive-failure tracking with exponential backoff.
struct Backoff {
    stage: &'static str,
    consecutive: u32,
    ceiling: u32,
}

impl Backoff {
    fn new(stage: &'static str, ceiling: u32) -> Self {
        Self {
            stage,
            consecutive: 0,
            ceiling,
        }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    /// Log `err` and wait out the backoff. Returns false once the stage
    /// should give up; the pipeline is cancelled in that case.
    async fn failure(&mut self, err: &Error, cancel: &CancellationToken) -> bool {
        self.consecutive += 1;
        if self.consecutive >= self.ceiling {
            error!(stage = self.stage, err = %err, failures = self.consecutive, "giving up");
            cancel.cancel();
            return false;
        }
        warn!(stage = self.stage, err = %err, failures = self.consecutive, "transient failure");
        let delay = Duration::from_millis(10 << (self.consecutive - 1).min(7)).min(Duration::from_secs(1));
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Running capture/encode/deliver task group.
pub struct MediaPipeline {
    cancel: CancellationToken,
    teardown: Mutex<Option<JoinHandle<()>>>,
    delivered: Arc<AtomicU64>,
    encoder_pid: Option<u32>,
}

impl MediaPipeline {
    pub fn start(
        settings: &MediaSettings,
        source: Box<dyn FrameSource>,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Self> {
        let encoder = &settings.encoder;
        info!(cmd = ?encoder.args, program = %encoder.program, "starting encoder");
        let mut child = Command::new(&encoder.program)
            .args(&encoder.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::io(format!("spawn encoder {}", encoder.program), e))?;

        let missing = |stream: &str| Error::Media(format!("encoder {stream} unavailable"));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;
        let encoder_pid = child.id();

        let cancel = CancellationToken::new();
        let delivered = Arc::new(AtomicU64::new(0));
        let window = Arc::new(AtomicU64::new(0));
        let ceiling = settings.max_consecutive_failures;

        let mut stages = JoinSet::new();
        stages.spawn(feed_frames(
            source,
            stdin,
            settings.resolution.frame_len(),
            ceiling,
            cancel.clone(),
        ));
        stages.spawn(read_samples(
            SampleReader::new(stdout, encoder.framing.clone()),
            sink.clone(),
            delivered.clone(),
            window.clone(),
            ceiling,
            cancel.clone(),
        ));
        stages.spawn(drain_diagnostics(stderr, cancel.clone()));
        stages.spawn(report_stats(window, cancel.clone()));

        let teardown = tokio::spawn(teardown(stages, child, sink, cancel.clone(), settings.grace));

        Ok(Self {
            cancel,
            teardown: Mutex::new(Some(teardown)),
            delivered,
            encoder_pid,
        })
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Cancel and wait until the encoder is gone and the track removed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.teardown.lock().await.take() {
            if let Err(e) = handle.await {
                error!(err = %e, "pipeline teardown panicked");
            }
            debug!(encoder = ?self.encoder_pid, "media pipeline shut down");
        }
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn teardown(
    mut stages: JoinSet<()>,
    mut encoder: Child,
    sink: Arc<dyn SampleSink>,
    cancel: CancellationToken,
    grace: Duration,
) {
    cancel.cancelled().await;
    debug!("pipeline cancelled");

    let drained = tokio::time::timeout(grace, async {
        while stages.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(?grace, "pipeline stages still busy, aborting them");
    }
    stages.shutdown().await;

    if let Err(e) = encoder.kill().await {
        error!(err = %e, "failed to kill encoder");
    }
    if let Err(e) = sink.remove().await {
        warn!(err = %e, "failed to remove video track");
    }
    info!("pipeline stopped");
}

async fn feed_frames(
    mut source: Box<dyn FrameSource>,
    mut stdin: ChildStdin,
    frame_len: usize,
    ceiling: u32,
    cancel: CancellationToken,
) {
    let mut ticker = interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut backoff = Backoff::new("capture", ceiling);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let started = Instant::now();
        let captured = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.capture() => frame,
        };
        let elapsed = started.elapsed();
        if elapsed > FRAME_INTERVAL {
            warn!(?elapsed, "slow frame");
        }

        let result = match captured {
            Ok(frame) if frame.len() != frame_len => Err(Error::Media(format!(
                "captured {} bytes, expected {frame_len}",
                frame.len()
            ))),
            Ok(frame) => tokio::select! {
                _ = cancel.cancelled() => break,
                written = stdin.write_all(&frame) => {
                    written.map_err(|e| Error::io("write frame to encoder", e))
                }
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => backoff.success(),
            Err(e) => {
                if !backoff.failure(&e, &cancel).await {
                    break;
                }
            }
        }
    }
    debug!("frame feed stopped");
}

async fn read_samples(
    mut reader: SampleReader<ChildStdout>,
    sink: Arc<dyn SampleSink>,
    delivered: Arc<AtomicU64>,
    window: Arc<AtomicU64>,
    ceiling: u32,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new("encoder read", ceiling);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next() => next,
        };

        let data = match next {
            Ok(Some(data)) => data,
            Ok(None) => {
                warn!("encoder stream ended");
                cancel.cancel();
                break;
            }
            Err(e) => {
                if !backoff.failure(&Error::io("read from encoder", e), &cancel).await {
                    break;
                }
                continue;
            }
        };
        backoff.success();

        let sample = Sample {
            data,
            duration: SAMPLE_DURATION,
            ..Default::default()
        };
        match sink.write_sample(&sample).await {
            Ok(()) => {
                delivered.fetch_add(1, Ordering::Relaxed);
                window.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => error!(err = %e, "failed to write to video track"),
        }
    }
    debug!("sample reader stopped");
}

async fn drain_diagnostics(stderr: ChildStderr, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => debug!(target: "encoder", "{}", line),
                Ok(None) => break,
                Err(e) => {
                    warn!(err = %e, "encoder diagnostics unreadable");
                    break;
                }
            },
        }
    }
}

async fn report_stats(window: Arc<AtomicU64>, cancel: CancellationToken) {
    let mut ticker = interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                info!(samples = window.swap(0, Ordering::Relaxed), "video streaming stats");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingSink {
        data: std::sync::Mutex<Vec<u8>>,
        removed: AtomicUsize,
    }

    #[async_trait]
    impl SampleSink for RecordingSink {
        async fn write_sample(&self, sample: &Sample) -> Result<()> {
            assert_eq!(sample.duration, SAMPLE_DURATION);
            self.data.lock().unwrap().extend_from_slice(&sample.data);
            Ok(())
        }

        async fn remove(&self) -> Result<()> {
            self.removed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Frames whose bytes all equal the frame index.
    struct Counting {
        next: u8,
        len: usize,
    }

    #[async_trait]
    impl FrameSource for Counting {
        async fn capture(&mut self) -> Result<Vec<u8>> {
            let frame = vec![self.next; self.len];
            self.next = self.next.wrapping_add(1);
            Ok(frame)
        }
    }

    struct Broken;

    #[async_trait]
    impl FrameSource for Broken {
        async fn capture(&mut self) -> Result<Vec<u8>> {
            Err(Error::Media("no display".into()))
        }
    }

    fn passthrough(resolution: Resolution) -> MediaSettings {
        MediaSettings {
            encoder: EncoderCommand {
                program: "cat".into(),
                args: vec![],
                framing: Framing::Chunked(4096),
            },
            grace: Duration::from_millis(200),
            ..MediaSettings::new(resolution, CaptureKind::TestPattern)
        }
    }

    #[tokio::test]
    async fn delivers_samples_in_encoder_order() {
        let resolution = Resolution { width: 4, height: 4 };
        let settings = passthrough(resolution);
        let sink = Arc::new(RecordingSink::default());
        let source = Box::new(Counting {
            next: 0,
            len: resolution.frame_len(),
        });
        let pipeline = MediaPipeline::start(&settings, source, sink.clone()).unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        pipeline.shutdown().await;

        let data = sink.data.lock().unwrap().clone();
        assert!(pipeline.delivered.load(Ordering::Relaxed) > 0);
        assert!(data.len() >= resolution.frame_len());
        for (i, byte) in data.iter().enumerate() {
            assert_eq!(*byte, (i / resolution.frame_len()) as u8);
        }
    }

    #[tokio::test]
    async fn cancellation_kills_encoder_and_removes_track_once() {
        let settings = passthrough(Resolution { width: 8, height: 8 });
        let sink = Arc::new(RecordingSink::default());
        let source = Box::new(TestPattern::new(settings.resolution));
        let pipeline = MediaPipeline::start(&settings, source, sink.clone()).unwrap();
        let pid = pipeline.encoder_pid.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        pipeline.shutdown().await;
        assert!(started.elapsed() < settings.grace + Duration::from_millis(500));
        assert!(!pipeline.is_running());

        assert_eq!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH));
        pipeline.shutdown().await;
        assert_eq!(sink.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_capture_failure_stops_pipeline() {
        let settings = MediaSettings {
            max_consecutive_failures: 3,
            ..passthrough(Resolution { width: 2, height: 2 })
        };
        let sink = Arc::new(RecordingSink::default());
        let pipeline = MediaPipeline::start(&settings, Box::new(Broken), sink.clone()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.is_running() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        pipeline.shutdown().await;
        assert_eq!(sink.removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pattern_frames_have_full_size() {
        let resolution = Resolution { width: 16, height: 9 };
        let mut source = TestPattern::new(resolution);
        let first = source.capture().await.unwrap();
        let second = source.capture().await.unwrap();
        assert_eq!(first.len(), resolution.frame_len());
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn ivf_frames_become_samples() {
        let mut stream = Vec::new();
        stream.extend_from_slice(b"DKIF");
        stream.extend_from_slice(&[0u8; 28]);
        for payload in [&b"first"[..], &b"second frame"[..]] {
            stream.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            stream.extend_from_slice(&[0u8; 8]);
            stream.extend_from_slice(payload);
        }

        let mut reader = SampleReader::new(&stream[..], Framing::Ivf);
        assert_eq!(reader.next().await.unwrap().unwrap(), Bytes::from_static(b"first"));
        assert_eq!(
            reader.next().await.unwrap().unwrap(),
            Bytes::from_static(b"second frame")
        );
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_ivf_stream_is_rejected() {
        let mut reader = SampleReader::new(&[7u8; 40][..], Framing::Ivf);
        assert_eq!(
            reader.next().await.unwrap_err().kind(),
            io::ErrorKind::InvalidData
        );
    }
}
