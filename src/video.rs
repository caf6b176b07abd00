//! Looping frame sources

use crate::error::OpenError;
use crate::ffmpeg::{probe_video, FfmpegCommand, FfmpegError, VideoProbe};
use async_trait::async_trait;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout};
use tracing::{debug, info, warn};

/// Bytes read from the head of a file for container sniffing.
const SNIFF_LEN: usize = 8192;

/// How long a decoder gets to exit once its stdout hit end of stream.
const DECODER_EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: RgbImage,
    /// Position in the current pass; resets to 0 when the source rewinds
    pub index: u64,
    pub fps: u32,
}

/// Infinite, sequential frame stream.
///
/// End of stream is not an error: implementations rewind to index 0 and keep
/// going. Errors are reserved for decoder failures.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<VideoFrame, FfmpegError>;

    fn fps(&self) -> u32;

    /// Release the underlying decoder. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens a [`FrameSource`] for a video reference handed over by the client.
#[async_trait]
pub trait SourceOpener: Send + Sync {
    async fn open(&self, video_path: &str) -> Result<Box<dyn FrameSource>, OpenError>;
}

/// Decodes a video file through an `ffmpeg` child process emitting raw RGB24.
pub struct FfmpegFrameSource {
    path: PathBuf,
    probe: VideoProbe,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    buffer: Vec<u8>,
    next_index: u64,
    rewinds: u64,
}

impl FfmpegFrameSource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OpenError> {
        let path = path.as_ref().to_path_buf();

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(OpenError::NotFound(path.display().to_string()));
        }

        check_container(&path).await?;

        let probe = probe_video(&path).await.map_err(|e| match e {
            FfmpegError::NotInstalled(_) => OpenError::Spawn(e),
            other => OpenError::Probe(other.to_string()),
        })?;

        let frame_len = probe.width as usize * probe.height as usize * 3;
        let mut source = Self {
            path,
            probe,
            child: None,
            stdout: None,
            buffer: vec![0u8; frame_len],
            next_index: 0,
            rewinds: 0,
        };
        source.spawn_decoder()?;

        info!(
            path = %source.path.display(),
            width = probe.width,
            height = probe.height,
            fps = probe.fps,
            "Opened video source"
        );

        Ok(source)
    }

    fn spawn_decoder(&mut self) -> Result<(), FfmpegError> {
        let mut child = decoder_command(&self.path).spawn_piped()?;

        let stdout = child.stdout.take()
            .ok_or_else(|| FfmpegError::ExecutionFailed("decoder stdout not captured".to_string()))?;

        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    /// `Ok(None)` on end of stream; a trailing partial frame is discarded.
    async fn read_frame(&mut self) -> Result<Option<RgbImage>, FfmpegError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        match stdout.read_exact(&mut self.buffer).await {
            Ok(_) => RgbImage::from_raw(self.probe.width, self.probe.height, self.buffer.clone())
                .map(Some)
                .ok_or_else(|| FfmpegError::InvalidOutput("frame buffer size mismatch".to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Collect a decoder that reached end of stream on its own. A non-zero
    /// exit means the pass ended early (corrupt input, decoder crash).
    async fn finish_pass(&mut self) {
        self.stdout = None;
        let Some(mut child) = self.child.take() else {
            return;
        };

        match tokio::time::timeout(DECODER_EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => warn!(
                path = %self.path.display(),
                status = %status,
                frames = self.next_index,
                "Decoder exited with failure, pass ended early"
            ),
            Ok(Err(e)) => debug!(error = %e, "Decoder wait failed"),
            Err(_) => {
                warn!(path = %self.path.display(), "Decoder did not exit after end of stream, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }

    async fn reap(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            if let Err(e) = child.wait().await {
                debug!(error = %e, "Decoder wait failed");
            }
        }
    }
}

/// Raw RGB24 frames on stdout at the coded size reported by ffprobe.
/// Autorotation is disabled so the frame geometry always matches the probe.
fn decoder_command(path: &Path) -> FfmpegCommand {
    FfmpegCommand::new()
        .args(&["-nostdin", "-noautorotate"])
        .input(path)
        .args(&["-f", "rawvideo", "-pix_fmt", "rgb24"])
        .output("pipe:1")
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn next_frame(&mut self) -> Result<VideoFrame, FfmpegError> {
        let mut empty_passes = 0;

        loop {
            if self.stdout.is_none() {
                self.spawn_decoder()?;
            }

            if let Some(image) = self.read_frame().await? {
                let index = self.next_index;
                self.next_index += 1;
                return Ok(VideoFrame { image, index, fps: self.probe.fps });
            }

            // End of stream
            let pass_was_empty = self.next_index == 0;
            self.finish_pass().await;

            if pass_was_empty {
                empty_passes += 1;
                if empty_passes >= 2 {
                    return Err(FfmpegError::InvalidOutput(format!(
                        "decoder produced no frames for {}",
                        self.path.display()
                    )));
                }
            }

            self.next_index = 0;
            self.rewinds += 1;
            info!(path = %self.path.display(), rewinds = self.rewinds, "Reached end of video, restarting");
        }
    }

    fn fps(&self) -> u32 {
        self.probe.fps
    }

    async fn close(&mut self) {
        self.reap().await;
        debug!(path = %self.path.display(), "Video source closed");
    }
}

/// Reject files whose magic bytes identify a non-video type. Unknown
/// signatures are left for ffprobe to judge.
async fn check_container(path: &Path) -> Result<(), OpenError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    if filled == 0 {
        return Err(OpenError::NotVideo(format!("{} is empty", path.display())));
    }

    match infer::get(&head[..filled]) {
        Some(kind) if kind.matcher_type() != infer::MatcherType::Video => Err(OpenError::NotVideo(
            format!("{} looks like {}", path.display(), kind.mime_type()),
        )),
        _ => Ok(()),
    }
}

/// Opens [`FfmpegFrameSource`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegOpener;

#[async_trait]
impl SourceOpener for FfmpegOpener {
    async fn open(&self, video_path: &str) -> Result<Box<dyn FrameSource>, OpenError> {
        let source = FfmpegFrameSource::open(video_path).await?;
        Ok(Box::new(source))
    }
}

/// Loops over frames held in memory. Used for tests and demos.
pub struct MemoryFrameSource {
    frames: Vec<RgbImage>,
    fps: u32,
    next_index: u64,
    closed: bool,
}

impl MemoryFrameSource {
    pub fn new(frames: Vec<RgbImage>, fps: u32) -> Self {
        Self {
            frames,
            fps: fps.max(1),
            next_index: 0,
            closed: false,
        }
    }

    /// `count` solid frames of the given size.
    pub fn solid(count: usize, width: u32, height: u32, fps: u32) -> Self {
        let frames = (0..count)
            .map(|i| RgbImage::from_pixel(width, height, image::Rgb([(i % 256) as u8, 64, 160])))
            .collect();
        Self::new(frames, fps)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl FrameSource for MemoryFrameSource {
    async fn next_frame(&mut self) -> Result<VideoFrame, FfmpegError> {
        if self.closed {
            return Err(FfmpegError::InvalidOutput("source closed".to_string()));
        }
        if self.frames.is_empty() {
            return Err(FfmpegError::InvalidOutput("no frames".to_string()));
        }
        if self.next_index as usize >= self.frames.len() {
            self.next_index = 0;
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(VideoFrame {
            image: self.frames[index as usize].clone(),
            index,
            fps: self.fps,
        })
    }

    fn fps(&self) -> u32 {
        self.fps
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}
