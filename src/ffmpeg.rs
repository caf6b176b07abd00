//! FFmpeg / FFprobe process wrappers

use serde::Deserialize;
use std::path::Path;
use std::process::{Output, Stdio};
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum FfmpegError {
    #[error("{0} not found in system PATH")]
    NotInstalled(&'static str),

    #[error("FFmpeg execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Builder for one `ffmpeg` or `ffprobe` invocation.
pub struct FfmpegCommand {
    program: &'static str,
    args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new() -> Self {
        Self {
            program: "ffmpeg",
            args: vec!["-hide_banner".to_string(), "-loglevel".to_string(), "error".to_string()],
        }
    }

    pub fn probe() -> Self {
        Self {
            program: "ffprobe",
            args: vec!["-v".to_string(), "error".to_string()],
        }
    }

    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        if self.program == "ffmpeg" {
            self.args.push("-i".to_string());
        }
        self.args.push(path.as_ref().display().to_string());
        self
    }

    pub fn output(mut self, path: impl AsRef<Path>) -> Self {
        self.args.push(path.as_ref().display().to_string());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn program(&self) -> &'static str {
        self.program
    }

    pub fn arg_list(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> FfmpegError {
        if e.kind() == std::io::ErrorKind::NotFound {
            FfmpegError::NotInstalled(self.program)
        } else {
            FfmpegError::ExecutionFailed(e.to_string())
        }
    }

    /// Run to completion and collect stdout/stderr.
    pub async fn execute(self) -> Result<Output, FfmpegError> {
        let output = self.command()
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FfmpegError::ExecutionFailed(stderr.trim().to_string()));
        }

        Ok(output)
    }

    /// Spawn with stdout piped for streaming reads. The child is killed when dropped.
    pub fn spawn_piped(self) -> Result<Child, FfmpegError> {
        self.command()
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(e))
    }
}

impl Default for FfmpegCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream properties needed to slice raw frames out of the decoder pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

/// Fallback when the container reports no usable frame rate (e.g. `0/0`).
pub const DEFAULT_FPS: u32 = 30;

/// Probe the first video stream of `path`.
pub async fn probe_video(path: impl AsRef<Path>) -> Result<VideoProbe, FfmpegError> {
    let output = FfmpegCommand::probe()
        .args(&[
            "-select_streams", "v:0",
            "-show_entries", "stream=width,height,r_frame_rate,avg_frame_rate",
            "-of", "json",
        ])
        .input(path)
        .execute()
        .await?;

    parse_probe_output(&output.stdout)
}

pub(crate) fn parse_probe_output(stdout: &[u8]) -> Result<VideoProbe, FfmpegError> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| FfmpegError::InvalidOutput(format!("ffprobe json: {}", e)))?;

    let stream = parsed.streams.into_iter().next()
        .ok_or_else(|| FfmpegError::InvalidOutput("no video stream".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(FfmpegError::InvalidOutput("missing frame dimensions".to_string())),
    };

    let fps = stream.r_frame_rate.as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(DEFAULT_FPS);

    Ok(VideoProbe { width, height, fps })
}

/// Parse an ffprobe rational like `30000/1001` into whole frames per second.
pub(crate) fn parse_frame_rate(rate: &str) -> Option<u32> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.trim().parse::<f64>().ok()?, d.trim().parse::<f64>().ok()?),
        None => (rate.trim().parse::<f64>().ok()?, 1.0),
    };
    if den <= 0.0 || num <= 0.0 {
        return None;
    }
    let fps = (num / den).round();
    if fps < 1.0 {
        Some(1)
    } else {
        Some(fps as u32)
    }
}
