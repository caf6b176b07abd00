//! Process configuration, built once at startup and injected

use crate::analyzer::AnalyzerConfig;
use crate::error::ConfigError;
use crate::image::ImageConfig;
use crate::sampler::DEFAULT_INTERVAL_FRAMES;
use crate::session::SessionConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "parkwatch", version, about = "Live parking space analysis over WebSocket")]
pub struct Args {
    /// Address for the HTTP/WebSocket listener
    #[arg(long, env = "PARKWATCH_BIND", default_value = "127.0.0.1:8000")]
    pub bind: SocketAddr,

    /// API key for the inference service
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true, default_value = "")]
    pub api_key: String,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub base_url: String,

    /// Multimodal model name
    #[arg(long, env = "PARKWATCH_MODEL", default_value = "gpt-4o-mini")]
    pub model: String,

    /// Completion token limit per analysis
    #[arg(long, env = "PARKWATCH_MAX_TOKENS", default_value_t = 300)]
    pub max_tokens: u32,

    /// Inference request timeout in seconds
    #[arg(long, env = "PARKWATCH_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Analyze every Nth decoded frame
    #[arg(long, env = "PARKWATCH_SAMPLE_INTERVAL", default_value_t = DEFAULT_INTERVAL_FRAMES)]
    pub sample_interval: u64,

    /// Pause between loop iterations in milliseconds
    #[arg(long, env = "PARKWATCH_FRAME_PAUSE_MS", default_value_t = 100)]
    pub frame_pause_ms: u64,

    /// Backoff after an unexpected loop failure in seconds
    #[arg(long, env = "PARKWATCH_FAULT_BACKOFF_SECS", default_value_t = 5)]
    pub fault_backoff_secs: u64,

    /// Longest edge of frames sent for analysis (0 = original size)
    #[arg(long, env = "PARKWATCH_ANALYSIS_MAX_DIM", default_value_t = 1024)]
    pub analysis_max_dimension: u32,

    /// Longest edge of preview frames sent to clients (0 = original size)
    #[arg(long, env = "PARKWATCH_PREVIEW_MAX_DIM", default_value_t = 1280)]
    pub preview_max_dimension: u32,

    /// JPEG quality for analysis and preview frames (1-100)
    #[arg(long, env = "PARKWATCH_JPEG_QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub bind: SocketAddr,
    pub analyzer: AnalyzerConfig,
    pub session: SessionConfig,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            analyzer: AnalyzerConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ScannerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.sample_interval_frames == 0 {
            return Err(ConfigError::Invalid("sample interval must be at least 1 frame".to_string()));
        }
        if self.analyzer.timeout.is_zero() {
            return Err(ConfigError::Invalid("request timeout must be positive".to_string()));
        }
        if self.analyzer.model.trim().is_empty() {
            return Err(ConfigError::Invalid("model name is empty".to_string()));
        }
        if !(self.analyzer.base_url.starts_with("http://") || self.analyzer.base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!("base URL must be http(s): {}", self.analyzer.base_url)));
        }
        for quality in [self.analyzer.image.quality, self.session.preview.quality] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::Invalid(format!("JPEG quality out of range: {}", quality)));
            }
        }
        Ok(())
    }
}

impl TryFrom<Args> for ScannerConfig {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let config = ScannerConfig {
            bind: args.bind,
            analyzer: AnalyzerConfig {
                api_key: args.api_key,
                base_url: args.base_url,
                model: args.model,
                max_tokens: args.max_tokens,
                timeout: Duration::from_secs(args.request_timeout_secs),
                image: ImageConfig {
                    max_dimension: args.analysis_max_dimension,
                    quality: args.jpeg_quality,
                },
            },
            session: SessionConfig {
                sample_interval_frames: args.sample_interval,
                frame_pause: Duration::from_millis(args.frame_pause_ms),
                fault_backoff: Duration::from_secs(args.fault_backoff_secs),
                preview: ImageConfig {
                    max_dimension: args.preview_max_dimension,
                    quality: args.jpeg_quality,
                },
            },
        };
        config.validate()?;
        Ok(config)
    }
}
