//! Outbound analysis updates

use crate::error::SendError;
use crate::image::{ImageConfig, ImageEncoder};
use crate::parser::AnalysisResult;
use crate::video::VideoFrame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Wire payload for one sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub available_spaces: u32,
    pub recommended_spots: Vec<String>,
    /// Seconds since the Unix epoch, millisecond precision
    pub timestamp: String,
    /// Base64 JPEG preview
    pub frame: String,
    pub frame_count: u64,
    pub fps: u32,
}

pub const UPDATE_TYPE: &str = "analysis_update";

impl UpdateMessage {
    pub fn new(result: &AnalysisResult, frame_b64: String) -> Self {
        Self {
            kind: UPDATE_TYPE.to_string(),
            available_spaces: result.available_spaces,
            recommended_spots: result.recommended_spots.clone(),
            timestamp: timestamp_now(),
            frame: frame_b64,
            frame_count: result.frame_index,
            fps: result.fps,
        }
    }
}

fn timestamp_now() -> String {
    let millis = chrono::Utc::now().timestamp_millis();
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}

/// Destination for serialized text messages.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<(), SendError>;
}

#[async_trait]
impl UpdateSink for mpsc::Sender<String> {
    async fn send_text(&self, text: String) -> Result<(), SendError> {
        self.send(text).await.map_err(|_| SendError::Closed)
    }
}

pub struct Broadcaster<S> {
    sink: S,
    encoder: ImageEncoder,
}

impl<S: UpdateSink> Broadcaster<S> {
    pub fn new(sink: S, preview: ImageConfig) -> Self {
        Self {
            sink,
            encoder: ImageEncoder::new(preview),
        }
    }

    /// Encode the preview and emit one `analysis_update`.
    pub async fn send(&self, result: &AnalysisResult, frame: &VideoFrame) -> Result<(), SendError> {
        let frame_b64 = self.encoder.encode_base64(&frame.image)?;
        let message = UpdateMessage::new(result, frame_b64);
        let text = serde_json::to_string(&message)?;
        self.sink.send_text(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn result() -> AnalysisResult {
        AnalysisResult {
            available_spaces: 4,
            recommended_spots: vec!["A1".to_string(), "C3".to_string()],
            frame_index: 720,
            fps: 30,
        }
    }

    fn frame() -> VideoFrame {
        VideoFrame { image: RgbImage::from_pixel(16, 16, image::Rgb([200, 10, 10])), index: 720, fps: 30 }
    }

    #[tokio::test]
    async fn test_send_emits_wire_format() {
        let (tx, mut rx) = mpsc::channel(4);
        let broadcaster = Broadcaster::new(tx, ImageConfig::default());

        broadcaster.send(&result(), &frame()).await.unwrap();

        let text = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "analysis_update");
        assert_eq!(value["available_spaces"], 4);
        assert_eq!(value["recommended_spots"], serde_json::json!(["A1", "C3"]));
        assert_eq!(value["frame_count"], 720);
        assert_eq!(value["fps"], 30);
        assert!(value["frame"].as_str().unwrap().starts_with("/9j/"));
        let ts: f64 = value["timestamp"].as_str().unwrap().parse().unwrap();
        assert!(ts > 1_600_000_000.0);
    }

    #[tokio::test]
    async fn test_send_to_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let broadcaster = Broadcaster::new(tx, ImageConfig::default());

        let err = broadcaster.send(&result(), &frame()).await.unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }

    #[test]
    fn test_timestamp_format() {
        let ts = timestamp_now();
        let (secs, frac) = ts.split_once('.').unwrap();
        assert!(secs.parse::<i64>().unwrap() > 0);
        assert_eq!(frac.len(), 3);
    }
}
