//! WebSocket control messages
//!
//! `analysis_update` payloads are defined in [`crate::broadcast::UpdateMessage`].

use serde::{Deserialize, Serialize};

/// Client → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    StartAnalysis { video_path: String },
    StopAnalysis,
}

/// Server → client acknowledgements and errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AnalysisStarted { video_path: String, fps: u32 },
    AnalysisStopped,
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error { message: message.into() }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"start_analysis","video_path":"/media/lot.mp4"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StartAnalysis { video_path: "/media/lot.mp4".to_string() });
    }

    #[test]
    fn test_parse_stop() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"stop_analysis"}"#).unwrap();
        assert_eq!(msg, ClientMessage::StopAnalysis);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"start_analysis"}"#).is_err());
    }

    #[test]
    fn test_server_message_tags() {
        let started = ServerMessage::AnalysisStarted { video_path: "a.mp4".to_string(), fps: 30 }.to_json().unwrap();
        assert_eq!(started, r#"{"type":"analysis_started","video_path":"a.mp4","fps":30}"#);
        assert_eq!(ServerMessage::AnalysisStopped.to_json().unwrap(), r#"{"type":"analysis_stopped"}"#);
        assert_eq!(ServerMessage::error("boom").to_json().unwrap(), r#"{"type":"error","message":"boom"}"#);
    }
}
