//! Wire protocol for the streaming transcription service.
//!
//! The service speaks a Deepgram-compatible dialect over a persistent
//! WebSocket: audio goes up as raw binary PCM frames, results come back as
//! JSON text frames tagged by `type`, and shutdown is signaled with a typed
//! `CloseStream` control message before the transport closes.
//!
//! # Session flow
//!
//! 1. Open `wss://.../v1/listen?...` with the token in an
//!    `Authorization: Token ...` header; audio format and endpointing are
//!    query parameters.
//! 2. Send binary PCM16 frames as audio arrives.
//! 3. Receive `Results` frames (interim and final) while streaming.
//! 4. Send `CloseStream`, then close the transport.

use serde::{Deserialize, Serialize};

/// Connection parameters rendered into the stream URL.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// WebSocket endpoint, without query parameters
    pub endpoint: String,
    /// Requested recognition model
    pub model: String,
    /// Sample rate of the outbound PCM, in Hz
    pub sample_rate: u32,
    /// Channel count of the outbound PCM
    pub channels: u16,
    /// Whether the service should push interim (non-final) results
    pub interim_results: bool,
    /// Silence window for server-side endpointing, in milliseconds
    pub endpointing_ms: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.deepgram.com/v1/listen".to_string(),
            model: "nova-2".to_string(),
            sample_rate: 16_000,
            channels: 1,
            interim_results: true,
            endpointing_ms: 300,
        }
    }
}

impl StreamConfig {
    /// Render the full connection URL. Audio is always linear16 PCM.
    pub fn url(&self) -> String {
        format!(
            "{}?model={}&encoding=linear16&sample_rate={}&channels={}&interim_results={}&endpointing={}",
            self.endpoint,
            self.model,
            self.sample_rate,
            self.channels,
            self.interim_results,
            self.endpointing_ms
        )
    }

    /// Samples per outbound frame for a given frame duration.
    pub fn samples_per_frame(&self, frame_ms: u32) -> usize {
        (self.sample_rate * frame_ms / 1000) as usize * self.channels as usize
    }
}

/// Convert PCM16 samples to the little-endian byte layout the service
/// expects in binary frames.
pub fn encode_pcm16_le(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|&s| s.to_le_bytes()).collect()
}

// ============================================================================
// Control messages (sent TO the service)
// ============================================================================

/// Typed JSON control frames. Audio itself is never JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Graceful end of stream; the service flushes pending results
    CloseStream,
    /// Keeps an idle connection open without sending audio
    KeepAlive,
}

// ============================================================================
// Server messages (received FROM the service)
// ============================================================================

/// Messages pushed by the service over the socket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A transcription result for a window of audio
    Results {
        #[serde(default)]
        channel_index: Vec<u32>,
        /// Duration of the audio window, seconds
        #[serde(default)]
        duration: f64,
        /// Offset of the window from stream start, seconds
        #[serde(default)]
        start: f64,
        #[serde(default)]
        is_final: bool,
        channel: ResultChannel,
    },
    /// Stream metadata, sent once at open and again at close
    Metadata {
        #[serde(default)]
        request_id: String,
    },
    /// Server-side VAD detected the start of speech
    SpeechStarted {
        #[serde(default)]
        timestamp: f64,
    },
    /// Endpointing decided the utterance is over
    UtteranceEnd {
        #[serde(default)]
        last_word_end: f64,
    },
    /// Catch-all so unknown message types never fail deserialization
    #[serde(other)]
    Unknown,
}

/// Per-channel recognition results.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultChannel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

/// One recognition hypothesis.
#[derive(Debug, Clone, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub words: Vec<Word>,
}

/// Word-level timing within an alternative.
#[derive(Debug, Clone, Deserialize)]
pub struct Word {
    pub word: String,
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    #[serde(default)]
    pub confidence: f64,
}

/// A single speech-to-text update, extracted from a `Results` frame.
///
/// Ephemeral: handed to the batch processor and consumed there.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFragment {
    pub text: String,
    pub is_final: bool,
    /// Recognition confidence, clamped to [0, 1]
    pub confidence: f64,
    /// Offset from stream start in seconds, when the service reported one
    pub start: Option<f64>,
}

impl ServerMessage {
    /// Extract a fragment from the top alternative of a `Results` frame.
    ///
    /// Returns `None` for non-result messages and for empty transcripts
    /// (the service sends empty interim results during silence).
    pub fn to_fragment(&self) -> Option<TranscriptFragment> {
        match self {
            ServerMessage::Results {
                is_final,
                start,
                channel,
                ..
            } => {
                let alt = channel.alternatives.first()?;
                if alt.transcript.is_empty() {
                    return None;
                }
                Some(TranscriptFragment {
                    text: alt.transcript.clone(),
                    is_final: *is_final,
                    confidence: alt.confidence.clamp(0.0, 1.0),
                    start: Some(*start),
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_url_query_parameters() {
        let config = StreamConfig::default();
        let url = config.url();

        assert!(url.starts_with("wss://api.deepgram.com/v1/listen?"));
        assert!(url.contains("encoding=linear16"));
        assert!(url.contains("sample_rate=16000"));
        assert!(url.contains("channels=1"));
        assert!(url.contains("interim_results=true"));
        assert!(url.contains("endpointing=300"));
        assert!(url.contains("model=nova-2"));
    }

    #[test]
    fn test_samples_per_frame() {
        let config = StreamConfig::default();
        // 16000 Hz * 100ms / 1000 = 1600 samples, mono
        assert_eq!(config.samples_per_frame(100), 1600);

        let stereo = StreamConfig {
            channels: 2,
            ..Default::default()
        };
        assert_eq!(stereo.samples_per_frame(100), 3200);
    }

    #[test]
    fn test_encode_pcm16_le() {
        let bytes = encode_pcm16_le(&[0x1234i16, 0x5678]);
        // Little-endian: 0x1234 -> [0x34, 0x12], 0x5678 -> [0x78, 0x56]
        assert_eq!(bytes, vec![0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_close_stream_serialization() {
        let json = serde_json::to_string(&ControlMessage::CloseStream).unwrap();
        assert_eq!(json, r#"{"type":"CloseStream"}"#);

        let json = serde_json::to_string(&ControlMessage::KeepAlive).unwrap();
        assert_eq!(json, r#"{"type":"KeepAlive"}"#);
    }

    #[test]
    fn test_results_deserialization() {
        let json = r#"{
            "type": "Results",
            "channel_index": [0, 1],
            "duration": 1.02,
            "start": 3.5,
            "is_final": true,
            "channel": {
                "alternatives": [{
                    "transcript": "hello world",
                    "confidence": 0.97,
                    "words": [
                        {"word": "hello", "start": 3.5, "end": 3.9, "confidence": 0.98},
                        {"word": "world", "start": 3.9, "end": 4.3, "confidence": 0.96}
                    ]
                }]
            }
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let fragment = msg.to_fragment().expect("fragment");

        assert_eq!(fragment.text, "hello world");
        assert!(fragment.is_final);
        assert!((fragment.confidence - 0.97).abs() < 1e-9);
        assert_eq!(fragment.start, Some(3.5));

        match msg {
            ServerMessage::Results { channel, .. } => {
                assert_eq!(channel.alternatives[0].words.len(), 2);
                assert_eq!(channel.alternatives[0].words[0].word, "hello");
            }
            _ => panic!("expected Results"),
        }
    }

    #[test]
    fn test_empty_transcript_yields_no_fragment() {
        let json = r#"{
            "type": "Results",
            "is_final": false,
            "channel": {"alternatives": [{"transcript": "", "confidence": 0.0}]}
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(msg.to_fragment().is_none());
    }

    #[test]
    fn test_confidence_clamped() {
        let json = r#"{
            "type": "Results",
            "is_final": true,
            "channel": {"alternatives": [{"transcript": "hi", "confidence": 1.7}]}
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.to_fragment().unwrap().confidence, 1.0);
    }

    #[test]
    fn test_unknown_message_type_tolerated() {
        let json = r#"{"type": "SomeFutureThing", "payload": 42}"#;
        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown));
        assert!(msg.to_fragment().is_none());
    }

    #[test]
    fn test_metadata_and_vad_messages() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type": "Metadata", "request_id": "req-1"}"#).unwrap();
        assert!(matches!(msg, ServerMessage::Metadata { .. }));

        let msg: ServerMessage =
            serde_json::from_str(r#"{"type": "SpeechStarted", "timestamp": 0.42}"#).unwrap();
        assert!(matches!(msg, ServerMessage::SpeechStarted { .. }));

        let msg: ServerMessage =
            serde_json::from_str(r#"{"type": "UtteranceEnd", "last_word_end": 7.1}"#).unwrap();
        assert!(matches!(msg, ServerMessage::UtteranceEnd { .. }));
    }
}
