//! Wire frame types for the live duplex connection.
//!
//! Frame shapes are fixed by the remote service and must be preserved
//! bit-for-bit: outbound frames are one of `clientContent`, `realtimeInput`,
//! `toolResponse` (plus the initial `setup`); inbound frames carry exactly one
//! of `setupComplete`, `toolCall`, `toolCallCancellation`, `serverContent`.
//! Frames are stateless and exist only for the duration of one send/receive.

use crate::config::{SessionConfig, ToolDefinition};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// MIME-type prefix identifying raw little-endian 16-bit PCM audio parts.
pub const AUDIO_PCM_MIME_PREFIX: &str = "audio/pcm";

// ── Outbound frames ─────────────────────────────────────────────────────

/// Top-level outbound message. Exactly one field is set per frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<Setup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_content: Option<ClientContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realtime_input: Option<RealtimeInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_response: Option<ToolResponseFrame>,
}

impl ClientMessage {
    /// Build the initial setup frame from a session configuration.
    pub fn setup(config: &SessionConfig) -> Self {
        let mut generation_config = json!({
            "responseModalities": config
                .modalities
                .clone()
                .unwrap_or_else(|| vec!["AUDIO".to_string()]),
        });
        if let Some(voice) = &config.voice {
            generation_config["speechConfig"] = json!({
                "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": voice } }
            });
        }
        if let Some(temp) = config.temperature {
            generation_config["temperature"] = json!(temp);
        }

        let system_instruction = config
            .instruction
            .as_ref()
            .map(|text| Content { parts: vec![Part::text(text.clone())] });

        Self {
            setup: Some(Setup {
                model: config.model.clone(),
                system_instruction,
                generation_config: Some(generation_config),
                tools: convert_tools(config),
            }),
            client_content: None,
            realtime_input: None,
            tool_response: None,
        }
    }

    /// Build a conversational-content frame wrapping `parts` as one user turn.
    pub fn client_content(parts: Vec<Part>, turn_complete: bool) -> Self {
        Self {
            setup: None,
            client_content: Some(ClientContent {
                turns: vec![Turn { role: "user".to_string(), parts }],
                turn_complete,
            }),
            realtime_input: None,
            tool_response: None,
        }
    }

    /// Build a realtime-input frame carrying one media chunk.
    pub fn realtime_input(chunk: MediaChunk) -> Self {
        Self {
            setup: None,
            client_content: None,
            realtime_input: Some(RealtimeInput { media_chunks: vec![chunk] }),
            tool_response: None,
        }
    }

    /// Build a tool-response frame.
    pub fn tool_response(responses: Vec<FunctionResponse>) -> Self {
        Self {
            setup: None,
            client_content: None,
            realtime_input: None,
            tool_response: Some(ToolResponseFrame { function_responses: responses }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Turn>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

/// One binary media chunk: base64 payload plus its MIME type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

impl MediaChunk {
    /// Wrap base64-encoded PCM16 audio captured at the given sample rate.
    pub fn audio_pcm(data: String, sample_rate: u32) -> Self {
        Self { mime_type: format!("{AUDIO_PCM_MIME_PREFIX};rate={sample_rate}"), data }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponseFrame {
    pub function_responses: Vec<FunctionResponse>,
}

/// Result of one tool invocation, keyed by the call id it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub response: Value,
}

impl FunctionResponse {
    /// Create a response for the given call id.
    pub fn new(id: impl Into<String>, response: Value) -> Self {
        Self { id: id.into(), response }
    }
}

// ── Shared content types ────────────────────────────────────────────────

/// A list of parts forming one piece of content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

/// One content part: text or inline binary data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

impl Part {
    /// Create a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), inline_data: None }
    }

    /// Whether this part carries inline PCM audio.
    pub fn is_audio(&self) -> bool {
        self.inline_data
            .as_ref()
            .is_some_and(|d| d.mime_type.starts_with(AUDIO_PCM_MIME_PREFIX))
    }
}

/// Base64-encoded inline data with its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

// ── Inbound frames ──────────────────────────────────────────────────────

/// Top-level inbound message. The service sets exactly one of these fields.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub tool_call: Option<ToolCallFrame>,
    pub tool_call_cancellation: Option<ToolCallCancellation>,
    pub server_content: Option<ServerContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallFrame {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallCancellation {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
    pub model_turn: Option<ModelTurn>,
    pub grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroundingMetadata {
    #[serde(default)]
    pub grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroundingChunk {
    pub web: Option<GroundingWeb>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroundingWeb {
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub title: String,
}

fn convert_tools(config: &SessionConfig) -> Option<Vec<Value>> {
    let mut tools = Vec::new();

    if config.web_grounding {
        tools.push(json!({ "googleSearch": {} }));
    }

    if let Some(defs) = config.tools.as_ref().filter(|t| !t.is_empty()) {
        let declarations: Vec<Value> = defs.iter().map(declaration).collect();
        tools.push(json!({ "functionDeclarations": declarations }));
    }

    if tools.is_empty() { None } else { Some(tools) }
}

fn declaration(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description.clone().unwrap_or_default(),
        "parameters": tool
            .parameters
            .clone()
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
    })
}
