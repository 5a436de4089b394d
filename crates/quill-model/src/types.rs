// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Free-form metadata attached to blocks, messages, call options, and usage
/// reports.  String keys, arbitrary JSON values.
pub type ExtraFields = Map<String, Value>;

/// Key under which the saving middleware records a message's stable identity
/// in [`Message::extra_fields`].
pub const MESSAGE_ID_KEY: &str = "message_id";

/// Key under which adapters record which provider produced a thinking block.
/// Blocks without this key have unknown origin.
pub const THINKING_GENERATOR_KEY: &str = "thinking_generator";

/// Key for the opaque integrity signature some providers attach to thinking
/// blocks.  Must be echoed back verbatim when the block is resent.
pub const SIGNATURE_KEY: &str = "signature";

/// Key under which a ToolCall block records the tool name.  The block's
/// `content` carries the raw JSON arguments — kept separate so streamed
/// argument fragments can be appended without re-parsing an envelope.
pub const TOOL_NAME_KEY: &str = "tool_name";

// ─── Blocks ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Content,
    Thinking,
    ToolCall,
    ToolResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
    Pdf,
}

/// One atomic unit of a message.
///
/// `content` is plain text for text-modality blocks and base64 for binary
/// modalities.  Tool-call blocks store the raw JSON arguments in `content`,
/// the call id in `id`, and the tool name under
/// `extra_fields[TOOL_NAME_KEY]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_type: BlockType,
    pub modality: Modality,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub content: String,
    /// Tool-call correlation id.  Required on ToolCall blocks and on the
    /// matching block inside the ToolResult message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_fields: ExtraFields,
}

impl Block {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Content,
            modality: Modality::Text,
            mime_type: "text/plain".into(),
            content: content.into(),
            id: None,
            extra_fields: Map::new(),
        }
    }

    /// A binary content block carrying an already-encoded base64 payload.
    pub fn binary(modality: Modality, mime_type: impl Into<String>, b64: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::Content,
            modality,
            mime_type: mime_type.into(),
            content: b64.into(),
            id: None,
            extra_fields: Map::new(),
        }
    }

    /// A binary content block from raw bytes (encoded here).
    pub fn binary_from_bytes(
        modality: Modality,
        mime_type: impl Into<String>,
        bytes: &[u8],
    ) -> Self {
        use base64::Engine;
        Self::binary(
            modality,
            mime_type,
            base64::engine::general_purpose::STANDARD.encode(bytes),
        )
    }

    /// A thinking block tagged with the id of the provider that produced it.
    pub fn thinking(content: impl Into<String>, generator_id: impl Into<String>) -> Self {
        let mut extra = Map::new();
        extra.insert(THINKING_GENERATOR_KEY.into(), Value::String(generator_id.into()));
        Self {
            block_type: BlockType::Thinking,
            modality: Modality::Text,
            mime_type: "text/plain".into(),
            content: content.into(),
            id: None,
            extra_fields: extra,
        }
    }

    pub fn tool_call(id: impl Into<String>, name: &str, parameters: Value) -> Self {
        let mut extra = Map::new();
        extra.insert(TOOL_NAME_KEY.into(), Value::String(name.into()));
        Self {
            block_type: BlockType::ToolCall,
            modality: Modality::Text,
            mime_type: "application/json".into(),
            content: parameters.to_string(),
            id: Some(id.into()),
            extra_fields: extra,
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            block_type: BlockType::ToolResult,
            modality: Modality::Text,
            mime_type: "text/plain".into(),
            content: content.into(),
            id: Some(id.into()),
            extra_fields: Map::new(),
        }
    }

    /// Provider id recorded on a thinking block, if any.
    pub fn thinking_generator(&self) -> Option<&str> {
        self.extra_fields.get(THINKING_GENERATOR_KEY).and_then(|v| v.as_str())
    }

    /// Decompose a ToolCall block into `(name, parameters)`.
    ///
    /// Returns `None` for non-ToolCall blocks or when no tool name was
    /// recorded.  Empty or unparseable arguments degrade to `{}` — some
    /// models stream zero argument fragments for nullary tools.
    pub fn tool_call_parts(&self) -> Option<(String, Value)> {
        if self.block_type != BlockType::ToolCall {
            return None;
        }
        let name = self.extra_fields.get(TOOL_NAME_KEY)?.as_str()?.to_string();
        let params = serde_json::from_str(&self.content).unwrap_or(json!({}));
        Some((name, params))
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolResult,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub blocks: Vec<Block>,
    /// Set when this message reports a failed tool execution.  Such messages
    /// are still fed back to the model; recovering is the model's job.
    #[serde(default)]
    pub tool_result_error: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_fields: ExtraFields,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            blocks: vec![Block::text(text)],
            tool_result_error: false,
            extra_fields: Map::new(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            blocks: vec![Block::text(text)],
            tool_result_error: false,
            extra_fields: Map::new(),
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::ToolResult,
            blocks: vec![Block::tool_result(id, content)],
            tool_result_error: false,
            extra_fields: Map::new(),
        }
    }

    /// A failed tool execution, reported back to the model as data.
    pub fn tool_error(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_result_error: true,
            ..Self::tool_result(id, content)
        }
    }

    /// Concatenated text of all Content blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Content && b.modality == Modality::Text)
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.block_type == BlockType::ToolCall)
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }

    /// Stable id assigned by the saving middleware, if this message has been
    /// persisted.
    pub fn message_id(&self) -> Option<&str> {
        self.extra_fields.get(MESSAGE_ID_KEY).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
    }

    pub fn set_message_id(&mut self, id: impl Into<String>) {
        self.extra_fields.insert(MESSAGE_ID_KEY.into(), Value::String(id.into()));
    }
}

/// Ordered conversation history.  Ordering is significant: it defines the
/// parent chain recorded by the saving middleware.
pub type Dialog = Vec<Message>;

// ─── Responses and usage ──────────────────────────────────────────────────────

/// Token accounting and provider-specific metadata for one model call.
pub type UsageMetadata = Map<String, Value>;

pub mod usage {
    use super::UsageMetadata;

    pub const INPUT_TOKENS: &str = "input_tokens";
    pub const GENERATION_TOKENS: &str = "generation_tokens";
    pub const CACHE_READ_TOKENS: &str = "cache_read_tokens";
    pub const CACHE_WRITE_TOKENS: &str = "cache_write_tokens";
    /// Responses-API prior response id, also propagated into block
    /// `extra_fields` by the metadata-propagating stream assembler.
    pub const RESPONSES_ID: &str = "responses_id";

    pub fn get_u64(usage: &UsageMetadata, key: &str) -> u64 {
        usage.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn set_u64(usage: &mut UsageMetadata, key: &str, value: u64) {
        usage.insert(key.to_string(), serde_json::Value::from(value));
    }
}

/// One or more candidate messages plus usage metadata.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub candidates: Vec<Message>,
    pub usage: UsageMetadata,
}

// ─── Call options ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThinkingBudget {
    #[default]
    Off,
    Low,
    Medium,
    High,
    Tokens(u32),
}

impl ThinkingBudget {
    pub fn is_off(&self) -> bool {
        matches!(self, Self::Off)
    }

    /// Token budget for providers that take a numeric budget.
    pub fn budget_tokens(&self) -> Option<u32> {
        match self {
            Self::Off => None,
            Self::Low => Some(2048),
            Self::Medium => Some(8192),
            Self::High => Some(24576),
            Self::Tokens(n) => Some(*n),
        }
    }

    /// Effort label for providers that take a qualitative level.  Numeric
    /// budgets map to the nearest tier.
    pub fn effort(&self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            Self::Low => Some("low"),
            Self::Medium => Some("medium"),
            Self::High => Some("high"),
            Self::Tokens(n) if *n <= 4096 => Some("low"),
            Self::Tokens(n) if *n <= 16384 => Some("medium"),
            Self::Tokens(_) => Some("high"),
        }
    }
}

/// A tool schema offered to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub input_schema: Value,
}

/// Caller-supplied per-call configuration.
///
/// `tools` is filled by the tool loop from its registry before every call so
/// adapters stay stateless; `extra_args` passes provider quirks through
/// verbatim (adapters merge recognized keys into the request body).
#[derive(Debug, Clone, Default)]
pub struct GenOpts {
    pub thinking_budget: ThinkingBudget,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    pub tools: Vec<Tool>,
    pub extra_args: ExtraFields,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn user_message_has_single_text_block() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.blocks.len(), 1);
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let m = Message::tool_result("tc_1", "output");
        assert_eq!(m.role, Role::ToolResult);
        assert!(!m.tool_result_error);
        assert_eq!(m.blocks[0].id.as_deref(), Some("tc_1"));
        assert_eq!(m.blocks[0].block_type, BlockType::ToolResult);
    }

    #[test]
    fn tool_error_message_sets_error_flag() {
        let m = Message::tool_error("tc_1", "boom");
        assert!(m.tool_result_error);
        assert_eq!(m.role, Role::ToolResult);
    }

    #[test]
    fn thinking_block_records_generator_tag() {
        let b = Block::thinking("let me think", "google");
        assert_eq!(b.block_type, BlockType::Thinking);
        assert_eq!(b.thinking_generator(), Some("google"));
    }

    #[test]
    fn plain_block_has_unknown_thinking_origin() {
        let b = Block::text("x");
        assert!(b.thinking_generator().is_none());
    }

    // ── Tool-call round trip ──────────────────────────────────────────────────

    #[test]
    fn tool_call_parts_round_trip() {
        let b = Block::tool_call("tc_9", "view_file", json!({ "path": "a" }));
        let (name, params) = b.tool_call_parts().unwrap();
        assert_eq!(name, "view_file");
        assert_eq!(params, json!({ "path": "a" }));
        assert_eq!(b.id.as_deref(), Some("tc_9"));
    }

    #[test]
    fn tool_call_parts_none_for_content_block() {
        assert!(Block::text("x").tool_call_parts().is_none());
    }

    #[test]
    fn tool_call_parts_defaults_empty_arguments_to_empty_object() {
        let mut b = Block::tool_call("tc", "f", json!({}));
        b.content.clear();
        let (_, params) = b.tool_call_parts().unwrap();
        assert_eq!(params, json!({}));
    }

    #[test]
    fn has_tool_calls_detects_mixed_blocks() {
        let m = Message {
            role: Role::Assistant,
            blocks: vec![Block::text("working on it"), Block::tool_call("t1", "ls", json!({}))],
            tool_result_error: false,
            extra_fields: Map::new(),
        };
        assert!(m.has_tool_calls());
        assert_eq!(m.tool_calls().count(), 1);
    }

    // ── Message identity ──────────────────────────────────────────────────────

    #[test]
    fn message_id_absent_until_assigned() {
        let mut m = Message::user("hi");
        assert!(m.message_id().is_none());
        m.set_message_id("msg_1");
        assert_eq!(m.message_id(), Some("msg_1"));
    }

    #[test]
    fn empty_message_id_counts_as_unsaved() {
        let mut m = Message::user("hi");
        m.set_message_id("");
        assert!(m.message_id().is_none());
    }

    // ── Thinking budget mapping ───────────────────────────────────────────────

    #[test]
    fn thinking_budget_presets_map_to_tokens_and_effort() {
        assert_eq!(ThinkingBudget::Off.budget_tokens(), None);
        assert_eq!(ThinkingBudget::Low.budget_tokens(), Some(2048));
        assert_eq!(ThinkingBudget::High.effort(), Some("high"));
        assert_eq!(ThinkingBudget::Tokens(1000).effort(), Some("low"));
        assert_eq!(ThinkingBudget::Tokens(10_000).effort(), Some("medium"));
        assert_eq!(ThinkingBudget::Tokens(100_000).effort(), Some("high"));
    }

    // ── Serialization round trip ──────────────────────────────────────────────

    #[test]
    fn message_serializes_and_deserializes() {
        let mut m = Message::assistant("answer");
        m.blocks.push(Block::thinking("why", "anthropic"));
        m.set_message_id("msg_42");
        let text = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back, m);
        assert_eq!(back.message_id(), Some("msg_42"));
    }

    #[test]
    fn binary_from_bytes_encodes_base64() {
        let b = Block::binary_from_bytes(Modality::Image, "image/png", b"png-bytes");
        assert_eq!(b.content, "cG5nLWJ5dGVz");
        assert_eq!(b.mime_type, "image/png");
        assert_eq!(b.block_type, BlockType::Content);
    }

    #[test]
    fn usage_helpers_read_and_write() {
        let mut u = UsageMetadata::new();
        usage::set_u64(&mut u, usage::INPUT_TOKENS, 120);
        assert_eq!(usage::get_u64(&u, usage::INPUT_TOKENS), 120);
        assert_eq!(usage::get_u64(&u, usage::GENERATION_TOKENS), 0);
    }
}
