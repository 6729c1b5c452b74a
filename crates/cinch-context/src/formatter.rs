//! Provider payload formatting.
//!
//! A [`Formatter`] turns the projected, blob-expanded history into the
//! message array a provider API expects, and turns provider responses back
//! into crate types. [`OpenAiFormatter`] targets the OpenAI chat-completions
//! wire format, which OpenRouter and most OpenAI-compatible gateways accept.

use crate::blob::resolver::decode_bare_base64;
use crate::{
    ContentPart, ContextError, MediaData, Message, MessageRole, TokenUsage, ToolCall,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::trace;

/// The model a payload is being built for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelContext {
    pub provider: String,
    pub model: String,
    /// Media type patterns the model accepts (after blob expansion).
    pub allowed_media_types: Vec<String>,
}

/// A provider response in crate terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

impl ParsedResponse {
    /// Assistant message carrying this response.
    pub fn into_message(self) -> Message {
        let mut msg = Message::assistant_tool_calls(self.tool_calls);
        if let Some(text) = self.content.filter(|t| !t.is_empty()) {
            msg.content = Some(vec![ContentPart::text(text)]);
        }
        msg.reasoning = self.reasoning;
        msg.token_usage = self.usage;
        msg
    }
}

/// Converts between crate messages and a provider's wire format.
pub trait Formatter: Send + Sync {
    /// Provider messages for `messages`, preceded by the system prompt if any.
    fn format(
        &self,
        messages: &[Message],
        model: &ModelContext,
        system_prompt: Option<&str>,
    ) -> Result<Vec<Value>, ContextError>;

    /// System prompt as a provider message. `None` if the provider takes the
    /// system prompt out of band.
    fn format_system_prompt(&self, system_prompt: &str) -> Option<Value> {
        Some(json!({ "role": "system", "content": system_prompt }))
    }

    /// Parse a complete (non-streaming) response body.
    fn parse_response(&self, raw: &Value) -> Result<ParsedResponse, ContextError> {
        let _ = raw;
        Err(ContextError::Format("response parsing not supported".into()))
    }

    /// Parse the accumulated data chunks of a streamed response.
    fn parse_stream_response(&self, chunks: &[Value]) -> Result<ParsedResponse, ContextError> {
        let _ = chunks;
        Err(ContextError::Format("stream parsing not supported".into()))
    }
}

// ── OpenAI wire types ──────────────────────────────────────────────

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCall>>,
    reasoning: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

#[derive(Deserialize, Debug, Clone)]
struct UsageInfo {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
    prompt_tokens_details: Option<PromptTokensDetails>,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Deserialize, Debug, Clone)]
struct PromptTokensDetails {
    cached_tokens: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
struct CompletionTokensDetails {
    reasoning_tokens: Option<u64>,
}

impl From<UsageInfo> for TokenUsage {
    fn from(u: UsageInfo) -> Self {
        let input = u.prompt_tokens.unwrap_or(0);
        let output = u.completion_tokens.unwrap_or(0);
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            reasoning_tokens: u
                .completion_tokens_details
                .and_then(|d| d.reasoning_tokens)
                .unwrap_or(0),
            cache_read_tokens: u
                .prompt_tokens_details
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0),
            cache_write_tokens: 0,
            total_tokens: u.total_tokens.unwrap_or(input + output),
        }
    }
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Option<Vec<StreamChoice>>,
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: Option<StreamDelta>,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    content: Option<String>,
    reasoning: Option<String>,
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Deserialize, Debug)]
struct StreamToolCallDelta {
    index: Option<usize>,
    id: Option<String>,
    function: Option<StreamFunctionDelta>,
}

#[derive(Deserialize, Debug)]
struct StreamFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

// ── OpenAiFormatter ────────────────────────────────────────────────

/// OpenAI chat-completions formatter.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiFormatter;

fn data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", STANDARD.encode(bytes))
}

/// URL for an attachment value. Data URIs, URLs and references pass
/// through; bare payloads are wrapped in a data URI.
fn media_url(data: &MediaData, mime_type: &str) -> String {
    match data {
        MediaData::Text(s) if s.starts_with("data:") || data.is_url() || data.blob_uri().is_some() => {
            s.clone()
        }
        MediaData::Text(s) => match decode_bare_base64(s, mime_type) {
            Some(bytes) => data_uri(mime_type, &bytes),
            None => data_uri(mime_type, s.as_bytes()),
        },
        MediaData::Bytes(bytes) => data_uri(mime_type, bytes),
    }
}

fn part_to_openai(part: &ContentPart) -> Option<Value> {
    match part {
        ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
        ContentPart::Image { data, mime_type } => Some(json!({
            "type": "image_url",
            "image_url": { "url": media_url(data, mime_type.as_deref().unwrap_or("image/png")) },
        })),
        ContentPart::File {
            data,
            mime_type,
            filename,
        } => Some(json!({
            "type": "file",
            "file": {
                "filename": filename.clone().unwrap_or_else(|| "attachment".to_string()),
                "file_data": media_url(data, mime_type),
            },
        })),
        ContentPart::UiResource { text, .. } => text
            .as_ref()
            .map(|t| json!({ "type": "text", "text": t })),
    }
}

/// Plain string when the content is text only, part array otherwise.
fn content_value(parts: &[ContentPart]) -> Value {
    if parts.iter().all(|p| matches!(p, ContentPart::Text { .. })) {
        let text: Vec<&str> = parts.iter().filter_map(ContentPart::as_text).collect();
        Value::String(text.join("\n"))
    } else {
        Value::Array(parts.iter().filter_map(part_to_openai).collect())
    }
}

fn message_to_openai(msg: &Message) -> Value {
    let parts = msg.content.as_deref().unwrap_or(&[]);
    match msg.role {
        MessageRole::System => json!({ "role": "system", "content": msg.text() }),
        MessageRole::User => json!({ "role": "user", "content": content_value(parts) }),
        MessageRole::Assistant => {
            let mut out = json!({ "role": "assistant" });
            out["content"] = if parts.is_empty() {
                Value::Null
            } else {
                Value::String(msg.text())
            };
            if !msg.tool_calls.is_empty() {
                out["tool_calls"] = json!(msg.tool_calls);
            }
            out
        }
        MessageRole::Tool => json!({
            "role": "tool",
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
            "content": msg.text(),
        }),
    }
}

impl Formatter for OpenAiFormatter {
    fn format(
        &self,
        messages: &[Message],
        model: &ModelContext,
        system_prompt: Option<&str>,
    ) -> Result<Vec<Value>, ContextError> {
        let mut out = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = system_prompt.filter(|p| !p.is_empty())
            && let Some(system) = self.format_system_prompt(prompt)
        {
            out.push(system);
        }
        out.extend(messages.iter().map(message_to_openai));
        trace!(model = %model.model, messages = out.len(), "Formatted OpenAI payload");
        Ok(out)
    }

    fn parse_response(&self, raw: &Value) -> Result<ParsedResponse, ContextError> {
        let resp: RawChatResponse = serde_json::from_value(raw.clone())?;
        if let Some(err) = resp.error {
            return Err(ContextError::Format(format!("provider error: {}", err.message)));
        }
        let choice = resp
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ContextError::Format("response has no choices".into()))?;
        Ok(ParsedResponse {
            content: choice.message.content,
            reasoning: choice.message.reasoning,
            tool_calls: choice.message.tool_calls.unwrap_or_default(),
            usage: resp.usage.map(TokenUsage::from),
            finish_reason: choice.finish_reason,
        })
    }

    fn parse_stream_response(&self, chunks: &[Value]) -> Result<ParsedResponse, ContextError> {
        let mut text = String::new();
        let mut reasoning = String::new();
        let mut calls: BTreeMap<usize, ToolCall> = BTreeMap::new();
        let mut usage = None;
        let mut finish_reason = None;

        for raw in chunks {
            let chunk: StreamChunk = serde_json::from_value(raw.clone())?;
            if let Some(u) = chunk.usage {
                usage = Some(TokenUsage::from(u));
            }
            for choice in chunk.choices.unwrap_or_default() {
                if let Some(reason) = choice.finish_reason {
                    finish_reason = Some(reason);
                }
                let Some(delta) = choice.delta else {
                    continue;
                };
                if let Some(content) = delta.content {
                    text.push_str(&content);
                }
                if let Some(r) = delta.reasoning {
                    reasoning.push_str(&r);
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    let entry = calls
                        .entry(tc.index.unwrap_or(0))
                        .or_insert_with(|| ToolCall::function("", "", ""));
                    if let Some(id) = tc.id {
                        entry.id = id;
                    }
                    if let Some(func) = tc.function {
                        if let Some(name) = func.name {
                            entry.function.name.push_str(&name);
                        }
                        if let Some(args) = func.arguments {
                            entry.function.arguments.push_str(&args);
                        }
                    }
                }
            }
        }

        Ok(ParsedResponse {
            content: (!text.is_empty()).then_some(text),
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            tool_calls: calls.into_values().collect(),
            usage,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ModelContext {
        ModelContext {
            provider: "openai".into(),
            model: "gpt-4o".into(),
            allowed_media_types: vec!["image/*".into()],
        }
    }

    #[test]
    fn formats_roles_and_parts() {
        let messages = vec![
            Message::user_parts(vec![
                ContentPart::text("what is this?"),
                ContentPart::image("data:image/png;base64,AAAA", "image/png"),
            ]),
            Message::assistant_tool_calls(vec![ToolCall::function("c1", "lookup", "{}")]),
            Message::tool_result("c1", "lookup", "a cat"),
            Message::assistant_text("It is a cat."),
        ];
        let out = OpenAiFormatter
            .format(&messages, &ctx(), Some("Be brief."))
            .unwrap();

        assert_eq!(out.len(), 5);
        assert_eq!(out[0], json!({"role": "system", "content": "Be brief."}));
        assert_eq!(out[1]["content"][1]["type"], "image_url");
        assert_eq!(out[1]["content"][1]["image_url"]["url"], "data:image/png;base64,AAAA");
        assert!(out[2]["content"].is_null());
        assert_eq!(out[2]["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(out[3]["tool_call_id"], "c1");
        assert_eq!(out[4]["content"], "It is a cat.");
    }

    #[test]
    fn raw_bytes_become_data_uris() {
        let msg = Message::user_parts(vec![ContentPart::file(
            vec![1u8, 2, 3],
            "application/pdf",
            Some("a.pdf".into()),
        )]);
        let out = OpenAiFormatter.format(&[msg], &ctx(), None).unwrap();
        assert_eq!(
            out[0]["content"][0]["file"]["file_data"],
            "data:application/pdf;base64,AQID"
        );
    }

    #[test]
    fn bare_payloads_become_data_uris() {
        let msg = Message::user_parts(vec![
            ContentPart::image("AQID", "image/png"),
            ContentPart::file("a,b\n1,2\n", "text/csv", Some("t.csv".into())),
            ContentPart::image("https://example.com/cat.png", "image/png"),
        ]);
        let out = OpenAiFormatter.format(&[msg], &ctx(), None).unwrap();
        let parts = &out[0]["content"];
        assert_eq!(parts[0]["image_url"]["url"], "data:image/png;base64,AQID");
        assert_eq!(
            parts[1]["file"]["file_data"],
            format!("data:text/csv;base64,{}", STANDARD.encode("a,b\n1,2\n"))
        );
        assert_eq!(parts[2]["image_url"]["url"], "https://example.com/cat.png");
    }

    #[test]
    fn parses_completion() {
        let raw = json!({
            "choices": [{
                "message": {"content": "hi", "tool_calls": null},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 1000, "completion_tokens": 200, "total_tokens": 1200}
        });
        let parsed = OpenAiFormatter.parse_response(&raw).unwrap();
        assert_eq!(parsed.content.as_deref(), Some("hi"));
        assert_eq!(parsed.usage, Some(TokenUsage::new(1000, 200)));

        let msg = parsed.into_message();
        assert_eq!(msg.role, MessageRole::Assistant);
        assert_eq!(msg.text(), "hi");
    }

    #[test]
    fn provider_error_is_reported() {
        let raw = json!({"error": {"message": "rate limited"}});
        let err = OpenAiFormatter.parse_response(&raw).unwrap_err();
        assert!(err.to_string().contains("rate limited"));
    }

    #[test]
    fn parses_stream_chunks() {
        let chunks = vec![
            json!({"choices": [{"delta": {"content": "Hel"}}]}),
            json!({"choices": [{"delta": {"content": "lo", "tool_calls": [
                {"index": 0, "id": "c1", "function": {"name": "grep", "arguments": "{\"q\":"}}
            ]}}]}),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "\"x\"}"}}
            ]}, "finish_reason": "tool_calls"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 5}}),
        ];
        let parsed = OpenAiFormatter.parse_stream_response(&chunks).unwrap();
        assert_eq!(parsed.content.as_deref(), Some("Hello"));
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].id, "c1");
        assert_eq!(parsed.tool_calls[0].function.arguments, r#"{"q":"x"}"#);
        assert_eq!(parsed.finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(parsed.usage.unwrap().total_tokens, 15);
    }
}
