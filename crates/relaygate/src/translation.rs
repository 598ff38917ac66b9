//! Anthropic <-> chat-completions body mapping.
//!
//! - Anthropic `/v1/messages` request -> OpenAI `chat/completions` JSON
//! - OpenAI `chat/completions` response -> Anthropic `/v1/messages`
//!
//! Both directions are stateless.

use serde_json::{json, Map, Value};

use crate::error::GatewayError;
use crate::types::{
    ContentBlock, Message, MessagesRequest, MessagesResponse, Role, ToolChoice, Usage,
};

/// Flattens the blocks of one Anthropic message into chat-completions
/// messages. Tool results become standalone `role: tool` messages.
#[derive(Default)]
struct MessageBuilder {
    out: Vec<Value>,
    parts: Vec<Value>,
    multipart: bool,
    tool_calls: Vec<Value>,
}

impl MessageBuilder {
    fn push_text(&mut self, text: String) {
        self.parts.push(json!({"type": "text", "text": text}));
    }

    fn push_image(&mut self, media_type: &str, data: &str) {
        self.multipart = true;
        self.parts.push(json!({
            "type": "image_url",
            "image_url": {"url": format!("data:{media_type};base64,{data}")}
        }));
    }

    fn content(&mut self) -> Option<Value> {
        if self.parts.is_empty() {
            return None;
        }
        let parts = std::mem::take(&mut self.parts);
        if std::mem::take(&mut self.multipart) {
            return Some(Value::Array(parts));
        }
        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect();
        Some(Value::String(text))
    }

    fn flush(&mut self, role: &str) {
        let content = self.content();
        let tool_calls = std::mem::take(&mut self.tool_calls);
        if content.is_none() && tool_calls.is_empty() {
            return;
        }
        let mut msg = Map::new();
        msg.insert("role".into(), json!(role));
        msg.insert("content".into(), content.unwrap_or(Value::Null));
        if !tool_calls.is_empty() {
            msg.insert("tool_calls".into(), Value::Array(tool_calls));
        }
        self.out.push(Value::Object(msg));
    }

    fn add(&mut self, message: &Message) -> Result<(), GatewayError> {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        for block in message.content.blocks() {
            match block {
                ContentBlock::Text { text } => self.push_text(text),
                ContentBlock::Image { source } => self.push_image(&source.media_type, &source.data),
                ContentBlock::ToolUse { id, name, input } => {
                    let arguments = serde_json::to_string(&input).map_err(|e| {
                        GatewayError::InvalidRequest(format!("tool_use input for {name}: {e}"))
                    })?;
                    self.tool_calls.push(json!({
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": arguments}
                    }));
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    ..
                } => {
                    self.flush(role);
                    self.out.push(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content.to_plaintext(),
                    }));
                }
            }
        }
        self.flush(role);
        Ok(())
    }
}

/// Build the upstream `chat/completions` body for `req`, addressed to
/// `target_model`.
pub fn to_upstream_request(
    req: &MessagesRequest,
    target_model: &str,
) -> Result<Value, GatewayError> {
    let mut builder = MessageBuilder::default();
    if let Some(system) = &req.system {
        let text = system.to_plaintext();
        if !text.is_empty() {
            builder.out.push(json!({"role": "system", "content": text}));
        }
    }
    for message in &req.messages {
        builder.add(message)?;
    }

    let mut out = json!({
        "model": target_model,
        "messages": builder.out,
        "max_tokens": req.max_tokens,
        "stream": req.stream,
    });
    if req.stream {
        out["stream_options"] = json!({"include_usage": true});
    }
    if let Some(t) = req.temperature {
        out["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        out["top_p"] = json!(p);
    }
    if let Some(stop) = &req.stop_sequences {
        out["stop"] = json!(stop);
    }
    if let Some(tools) = &req.tools {
        out["tools"] = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
    }
    if let Some(choice) = &req.tool_choice {
        out["tool_choice"] = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool { name } => json!({"type": "function", "function": {"name": name}}),
        };
    }
    Ok(out)
}

/// Map an OpenAI finish reason onto Anthropic's `stop_reason` vocabulary.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        other => other,
    }
    .to_string()
}

/// Token counts reported by an upstream body: `(prompt, completion, total)`.
pub fn upstream_usage(resp: &Value) -> Option<(u32, u32, u32)> {
    let usage = resp.get("usage")?;
    let read = |key: &str| {
        usage
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
    };
    let prompt = read("prompt_tokens").unwrap_or(0);
    let completion = read("completion_tokens").unwrap_or(0);
    let total = read("total_tokens").unwrap_or(prompt.saturating_add(completion));
    Some((prompt, completion, total))
}

/// Translate a buffered chat completion into an Anthropic response that
/// echoes `requested_model`.
pub fn from_upstream_response(
    resp: &Value,
    requested_model: &str,
) -> Result<MessagesResponse, GatewayError> {
    let choice = resp
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| GatewayError::upstream(502, "upstream response has no choices"))?;
    let message = choice
        .get("message")
        .ok_or_else(|| GatewayError::upstream(502, "upstream choice has no message"))?;

    let mut content = Vec::new();
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
    }
    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let function = call.get("function");
        let arguments = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
            .unwrap_or("{}");
        content.push(ContentBlock::ToolUse {
            id: call
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or("toolu_unknown")
                .to_string(),
            name: function
                .and_then(|f| f.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            input: serde_json::from_str(arguments).unwrap_or_else(|_| json!({"raw": arguments})),
        });
    }

    let (input_tokens, output_tokens, _) = upstream_usage(resp).unwrap_or_default();
    Ok(MessagesResponse {
        id: resp
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| "msg_unknown".to_string()),
        kind: "message".to_string(),
        role: Role::Assistant,
        content,
        model: requested_model.to_string(),
        stop_reason: choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(map_finish_reason),
        stop_sequence: None,
        usage: Usage {
            input_tokens,
            output_tokens,
        },
    })
}
