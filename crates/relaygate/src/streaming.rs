//! Streaming conversion (SSE).
//!
//! OpenAI-compatible upstreams stream `data: {json}` lines terminated by
//! `data: [DONE]`. Claude clients expect typed Anthropic events
//! (`message_start`, `content_block_delta`, ...). [`StreamConverter`] is the
//! per-stream state machine between the two; [`SseLineDecoder`] reassembles
//! upstream lines across network reads.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{
    BlockDelta, ContentBlock, MessageDelta, MessageStart, OutputUsage, Role, StreamEvent, Usage,
};

/// Terminal sentinel sent by OpenAI-compatible upstreams.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One decoded `chat.completion.chunk`.
///
/// Delta and finish reason normally sit under `choices[0]`; top-level fields
/// are accepted as well.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub choices: Vec<ChunkChoice>,
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<ChunkUsage>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<ChunkChoice>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<ChunkChoice>>::deserialize(deserializer)?.unwrap_or_default())
}

impl ChatChunk {
    pub fn delta(&self) -> Option<&ChunkDelta> {
        self.choices
            .first()
            .and_then(|c| c.delta.as_ref())
            .or(self.delta.as_ref())
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.finish_reason.as_deref())
            .or(self.finish_reason.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u64>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Cumulative usage counters; both OpenAI and Anthropic spellings are accepted.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ChunkUsage {
    #[serde(default, alias = "input_tokens")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, alias = "output_tokens")]
    pub completion_tokens: Option<u32>,
}

/// Kind of a content block the converter opened.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockKind {
    Text,
    ToolUse { key: String },
}

#[derive(Debug)]
struct OpenBlock {
    kind: BlockKind,
    closed: bool,
}

#[derive(Debug, Clone)]
struct ToolCallBuffer {
    name: String,
    arguments: String,
    block: usize,
}

fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..24])
}

/// Per-stream OpenAI → Anthropic event state machine.
///
/// Blocks are indexed densely from 0 and at most one block is open at a time.
#[derive(Debug)]
pub struct StreamConverter {
    model: String,
    message_id: String,
    started: bool,
    finished: bool,
    blocks: Vec<OpenBlock>,
    current: Option<usize>,
    tool_calls: HashMap<String, ToolCallBuffer>,
    tool_positions: HashMap<u64, String>,
    usage: Usage,
    finish_reason: Option<String>,
}

impl StreamConverter {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            message_id: short_id("msg"),
            started: false,
            finished: false,
            blocks: Vec::new(),
            current: None,
            tool_calls: HashMap::new(),
            tool_positions: HashMap::new(),
            usage: Usage::default(),
            finish_reason: None,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of content blocks opened so far.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Accumulated argument JSON for a tool call.
    pub fn tool_arguments(&self, tool_call_id: &str) -> Option<&str> {
        self.tool_calls.get(tool_call_id).map(|t| t.arguments.as_str())
    }

    /// `message_start`, emitted once per stream.
    pub fn initial_events(&mut self) -> Vec<StreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        vec![StreamEvent::MessageStart {
            message: MessageStart {
                id: self.message_id.clone(),
                kind: "message".to_string(),
                role: Role::Assistant,
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                usage: Usage::default(),
            },
        }]
    }

    /// Decode one `data:` payload and convert it. Malformed payloads are
    /// logged and produce no events.
    pub fn process_data(&mut self, data: &str) -> Vec<StreamEvent> {
        match serde_json::from_str::<ChatChunk>(data) {
            Ok(chunk) => self.process_chunk(&chunk),
            Err(e) => {
                warn!(error = %e, data, "skipping malformed upstream chunk");
                Vec::new()
            }
        }
    }

    pub fn process_chunk(&mut self, chunk: &ChatChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        if let Some(usage) = chunk.usage {
            if let Some(input) = usage.prompt_tokens {
                self.usage.input_tokens = input;
            }
            if let Some(output) = usage.completion_tokens {
                self.usage.output_tokens = output;
            }
        }
        if let Some(reason) = chunk.finish_reason() {
            self.finish_reason = Some(reason.to_string());
        }

        let Some(delta) = chunk.delta() else {
            return events;
        };

        if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
            let text_open = matches!(self.current_kind(), Some(BlockKind::Text));
            let index = match self.current {
                Some(index) if text_open => index,
                _ => self.open_block(
                    BlockKind::Text,
                    ContentBlock::Text {
                        text: String::new(),
                    },
                    &mut events,
                ),
            };
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: BlockDelta::TextDelta {
                    text: text.to_string(),
                },
            });
        }

        for call in delta.tool_calls.iter().flatten() {
            self.process_tool_call(call, &mut events);
        }

        events
    }

    fn process_tool_call(&mut self, call: &ToolCallDelta, events: &mut Vec<StreamEvent>) {
        let function = call.function.as_ref();
        let key = match (&call.id, call.index.and_then(|i| self.tool_positions.get(&i))) {
            (Some(id), _) if !id.is_empty() => id.clone(),
            (_, Some(known)) => known.clone(),
            _ => short_id("toolu"),
        };

        if !self.tool_calls.contains_key(&key) {
            let name = function
                .and_then(|f| f.name.clone())
                .unwrap_or_default();
            let block = self.open_block(
                BlockKind::ToolUse { key: key.clone() },
                ContentBlock::ToolUse {
                    id: key.clone(),
                    name: name.clone(),
                    input: serde_json::json!({}),
                },
                events,
            );
            if let Some(position) = call.index {
                self.tool_positions.insert(position, key.clone());
            }
            self.tool_calls.insert(
                key.clone(),
                ToolCallBuffer {
                    name,
                    arguments: String::new(),
                    block,
                },
            );
        }

        let Some(fragment) = function
            .and_then(|f| f.arguments.as_deref())
            .filter(|a| !a.is_empty())
        else {
            return;
        };

        let streaming = matches!(
            self.current_kind(),
            Some(BlockKind::ToolUse { key: open }) if *open == key
        );
        let Some(buffer) = self.tool_calls.get_mut(&key) else {
            return;
        };
        buffer.arguments.push_str(fragment);
        if streaming {
            events.push(StreamEvent::ContentBlockDelta {
                index: buffer.block,
                delta: BlockDelta::InputJsonDelta {
                    partial_json: fragment.to_string(),
                },
            });
        } else {
            debug!(
                tool_call = %key,
                tool = %buffer.name,
                block = buffer.block,
                "arguments for a closed tool block buffered only"
            );
        }
    }

    fn current_kind(&self) -> Option<&BlockKind> {
        self.current
            .and_then(|i| self.blocks.get(i))
            .filter(|b| !b.closed)
            .map(|b| &b.kind)
    }

    fn close_current(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(index) = self.current.take() {
            if let Some(block) = self.blocks.get_mut(index) {
                if !block.closed {
                    block.closed = true;
                    events.push(StreamEvent::ContentBlockStop { index });
                }
            }
        }
    }

    fn open_block(
        &mut self,
        kind: BlockKind,
        content_block: ContentBlock,
        events: &mut Vec<StreamEvent>,
    ) -> usize {
        self.close_current(events);
        let index = self.blocks.len();
        self.blocks.push(OpenBlock {
            kind,
            closed: false,
        });
        self.current = Some(index);
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block,
        });
        index
    }

    /// Close open blocks and emit `message_delta` + `message_stop`, once.
    pub fn finish_events(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.finished = true;

        for (index, block) in self.blocks.iter_mut().enumerate() {
            if !block.closed {
                block.closed = true;
                events.push(StreamEvent::ContentBlockStop { index });
            }
        }
        self.current = None;

        events.push(StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: self.finish_reason.clone(),
                stop_sequence: None,
            },
            usage: OutputUsage {
                output_tokens: self.usage.output_tokens,
            },
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

/// One meaningful upstream SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    Data(String),
    Done,
}

/// Classify a raw line. `event:` lines, comments and blank lines are ignored.
pub fn parse_line(line: &str) -> Option<SseLine> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let data = line.strip_prefix("data:")?.trim_start();
    if data.is_empty() {
        return None;
    }
    if data.trim_end() == DONE_SENTINEL {
        return Some(SseLine::Done);
    }
    Some(SseLine::Data(data.to_string()))
}

/// Longest partial line kept while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Reassembles newline-delimited upstream lines across reads.
///
/// Bytes are buffered raw so multi-byte UTF-8 sequences split across reads
/// decode correctly. A partial line longer than [`MAX_LINE_BYTES`] is
/// discarded together with the rest of that line.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
    discarding: bool,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return every complete line now available.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseLine> {
        let mut bytes = bytes;
        if self.discarding {
            match bytes.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    bytes = &bytes[pos + 1..];
                }
                None => return Vec::new(),
            }
        }

        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            if let Some(line) = parse_line(&text) {
                lines.push(line);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            warn!(
                buffered = self.buffer.len(),
                limit = MAX_LINE_BYTES,
                "dropping oversized upstream line"
            );
            self.buffer = Vec::new();
            self.discarding = true;
        }
        lines
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Option<SseLine> {
        self.discarding = false;
        if self.buffer.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        parse_line(&String::from_utf8_lossy(&raw))
    }
}
