//! Decoding of the model's streamed response into protocol events.
//!
//! Every chunk handed to [`decode_chunk`] is one complete JSON document
//! discriminated by its `type` field. Decoding is stateless: the ordering rules
//! between events are enforced later by the accumulator and translator.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::{DecodeError, Error};
use crate::message::{Content, Role, StopReason, Usage};

/// Payload of `message_start`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub id: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub content: Vec<Content>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentBlockSeed {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        partial_arguments_json: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delta {
    Text { fragment: String },
    Arguments { fragment: String },
}

/// Bedrock attaches these to `message_stop`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMetrics {
    pub first_byte_latency: u64,
    pub input_token_count: u64,
    pub invocation_latency: u64,
    pub output_token_count: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    MessageStart {
        message: MessageStart,
    },
    ContentBlockStart {
        index: usize,
        block: ContentBlockSeed,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },
    MessageStop {
        metrics: Option<InvocationMetrics>,
    },
    /// Keep-alives and any event type this crate does not know about.
    Heartbeat,
    /// In-stream error document sent by the endpoint.
    Error {
        kind: String,
        message: String,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Deserialize, Default)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<StopReason>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

const BEDROCK_METRICS_KEY: &str = "amazon-bedrock-invocationMetrics";

/// Decodes one framed chunk into an [`Event`].
pub fn decode_chunk(chunk: &[u8]) -> Result<Event, DecodeError> {
    let value: Value = serde_json::from_slice(chunk)
        .map_err(|e| DecodeError::new(format!("invalid JSON: {e}"), chunk))?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::new("missing type discriminator", chunk));
    };

    let event = match kind {
        "message_start" => Event::MessageStart {
            message: field(&value, "message", chunk)?,
        },
        "content_block_start" => {
            let index = field(&value, "index", chunk)?;
            let block = match field::<WireBlock>(&value, "content_block", chunk)? {
                WireBlock::Text { text } => ContentBlockSeed::Text { text },
                WireBlock::ToolUse { id, name, input } => ContentBlockSeed::ToolUse {
                    id,
                    name,
                    partial_arguments_json: seed_arguments(&input),
                },
            };
            Event::ContentBlockStart { index, block }
        }
        "content_block_delta" => {
            let index = field(&value, "index", chunk)?;
            let delta = match field::<WireDelta>(&value, "delta", chunk)? {
                WireDelta::TextDelta { text } => Delta::Text { fragment: text },
                WireDelta::InputJsonDelta { partial_json } => Delta::Arguments {
                    fragment: partial_json,
                },
            };
            Event::ContentBlockDelta { index, delta }
        }
        "content_block_stop" => Event::ContentBlockStop {
            index: field(&value, "index", chunk)?,
        },
        "message_delta" => {
            let delta: WireMessageDelta = optional_field(&value, "delta", chunk)?.unwrap_or_default();
            Event::MessageDelta {
                stop_reason: delta.stop_reason,
                usage: optional_field(&value, "usage", chunk)?,
            }
        }
        "message_stop" => Event::MessageStop {
            metrics: optional_field(&value, BEDROCK_METRICS_KEY, chunk)?,
        },
        "ping" => Event::Heartbeat,
        "error" => {
            let err: WireError = field(&value, "error", chunk)?;
            Event::Error {
                kind: err.kind,
                message: err.message,
            }
        }
        other => {
            trace!(kind = other, "ignoring unknown event type");
            Event::Heartbeat
        }
    };
    Ok(event)
}

/// Lazily decodes a stream of framed chunks. Transport failures pass through
/// unchanged; a malformed chunk becomes a recoverable [`Error::Decode`] item
/// and decoding continues with the next chunk.
pub fn decode_stream<S>(chunks: S) -> impl Stream<Item = Result<Event, Error>> + Send
where
    S: Stream<Item = Result<Bytes, Error>> + Send,
{
    chunks.map(|chunk| chunk.and_then(|bytes| decode_chunk(&bytes).map_err(Error::from)))
}

fn seed_arguments(input: &Value) -> String {
    match input {
        Value::Null => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => other.to_string(),
    }
}

fn field<T: DeserializeOwned>(value: &Value, key: &str, chunk: &[u8]) -> Result<T, DecodeError> {
    optional_field(value, key, chunk)?
        .ok_or_else(|| DecodeError::new(format!("missing field `{key}`"), chunk))
}

fn optional_field<T: DeserializeOwned>(
    value: &Value,
    key: &str,
    chunk: &[u8],
) -> Result<Option<T>, DecodeError> {
    match value.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => T::deserialize(v)
            .map(Some)
            .map_err(|e| DecodeError::new(format!("invalid `{key}`: {e}"), chunk)),
    }
}
