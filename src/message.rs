use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaType {
    #[serde(rename = "image/jpeg")]
    Jpeg,
    #[serde(rename = "image/png")]
    Png,
    #[serde(rename = "image/gif")]
    Gif,
    #[serde(rename = "image/webp")]
    Webp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    /// Always `base64`; other source kinds are not produced by this crate.
    #[serde(rename = "type")]
    pub kind: String,
    pub media_type: MediaType,
    pub data: String,
}

/// One piece of message content, shaped like the Messages API wire format.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<Content>,
        #[serde(default)]
        is_error: bool,
    },
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text { text: text.into() }
    }

    pub fn image(bytes: &[u8], media_type: MediaType) -> Self {
        Content::Image {
            source: ImageSource {
                kind: "base64".to_string(),
                media_type,
                data: B64.encode(bytes),
            },
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Vec<Content>) -> Self {
        Content::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error: false,
        }
    }

    pub fn tool_error(tool_use_id: impl Into<String>, message: impl Into<String>) -> Self {
        Content::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![Content::text(message)],
            is_error: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Content>,
}

impl Message {
    pub fn new(role: Role, content: Vec<Content>) -> Self {
        Self { role, content }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Content::text(text)])
    }

    /// Concatenated text content, ignoring images and tool blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                Content::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|c| match c {
            Content::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    PauseTurn,
    Refusal,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens: u32,
}

impl Usage {
    /// Applies a `message_delta` usage update. Counts the delta omits keep
    /// their `message_start` values.
    pub fn merge(&mut self, delta: Usage) {
        self.input_tokens = delta.input_tokens.or(self.input_tokens);
        self.cache_creation_input_tokens = delta
            .cache_creation_input_tokens
            .or(self.cache_creation_input_tokens);
        self.cache_read_input_tokens = delta.cache_read_input_tokens.or(self.cache_read_input_tokens);
        self.output_tokens = delta.output_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_serializes_in_wire_shape() {
        let c = Content::tool_error("toolu_1", "screen is off");
        let v = serde_json::to_value(&c).expect("serialize");
        assert_eq!(
            v,
            json!({
                "type": "tool_result",
                "tool_use_id": "toolu_1",
                "content": [{"type": "text", "text": "screen is off"}],
                "is_error": true
            })
        );
    }

    #[test]
    fn image_content_is_base64_encoded() {
        let c = Content::image(b"\x89PNG", MediaType::Png);
        let v = serde_json::to_value(&c).expect("serialize");
        assert_eq!(v["source"]["type"], "base64");
        assert_eq!(v["source"]["media_type"], "image/png");
        assert_eq!(v["source"]["data"], "iVBORw==");
    }

    #[test]
    fn message_text_skips_non_text_parts() {
        let m = Message::new(
            Role::Assistant,
            vec![
                Content::text("Looking"),
                Content::ToolUse {
                    id: "t".into(),
                    name: "computer".into(),
                    input: json!({"action": "screenshot"}),
                },
                Content::text(" now"),
            ],
        );
        assert_eq!(m.text(), "Looking now");
        assert_eq!(m.tool_use_ids().collect::<Vec<_>>(), vec!["t"]);
    }

    #[test]
    fn usage_keeps_cache_counts_across_deltas() {
        let mut usage: Usage = serde_json::from_value(json!({
            "input_tokens": 1200,
            "cache_creation_input_tokens": 300,
            "cache_read_input_tokens": 900,
            "output_tokens": 1
        }))
        .expect("usage");
        usage.merge(Usage {
            output_tokens: 64,
            ..Usage::default()
        });
        assert_eq!(usage.input_tokens, Some(1200));
        assert_eq!(usage.cache_creation_input_tokens, Some(300));
        assert_eq!(usage.cache_read_input_tokens, Some(900));
        assert_eq!(usage.output_tokens, 64);

        let v = serde_json::to_value(&usage).expect("serialize");
        assert_eq!(v["cache_read_input_tokens"], 900);
        let bare = serde_json::to_value(Usage::default()).expect("serialize");
        assert_eq!(bare, json!({"output_tokens": 0}));
    }
}
