use std::env;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures::{future, Stream, StreamExt};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::action::ComputerTool;
use crate::error::Error;
use crate::message::Message;

pub const COMPUTER_USE_BETA: &str = "computer-use-2024-10-22";

/// Framed response chunks, one JSON event document each.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>;

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub api_base: String,      // e.g. "https://api.anthropic.com"
    pub api_key: String,       // env ANTHROPIC_API_KEY
    pub model: String,         // e.g. "claude-3-5-sonnet-20241022"
    pub max_tokens: u32,
    pub anthropic_version: String,
    pub betas: Vec<String>,
    /// Connect timeout; the response body itself may stream for longer.
    pub connect_timeout: Duration,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| "https://api.anthropic.com".into()),
            api_key: env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model: env::var("ANTHROPIC_MODEL").unwrap_or_else(|_| "claude-3-5-sonnet-20241022".into()),
            max_tokens: 8192,
            anthropic_version: "2023-06-01".into(),
            betas: vec![COMPUTER_USE_BETA.into()],
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ModelConfig {
    /// Defaults read from the environment; fails when no API key is set.
    pub fn from_env() -> Result<Self, Error> {
        let cfg = Self::default();
        if cfg.api_key.trim().is_empty() {
            return Err(Error::Config("ANTHROPIC_API_KEY missing".into()));
        }
        Ok(cfg)
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.api_base.trim_end_matches('/'))
    }
}

/// Everything the loop sends for one model invocation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ComputerTool>,
}

/// Opens one streamed model invocation.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn open_stream(&self, request: &ModelRequest) -> Result<ChunkStream, Error>;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    cfg: ModelConfig,
}

impl HttpTransport {
    pub fn new(cfg: ModelConfig) -> Result<Self, Error> {
        if cfg.api_key.trim().is_empty() {
            return Err(Error::Config("ANTHROPIC_API_KEY missing".into()));
        }
        let http = Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self, Error> {
        Self::new(ModelConfig::from_env()?)
    }

    pub(crate) fn build_body(&self, request: &ModelRequest) -> Value {
        json!({
            "model": self.cfg.model,
            "max_tokens": self.cfg.max_tokens,
            "system": request.system,
            "messages": request.messages,
            "tools": request.tools,
            "stream": true,
        })
    }
}

#[async_trait]
impl ModelTransport for HttpTransport {
    async fn open_stream(&self, request: &ModelRequest) -> Result<ChunkStream, Error> {
        let body = self.build_body(request);
        debug!(model = %self.cfg.model, messages = request.messages.len(), "opening model stream");

        let mut req = self
            .http
            .post(self.cfg.messages_url())
            .header("x-api-key", &self.cfg.api_key)
            .header("anthropic-version", &self.cfg.anthropic_version)
            .header("accept", "text/event-stream");
        if !self.cfg.betas.is_empty() {
            req = req.header("anthropic-beta", self.cfg.betas.join(","));
        }
        let resp = req.json(&body).send().await.map_err(Error::transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(provider_error(status.as_u16(), &text));
        }

        Ok(frame_body(resp.bytes_stream()))
    }
}

fn provider_error(status: u16, body: &str) -> Error {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let detail = parsed.as_ref().and_then(|v| v.get("error"));
    let kind = detail
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("http")
        .to_string();
    let message = detail
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("status {status}: {body}"));
    Error::Provider {
        kind,
        message,
        status_code: Some(status),
    }
}

/// Re-frames a `text/event-stream` body into one chunk per event payload.
/// Keep-alive comments, empty events and `[DONE]` markers are dropped.
fn frame_body<S, E>(body: S) -> ChunkStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(body.eventsource().filter_map(|item| {
        future::ready(match item {
            Ok(event) => {
                let data = event.data.trim();
                if data.is_empty() || data == "[DONE]" {
                    None
                } else {
                    trace!(event = %event.event, bytes = data.len(), "sse event");
                    Some(Ok(Bytes::from(event.data)))
                }
            }
            Err(e) => Some(Err(Error::transport(format!("event stream: {e}")))),
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Content, Role};

    fn transport() -> HttpTransport {
        HttpTransport::new(ModelConfig {
            api_base: "http://localhost:9".into(),
            api_key: "test-key".into(),
            model: "claude-test".into(),
            ..ModelConfig::default()
        })
        .expect("transport")
    }

    #[test]
    fn new_rejects_missing_key() {
        let err = HttpTransport::new(ModelConfig {
            api_key: "  ".into(),
            ..ModelConfig::default()
        })
        .err()
        .expect("missing key");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn request_body_carries_history_tool_and_stream_flag() {
        let request = ModelRequest {
            system: "be careful".into(),
            messages: vec![Message::new(Role::User, vec![Content::text("open settings")])],
            tools: vec![ComputerTool::new(1080, 720)],
        };
        let body = transport().build_body(&request);
        assert_eq!(body["model"], "claude-test");
        assert_eq!(body["stream"], true);
        assert_eq!(body["system"], "be careful");
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "open settings");
        assert_eq!(body["tools"][0]["name"], "computer");
        assert_eq!(body["tools"][0]["display_width_px"], 1080);
    }

    #[test]
    fn provider_error_prefers_structured_body() {
        let err = provider_error(
            529,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(
            err,
            Error::Provider {
                kind: "overloaded_error".into(),
                message: "Overloaded".into(),
                status_code: Some(529)
            }
        );
        let err = provider_error(502, "bad gateway");
        assert!(matches!(err, Error::Provider { kind, status_code: Some(502), .. } if kind == "http"));
    }

    async fn frames(parts: Vec<&'static str>) -> Vec<Bytes> {
        let body = futures::stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, std::io::Error>(Bytes::from_static(p.as_bytes()))),
        );
        frame_body(body)
            .map(|frame| frame.expect("frame"))
            .collect()
            .await
    }

    #[tokio::test]
    async fn frames_survive_arbitrary_chunk_boundaries() {
        let body: &'static str =
            "event: message_start\ndata: {\"type\":\"message_start\"}\n\nevent: ping\ndata: {\"type\": \"ping\"}\n\n";
        for split in 1..body.len() {
            assert_eq!(
                frames(vec![&body[..split], &body[split..]]).await,
                vec![
                    Bytes::from_static(b"{\"type\":\"message_start\"}"),
                    Bytes::from_static(b"{\"type\": \"ping\"}"),
                ],
                "split at {split}"
            );
        }
    }

    #[tokio::test]
    async fn comments_and_done_markers_are_dropped() {
        let framed = frames(vec![": keep-alive\n\n", "data: [DONE]\n\n", "event: ping\ndata:\n\n"]).await;
        assert!(framed.is_empty(), "{framed:?}");
    }

    #[tokio::test]
    async fn crlf_line_endings_are_accepted() {
        let framed = frames(vec!["event: message_stop\r\ndata: {\"type\":\"message_stop\"}\r\n\r\n"]).await;
        assert_eq!(framed, vec![Bytes::from_static(b"{\"type\":\"message_stop\"}")]);
    }

    #[tokio::test]
    async fn multi_line_data_is_joined() {
        let framed = frames(vec!["data: {\"type\":\ndata: \"ping\"}\n\n"]).await;
        assert_eq!(framed, vec![Bytes::from_static(b"{\"type\":\n\"ping\"}")]);
    }

    #[tokio::test]
    async fn body_read_failure_becomes_a_transport_error() {
        let body = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"ping\"}\n\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ]);
        let framed: Vec<_> = frame_body(body).collect().await;
        assert_eq!(framed.len(), 2);
        assert!(framed[0].is_ok());
        assert!(matches!(&framed[1], Err(Error::Transport(msg)) if msg.contains("reset")));
    }
}
