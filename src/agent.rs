use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::action::{Action, ComputerTool};
use crate::client::{ModelRequest, ModelTransport};
use crate::device::{self, Device};
use crate::error::{Error, ProtocolError};
use crate::event::decode_stream;
use crate::message::{Content, Message, Role, Usage};
use crate::translator::{translate, SemanticEvent};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are operating a device on behalf of the user through the computer tool. \
After every action take a screenshot and check that the screen shows the expected result before moving on; \
if it does not, try again. Prefer keyboard shortcuts where they exist. \
Always respond with a tool call. When the task is done, call the computer tool with the finish action \
instead of describing that you are done.";

// ========================= Core Types =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_turns: usize,
    /// `None` skips malformed chunks forever.
    pub max_consecutive_malformed: Option<usize>,
    pub event_buffer: usize,
    pub attach_initial_screenshot: bool,
    /// Overrides the display size otherwise taken from the initial screenshot.
    pub display: Option<(u32, u32)>,
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_consecutive_malformed: None,
            event_buffer: 64,
            attach_initial_screenshot: true,
            display: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    Idle,
    Requesting,
    Translating,
    Dispatching,
    Finished,
    Failed,
    Aborted,
}

/// What the caller sees while a run progresses.
#[derive(Clone, Debug, PartialEq)]
pub enum LoopEvent {
    Prose { turn: usize, text: String },
    Finished { history: Vec<Message> },
    Failed { error: Error },
    Aborted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Finished,
    Failed,
    Aborted,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct RunMetrics {
    pub turns: usize,
    pub time_ms: u128,
    pub input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub metrics: RunMetrics,
    pub history: Vec<Message>,
    pub error: Option<Error>,
}

/// History plus turn bookkeeping. Only the loop mutates it, and only at turn
/// boundaries.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    history: Vec<Message>,
    turn: usize,
    terminal: bool,
}

impl ConversationState {
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn turn(&self) -> usize {
        self.turn
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    fn open(&mut self, first: Message) {
        self.history.push(first);
    }

    /// A turn that invoked tools: the assistant message and the message with
    /// every tool result land together.
    fn commit_tool_turn(&mut self, assistant: Message, results: Message) {
        self.history.extend([assistant, results]);
        self.turn += 1;
    }

    fn commit_prose_turn(&mut self, assistant: Message, follow_up: Option<Message>) {
        self.history.push(assistant);
        self.history.extend(follow_up);
        self.turn += 1;
    }

    fn close(&mut self) {
        self.terminal = true;
    }
}

// ========================= Pluggable Subsystems =========================

/// Supplies the next user message after a turn in which the model only wrote
/// prose. Returning `None` finishes the run.
#[async_trait]
pub trait FollowUp: Send + Sync {
    async fn next_message(&self, history: &[Message], assistant: &Message) -> Option<String>;
}

pub struct NoFollowUp;

#[async_trait]
impl FollowUp for NoFollowUp {
    async fn next_message(&self, _history: &[Message], _assistant: &Message) -> Option<String> {
        None
    }
}

// ========================= Run Handles =========================

#[derive(Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    /// Requests cancellation. The open model stream is dropped right away; a
    /// device action already in flight completes but its result is discarded.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

pub struct RunStream {
    rx: mpsc::Receiver<LoopEvent>,
    abort: AbortHandle,
    task: JoinHandle<RunReport>,
}

impl RunStream {
    /// Next event, or `None` once the terminal event has been delivered.
    pub async fn next_event(&mut self) -> Option<LoopEvent> {
        self.rx.recv().await
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Waits for the run to end, discarding events not yet consumed.
    pub async fn finish(self) -> Result<RunReport, Error> {
        drop(self.rx);
        self.task
            .await
            .map_err(|e| Error::Internal(format!("run task failed: {e}")))
    }
}

// ========================= Agent Core =========================

pub struct Agent<D, T, F = NoFollowUp>
where
    D: Device,
    T: ModelTransport,
    F: FollowUp,
{
    device: Arc<D>,
    transport: Arc<T>,
    follow_up: Arc<F>,
    cfg: AgentConfig,
}

impl<D: Device, T: ModelTransport, F: FollowUp> Clone for Agent<D, T, F> {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            transport: self.transport.clone(),
            follow_up: self.follow_up.clone(),
            cfg: self.cfg.clone(),
        }
    }
}

enum Halt {
    Aborted,
    Failed(Error),
}

impl From<Error> for Halt {
    fn from(err: Error) -> Self {
        Halt::Failed(err)
    }
}

impl<D: Device, T: ModelTransport> Agent<D, T, NoFollowUp> {
    pub fn with_defaults(device: D, transport: T, cfg: AgentConfig) -> Self {
        Self::new(device, transport, NoFollowUp, cfg)
    }
}

impl<D, T, F> Agent<D, T, F>
where
    D: Device,
    T: ModelTransport,
    F: FollowUp,
{
    pub fn new(device: D, transport: T, follow_up: F, cfg: AgentConfig) -> Self {
        Self {
            device: Arc::new(device),
            transport: Arc::new(transport),
            follow_up: Arc::new(follow_up),
            cfg,
        }
    }

    pub fn with_follow_up<G: FollowUp>(self, follow_up: G) -> Agent<D, T, G> {
        Agent {
            device: self.device,
            transport: self.transport,
            follow_up: Arc::new(follow_up),
            cfg: self.cfg,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    /// Runs the whole conversation on the current task, reporting progress on
    /// `events`. The terminal event is always the last one sent.
    pub async fn run(
        &self,
        initial: String,
        events: mpsc::Sender<LoopEvent>,
        mut abort: watch::Receiver<bool>,
    ) -> RunReport {
        let run_id = nanoid!();
        let span = info_span!("run", run_id = %run_id);
        async move {
            let start = Instant::now();
            let mut conversation = ConversationState::default();
            let mut metrics = RunMetrics::default();
            info!(max_turns = self.cfg.max_turns, "run started");

            let halt = self
                .drive(&mut conversation, &mut metrics, initial, &events, &mut abort)
                .await;
            conversation.close();
            metrics.turns = conversation.turn();
            metrics.time_ms = start.elapsed().as_millis();
            let history = conversation.history().to_vec();

            let (status, error, terminal) = match halt {
                Ok(()) => {
                    self.enter(LoopState::Finished, metrics.turns);
                    info!(turns = metrics.turns, "run finished");
                    (
                        RunStatus::Finished,
                        None,
                        LoopEvent::Finished {
                            history: history.clone(),
                        },
                    )
                }
                Err(Halt::Aborted) => {
                    self.enter(LoopState::Aborted, metrics.turns);
                    info!(turns = metrics.turns, "run aborted");
                    (RunStatus::Aborted, None, LoopEvent::Aborted)
                }
                Err(Halt::Failed(error)) => {
                    self.enter(LoopState::Failed, metrics.turns);
                    warn!(turns = metrics.turns, error = %error, "run failed");
                    (
                        RunStatus::Failed,
                        Some(error.clone()),
                        LoopEvent::Failed { error },
                    )
                }
            };
            if events.send(terminal).await.is_err() {
                debug!("event receiver dropped before the terminal event");
            }
            RunReport {
                run_id: run_id.clone(),
                status,
                metrics,
                history,
                error,
            }
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        conversation: &mut ConversationState,
        metrics: &mut RunMetrics,
        initial: String,
        events: &mpsc::Sender<LoopEvent>,
        abort: &mut watch::Receiver<bool>,
    ) -> Result<(), Halt> {
        self.enter(LoopState::Idle, 0);
        let (first, tool) = self.opening(initial).await?;
        conversation.open(first);

        while !conversation.is_terminal() {
            if *abort.borrow() {
                return Err(Halt::Aborted);
            }
            let turn = conversation.turn();
            if turn >= self.cfg.max_turns {
                return Err(Error::TurnLimit(self.cfg.max_turns).into());
            }

            self.enter(LoopState::Requesting, turn);
            let request = ModelRequest {
                system: self.cfg.system_prompt.clone(),
                messages: conversation.history().to_vec(),
                tools: vec![tool.clone()],
            };
            let chunks = tokio::select! {
                biased;
                _ = aborted(abort) => return Err(Halt::Aborted),
                opened = self.transport.open_stream(&request) => opened?,
            };

            self.enter(LoopState::Translating, turn);
            let mut semantic = Box::pin(translate(
                decode_stream(chunks),
                self.cfg.max_consecutive_malformed,
            ));
            let mut queued: Vec<(String, Action)> = Vec::new();
            let assistant = loop {
                let next = tokio::select! {
                    biased;
                    _ = aborted(abort) => return Err(Halt::Aborted),
                    next = semantic.next() => next,
                };
                match next {
                    None => return Err(Error::from(ProtocolError::StreamEnded).into()),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(SemanticEvent::Prose { text })) => {
                        debug!(turn, chars = text.len(), "prose");
                        tokio::select! {
                            biased;
                            _ = aborted(abort) => return Err(Halt::Aborted),
                            sent = events.send(LoopEvent::Prose { turn, text }) => {
                                if sent.is_err() {
                                    debug!(turn, "event receiver dropped");
                                }
                            }
                        }
                    }
                    Some(Ok(SemanticEvent::Invocation { id, action })) => {
                        if action.is_finish() {
                            info!(turn, id = %id, "model finished the task");
                            conversation.close();
                            break None;
                        }
                        info!(turn, id = %id, action = ?action, "tool invocation");
                        queued.push((id, action));
                    }
                    Some(Ok(SemanticEvent::TurnComplete {
                        message,
                        stop_reason,
                        usage,
                    })) => {
                        debug!(turn, stop_reason = ?stop_reason, "turn complete");
                        record_usage(metrics, usage.as_ref());
                        break Some(message);
                    }
                }
            };
            // closes the transport read before any device work
            drop(semantic);
            let Some(assistant) = assistant else {
                continue;
            };

            if queued.is_empty() {
                let follow_up = tokio::select! {
                    biased;
                    _ = aborted(abort) => return Err(Halt::Aborted),
                    next = self.follow_up.next_message(conversation.history(), &assistant) => {
                        next.map(Message::user_text)
                    }
                };
                let more = follow_up.is_some();
                conversation.commit_prose_turn(assistant, follow_up);
                if !more {
                    conversation.close();
                }
                continue;
            }

            self.enter(LoopState::Dispatching, turn);
            let mut results = Vec::with_capacity(queued.len());
            for (id, action) in &queued {
                let result = match device::execute(self.device.as_ref(), action).await {
                    Ok(content) => Content::tool_result(id.clone(), content),
                    Err(err) => {
                        warn!(turn, id = %id, action = action.name(), error = %err, "device action failed");
                        Content::tool_error(id.clone(), err.to_string())
                    }
                };
                if *abort.borrow() {
                    return Err(Halt::Aborted);
                }
                results.push(result);
            }
            conversation.commit_tool_turn(assistant, Message::new(Role::User, results));
        }
        Ok(())
    }

    /// Builds the first user message and the tool declaration.
    async fn opening(&self, text: String) -> Result<(Message, ComputerTool), Halt> {
        let mut content = vec![Content::text(text)];
        let mut display = self.cfg.display;
        if self.cfg.attach_initial_screenshot {
            match self.device.capture_screenshot().await {
                Ok(shot) => {
                    display.get_or_insert((shot.width, shot.height));
                    content.extend(device::screenshot_content(&shot));
                }
                Err(err) if display.is_some() => {
                    warn!(error = %err, "initial screenshot failed, continuing without it");
                }
                Err(err) => return Err(Error::from(err).into()),
            }
        }
        let Some((width, height)) = display else {
            return Err(Error::Config(
                "display size unknown: set AgentConfig::display or attach an initial screenshot".into(),
            )
            .into());
        };
        Ok((Message::new(Role::User, content), ComputerTool::new(width, height)))
    }

    fn enter(&self, state: LoopState, turn: usize) {
        debug!(turn, state = ?state, "loop state");
    }
}

impl<D, T, F> Agent<D, T, F>
where
    D: Device + 'static,
    T: ModelTransport + 'static,
    F: FollowUp + 'static,
{
    /// Spawns the run on the tokio runtime.
    pub fn start(&self, initial: impl Into<String>) -> RunStream {
        let (tx, rx) = mpsc::channel(self.cfg.event_buffer.max(1));
        let (abort_tx, abort_rx) = watch::channel(false);
        let agent = self.clone();
        let initial = initial.into();
        let task = tokio::spawn(async move { agent.run(initial, tx, abort_rx).await });
        RunStream {
            rx,
            abort: AbortHandle {
                tx: Arc::new(abort_tx),
            },
            task,
        }
    }
}

/// Resolves once cancellation is requested; never resolves if every abort
/// handle is gone.
async fn aborted(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow_and_update() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn record_usage(metrics: &mut RunMetrics, usage: Option<&Usage>) {
    if let Some(usage) = usage {
        metrics.input_tokens += u64::from(usage.input_tokens.unwrap_or(0));
        metrics.cache_creation_input_tokens += u64::from(usage.cache_creation_input_tokens.unwrap_or(0));
        metrics.cache_read_input_tokens += u64::from(usage.cache_read_input_tokens.unwrap_or(0));
        metrics.output_tokens += u64::from(usage.output_tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant(text: &str) -> Message {
        Message::new(Role::Assistant, vec![Content::text(text)])
    }

    #[test]
    fn conversation_grows_by_whole_turns() {
        let mut conv = ConversationState::default();
        conv.open(Message::user_text("go"));
        conv.commit_tool_turn(
            assistant("clicking"),
            Message::new(Role::User, vec![Content::tool_result("t1", vec![Content::text("ok")])]),
        );
        assert_eq!(conv.history().len(), 3);
        assert_eq!(conv.turn(), 1);

        conv.commit_prose_turn(assistant("done?"), None);
        assert_eq!(conv.history().len(), 4);
        conv.commit_prose_turn(assistant("still here"), Some(Message::user_text("continue")));
        assert_eq!(conv.history().len(), 6);
        assert_eq!(conv.turn(), 3);
        assert!(!conv.is_terminal());
        conv.close();
        assert!(conv.is_terminal());
    }

    #[test]
    fn usage_is_summed_across_turns() {
        let mut metrics = RunMetrics::default();
        record_usage(
            &mut metrics,
            Some(&Usage {
                input_tokens: Some(100),
                cache_read_input_tokens: Some(80),
                output_tokens: 20,
                ..Usage::default()
            }),
        );
        record_usage(&mut metrics, None);
        record_usage(
            &mut metrics,
            Some(&Usage {
                cache_creation_input_tokens: Some(7),
                output_tokens: 5,
                ..Usage::default()
            }),
        );
        assert_eq!(metrics.input_tokens, 100);
        assert_eq!(metrics.cache_read_input_tokens, 80);
        assert_eq!(metrics.cache_creation_input_tokens, 7);
        assert_eq!(metrics.output_tokens, 25);
    }

    #[tokio::test]
    async fn abort_handle_wakes_waiters() {
        let (tx, mut rx) = watch::channel(false);
        let handle = AbortHandle { tx: Arc::new(tx) };
        assert!(!handle.is_aborted());
        handle.abort();
        aborted(&mut rx).await;
        assert!(handle.is_aborted());
    }
}
