//! Turns protocol events into the semantic events the conversation loop acts on.

use futures::{stream, Stream, StreamExt};
use tracing::{debug, trace, warn};

use crate::accumulator::{BlockAccumulator, CompletedContentItem};
use crate::action::Action;
use crate::error::{Error, ProtocolError};
use crate::event::Event;
use crate::message::{Content, Message, StopReason, Usage};

#[derive(Clone, Debug, PartialEq)]
pub enum SemanticEvent {
    /// A completed text block.
    Prose { text: String },
    /// A completed `computer` tool invocation.
    Invocation { id: String, action: Action },
    /// The model finished its message.
    TurnComplete {
        message: Message,
        stop_reason: Option<StopReason>,
        usage: Option<Usage>,
    },
}

#[derive(Debug)]
struct InProgress {
    message: Message,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
}

/// Stateful translator for the events of a single model invocation.
#[derive(Debug, Default)]
pub struct EventTranslator {
    blocks: BlockAccumulator,
    current: Option<InProgress>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_message_in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Applies one event. Any error returned here is fatal for the stream.
    pub fn handle(&mut self, event: Event) -> Result<Option<SemanticEvent>, Error> {
        match event {
            Event::MessageStart { message } => {
                if self.current.is_some() {
                    return Err(ProtocolError::MessageAlreadyStarted.into());
                }
                debug!(id = ?message.id, model = ?message.model, "message started");
                self.blocks.reset();
                self.current = Some(InProgress {
                    message: Message::new(message.role, message.content),
                    stop_reason: None,
                    usage: message.usage,
                });
                Ok(None)
            }
            Event::ContentBlockStart { index, block } => {
                self.blocks.start(index, block)?;
                Ok(None)
            }
            Event::ContentBlockDelta { index, delta } => {
                self.blocks.delta(index, delta)?;
                Ok(None)
            }
            Event::ContentBlockStop { index } => {
                let item = self.blocks.stop(index)?;
                Ok(Some(self.complete(item)))
            }
            Event::MessageDelta { stop_reason, usage } => {
                match self.current.as_mut() {
                    Some(current) => {
                        if stop_reason.is_some() {
                            current.stop_reason = stop_reason;
                        }
                        if let Some(delta) = usage {
                            current.usage.get_or_insert_with(Usage::default).merge(delta);
                        }
                    }
                    None => debug!("message_delta outside of a message"),
                }
                Ok(None)
            }
            Event::MessageStop { metrics } => {
                let Some(done) = self.current.take() else {
                    return Err(ProtocolError::NoMessageInProgress.into());
                };
                if let Some(index) = self.blocks.open_index() {
                    return Err(ProtocolError::MessageStopWithOpenBlock { index }.into());
                }
                self.blocks.reset();
                debug!(
                    stop_reason = ?done.stop_reason,
                    blocks = done.message.content.len(),
                    metrics = ?metrics,
                    "message stopped"
                );
                Ok(Some(SemanticEvent::TurnComplete {
                    message: done.message,
                    stop_reason: done.stop_reason,
                    usage: done.usage,
                }))
            }
            Event::Heartbeat => {
                trace!("heartbeat");
                Ok(None)
            }
            Event::Error { kind, message } => Err(Error::Provider {
                kind,
                message,
                status_code: None,
            }),
        }
    }

    fn complete(&mut self, item: CompletedContentItem) -> SemanticEvent {
        match item {
            CompletedContentItem::Text { text } => {
                if let Some(current) = self.current.as_mut() {
                    current.message.content.push(Content::text(text.clone()));
                }
                SemanticEvent::Prose { text }
            }
            CompletedContentItem::ToolInvocation {
                id,
                name,
                arguments,
                input,
            } => {
                if let Some(current) = self.current.as_mut() {
                    current.message.content.push(Content::ToolUse {
                        id: id.clone(),
                        name,
                        input,
                    });
                }
                SemanticEvent::Invocation {
                    id,
                    action: arguments,
                }
            }
        }
    }
}

/// Lazily translates a decoded event stream.
///
/// Malformed chunks are logged and skipped. With `max_consecutive_malformed`
/// set, a run of more than that many malformed chunks in a row ends the stream
/// with [`Error::MalformedStream`]. Every other error ends the stream after
/// being yielded once.
pub fn translate<S>(
    events: S,
    max_consecutive_malformed: Option<usize>,
) -> impl Stream<Item = Result<SemanticEvent, Error>> + Send
where
    S: Stream<Item = Result<Event, Error>> + Send,
{
    struct State<S> {
        events: std::pin::Pin<Box<S>>,
        translator: EventTranslator,
        malformed: usize,
        done: bool,
    }

    stream::unfold(
        State {
            events: Box::pin(events),
            translator: EventTranslator::new(),
            malformed: 0,
            done: false,
        },
        move |mut state| async move {
            loop {
                if state.done {
                    return None;
                }
                match state.events.next().await {
                    None => {
                        state.done = true;
                        if state.translator.is_message_in_progress() {
                            return Some((Err(ProtocolError::StreamEnded.into()), state));
                        }
                        return None;
                    }
                    Some(Err(Error::Decode(err))) => {
                        state.malformed += 1;
                        warn!(error = %err, excerpt = %err.excerpt, consecutive = state.malformed, "skipping malformed chunk");
                        if max_consecutive_malformed.is_some_and(|limit| state.malformed > limit) {
                            state.done = true;
                            let fatal = Error::MalformedStream {
                                count: state.malformed,
                                last: err,
                            };
                            return Some((Err(fatal), state));
                        }
                    }
                    Some(Err(err)) => {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                    Some(Ok(event)) => {
                        state.malformed = 0;
                        match state.translator.handle(event) {
                            Ok(Some(semantic)) => return Some((Ok(semantic), state)),
                            Ok(None) => {}
                            Err(err) => {
                                state.done = true;
                                return Some((Err(err), state));
                            }
                        }
                    }
                }
            }
        },
    )
}
