//! Reassembly of content blocks from their start, delta and stop events.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::action::{Action, COMPUTER_TOOL_NAME};
use crate::error::{Error, ProtocolError};
use crate::event::{ContentBlockSeed, Delta};

#[derive(Clone, Debug, PartialEq)]
pub enum CompletedContentItem {
    Text {
        text: String,
    },
    ToolInvocation {
        id: String,
        name: String,
        arguments: Action,
        /// The argument object exactly as the model sent it, echoed back in
        /// the assistant message.
        input: Value,
    },
}

#[derive(Debug)]
enum OpenBlock {
    Text {
        index: usize,
        text: String,
    },
    ToolUse {
        index: usize,
        id: String,
        name: String,
        arguments: String,
    },
}

impl OpenBlock {
    fn index(&self) -> usize {
        match self {
            OpenBlock::Text { index, .. } | OpenBlock::ToolUse { index, .. } => *index,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            OpenBlock::Text { .. } => "text",
            OpenBlock::ToolUse { .. } => "tool_use",
        }
    }
}

/// Owns the single "currently open block" slot of a message.
#[derive(Debug, Default)]
pub struct BlockAccumulator {
    open: Option<OpenBlock>,
    closed: BTreeSet<usize>,
}

impl BlockAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_index(&self) -> Option<usize> {
        self.open.as_ref().map(OpenBlock::index)
    }

    /// Forgets the open slot and closed indices, ready for the next message.
    pub fn reset(&mut self) {
        self.open = None;
        self.closed.clear();
    }

    pub fn start(&mut self, index: usize, seed: ContentBlockSeed) -> Result<(), Error> {
        if let Some(open) = &self.open {
            return Err(ProtocolError::BlockAlreadyOpen {
                open: open.index(),
                requested: index,
            }
            .into());
        }
        if self.closed.contains(&index) {
            return Err(ProtocolError::BlockReopened { index }.into());
        }
        self.open = Some(match seed {
            ContentBlockSeed::Text { text } => OpenBlock::Text { index, text },
            ContentBlockSeed::ToolUse {
                id,
                name,
                partial_arguments_json,
            } => OpenBlock::ToolUse {
                index,
                id,
                name,
                arguments: partial_arguments_json,
            },
        });
        Ok(())
    }

    pub fn delta(&mut self, index: usize, delta: Delta) -> Result<(), Error> {
        let open = self.expect_open(index)?;
        match (open, delta) {
            (OpenBlock::Text { text, .. }, Delta::Text { fragment }) => text.push_str(&fragment),
            (OpenBlock::ToolUse { arguments, .. }, Delta::Arguments { fragment }) => {
                arguments.push_str(&fragment)
            }
            (open, delta) => {
                return Err(ProtocolError::DeltaKindMismatch {
                    index,
                    block: open.kind().to_string(),
                    delta: match delta {
                        Delta::Text { .. } => "text",
                        Delta::Arguments { .. } => "arguments",
                    }
                    .to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn stop(&mut self, index: usize) -> Result<CompletedContentItem, Error> {
        self.expect_open(index)?;
        let Some(open) = self.open.take() else {
            return Err(ProtocolError::NoOpenBlock { index }.into());
        };
        self.closed.insert(index);
        match open {
            OpenBlock::Text { text, .. } => Ok(CompletedContentItem::Text { text }),
            OpenBlock::ToolUse {
                id,
                name,
                arguments,
                ..
            } => {
                if name != COMPUTER_TOOL_NAME {
                    return Err(Error::UnknownTool { name });
                }
                let raw = if arguments.trim().is_empty() {
                    "{}"
                } else {
                    arguments.as_str()
                };
                let input: Value = serde_json::from_str(raw).map_err(|e| {
                    ProtocolError::InvalidToolInput {
                        id: id.clone(),
                        message: e.to_string(),
                    }
                })?;
                let action = Action::from_input(&input).map_err(|e| {
                    ProtocolError::InvalidToolInput {
                        id: id.clone(),
                        message: e.to_string(),
                    }
                })?;
                Ok(CompletedContentItem::ToolInvocation {
                    id,
                    name,
                    arguments: action,
                    input,
                })
            }
        }
    }

    fn expect_open(&mut self, index: usize) -> Result<&mut OpenBlock, Error> {
        match self.open.as_mut() {
            None => Err(ProtocolError::NoOpenBlock { index }.into()),
            Some(open) if open.index() != index => Err(ProtocolError::IndexMismatch {
                open: open.index(),
                got: index,
            }
            .into()),
            Some(open) => Ok(open),
        }
    }
}
