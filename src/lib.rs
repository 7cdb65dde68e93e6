//! Streaming decoder and conversation loop for a computer-use model.
//!
//! Raw response chunks flow through [`event::decode_chunk`], the
//! [`accumulator::BlockAccumulator`] and the [`translator::EventTranslator`]
//! before the [`Agent`] turns them into device actions.

pub mod accumulator;
pub mod action;
pub mod agent;
pub mod client;
pub mod device;
pub mod error;
pub mod event;
pub mod message;
pub mod translator;

pub use action::{Action, ComputerTool, Coordinate};
pub use agent::{
    AbortHandle, Agent, AgentConfig, FollowUp, LoopEvent, NoFollowUp, RunReport, RunStatus, RunStream,
};
pub use client::{ChunkStream, HttpTransport, ModelConfig, ModelRequest, ModelTransport};
pub use device::{Device, Screenshot};
pub use error::{DecodeError, DeviceError, Error, ProtocolError};
pub use event::Event;
pub use message::{Content, MediaType, Message, Role};
pub use translator::SemanticEvent;
