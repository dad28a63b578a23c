//! jam-protocol: Wire framing shared by the orchestrator and session workers
//!
//! Three grammars travel over jamhub sockets:
//! - correlated JSON (`<correlationId>:<json>`) on orchestrator/worker control sockets
//! - param-lists (`key=value,key=value;`) opening a file-streaming connection
//! - prefixed client frames (`tok:`, `jam:`, `ses:`) on browser links

pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod params;
pub mod request;

pub use client::{ClientFrame, JamRequest, ServerFrame, SessionNotice, SessionRequest};
pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use frame::{CorrelatedFrame, CorrelationId};
pub use params::ParamList;
pub use request::{
    error_reply, reply, reply_connected_accounts, CreateSessionParams, SoundParams,
    WorkerRequest,
};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;
