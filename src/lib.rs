//! Bridge between a local agent CLI and a remote relay.
//!
//! One persistent WebSocket to the relay, one backend behind an adapter, and a
//! single-writer orchestrator in between that handles admission control,
//! replay protection, session pooling, and out-of-band file-transfer offers.

pub mod adapter;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod orchestrator;
pub mod protocol;
pub mod queue;
pub mod relay_ws;
pub mod replay;
pub mod session;
pub mod transfer;
pub mod wire;
