//! Core of a general-purpose network server framework.
//!
//! This crate provides the concurrent substrate and protocol engine a
//! CBPP server or client is built from: per-connection serialized job
//! dispatch with promise-based suspension, the streaming CBPP codec with
//! its session and client state machines, keep-alive handling, a runtime
//! module loader, and the administrative HTTP surface that exposes these
//! subsystems.
//!
//! Low-level socket I/O, TLS termination, and the full HTTP stack are
//! external collaborators: sessions and clients consume raw bytes through
//! `put_encoded_data` and emit encoded frames through prioritized
//! outbound queues that the transport glue drains.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub use error::{Result, SeawireError};
pub mod job;
pub mod logging;
pub mod metrics;
#[cfg(unix)]
pub mod module;
pub mod outbound;
pub mod profile;
pub mod promise;
pub mod registry;
pub mod session;
#[cfg(unix)]
pub mod system_http;
pub mod varint;

pub use client::{Client, ClientHandler};
pub use codec::{
    CbppDecoder, CbppEncoder, CbppEvent, CbppFrame, CbppWriter, ControlCode, ProtocolViolation,
    StatusCode,
};
pub use config::ServerConfig;
pub use job::{Job, JobDispatcher, JobError};
#[cfg(unix)]
pub use module::{Module, ModuleContexts, ModuleLoader};
pub use outbound::{FrameHandle, FrameQueues};
pub use promise::{yield_until, Promise, PromiseFailure, TypedPromise};
pub use registry::{ConnectionId, SessionRegistry};
pub use session::{HandlerError, Session, SessionHandler};
#[cfg(unix)]
pub use system_http::{SystemContext, SystemHttpServer};
