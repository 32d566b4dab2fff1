//! Supervised worker-process RPC over stdio.
//!
//! A long-lived worker process does the slow work (model inference). This
//! module spawns it, keeps it running, and multiplexes any number of
//! concurrent requests over its stdin/stdout.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  register   ┌──────────┐
//! │  RpcClient   │────────────►│ Registry │◄──────── resolve ───────┐
//! └──────┬───────┘             └──────────┘                         │
//!        │ write line                                         ┌─────┴──────┐
//!        ▼                                                    │ LineFramer │
//! ┌──────────────┐   stdin   ┌──────────────────┐   stdout    └─────▲──────┘
//! │  Supervisor  │──────────►│  worker process  │─────────────────────┘
//! │ (WorkerHandle)│◄─ exit ───│ (--mode daemon)  │── stderr ──► tracing
//! └──────────────┘           └──────────────────┘
//! ```
//!
//! # Protocol
//!
//! Newline-delimited JSON, one record per line:
//!
//! ```text
//! → {"correlationId":"<uuid>","action":"echo","x":1}
//! ← {"type":"startup","status":"ready"}
//! ← {"correlationId":"<uuid>","result":{"x":1}}
//! ← {"correlationId":"<uuid>","error":"Unknown action: echo"}
//! ```
//!
//! Responses may arrive in any order; only the correlation id matters.

mod client;
mod envelope;
mod error;
mod framing;
mod registry;
mod supervisor;

pub use client::RpcClient;
pub use envelope::{encode_request, encode_response, Inbound, StartupSignal};
pub use error::IpcError;
pub use framing::{LineFramer, DEFAULT_MAX_LINE_BYTES};
pub use registry::{Outcome, Registry};
pub use supervisor::{Supervisor, WorkerHandle, WorkerStatus};
