//! CuraVox worker bridge library.
//!
//! This library provides the process boundary between the CuraVox service
//! and its long-running inference worker:
//!
//! - `ipc` - supervised worker process, NDJSON framing, request correlation
//! - `config` - worker command line and timing configuration
//!
//! # Usage
//!
//! ```ignore
//! use curavox_bridge::{BridgeConfig, RpcClient, Supervisor};
//! use serde_json::json;
//!
//! let supervisor = Supervisor::new(BridgeConfig::load()?);
//! supervisor.start()?;
//! supervisor.wait_ready(std::time::Duration::from_secs(30)).await?;
//!
//! let client = RpcClient::new(&supervisor);
//! let result = client.invoke("echo", json!({"x": 1})).await?;
//!
//! supervisor.stop().await?;
//! ```

pub mod config;
pub mod ipc;

pub use config::{BridgeConfig, CrashPolicy};
pub use ipc::{IpcError, RpcClient, Supervisor};
