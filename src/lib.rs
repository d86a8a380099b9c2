//! # fezz-local - a local function-as-a-service runtime
//!
//! fezz-local runs Fezz functions in pooled worker processes and exposes
//! them through a small HTTP API modelled on the 2014-11-13 Lambda
//! `invoke-async` route.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   invoke-async   ┌──────────────────────────────────────┐
//! │ HTTP client  │ ───────────────▶ │ ApiServer                            │
//! └──────────────┘                  │   │                                  │
//!                                   │   ▼                                  │
//!                                   │ Dispatcher ── FunctionRegistry       │
//!                                   │   │    ▲            ▲                │
//!                                   │   │    └ reload ─ SourceWatcher      │
//!                                   │   ▼                                  │
//!                                   │ WorkerPool (single | multi)          │
//!                                   └───┬──────────────┬───────────────────┘
//!                                       │ NDJSON stdio │
//!                                   ┌───▼───┐      ┌───▼───┐
//!                                   │worker │ ...  │worker │  fezz-worker
//!                                   └───────┘      └───────┘
//! ```
//!
//! Each function is a directory holding a `fezz.json` descriptor. The
//! dispatcher leases a worker for every invocation, enforces the function's
//! deadline, replaces crashed or timed out workers and swaps in a fresh
//! registry and pool when the folder changes.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fezz_local::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = RuntimeConfig::new().folder("./functions").max_workers(4);
//!     let dispatcher = Dispatcher::new(config)?;
//!
//!     let invocation = dispatcher.invoke("hello", json!({ "name": "fezz" }))?;
//!     let output = invocation.completion().await?;
//!     println!("{} in {}", output.return_value, output.duration);
//!
//!     dispatcher.drain().await;
//!     dispatcher.shutdown();
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod function;
pub mod harness;
pub mod pool;
pub mod runtime;
pub mod worker;

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::error::{ConfigError, InvokeError};
    pub use crate::function::{FunctionDescriptor, FunctionRegistry, FunctionStats};
    pub use crate::runtime::{
        ApiServer, Dispatcher, DispatcherEvent, Invocation, InvocationOutput, RuntimeConfig,
    };
    pub use fezz_sdk::ErrorDescriptor;
}

pub use error::{ConfigError, InvokeError};
pub use runtime::{ApiServer, Dispatcher, RuntimeConfig};
