//! The runtime: configuration, the dispatcher and its HTTP façade.

mod config;
mod dispatcher;
mod events;
mod invocation;
mod server;

pub use config::{default_max_workers, RuntimeConfig, WORKER_BINARY};
pub use dispatcher::{Dispatcher, FunctionSummary};
pub use events::{DispatcherEvent, EventBus, Outcome, RuntimeStats};
pub use invocation::{Invocation, InvocationOutput, InvocationState};
pub use server::{error_status, route, ApiServer, API_PREFIX, REQUEST_ID_HEADER};
