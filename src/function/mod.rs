//! Functions: on-disk descriptors, the registry built from them, and the
//! watcher that triggers hot reloads.

pub mod descriptor;
pub mod registry;
pub mod watcher;

pub use descriptor::{FunctionDescriptor, FunctionStats, SharedStats, DESCRIPTOR_FILE};
pub use registry::FunctionRegistry;
pub use watcher::{Fingerprint, SourceWatcher};
