//! Long-lived tool-server subprocesses: framing, per-process multiplexing,
//! and lifecycle management.

pub mod framing;
pub mod manager;
pub mod process;

pub use manager::{StdioProcessManager, PROTOCOL_VERSION};
pub use process::StdioProcess;
