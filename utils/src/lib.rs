//! Process plumbing shared by the broker and the worker.

pub mod logging;
pub mod shutdown;

pub use logging::{init_logging, LogFormat};
pub use shutdown::ShutdownController;
