//! Logging facade for the engine.
//!
//! Re-exports the [`log`](https://crates.io/crates/log) macros so that crates
//! only need a dependency on this facade.

pub use log::{Level, LevelFilter, debug, error, info, log, log_enabled, trace, warn};
