//! Performance instrumentation.

pub mod instrumentation;
