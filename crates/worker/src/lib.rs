//! Job handlers and wiring for the `jobward-worker` binary.

pub mod handlers;
