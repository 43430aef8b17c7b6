//! Cross-cutting HTTP/WebSocket concerns, one file per concern.

pub mod logging;
pub mod size_guard;
