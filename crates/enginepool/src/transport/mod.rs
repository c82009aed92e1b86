//! Transport layer for the pool controller.
//!
//! HTTP via axum is the only transport; it exposes acquire and release.

pub mod http;

pub use http::{ServerConfig, serve};
