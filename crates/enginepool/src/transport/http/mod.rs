//! HTTP transport: router and server loop.

mod routes;
mod server;

pub use routes::{ReleaseRequest, routes};
pub use server::{ServerConfig, serve};
