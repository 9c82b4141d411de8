//! Minimal HTTP client for plugins running as WASI components.
//!
//! # Overview
//! Turns a plain [`Request`] into the low-level outgoing-request, body-sink
//! and pollable primitives of `wasi:http`, drives the exchange to completion
//! on a single-task cooperative loop, and hands back a plain [`Response`].
//!
//! # Design
//! - The exchange logic is generic over [`Substrate`], a trait family that
//!   mirrors the WASI resources. `wasi::WasiSubstrate` is the real thing inside
//!   a component; `native::NativeSubstrate` emulates it with `ureq` on helper
//!   threads so the same code runs in tests and on a developer machine.
//! - Writing the request body and waiting for the response head run
//!   concurrently; either may finish first, both must finish before the
//!   response body is read.
//! - Each call to [`send`] gets its own [`PollLoop`]; there is no global
//!   executor.
//! - Received resources are released on every exit path, body stream before
//!   response.

pub mod error;
pub mod exchange;
pub mod http;
pub mod poll_loop;
pub mod sink;
pub mod stream;
pub mod substrate;
pub mod translate;

#[cfg(not(target_arch = "wasm32"))]
pub mod native;
#[cfg(target_arch = "wasm32")]
pub mod wasi;

#[cfg(test)]
mod testing;

pub use error::{ExchangeError, ExchangeState};
pub use exchange::{send, send_async};
pub use http::{Method, Request, Response, Scheme};
pub use poll_loop::PollLoop;
pub use substrate::{StreamError, Substrate, SubstrateError};
pub use translate::{translate, RequestParts};
