#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # spliced
//!
//! `spliced` is a forwarding HTTP/1.x proxy built for high connection
//! concurrency at minimal per-byte cost: once a request head has been
//! parsed, rewritten, and forwarded, the two directions of the connection
//! are pumped with `splice(2)` through kernel pipes, so relayed bytes never
//! enter user space.
//!
//! Everything runs on one cooperative reactor (a current-thread tokio
//! runtime driving a `LocalSet`); there is no kernel-thread parallelism and
//! no locking. Each accepted connection becomes a session with a unique id,
//! registered in the proxy for its lifetime:
//!
//! 1. parse the request head,
//! 2. resolve the request host (stub UDP client or validating resolver
//!    library, both cancellable),
//! 3. connect to the origin, falling back across candidate addresses,
//! 4. forward the head, rewritten to origin-form and filtered through the
//!    header allow/rename sieve,
//! 5. relay both directions until the peers close or idle out.
//!
//! Failures before the first relayed response byte can answer the client
//! with a canned page from the configured error-page directory; later
//! failures close the connection silently.

pub use crate::config::{ProxyConfig, ResolverBackend};
pub use crate::error::{Error, Result};
pub use crate::headers::HeaderSieve;
pub use crate::pages::ErrorPages;
pub use crate::proxy::{Proxy, ProxyHandle};
pub use crate::stats::Counters;

mod channel;
mod config;
mod error;
mod headers;
mod pages;
mod proxy;
mod resolver;
mod session;
mod stats;
