//! # Vitrine — SSR render server
//!
//! A server-side rendering HTTP server for single-page applications. Each
//! request walks an ordered renderer pipeline; the index renderer executes
//! a user-supplied JavaScript bundle in a pooled isolate, injects state
//! assembled from upstream JSON resources and splices the script's output
//! into a static HTML shell.
//!
//! ## Architecture overview
//!
//! - **`cache`** / **`buffer`**: TTL object store and byte-buffer pool
//! - **`dom`**: ordered attribute maps and head-element containers
//! - **`fetcher`**: upstream resource registry, HTTP client, retries
//! - **`loader`**: periodic scheduler expanding fetch rules
//! - **`vm`**: pooled JS isolates with the host-object surface
//! - **`renderer`**: the pipeline contract, the index renderer and the
//!   thin sub-renderers
//! - **`server`**: actix-web listener, correlation IDs, access log
//! - **`config`**: TOML configuration and validation
//!
//! ```text
//! request
//!    |
//!    +-> server (correlation id, access log)
//!    |
//!    +-> renderer chain (rewrite -> static -> index -> ... -> error)
//!            |
//!            +-> index: rules -> state (fetcher cache) -> VM -> splice
//! ```
//!
//! Isolates are not `Send`: renderer chains are built per worker thread
//! and spare VMs stay on the thread that created them, while the fetcher,
//! caches and pool bookkeeping are shared process-wide.

pub mod buffer;
pub mod cache;
pub mod config;
pub mod dom;
pub mod error;
pub mod fetcher;
pub mod loader;
pub mod renderer;
pub mod server;
pub mod template;
pub mod vm;
