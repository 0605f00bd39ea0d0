//! JavaScript execution core
//!
//! One [`Vm`] owns one isolate and one context. A request configures the VM
//! with its snapshot and the assembled state, executes the bundle under a
//! deadline, and reads the marshalled result back. VMs are handed out by
//! the bounded [`VmPool`]; an isolate is single-threaded and never shared.

mod data;
mod engine;
mod pool;
mod scripts;

pub use data::{ElementKind, VmData, VmRedirect, VmResult};
pub use engine::Vm;
pub use pool::{VmLease, VmPool, VmPoolConfig};

use serde::Serialize;

/// Identity of the running server, exposed to bundles via `server.*()`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerInfo {
    /// Listen address.
    pub addr: String,
    /// Listen port.
    pub port: u16,
    /// Product version string.
    pub version: String,
}

/// Snapshot of the incoming HTTP request, exposed via `serverRequest.*()`.
///
/// `query` and `headers` carry pre-serialized JSON so the host functions
/// return them as strings, exactly as the bundle API promises.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRequest {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Protocol string, e.g. `HTTP/1.1`.
    pub proto: String,
    /// Major protocol version.
    pub proto_major: u16,
    /// Minor protocol version.
    pub proto_minor: u16,
    /// Peer address.
    pub remote_addr: String,
    /// Host the request was addressed to.
    pub host: String,
    /// Request path (after any rewrite).
    pub path: String,
    /// JSON object of parsed query parameters (values are string arrays).
    pub query: String,
    /// JSON object of request headers (values are string arrays).
    pub headers: String,
}
