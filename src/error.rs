//! Error types for the render server
//!
//! Domain errors use `SsrError`; binary and service boundaries convert to
//! `anyhow::Error`. Renderers and fetchers return errors rather than
//! panicking; the terminal renderer of the pipeline translates anything
//! unhandled into a 500 response.

use thiserror::Error;

/// Custom error type for server-side rendering operations
#[derive(Error, Debug)]
pub enum SsrError {
    /// Invalid configuration: bad regex, missing mandatory file, malformed rule.
    /// Fatal at startup.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Upstream fetch exhausted its retries or failed outright
    #[error("Upstream unavailable for resource '{resource}': {reason}")]
    UpstreamUnavailable {
        /// Name of the resource whose fetch failed
        resource: String,
        /// Final status code or transport error description
        reason: String,
    },

    /// A resource name was referenced but never registered
    #[error("Unknown resource: {0}")]
    UnknownResource(String),

    /// A resource is registered but its payload is absent or expired
    #[error("No cached payload for resource: {0}")]
    CacheMiss(String),

    /// A loader rule referenced a template that is not configured
    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    /// An upstream payload did not have the shape a loader rule expects
    #[error("Unexpected payload shape for resource '{resource}': {detail}")]
    Payload {
        /// Base resource whose payload was being expanded
        resource: String,
        /// What was expected at the selected path
        detail: String,
    },

    /// The JavaScript bundle threw or failed to parse
    #[error("Script error in {name}: {detail}")]
    Script {
        /// Script name as reported to the engine
        name: String,
        /// Exception or parse failure detail
        detail: String,
    },

    /// The JavaScript bundle exceeded its execution deadline
    #[error("Script '{name}' exceeded the {timeout_secs}s execution timeout")]
    ScriptTimeout {
        /// Script name as reported to the engine
        name: String,
        /// Configured deadline in seconds
        timeout_secs: u64,
    },

    /// The VM was asked to execute before being configured
    #[error("VM not configured: {0}")]
    VmNotConfigured(String),

    /// HTML shell or JS bundle could not be read
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path of the file that failed
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rewriting the HTML shell failed
    #[error("HTML splice failed: {0}")]
    Splice(String),
}

impl SsrError {
    /// Builds an I/O error annotated with the offending path.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        SsrError::Io {
            path: path.into(),
            source,
        }
    }

    /// Builds a script error.
    pub fn script(name: impl Into<String>, detail: impl Into<String>) -> Self {
        SsrError::Script {
            name: name.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_resource_name() {
        let err = SsrError::UpstreamUnavailable {
            resource: "posts".into(),
            reason: "status 503".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("posts"));
        assert!(msg.contains("503"));
    }

    #[test]
    fn timeout_reports_deadline() {
        let err = SsrError::ScriptTimeout {
            name: "bundle.js".into(),
            timeout_secs: 5,
        };
        assert_eq!(
            err.to_string(),
            "Script 'bundle.js' exceeded the 5s execution timeout"
        );
    }
}
