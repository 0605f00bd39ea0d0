//! VM lifecycle: configure, execute, reset
//!
//! Execution runs on the calling thread; a watchdog thread holds the
//! isolate's thread-safe handle and hard-terminates evaluation when the
//! deadline passes. The only outcomes are a marshalled result, a script
//! error, or a timeout.

use crate::error::SsrError;
use crate::vm::data::{RawVmData, VmData, VmResult};
use crate::vm::scripts::{configure_script, script_tags, CLEANUP_SCRIPT, SNAPSHOT_SCRIPT};
use crate::vm::{ServerInfo, VmRequest};
use deno_core::{v8, JsRuntime, RuntimeOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

/// A single JS isolate + context with the host objects installed per
/// request.
pub struct Vm {
    runtime: JsRuntime,
    data: VmData,
    configured: bool,
}

impl Vm {
    /// Creates a VM with a fresh isolate and context.
    pub fn new() -> Self {
        Self {
            runtime: JsRuntime::new(RuntimeOptions::default()),
            data: VmData::default(),
            configured: false,
        }
    }

    /// Installs fresh host objects bound to this VM's carrier.
    ///
    /// Must be called before [`Vm::execute`]. A missing state defaults to
    /// the empty object.
    pub fn configure(
        &mut self,
        env: &str,
        info: &ServerInfo,
        request: &VmRequest,
        state: Option<&str>,
    ) -> Result<(), SsrError> {
        let script = configure_script(env, info, request, state.unwrap_or("{}"))?;
        self.runtime
            .execute_script(script_tags::CONFIGURE, script)
            .map_err(|e| SsrError::script("<configure>", format!("{e:?}")))?;
        self.data = VmData::default();
        self.configured = true;
        Ok(())
    }

    /// Evaluates the bundle under the given deadline and returns a snapshot
    /// of what the host callbacks accumulated.
    ///
    /// On deadline the isolate is terminated, the termination is cancelled
    /// so the isolate stays usable after a reset, and a timeout error is
    /// returned.
    pub fn execute(
        &mut self,
        name: &str,
        source: &str,
        timeout: Duration,
    ) -> Result<VmResult, SsrError> {
        if !self.configured {
            return Err(SsrError::VmNotConfigured(name.to_string()));
        }

        let isolate_handle = self.runtime.v8_isolate().thread_safe_handle();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog_flag = Arc::clone(&timed_out);
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();

        let watchdog = std::thread::spawn(move || {
            if cancel_rx.recv_timeout(timeout).is_err() {
                watchdog_flag.store(true, Ordering::SeqCst);
                isolate_handle.terminate_execution();
            }
        });

        let evaluated = self
            .runtime
            .execute_script(script_tags::BUNDLE, source.to_string());
        let _ = cancel_tx.send(());
        let _ = watchdog.join();

        if timed_out.load(Ordering::SeqCst) {
            // Drain the termination so the isolate accepts scripts again.
            self.runtime.v8_isolate().cancel_terminate_execution();
            return Err(SsrError::ScriptTimeout {
                name: name.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }

        if let Err(err) = evaluated {
            tracing::debug!(
                target: "vitrine::vm",
                script = name,
                error = ?err,
                "bundle evaluation failed"
            );
            return Err(SsrError::script(name, format!("{err:?}")));
        }

        let snapshot = self
            .runtime
            .execute_script(script_tags::SNAPSHOT, SNAPSHOT_SCRIPT)
            .map_err(|e| SsrError::script(name, format!("failed to read result: {e:?}")))?;
        let json = self.extract_string(snapshot, "execution result is not a string")?;
        self.data = VmData::from(RawVmData::parse(&json)?);
        Ok(self.data.to_result())
    }

    /// Replaces the carrier with a zero value and removes the per-request
    /// globals. A VM that fails to reset must be closed, not reused.
    pub fn reset(&mut self) -> Result<(), SsrError> {
        self.data = VmData::default();
        self.configured = false;
        self.runtime
            .execute_script(script_tags::CLEANUP, CLEANUP_SCRIPT)
            .map_err(|e| SsrError::script("<cleanup>", format!("{e:?}")))?;
        Ok(())
    }

    /// Disposes the context and isolate.
    pub fn close(self) {
        drop(self);
    }

    /// Current carrier contents (zeroed after a reset).
    pub fn data(&self) -> &VmData {
        &self.data
    }

    fn extract_string(
        &mut self,
        value: v8::Global<v8::Value>,
        error_msg: &str,
    ) -> Result<String, SsrError> {
        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        if local.is_string() {
            local
                .to_string(scope)
                .map(|s| s.to_rust_string_lossy(scope))
                .ok_or_else(|| SsrError::script("<snapshot>", error_msg))
        } else {
            Err(SsrError::script("<snapshot>", error_msg))
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn configured_vm() -> Vm {
        let mut vm = Vm::new();
        let info = ServerInfo {
            addr: "127.0.0.1".to_string(),
            port: 8080,
            version: "0.4.1".to_string(),
        };
        let request = VmRequest {
            method: "GET".to_string(),
            proto: "HTTP/1.1".to_string(),
            proto_major: 1,
            proto_minor: 1,
            remote_addr: "10.0.0.1:4000".to_string(),
            host: "example.test".to_string(),
            path: "/page".to_string(),
            query: r#"{"q":["1"]}"#.to_string(),
            headers: r#"{"accept":["text/html"]}"#.to_string(),
        };
        vm.configure("test", &info, &request, Some(r#"{"k":{"loading":false}}"#))
            .unwrap();
        vm
    }

    const SHORT_TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn execute_requires_configure() {
        let mut vm = Vm::new();
        let result = vm.execute("b.js", "1 + 1", SHORT_TIMEOUT);
        assert!(matches!(result, Err(SsrError::VmNotConfigured(_))));
    }

    #[test]
    fn render_with_status() {
        let mut vm = configured_vm();
        let result = vm
            .execute(
                "b.js",
                r#"(() => { serverResponse.render("<p>hi</p>", 201); })();"#,
                SHORT_TIMEOUT,
            )
            .unwrap();
        assert_eq!(result.render, b"<p>hi</p>");
        assert_eq!(result.status, 201);
        assert!(result.redirect.is_none());
    }

    #[test]
    fn invalid_render_status_becomes_500() {
        let mut vm = configured_vm();
        let result = vm
            .execute(
                "b.js",
                r#"(() => { serverResponse.render("x", 12345); })();"#,
                SHORT_TIMEOUT,
            )
            .unwrap();
        assert_eq!(result.status, 500);
    }

    #[test]
    fn redirect_defaults_to_302() {
        let mut vm = configured_vm();
        let result = vm
            .execute(
                "b.js",
                r#"(() => { serverResponse.redirect("http://external"); })();"#,
                SHORT_TIMEOUT,
            )
            .unwrap();
        let redirect = result.redirect.unwrap();
        assert_eq!(redirect.url, "http://external");
        assert_eq!(redirect.status, 302);
    }

    #[test]
    fn invalid_redirect_status_becomes_500() {
        let mut vm = configured_vm();
        let result = vm
            .execute(
                "b.js",
                r#"(() => { serverResponse.redirect("http://external", 418); })();"#,
                SHORT_TIMEOUT,
            )
            .unwrap();
        assert_eq!(result.redirect.unwrap().status, 500);
    }

    #[test]
    fn host_request_surface_is_visible() {
        let mut vm = configured_vm();
        let result = vm
            .execute(
                "b.js",
                r#"(() => {
                    const state = serverRequest.state();
                    const parts = [
                        serverRequest.method(),
                        serverRequest.path(),
                        serverRequest.host(),
                        server.port(),
                        process.env.ENV,
                        String(state.k.loading),
                        serverRequest.query(),
                    ];
                    serverResponse.render(parts.join("|"));
                })();"#,
                SHORT_TIMEOUT,
            )
            .unwrap();
        assert_eq!(
            String::from_utf8(result.render).unwrap(),
            r#"GET|/page|example.test|8080|test|false|{"q":["1"]}"#
        );
        assert_eq!(result.status, 200);
    }

    #[test]
    fn set_meta_applies_whitelist_and_order() {
        let mut vm = configured_vm();
        let result = vm
            .execute(
                "b.js",
                r#"(() => {
                    serverResponse.setTitle("My Page");
                    serverResponse.setHeader("x-frame-options", "DENY");
                    serverResponse.setMeta("description", new Map([
                        ["name", "description"],
                        ["content", "hello"],
                        ["onload", "evil()"],
                    ]));
                    serverResponse.setScript("app", new Map([
                        ["type", "module"],
                        ["children", "boot()"],
                    ]));
                    serverResponse.render("");
                })();"#,
                SHORT_TIMEOUT,
            )
            .unwrap();
        assert_eq!(result.title.as_deref(), Some("My Page"));
        assert_eq!(result.headers.get("x-frame-options").unwrap(), "DENY");

        let meta = result.metas.get("description").unwrap();
        let keys: Vec<&String> = meta.attributes.keys().collect();
        assert_eq!(keys, ["name", "content"]);

        let script = result.scripts.get("app").unwrap();
        assert_eq!(script.attribute("children"), Some("boot()"));
    }

    #[test]
    fn script_exception_is_an_error() {
        let mut vm = configured_vm();
        let result = vm.execute("b.js", r#"throw new Error("boom");"#, SHORT_TIMEOUT);
        match result {
            Err(SsrError::Script { detail, .. }) => assert!(detail.contains("boom")),
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[test]
    fn infinite_loop_times_out_and_vm_recovers() {
        let mut vm = configured_vm();
        let timeout = Duration::from_secs(1);
        let start = Instant::now();
        let result = vm.execute("b.js", "(() => { while (true) {} })();", timeout);
        assert!(matches!(result, Err(SsrError::ScriptTimeout { .. })));
        assert!(start.elapsed() < timeout * 2);

        // After reset + reconfigure the same isolate must execute again.
        vm.reset().unwrap();
        let info = ServerInfo::default();
        let request = VmRequest::default();
        vm.configure("test", &info, &request, None).unwrap();
        let result = vm
            .execute("b.js", r#"(() => { serverResponse.render("ok"); })();"#, SHORT_TIMEOUT)
            .unwrap();
        assert_eq!(result.render, b"ok");
    }

    #[test]
    fn reset_zeroes_the_carrier() {
        let mut vm = configured_vm();
        vm.execute(
            "b.js",
            r#"(() => { serverResponse.render("x", 201); serverResponse.setTitle("t"); })();"#,
            SHORT_TIMEOUT,
        )
        .unwrap();
        assert_ne!(vm.data(), &VmData::default());

        vm.reset().unwrap();
        assert_eq!(vm.data(), &VmData::default());

        // The per-request globals are gone until the next configure.
        let err = vm.execute("b.js", "serverResponse.render('x');", SHORT_TIMEOUT);
        assert!(matches!(err, Err(SsrError::VmNotConfigured(_))));
    }
}
