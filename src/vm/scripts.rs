//! Host-object script generation
//!
//! The host API surface (`process.env`, `server`, `serverRequest`,
//! `serverResponse`) is installed by evaluating a generated bootstrap script
//! that closes over the request snapshot injected as JSON. The callbacks
//! write into `globalThis.__vmData`, which is marshalled back after the
//! bundle runs and deleted again on reset.

use crate::vm::{ServerInfo, VmRequest};

/// Script tags used for evaluation in the runtime
pub(super) mod script_tags {
    pub const CONFIGURE: &str = "<configure>";
    pub const BUNDLE: &str = "<bundle>";
    pub const SNAPSHOT: &str = "<snapshot>";
    pub const CLEANUP: &str = "<cleanup>";
}

/// Reads the accumulated carrier back out of the runtime.
pub(super) const SNAPSHOT_SCRIPT: &str = "JSON.stringify(globalThis.__vmData)";

/// Removes every per-request global installed by the bootstrap.
pub(super) const CLEANUP_SCRIPT: &str = r#"
(() => {
    delete globalThis.__vmData;
    delete globalThis.process;
    delete globalThis.server;
    delete globalThis.serverRequest;
    delete globalThis.serverResponse;
})();
"#;

/// Builds the bootstrap script installing the host objects for one request.
///
/// `state` is injected as a string: `serverRequest.state()` parses it on
/// access so the bundle sees a plain object.
pub(super) fn configure_script(
    env: &str,
    info: &ServerInfo,
    request: &VmRequest,
    state: &str,
) -> Result<String, serde_json::Error> {
    let env_json = serde_json::to_string(env)?;
    let info_json = serde_json::to_string(info)?;
    let request_json = serde_json::to_string(request)?;
    let state_json = serde_json::to_string(state)?;

    Ok(format!(
        r#"
(() => {{
    const __info = {info_json};
    const __req = {request_json};
    const __state = {state_json};

    globalThis.__vmData = {{
        render: null,
        status: null,
        redirect: false,
        redirectUrl: "",
        redirectStatus: null,
        title: null,
        headers: {{}},
        metas: [],
        links: [],
        scripts: []
    }};
    const __vm = globalThis.__vmData;

    const __num = (value) => {{
        const n = Number(value);
        return Number.isFinite(n) ? Math.trunc(n) : null;
    }};
    const __pairs = (attrs) => {{
        const out = [];
        if (attrs == null) {{
            return out;
        }}
        for (const pair of attrs) {{
            out.push([String(pair[0]), String(pair[1])]);
        }}
        return out;
    }};

    globalThis.process = {{ env: {{ ENV: {env_json} }} }};

    globalThis.server = {{
        addr: () => __info.addr,
        port: () => __info.port,
        version: () => __info.version
    }};

    globalThis.serverRequest = {{
        method: () => __req.method,
        proto: () => __req.proto,
        protoMajor: () => __req.protoMajor,
        protoMinor: () => __req.protoMinor,
        remoteAddr: () => __req.remoteAddr,
        host: () => __req.host,
        path: () => __req.path,
        query: () => __req.query,
        headers: () => __req.headers,
        state: () => JSON.parse(__state)
    }};

    globalThis.serverResponse = {{
        render: (body, status) => {{
            __vm.render = String(body);
            __vm.status = status === undefined ? null : __num(status);
        }},
        redirect: (url, status) => {{
            __vm.redirect = true;
            __vm.redirectUrl = String(url);
            __vm.redirectStatus = status === undefined ? null : __num(status);
        }},
        setHeader: (key, value) => {{
            __vm.headers[String(key)] = String(value);
        }},
        setTitle: (title) => {{
            __vm.title = String(title);
        }},
        setMeta: (id, attrs) => {{
            __vm.metas.push({{ id: String(id), attributes: __pairs(attrs) }});
        }},
        setLink: (id, attrs) => {{
            __vm.links.push({{ id: String(id), attributes: __pairs(attrs) }});
        }},
        setScript: (id, attrs) => {{
            __vm.scripts.push({{ id: String(id), attributes: __pairs(attrs) }});
        }}
    }};
}})();
"#
    ))
}
