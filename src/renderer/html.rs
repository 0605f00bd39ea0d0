//! HTML shell splicing
//!
//! The shell is rewritten as a byte stream: everything outside the splice
//! points passes through verbatim. Splice points are the end of `<head>`
//! (title and injected elements), the container element (inner content
//! replaced by the rendered fragment) and the end of `<body>` (hydration
//! state script).

use crate::dom::{DomElement, DomElementList};
use crate::error::SsrError;
use lol_html::html_content::ContentType;
use lol_html::{element, HtmlRewriter, Settings};
use std::fmt::Write as _;

/// Everything one splice pass needs.
pub struct SpliceInputs<'a> {
    /// Id of the element whose children are replaced by the fragment.
    pub container: &'a str,
    /// Id of the hydration state script tag.
    pub state_id: &'a str,
    /// Document title, when the bundle set one.
    pub title: Option<&'a str>,
    /// `<meta>` elements in set order.
    pub metas: &'a DomElementList,
    /// `<link>` elements in set order.
    pub links: &'a DomElementList,
    /// `<script>` elements in set order.
    pub scripts: &'a DomElementList,
    /// Rendered fragment (already HTML, injected unescaped).
    pub render: &'a [u8],
    /// Serialized exported state; `None` omits the state script entirely.
    pub state_json: Option<&'a str>,
}

/// Splices the shell into `out`.
pub fn splice(shell: &[u8], inputs: &SpliceInputs<'_>, out: &mut Vec<u8>) -> Result<(), SsrError> {
    let head = head_fragment(inputs);
    let fragment = String::from_utf8_lossy(inputs.render).into_owned();
    let state_script = inputs.state_json.map(|json| {
        format!(
            r#"<script id="{}" type="application/json">{}</script>"#,
            escape_attr(inputs.state_id),
            json
        )
    });
    let container_selector = format!(r#"[id="{}"]"#, inputs.container);

    let mut handlers = Vec::new();
    if !head.is_empty() {
        handlers.push(element!("head", move |el| {
            el.append(&head, ContentType::Html);
            Ok(())
        }));
    }
    handlers.push(element!(container_selector, move |el| {
        el.set_inner_content(&fragment, ContentType::Html);
        Ok(())
    }));
    if let Some(state_script) = state_script {
        handlers.push(element!("body", move |el| {
            el.append(&state_script, ContentType::Html);
            Ok(())
        }));
    }

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::new()
        },
        |chunk: &[u8]| out.extend_from_slice(chunk),
    );
    rewriter
        .write(shell)
        .map_err(|e| SsrError::Splice(e.to_string()))?;
    rewriter.end().map_err(|e| SsrError::Splice(e.to_string()))
}

/// Builds the markup appended to `<head>`: title first, then metas, links
/// and scripts in the order the bundle set them.
fn head_fragment(inputs: &SpliceInputs<'_>) -> String {
    let mut out = String::new();
    if let Some(title) = inputs.title {
        let _ = write!(out, "<title>{}</title>", escape_text(title));
    }
    for element in inputs.metas {
        out.push_str(&void_element("meta", element));
    }
    for element in inputs.links {
        out.push_str(&void_element("link", element));
    }
    for element in inputs.scripts {
        out.push_str(&script_element(element));
    }
    out
}

fn void_element(tag: &str, element: &DomElement) -> String {
    let mut out = format!(r#"<{tag} id="{}""#, escape_attr(&element.id));
    for (key, value) in &element.attributes {
        let _ = write!(out, r#" {key}="{}""#, escape_attr(value));
    }
    out.push('>');
    out
}

fn script_element(element: &DomElement) -> String {
    let mut out = format!(r#"<script id="{}""#, escape_attr(&element.id));
    let mut children = "";
    for (key, value) in &element.attributes {
        if key == "children" {
            children = value;
        } else {
            let _ = write!(out, r#" {key}="{}""#, escape_attr(value));
        }
    }
    out.push('>');
    // `children` is the script body, injected as-is.
    out.push_str(children);
    out.push_str("</script>");
    out
}

fn escape_text(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(input: &str) -> String {
    escape_text(input).replace('"', "&quot;")
}
