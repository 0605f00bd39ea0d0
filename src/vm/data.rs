//! Per-execution VM output carrier
//!
//! Host callbacks accumulate their effects in a JS-side record during
//! execution; after the bundle returns, the record is marshalled back as
//! JSON and validated into [`VmData`]. The carrier is fully reset between
//! executions so no state leaks across requests.

use crate::dom::{DomElement, DomElementList};
use indexmap::IndexMap;
use serde::Deserialize;

/// Element kinds a bundle may inject into `<head>`, each with its own
/// retained attribute set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// `<meta>` element
    Meta,
    /// `<link>` element
    Link,
    /// `<script>` element
    Script,
}

impl ElementKind {
    /// Attributes retained for this element kind; everything else a bundle
    /// sets is dropped.
    pub fn allowed_attributes(self) -> &'static [&'static str] {
        match self {
            ElementKind::Meta => &[
                "name", "itemprop", "content", "charset", "http-equiv", "scheme", "property",
            ],
            ElementKind::Link => &[
                "rel",
                "href",
                "hreflang",
                "type",
                "sizes",
                "media",
                "as",
                "crossorigin",
                "disabled",
                "importance",
                "integrity",
                "referrerpolicy",
                "title",
            ],
            ElementKind::Script => &[
                "type",
                "src",
                "async",
                "crossorigin",
                "defer",
                "integrity",
                "nomodule",
                "nonce",
                "referrerpolicy",
                "children",
            ],
        }
    }

    fn allows(self, attribute: &str) -> bool {
        self.allowed_attributes().contains(&attribute)
    }
}

/// Output of one bundle execution, populated through the `serverResponse`
/// host object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmData {
    /// Rendered HTML fragment.
    pub render: Option<Vec<u8>>,
    /// Validated render status; `None` means the bundle never set one.
    pub status: Option<u16>,
    /// True when the bundle requested a redirect.
    pub redirect: bool,
    /// Redirect target.
    pub redirect_url: String,
    /// Validated redirect status; `None` means the bundle never set one.
    pub redirect_status: Option<u16>,
    /// Document title to splice into `<head>`.
    pub title: Option<String>,
    /// Response headers set by the bundle.
    pub headers: IndexMap<String, String>,
    /// `<meta>` elements in set order.
    pub metas: DomElementList,
    /// `<link>` elements in set order.
    pub links: DomElementList,
    /// `<script>` elements in set order.
    pub scripts: DomElementList,
}

/// Immutable snapshot of a completed execution handed to the renderer.
/// Copies every map and list so later VM mutations cannot leak into it.
#[derive(Debug, Clone, PartialEq)]
pub struct VmResult {
    /// Rendered HTML fragment (empty when the bundle rendered nothing).
    pub render: Vec<u8>,
    /// Response status; defaults to 200 when the bundle set none.
    pub status: u16,
    /// Redirect target and status when the bundle redirected.
    pub redirect: Option<VmRedirect>,
    /// Document title, when set.
    pub title: Option<String>,
    /// Response headers set by the bundle.
    pub headers: IndexMap<String, String>,
    /// `<meta>` elements in set order.
    pub metas: DomElementList,
    /// `<link>` elements in set order.
    pub links: DomElementList,
    /// `<script>` elements in set order.
    pub scripts: DomElementList,
}

/// A redirect requested by the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRedirect {
    /// `Location` header value.
    pub url: String,
    /// Redirect status; defaults to 302 when the bundle set none.
    pub status: u16,
}

impl VmData {
    /// Snapshots this carrier into a [`VmResult`], applying the defaults.
    pub fn to_result(&self) -> VmResult {
        let redirect = if self.redirect {
            Some(VmRedirect {
                url: self.redirect_url.clone(),
                status: self.redirect_status.unwrap_or(302),
            })
        } else {
            None
        };
        VmResult {
            render: self.render.clone().unwrap_or_default(),
            status: self.status.unwrap_or(200),
            redirect,
            title: self.title.clone(),
            headers: self.headers.clone(),
            metas: self.metas.clone(),
            links: self.links.clone(),
            scripts: self.scripts.clone(),
        }
    }
}

/// Marshalled shape of the JS-side carrier, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct RawVmData {
    render: Option<String>,
    status: Option<i64>,
    redirect: bool,
    redirect_url: String,
    redirect_status: Option<i64>,
    title: Option<String>,
    headers: IndexMap<String, String>,
    metas: Vec<RawElement>,
    links: Vec<RawElement>,
    scripts: Vec<RawElement>,
}

#[derive(Debug, Default, Deserialize)]
struct RawElement {
    id: String,
    attributes: Vec<(String, String)>,
}

/// A render status outside the HTTP range is replaced by 500.
fn validate_render_status(status: Option<i64>) -> Option<u16> {
    status.map(|s| {
        if (100..=599).contains(&s) {
            s as u16
        } else {
            500
        }
    })
}

/// A redirect status that is not a valid 3xx is replaced by 500.
fn validate_redirect_status(status: Option<i64>) -> Option<u16> {
    status.map(|s| {
        if (300..=399).contains(&s) {
            s as u16
        } else {
            500
        }
    })
}

fn build_element_list(raw: Vec<RawElement>, kind: ElementKind) -> DomElementList {
    let mut list = DomElementList::new();
    for raw_element in raw {
        let mut element = DomElement::new(raw_element.id);
        for (key, value) in raw_element.attributes {
            if kind.allows(&key) {
                element.set_attribute(key, value);
            }
        }
        list.set(element);
    }
    list
}

impl From<RawVmData> for VmData {
    fn from(raw: RawVmData) -> Self {
        VmData {
            render: raw.render.map(String::into_bytes),
            status: validate_render_status(raw.status),
            redirect: raw.redirect,
            redirect_url: raw.redirect_url,
            redirect_status: validate_redirect_status(raw.redirect_status),
            title: raw.title,
            headers: raw.headers,
            metas: build_element_list(raw.metas, ElementKind::Meta),
            links: build_element_list(raw.links, ElementKind::Link),
            scripts: build_element_list(raw.scripts, ElementKind::Script),
        }
    }
}

impl RawVmData {
    /// Parses the JSON produced by `JSON.stringify` of the JS-side carrier.
    pub(crate) fn parse(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
