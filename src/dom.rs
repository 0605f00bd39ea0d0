//! Ordered DOM element containers
//!
//! Head elements (`<meta>`, `<link>`, `<script>`) injected by a bundle must
//! render in the exact order the script set them, and each element's
//! attributes in the order they were set. Both levels ride on
//! `indexmap::IndexMap`, whose insert-preserves-position and
//! order-preserving-removal semantics are exactly the ordering discipline
//! required here.

use indexmap::IndexMap;
use serde::Serialize;

/// A DOM node identified by `id` with insertion-ordered attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DomElement {
    /// Value of the element's `id` attribute.
    pub id: String,
    /// Attributes in insertion order. Setting an existing attribute updates
    /// it in place without changing its position.
    pub attributes: IndexMap<String, String>,
}

impl DomElement {
    /// Creates an element with the given id and no attributes.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: IndexMap::new(),
        }
    }

    /// Sets an attribute, preserving its original position on update.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Returns the attribute value for `key`.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Insertion-ordered collection of [`DomElement`]s keyed by id.
///
/// `set` appends the id on first insertion and updates in place afterwards,
/// so iteration order is first-set order. The id list and the element map
/// are one structure; their lengths cannot diverge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DomElementList {
    items: IndexMap<String, DomElement>,
}

impl DomElementList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            items: IndexMap::new(),
        }
    }

    /// Inserts or updates an element keyed by its id.
    pub fn set(&mut self, element: DomElement) {
        self.items.insert(element.id.clone(), element);
    }

    /// Returns the element with the given id.
    pub fn get(&self, id: &str) -> Option<&DomElement> {
        self.items.get(id)
    }

    /// Removes the element with the given id, keeping the order of the rest.
    pub fn remove(&mut self, id: &str) -> Option<DomElement> {
        self.items.shift_remove(id)
    }

    /// Element ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    /// Elements in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DomElement> {
        self.items.values()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<'a> IntoIterator for &'a DomElementList {
    type Item = &'a DomElement;
    type IntoIter = indexmap::map::Values<'a, String, DomElement>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, pairs: &[(&str, &str)]) -> DomElement {
        let mut el = DomElement::new(id);
        for (k, v) in pairs {
            el.set_attribute(*k, *v);
        }
        el
    }

    #[test]
    fn attribute_order_is_insertion_order() {
        let el = meta(
            "description",
            &[("name", "description"), ("content", "hello"), ("scheme", "x")],
        );
        let keys: Vec<&String> = el.attributes.keys().collect();
        assert_eq!(keys, ["name", "content", "scheme"]);
    }

    #[test]
    fn attribute_update_keeps_position() {
        let mut el = meta("og", &[("property", "og:title"), ("content", "a")]);
        el.set_attribute("property", "og:description");
        let keys: Vec<&String> = el.attributes.keys().collect();
        assert_eq!(keys, ["property", "content"]);
        assert_eq!(el.attribute("property"), Some("og:description"));
    }

    #[test]
    fn list_set_appends_once_and_updates_in_place() {
        let mut list = DomElementList::new();
        list.set(meta("a", &[("content", "1")]));
        list.set(meta("b", &[("content", "2")]));
        list.set(meta("a", &[("content", "3")]));

        let ids: Vec<&str> = list.ids().collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(list.len(), 2);
        assert_eq!(list.get("a").unwrap().attribute("content"), Some("3"));
    }

    #[test]
    fn remove_keeps_remaining_order() {
        let mut list = DomElementList::new();
        list.set(DomElement::new("a"));
        list.set(DomElement::new("b"));
        list.set(DomElement::new("c"));
        list.remove("b");
        let ids: Vec<&str> = list.ids().collect();
        assert_eq!(ids, ["a", "c"]);
    }
}
