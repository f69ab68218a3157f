//! Normalizes `$elements` payloads into element rows and the serialized
//! chain string attached to autocaptured events.

use std::collections::BTreeMap;

use serde_json::Value;

/// One element in a DOM-path-like trail, ordered outermost-last.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Element {
    pub tag_name: Option<String>,
    pub text: Option<String>,
    pub href: Option<String>,
    pub attr_id: Option<String>,
    pub attr_class: Vec<String>,
    pub nth_child: Option<i64>,
    pub nth_of_type: Option<i64>,
    pub attributes: BTreeMap<String, String>,
    pub order: i32,
}

/// Normalize a raw `$elements` array. Entries that are not objects are
/// skipped; everything else is best-effort extracted.
pub fn extract_elements(raw: &[Value]) -> Vec<Element> {
    raw.iter()
        .filter_map(Value::as_object)
        .enumerate()
        .map(|(index, el)| {
            let mut element = Element {
                order: index as i32,
                tag_name: string_prop(el, "tag_name"),
                text: string_prop(el, "$el_text").or_else(|| string_prop(el, "text")),
                href: string_prop(el, "attr__href").or_else(|| string_prop(el, "href")),
                attr_id: string_prop(el, "attr__id").or_else(|| string_prop(el, "attr_id")),
                nth_child: el.get("nth_child").and_then(Value::as_i64),
                nth_of_type: el.get("nth_of_type").and_then(Value::as_i64),
                ..Default::default()
            };

            element.attr_class = match el.get("attr_class").or_else(|| el.get("attr__class")) {
                Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
                Some(Value::Array(classes)) => classes
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                _ => Vec::new(),
            };

            if let Some(Value::Object(attributes)) = el.get("attributes") {
                for (key, value) in attributes {
                    element
                        .attributes
                        .insert(key.clone(), stringify_value(value));
                }
            }

            element
        })
        .collect()
}

/// Serialize an element list to the chain format:
/// `tag.class1.class2:key="value"key="value"` per element, joined with `;`.
///
/// The chain is a pure function of the input list: classes and attribute
/// keys are sorted, so equal lists always serialize identically.
pub fn elements_to_string(elements: &[Element]) -> String {
    elements
        .iter()
        .map(element_to_string)
        .collect::<Vec<_>>()
        .join(";")
}

/// Content-address an element list. Equal lists hash equally; the hash keys
/// the `(team_id, hash)` uniqueness of stored element groups.
pub fn hash_elements(elements: &[Element]) -> String {
    format!("{:x}", md5::compute(elements_to_string(elements)))
}

fn element_to_string(element: &Element) -> String {
    let mut out = String::new();
    if let Some(tag_name) = &element.tag_name {
        out.push_str(tag_name);
    }

    let mut classes = element.attr_class.clone();
    classes.sort();
    for class in classes {
        out.push('.');
        out.push_str(&class.replace('"', ""));
    }

    let mut attributes: BTreeMap<String, String> = BTreeMap::new();
    if let Some(text) = &element.text {
        attributes.insert("text".to_string(), text.clone());
    }
    attributes.insert(
        "nth-child".to_string(),
        element.nth_child.unwrap_or(0).to_string(),
    );
    attributes.insert(
        "nth-of-type".to_string(),
        element.nth_of_type.unwrap_or(0).to_string(),
    );
    if let Some(href) = &element.href {
        attributes.insert("href".to_string(), href.clone());
    }
    if let Some(attr_id) = &element.attr_id {
        attributes.insert("attr_id".to_string(), attr_id.clone());
    }
    for (key, value) in &element.attributes {
        attributes.insert(key.clone(), value.clone());
    }

    out.push(':');
    for (key, value) in attributes {
        out.push_str(&format!("{key}=\"{}\"", value.replace('"', "\\\"")));
    }
    out
}

fn string_prop(el: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    el.get(key).and_then(Value::as_str).map(str::to_string)
}

fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
