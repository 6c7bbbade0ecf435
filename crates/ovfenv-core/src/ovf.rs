//! OVF environment document parsing.
//!
//! This module reads the `Environment` document a hypervisor hands to the
//! guest and pulls out the two things the data source needs: the flat list
//! of `Property` key/value pairs and the optional vCenter instance id.

use quick_xml::events::{BytesStart, Event};
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;

use crate::error::{Error, Result};

/// Namespace of the `key` and `value` attributes on `Property` elements.
pub const ENV_NAMESPACE: &str = "http://schemas.dmtf.org/ovf/environment/1";

/// Qualified name of the root attribute carrying the instance id.
pub const INSTANCE_ID_ATTRIBUTE: &str = "ve:vCenterId";

/// Local name the root element must have.
const ROOT_ELEMENT: &[u8] = b"Environment";

const PROPERTY_SECTION: &[u8] = b"PropertySection";
const PROPERTY: &[u8] = b"Property";

/// A single configuration property from the environment document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    /// The `oe:key` attribute, e.g. `"disk-size"`.
    pub key: String,
    /// The `oe:value` attribute, unescaped.
    pub value: String,
}

impl Property {
    /// Create a property from a key and value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Properties in document order.
pub type PropertyList = Vec<Property>;

/// Extract the `Property` entries of the first `PropertySection`.
///
/// Only a `PropertySection` that is a direct child of the root element is
/// considered, and only its direct `Property` children are read.
///
/// # Errors
///
/// Returns [`Error::MalformedDocument`] if the document is not well-formed,
/// its root element is not named `Environment`, it has no `PropertySection`,
/// or it contains a `Property` without a namespaced `key` or `value`
/// attribute.
pub fn extract_properties(doc: &str) -> Result<PropertyList> {
    let mut properties = Vec::new();
    let mut section_found = false;
    let mut in_section = false;
    let mut section_done = false;

    walk_elements(doc, |reader, element, depth, has_children| {
        match depth {
            0 => check_root(element)?,
            1 => {
                if in_section {
                    in_section = false;
                    section_done = true;
                }
                if !section_done && element.local_name().as_ref() == PROPERTY_SECTION {
                    section_found = true;
                    in_section = has_children;
                    section_done = !has_children;
                }
            }
            2 if in_section && element.local_name().as_ref() == PROPERTY => {
                properties.push(read_property(reader, element)?);
            }
            _ => {}
        }
        Ok(())
    })?;

    if !section_found {
        return Err(Error::malformed("No 'PropertySection's"));
    }

    Ok(properties)
}

/// Read the instance id from the `ve:vCenterId` attribute of the root element.
///
/// # Errors
///
/// Returns [`Error::MalformedDocument`] if the document is not well-formed or
/// its root element is not named `Environment`.
pub fn extract_instance_id(doc: &str) -> Result<Option<String>> {
    let mut instance_id = None;

    walk_elements(doc, |_, element, depth, _| {
        if depth != 0 {
            return Ok(());
        }
        check_root(element)?;
        for attr in element.attributes() {
            let attr = attr?;
            if attr.key.as_ref() == INSTANCE_ID_ATTRIBUTE.as_bytes() {
                instance_id = Some(attr.unescape_value()?.into_owned());
            }
        }
        Ok(())
    })?;

    Ok(instance_id)
}

fn check_root(element: &BytesStart<'_>) -> Result<()> {
    if element.local_name().as_ref() != ROOT_ELEMENT {
        return Err(Error::malformed("No Environment Node"));
    }
    Ok(())
}

fn read_property(reader: &NsReader<&[u8]>, element: &BytesStart<'_>) -> Result<Property> {
    let mut key = None;
    let mut value = None;

    for attr in element.attributes() {
        let attr = attr?;
        let (ns, local) = reader.resolve_attribute(attr.key);
        let in_env_namespace =
            matches!(ns, ResolveResult::Bound(Namespace(uri)) if uri == ENV_NAMESPACE.as_bytes());
        if !in_env_namespace {
            continue;
        }
        match local.as_ref() {
            b"key" => key = Some(attr.unescape_value()?.into_owned()),
            b"value" => value = Some(attr.unescape_value()?.into_owned()),
            _ => {}
        }
    }

    match (key, value) {
        (Some(key), Some(value)) => Ok(Property { key, value }),
        (None, _) => Err(Error::malformed("Property without a key attribute")),
        (Some(key), None) => Err(Error::malformed(format!(
            "Property '{}' without a value attribute",
            key
        ))),
    }
}

/// Walk every element of a well-formed document.
///
/// `visit` receives the reader (for namespace resolution), the element, its
/// depth (0 for the root) and whether it is a start tag with content rather
/// than an empty element.
fn walk_elements<'a, F>(doc: &'a str, mut visit: F) -> Result<()>
where
    F: FnMut(&NsReader<&'a [u8]>, &BytesStart<'a>, usize, bool) -> Result<()>,
{
    let mut reader = NsReader::from_str(doc);
    let mut depth = 0usize;
    let mut root_seen = false;

    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                if depth == 0 {
                    if root_seen {
                        return Err(Error::malformed("multiple root elements"));
                    }
                    root_seen = true;
                }
                visit(&reader, &element, depth, true)?;
                depth += 1;
            }
            Event::Empty(element) => {
                if depth == 0 {
                    if root_seen {
                        return Err(Error::malformed("multiple root elements"));
                    }
                    root_seen = true;
                }
                visit(&reader, &element, depth, false)?;
            }
            Event::End(_) => {
                if depth == 0 {
                    return Err(Error::malformed("unexpected end tag"));
                }
                depth -= 1;
            }
            Event::Text(text) if depth == 0 => {
                if !text.iter().all(|b| b.is_ascii_whitespace()) {
                    return Err(Error::malformed("text outside of the root element"));
                }
            }
            Event::CData(_) if depth == 0 => {
                return Err(Error::malformed("CDATA outside of the root element"));
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if depth > 0 {
        return Err(Error::malformed("unexpected end of document"));
    }
    if !root_seen {
        return Err(Error::malformed("no root element"));
    }

    Ok(())
}
