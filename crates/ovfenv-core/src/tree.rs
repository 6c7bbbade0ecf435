//! Property tree building.
//!
//! Flat OVF properties such as `lan1-v4_addr` are grouped into a two-level
//! tree by splitting the key on `-`: the first segment names the section,
//! the second the field inside it.

use indexmap::IndexMap;

use crate::ovf::Property;

/// Separator between the section and field parts of a property key.
pub const KEY_DELIMITER: char = '-';

/// Fields of one section, in first-seen order.
pub type Section = IndexMap<String, String>;

/// A top-level entry of the property tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeValue {
    /// A property whose key had no delimiter.
    Scalar(String),
    /// Fields grouped under a section name.
    Section(Section),
}

/// Two-level property tree in first-seen insertion order.
pub type PropertyTree = IndexMap<String, TreeValue>;

/// Group a flat property list into a [`PropertyTree`].
///
/// Keys are split on every `-` but only the first two segments are used, so
/// `a-b-c` lands in section `a` as field `b` and the `c` is dropped. Later
/// duplicates overwrite earlier values in place. A sectioned key whose
/// section name currently holds a scalar replaces that scalar with a new
/// section.
pub fn build_tree(props: &[Property]) -> PropertyTree {
    let mut tree = PropertyTree::new();

    for prop in props {
        match split_key(&prop.key) {
            Some((section, field)) => {
                let entry = tree
                    .entry(section.to_string())
                    .or_insert_with(|| TreeValue::Section(Section::new()));
                if let TreeValue::Scalar(_) = entry {
                    *entry = TreeValue::Section(Section::new());
                }
                if let TreeValue::Section(fields) = entry {
                    fields.insert(field.to_string(), prop.value.clone());
                }
            }
            None => {
                tree.insert(prop.key.clone(), TreeValue::Scalar(prop.value.clone()));
            }
        }
    }

    tree
}

/// Split a key into its section and field parts.
fn split_key(key: &str) -> Option<(&str, &str)> {
    let mut parts = key.split(KEY_DELIMITER);
    let section = parts.next()?;
    // Segments past the second are intentionally discarded.
    let field = parts.next()?;
    Some((section, field))
}
