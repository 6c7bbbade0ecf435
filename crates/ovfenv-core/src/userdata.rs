//! User-data rendering.
//!
//! Renders a [`PropertyTree`] as the YAML-like `#infoblox-config` block that
//! downstream configuration tooling appends to its own config.

use crate::tree::{PropertyTree, TreeValue};

/// First line of every rendered user-data block.
pub const USERDATA_HEADER: &str = "#infoblox-config";

/// Render a property tree as user-data text.
///
/// Empty values are left out. A section header is only written once the
/// section has a non-empty field, but every section is followed by a blank
/// line whether or not anything was written for it.
pub fn serialize(tree: &PropertyTree) -> String {
    let mut out = String::new();
    out.push_str(USERDATA_HEADER);
    out.push_str("\n\n");

    for (key, value) in tree {
        match value {
            TreeValue::Scalar(value) => {
                if !value.is_empty() {
                    out.push_str(&format!("{}: {}\n", key, value));
                }
            }
            TreeValue::Section(fields) => {
                let mut header_written = false;
                for (field, value) in fields {
                    if value.is_empty() {
                        continue;
                    }
                    if !header_written {
                        out.push_str(&format!("{}:\n", key));
                        header_written = true;
                    }
                    out.push_str(&format!("  {}: {}\n", field, value));
                }
                out.push('\n');
            }
        }
    }

    out.push('\n');
    out
}
