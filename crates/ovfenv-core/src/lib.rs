//! ovfenv Core Library
//!
//! This crate reads the OVF environment document a VMware hypervisor hands to
//! a guest and turns it into instance metadata and user-data.
//!
//! # Overview
//!
//! The document is fetched from the guest tools (`vmtoolsd`) or from an
//! ISO9660 seed disc, its `Property` entries are grouped into sections by
//! splitting keys on `-`, and the result is rendered as an
//! `#infoblox-config` user-data block. The main entry point is
//! [`DataSource::fetch`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`diagnostics`] - Sink for transport failures
//! - [`transport`] - Guest tools and seed media transports
//! - [`ovf`] - OVF environment parsing
//! - [`tree`] - Property tree building
//! - [`userdata`] - User-data rendering
//! - [`datasource`] - Orchestration and metadata defaults
//!
//! # Quick Start
//!
//! ```no_run
//! use ovfenv_core::{DataSource, DataSourceOptions};
//!
//! let source = DataSource::new(&DataSourceOptions::default()).unwrap();
//! let data = source.fetch().unwrap().found().unwrap();
//! println!("{}", data.metadata.instance_id().unwrap_or_default());
//! ```

pub mod datasource;
pub mod diagnostics;
pub mod error;
pub mod ovf;
pub mod transport;
pub mod tree;
pub mod userdata;

pub use error::{Error, Result};

pub use datasource::{
    read_environment, ConfigFragment, DataSource, DataSourceOptions, FetchOutcome, Metadata,
    OvfData, DEFAULT_INSTANCE_ID, INSTANCE_ID_KEY,
};
pub use diagnostics::{DiagnosticEvent, Diagnostics, RecordingDiagnostics, TracingDiagnostics};
pub use ovf::{extract_instance_id, extract_properties, Property, PropertyList};
pub use transport::{probe, GuestInfoTransport, IsoTransport, Probed, Transport};
pub use tree::{build_tree, PropertyTree, TreeValue};
pub use userdata::serialize;
