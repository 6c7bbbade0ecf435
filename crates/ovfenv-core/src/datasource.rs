//! OVF data source orchestration.
//!
//! This module ties the pieces together:
//! 1. Probe the transports for an environment document
//! 2. Extract properties and the instance id from it
//! 3. Build the property tree and render the user-data
//! 4. Merge the extracted metadata over the defaults
//!
//! # Example
//!
//! ```no_run
//! use ovfenv_core::{DataSource, DataSourceOptions, FetchOutcome};
//!
//! let source = DataSource::new(&DataSourceOptions::default()).unwrap();
//! match source.fetch().unwrap() {
//!     FetchOutcome::Found(data) => print!("{}", data.userdata),
//!     FetchOutcome::NotApplicable => eprintln!("no OVF environment"),
//! }
//! ```

use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Serialize;

use crate::diagnostics::{Diagnostics, TracingDiagnostics};
use crate::error::{Error, Result};
use crate::ovf::{extract_instance_id, extract_properties};
use crate::transport::{
    probe, GuestInfoTransport, IsoTransport, Transport, DEFAULT_CDROM_DEVICE_PATTERN,
    DEFAULT_GUESTINFO_KEY, DEFAULT_MOUNTS_PATH, DEFAULT_VMTOOLSD,
};
use crate::tree::build_tree;
use crate::userdata::serialize;

/// Metadata key of the instance id.
pub const INSTANCE_ID_KEY: &str = "instance-id";

/// Instance id used when the environment does not carry one.
pub const DEFAULT_INSTANCE_ID: &str = "iid-dsovf";

/// Extra configuration returned alongside metadata and user-data.
pub type ConfigFragment = IndexMap<String, String>;

/// Instance metadata handed to the initialization system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Metadata(IndexMap<String, String>);

impl Metadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// The defaults every result is merged over.
    pub fn defaults() -> Self {
        let mut md = Self::new();
        md.insert(INSTANCE_ID_KEY, DEFAULT_INSTANCE_ID);
        md
    }

    /// Set a key, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The instance id, if set.
    pub fn instance_id(&self) -> Option<&str> {
        self.get(INSTANCE_ID_KEY)
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge several layers; for each key the first layer defining it wins.
    pub fn merge(layers: &[&Metadata]) -> Metadata {
        let mut merged = Metadata::new();
        for layer in layers {
            for (key, value) in layer.iter() {
                if !merged.0.contains_key(key) {
                    merged.insert(key, value);
                }
            }
        }
        merged
    }
}

/// Everything read from a found environment document.
#[derive(Debug, Clone, Serialize)]
pub struct OvfData {
    /// Name of the transport that delivered the document.
    pub seed: String,
    /// Merged metadata, always with an instance id.
    pub metadata: Metadata,
    /// Rendered `#infoblox-config` user-data.
    pub userdata: String,
    /// Extra configuration; empty for OVF environments.
    #[serde(skip)]
    pub config: ConfigFragment,
    /// The raw environment document.
    #[serde(skip)]
    pub environment: String,
}

impl OvfData {
    /// Read an environment document delivered by `seed`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedDocument`] if the document cannot be parsed.
    pub fn from_document(seed: impl Into<String>, environment: String) -> Result<Self> {
        let (md, userdata, config) = read_environment(&environment)?;
        Ok(Self {
            seed: seed.into(),
            metadata: Metadata::merge(&[&md, &Metadata::defaults()]),
            userdata,
            config,
            environment,
        })
    }
}

/// Result of a fetch that did not fail.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// A transport delivered an environment document.
    Found(OvfData),
    /// No transport delivered anything; this data source does not apply.
    NotApplicable,
}

impl FetchOutcome {
    /// Convert to a `Result`, mapping [`FetchOutcome::NotApplicable`] to
    /// [`Error::NotFound`].
    pub fn found(self) -> Result<OvfData> {
        match self {
            FetchOutcome::Found(data) => Ok(data),
            FetchOutcome::NotApplicable => Err(Error::NotFound),
        }
    }

    /// Whether a document was found.
    pub fn is_found(&self) -> bool {
        matches!(self, FetchOutcome::Found(_))
    }
}

/// Settings for the default transports.
#[derive(Debug, Clone)]
pub struct DataSourceOptions {
    /// Guest tools daemon to query.
    pub vmtoolsd: PathBuf,
    /// Guestinfo key holding the document.
    pub guestinfo_key: String,
    /// Mount table to scan for seed media.
    pub mounts_path: PathBuf,
    /// Extra directories to search for the document.
    pub seed_dirs: Vec<PathBuf>,
    /// Regex matching CD-ROM device names.
    pub cdrom_pattern: String,
    /// Whether to mount unmounted ISO9660 devices to look for the document.
    pub mount_devices: bool,
}

impl Default for DataSourceOptions {
    fn default() -> Self {
        Self {
            vmtoolsd: PathBuf::from(DEFAULT_VMTOOLSD),
            guestinfo_key: DEFAULT_GUESTINFO_KEY.to_string(),
            mounts_path: PathBuf::from(DEFAULT_MOUNTS_PATH),
            seed_dirs: Vec::new(),
            cdrom_pattern: DEFAULT_CDROM_DEVICE_PATTERN.to_string(),
            mount_devices: true,
        }
    }
}

impl DataSourceOptions {
    /// Use a different guest tools binary.
    pub fn with_vmtoolsd(mut self, vmtoolsd: impl Into<PathBuf>) -> Self {
        self.vmtoolsd = vmtoolsd.into();
        self
    }

    /// Query a different guestinfo key.
    pub fn with_guestinfo_key(mut self, key: impl Into<String>) -> Self {
        self.guestinfo_key = key.into();
        self
    }

    /// Read a different mount table.
    pub fn with_mounts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mounts_path = path.into();
        self
    }

    /// Add a directory to search for the document.
    pub fn with_seed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.seed_dirs.push(dir.into());
        self
    }

    /// Match CD-ROM devices with a different regex.
    pub fn with_cdrom_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.cdrom_pattern = pattern.into();
        self
    }

    /// Enable or disable mounting unmounted devices.
    pub fn with_mount_devices(mut self, mount_devices: bool) -> Self {
        self.mount_devices = mount_devices;
        self
    }

    /// Build the transports in the order they are tried.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the CD-ROM pattern is invalid.
    pub fn transports(&self) -> Result<Vec<Box<dyn Transport>>> {
        let guestinfo = GuestInfoTransport::new(&self.vmtoolsd, &self.guestinfo_key);
        let iso = IsoTransport::new(&self.mounts_path)
            .with_seed_dirs(self.seed_dirs.clone())
            .with_cdrom_pattern(&self.cdrom_pattern)?
            .with_mount_devices(self.mount_devices);

        Ok(vec![Box::new(guestinfo), Box::new(iso)])
    }
}

/// The OVF environment data source.
pub struct DataSource {
    transports: Vec<Box<dyn Transport>>,
    diagnostics: Box<dyn Diagnostics>,
}

impl DataSource {
    /// Create a data source with the default transports, logging through
    /// `tracing`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn new(options: &DataSourceOptions) -> Result<Self> {
        Ok(Self::with_transports(
            options.transports()?,
            Box::new(TracingDiagnostics),
        ))
    }

    /// Create a data source from explicit transports and a diagnostics sink.
    pub fn with_transports(
        transports: Vec<Box<dyn Transport>>,
        diagnostics: Box<dyn Diagnostics>,
    ) -> Self {
        Self {
            transports,
            diagnostics,
        }
    }

    /// Names of the transports, in the order they are tried.
    pub fn transport_names(&self) -> Vec<&str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    /// Probe the transports and read the first document found.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedDocument`] if a transport delivered a
    /// document that cannot be parsed. Finding nothing is not an error.
    pub fn fetch(&self) -> Result<FetchOutcome> {
        let Some(probed) = probe(&self.transports, self.diagnostics.as_ref()) else {
            tracing::debug!("no OVF transport produced an environment");
            return Ok(FetchOutcome::NotApplicable);
        };

        let data = OvfData::from_document(probed.transport, probed.content).map_err(|e| {
            tracing::error!("unusable OVF environment: {}", e);
            e
        })?;

        tracing::info!(
            seed = %data.seed,
            instance_id = data.metadata.instance_id().unwrap_or_default(),
            "read OVF environment"
        );

        Ok(FetchOutcome::Found(data))
    }
}

/// Turn an environment document into metadata, user-data and config.
///
/// The metadata only holds what the document itself provides; merge it with
/// [`Metadata::defaults`] for a complete set.
///
/// # Errors
///
/// Returns [`Error::MalformedDocument`] if the document is not a well-formed
/// `Environment` with a `PropertySection`.
pub fn read_environment(doc: &str) -> Result<(Metadata, String, ConfigFragment)> {
    let props = extract_properties(doc)?;
    let userdata = serialize(&build_tree(&props));

    let mut md = Metadata::new();
    if let Some(instance_id) = extract_instance_id(doc)?.filter(|id| !id.is_empty()) {
        md.insert(INSTANCE_ID_KEY, instance_id);
    }

    Ok((md, userdata, ConfigFragment::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::RecordingDiagnostics;

    const DOC: &str = r#"<Environment xmlns:oe="http://schemas.dmtf.org/ovf/environment/1"
        xmlns:ve="http://www.vmware.com/schema/ovfenv" ve:vCenterId="abc-123">
        <PropertySection>
            <Property oe:key="disk-size" oe:value="10"/>
            <Property oe:key="disk-type" oe:value=""/>
            <Property oe:key="hostname" oe:value="web1"/>
        </PropertySection>
    </Environment>"#;

    struct Fixed(&'static str, &'static str);

    impl Transport for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn fetch(&self, _diagnostics: &dyn Diagnostics) -> Option<String> {
            Some(self.1.to_string())
        }
    }

    fn source(transports: Vec<Box<dyn Transport>>) -> DataSource {
        DataSource::with_transports(transports, Box::new(RecordingDiagnostics::new()))
    }

    #[test]
    fn test_metadata_merge_first_wins() {
        let mut extracted = Metadata::new();
        extracted.insert(INSTANCE_ID_KEY, "abc-123");
        extracted.insert("local-hostname", "web1");

        let merged = Metadata::merge(&[&extracted, &Metadata::defaults()]);
        assert_eq!(merged.instance_id(), Some("abc-123"));
        assert_eq!(merged.get("local-hostname"), Some("web1"));
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_metadata_merge_fills_gaps() {
        let merged = Metadata::merge(&[&Metadata::new(), &Metadata::defaults()]);
        assert_eq!(merged.instance_id(), Some(DEFAULT_INSTANCE_ID));
    }

    #[test]
    fn test_read_environment() {
        let (md, ud, cfg) = read_environment(DOC).unwrap();
        assert_eq!(md.instance_id(), Some("abc-123"));
        assert_eq!(ud, "#infoblox-config\n\ndisk:\n  size: 10\n\nhostname: web1\n\n");
        assert!(cfg.is_empty());
    }

    #[test]
    fn test_read_environment_empty_instance_id_ignored() {
        let doc = r#"<Environment xmlns:ve="http://www.vmware.com/schema/ovfenv" ve:vCenterId="">
            <PropertySection/>
        </Environment>"#;
        let (md, _, _) = read_environment(doc).unwrap();
        assert!(md.is_empty());
    }

    #[test]
    fn test_fetch_found() {
        let ds = source(vec![Box::new(Fixed("vmtools", DOC))]);
        let data = ds.fetch().unwrap().found().unwrap();
        assert_eq!(data.seed, "vmtools");
        assert_eq!(data.metadata.instance_id(), Some("abc-123"));
        assert_eq!(data.environment, DOC);
        assert!(data.config.is_empty());
    }

    #[test]
    fn test_fetch_not_applicable() {
        let ds = source(vec![Box::new(Fixed("vmtools", "")), Box::new(Fixed("iso", ""))]);
        let outcome = ds.fetch().unwrap();
        assert!(!outcome.is_found());
        assert!(outcome.found().unwrap_err().is_not_found());
    }

    #[test]
    fn test_fetch_malformed_propagates() {
        let ds = source(vec![
            Box::new(Fixed("vmtools", "<Foo/>")),
            Box::new(Fixed("iso", DOC)),
        ]);
        let err = ds.fetch().unwrap_err();
        assert!(matches!(err, Error::MalformedDocument { .. }));
    }

    #[test]
    fn test_default_transport_order() {
        let ds = DataSource::new(&DataSourceOptions::default()).unwrap();
        assert_eq!(ds.transport_names(), vec!["vmtools", "iso"]);
    }

    #[test]
    fn test_invalid_cdrom_pattern() {
        let options = DataSourceOptions::default().with_cdrom_pattern("[");
        assert!(matches!(
            DataSource::new(&options),
            Err(Error::Config { .. })
        ));
    }
}
