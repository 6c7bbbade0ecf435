//! Integration tests for the data source: transport fallback, metadata
//! defaults and error propagation.

use ovfenv_core::diagnostics::{DiagnosticEvent, Diagnostics, RecordingDiagnostics};
use ovfenv_core::{
    DataSource, DataSourceOptions, Error, FetchOutcome, OvfData, Transport, DEFAULT_INSTANCE_ID,
};
use std::path::Path;
use std::rc::Rc;
use tempfile::TempDir;

/// Transport returning a fixed answer.
struct StaticTransport {
    name: &'static str,
    content: Option<String>,
}

impl StaticTransport {
    fn boxed(name: &'static str, content: Option<&str>) -> Box<dyn Transport> {
        Box::new(Self {
            name,
            content: content.map(str::to_string),
        })
    }
}

impl Transport for StaticTransport {
    fn name(&self) -> &str {
        self.name
    }

    fn fetch(&self, _diagnostics: &dyn Diagnostics) -> Option<String> {
        self.content.clone()
    }
}

/// Lets a test keep a handle on the sink it gives away.
struct SharedDiagnostics(Rc<RecordingDiagnostics>);

impl Diagnostics for SharedDiagnostics {
    fn report(&self, event: DiagnosticEvent) {
        self.0.report(event);
    }
}

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name);
    std::fs::read_to_string(path).expect("Failed to read fixture")
}

#[test]
fn test_fallback_to_second_transport() {
    let diagnostics = Rc::new(RecordingDiagnostics::new());
    let source = DataSource::with_transports(
        vec![
            StaticTransport::boxed("first", Some("")),
            StaticTransport::boxed("second", Some(fixture("ovf-env.xml").as_str())),
        ],
        Box::new(SharedDiagnostics(Rc::clone(&diagnostics))),
    );

    let data = source.fetch().unwrap().found().unwrap();
    assert_eq!(data.seed, "second");
    assert_eq!(data.environment, fixture("ovf-env.xml"));

    assert_eq!(
        diagnostics.events(),
        vec![
            DiagnosticEvent::TransportEmpty {
                transport: "first".to_string()
            },
            DiagnosticEvent::TransportSelected {
                transport: "second".to_string()
            },
        ]
    );
}

#[test]
fn test_first_transport_wins() {
    let source = DataSource::with_transports(
        vec![
            StaticTransport::boxed("first", Some(fixture("no-instance-id.xml").as_str())),
            StaticTransport::boxed("second", Some(fixture("ovf-env.xml").as_str())),
        ],
        Box::new(RecordingDiagnostics::new()),
    );

    let data = source.fetch().unwrap().found().unwrap();
    assert_eq!(data.seed, "first");
}

#[test]
fn test_instance_id_from_document() {
    let data = OvfData::from_document("vmtools", fixture("ovf-env.xml")).unwrap();
    assert_eq!(data.metadata.instance_id(), Some("vm-1234"));
}

#[test]
fn test_instance_id_default() {
    let data = OvfData::from_document("vmtools", fixture("no-instance-id.xml")).unwrap();
    assert_eq!(data.metadata.instance_id(), Some(DEFAULT_INSTANCE_ID));
    assert_eq!(
        data.userdata,
        "#infoblox-config\n\nhostname: web1\ndisk:\n  size: 10\n\n\n"
    );
}

#[test]
fn test_vcenter_id_overrides_default() {
    let doc = r#"<Environment xmlns:oe="http://schemas.dmtf.org/ovf/environment/1"
        xmlns:ve="http://www.vmware.com/schema/ovfenv" ve:vCenterId="abc-123">
        <PropertySection/>
    </Environment>"#;
    let data = OvfData::from_document("iso", doc.to_string()).unwrap();
    assert_eq!(data.metadata.instance_id(), Some("abc-123"));
    assert_eq!(data.metadata.len(), 1);
}

#[test]
fn test_not_applicable_when_nothing_found() {
    let source = DataSource::with_transports(
        vec![
            StaticTransport::boxed("vmtools", None),
            StaticTransport::boxed("iso", None),
        ],
        Box::new(RecordingDiagnostics::new()),
    );

    let outcome = source.fetch().unwrap();
    assert!(matches!(outcome, FetchOutcome::NotApplicable));
    assert!(matches!(outcome.found(), Err(Error::NotFound)));
}

#[test]
fn test_malformed_document_aborts_fetch() {
    let source = DataSource::with_transports(
        vec![
            StaticTransport::boxed("vmtools", Some("<Foo/>")),
            StaticTransport::boxed("iso", Some(fixture("ovf-env.xml").as_str())),
        ],
        Box::new(RecordingDiagnostics::new()),
    );

    let err = source.fetch().unwrap_err();
    assert!(matches!(err, Error::MalformedDocument { .. }));
}

#[test]
fn test_repeated_fetch_is_stable() {
    let source = DataSource::with_transports(
        vec![StaticTransport::boxed("vmtools", Some(fixture("ovf-env.xml").as_str()))],
        Box::new(RecordingDiagnostics::new()),
    );

    let first = source.fetch().unwrap().found().unwrap();
    let second = source.fetch().unwrap().found().unwrap();
    assert_eq!(first.metadata, second.metadata);
    assert_eq!(first.userdata, second.userdata);
}

#[test]
fn test_json_output() {
    let data = OvfData::from_document("vmtools", fixture("ovf-env.xml")).unwrap();
    let json: serde_json::Value = serde_json::to_value(&data).unwrap();

    assert_eq!(json["seed"], "vmtools");
    assert_eq!(json["metadata"]["instance-id"], "vm-1234");
    assert!(json["userdata"]
        .as_str()
        .unwrap()
        .starts_with("#infoblox-config\n\n"));
    assert!(json.get("environment").is_none());

    let keys: Vec<&str> = json.as_object().unwrap().keys().map(String::as_str).collect();
    assert_eq!(keys.len(), 3);
    for key in ["seed", "metadata", "userdata"] {
        assert!(keys.contains(&key), "missing {}", key);
    }
}

#[test]
fn test_default_options_with_seed_dir() {
    let dir = TempDir::new().unwrap();
    let seed = dir.path().join("seed");
    std::fs::create_dir(&seed).unwrap();
    std::fs::write(seed.join("ovf-env.xml"), fixture("ovf-env.xml")).unwrap();
    let mounts = dir.path().join("mounts");
    std::fs::write(&mounts, "").unwrap();

    let options = DataSourceOptions::default()
        .with_vmtoolsd(dir.path().join("no-such-vmtoolsd"))
        .with_mounts_path(&mounts)
        .with_seed_dir(&seed)
        .with_mount_devices(false);
    let source = DataSource::new(&options).unwrap();

    let data = source.fetch().unwrap().found().unwrap();
    assert_eq!(data.seed, "iso");
    assert_eq!(data.metadata.instance_id(), Some("vm-1234"));
}
