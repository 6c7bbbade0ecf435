//! Transports that deliver the OVF environment document to the guest.
//!
//! A transport is tried once; whatever goes wrong inside it is reported to
//! the [`Diagnostics`] sink and turned into "no content". [`probe`] walks an
//! ordered list of transports and keeps the first non-empty document.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

use crate::diagnostics::{DiagnosticEvent, Diagnostics};
use crate::error::{Error, Result};

/// Guest tools daemon used to query guestinfo keys.
pub const DEFAULT_VMTOOLSD: &str = "vmtoolsd";

/// Guestinfo key holding the OVF environment.
pub const DEFAULT_GUESTINFO_KEY: &str = "guestinfo.ovfEnv";

/// Kernel mount table.
pub const DEFAULT_MOUNTS_PATH: &str = "/proc/mounts";

/// Device names that may carry an ISO9660 seed (see udev's 60-cdrom_id rules).
pub const DEFAULT_CDROM_DEVICE_PATTERN: &str = r"^(sr[0-9]+|hd[a-z]|xvd.*)";

/// File names the environment document may have on seed media.
pub const ENV_FILE_NAMES: [&str; 4] = [
    "ovf-env.xml",
    "ovf_env.xml",
    "OVF_ENV.XML",
    "OVF-ENV.XML",
];

/// Filesystem type of seed media.
pub const ISO9660: &str = "iso9660";

/// Name of the guest tools transport.
pub const VMTOOLS_TRANSPORT: &str = "vmtools";

/// Name of the seed media transport.
pub const ISO_TRANSPORT: &str = "iso";

/// A source of the raw OVF environment document.
pub trait Transport {
    /// Name recorded as the seed when this transport wins.
    fn name(&self) -> &str;

    /// Try to read the document once. Failures are reported, not returned.
    fn fetch(&self, diagnostics: &dyn Diagnostics) -> Option<String>;
}

/// The document found by [`probe`] and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probed {
    /// Name of the transport that produced the document.
    pub transport: String,
    /// The document text.
    pub content: String,
}

/// Try each transport in order and return the first non-empty document.
pub fn probe(transports: &[Box<dyn Transport>], diagnostics: &dyn Diagnostics) -> Option<Probed> {
    for transport in transports {
        match transport.fetch(diagnostics) {
            Some(content) if !content.is_empty() => {
                diagnostics.report(DiagnosticEvent::TransportSelected {
                    transport: transport.name().to_string(),
                });
                return Some(Probed {
                    transport: transport.name().to_string(),
                    content,
                });
            }
            _ => diagnostics.report(DiagnosticEvent::TransportEmpty {
                transport: transport.name().to_string(),
            }),
        }
    }

    None
}

/// Reads the document through `vmtoolsd --cmd "info-get <key>"`.
#[derive(Debug, Clone)]
pub struct GuestInfoTransport {
    program: PathBuf,
    key: String,
}

impl Default for GuestInfoTransport {
    fn default() -> Self {
        Self::new(DEFAULT_VMTOOLSD, DEFAULT_GUESTINFO_KEY)
    }
}

impl GuestInfoTransport {
    /// Create a transport querying `key` through `program`.
    pub fn new(program: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            key: key.into(),
        }
    }

    /// Arguments passed to the guest tools daemon.
    pub fn args(&self) -> Vec<String> {
        vec!["--cmd".to_string(), format!("info-get {}", self.key)]
    }

    /// Run the query, returning stdout on success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportExecution`] if the program cannot be spawned
    /// or exits unsuccessfully.
    pub fn query(&self) -> Result<String> {
        let args = self.args();
        run_command(self.program.as_os_str(), &args)
    }
}

impl Transport for GuestInfoTransport {
    fn name(&self) -> &str {
        VMTOOLS_TRANSPORT
    }

    fn fetch(&self, diagnostics: &dyn Diagnostics) -> Option<String> {
        match self.query() {
            Ok(out) => Some(out),
            Err(err) => {
                report_command_error(diagnostics, err);
                None
            }
        }
    }
}

/// External programs used to find and mount unmounted seed media.
#[derive(Debug, Clone)]
pub struct MountTools {
    /// Lists block devices by filesystem type.
    pub blkid: PathBuf,
    /// Mounts a device read-only.
    pub mount: PathBuf,
    /// Unmounts it again.
    pub umount: PathBuf,
}

impl Default for MountTools {
    fn default() -> Self {
        Self {
            blkid: PathBuf::from("blkid"),
            mount: PathBuf::from("mount"),
            umount: PathBuf::from("umount"),
        }
    }
}

/// Looks for the document on ISO9660 seed media.
///
/// Already mounted CD-ROM devices are searched first, then the configured
/// seed directories, then (if enabled) CD-ROM devices that carry an ISO9660
/// filesystem but are not mounted yet.
#[derive(Debug, Clone)]
pub struct IsoTransport {
    mounts_path: PathBuf,
    seed_dirs: Vec<PathBuf>,
    cdrom_pattern: Regex,
    mount_devices: bool,
    tools: MountTools,
}

impl IsoTransport {
    /// Create a transport reading the mount table at `mounts_path`.
    pub fn new(mounts_path: impl Into<PathBuf>) -> Self {
        Self {
            mounts_path: mounts_path.into(),
            seed_dirs: Vec::new(),
            cdrom_pattern: default_cdrom_pattern(),
            mount_devices: true,
            tools: MountTools::default(),
        }
    }

    /// Also search these directories for the document.
    pub fn with_seed_dirs(mut self, seed_dirs: Vec<PathBuf>) -> Self {
        self.seed_dirs = seed_dirs;
        self
    }

    /// Use a different pattern to recognise CD-ROM device names.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the pattern is not a valid regex.
    pub fn with_cdrom_pattern(mut self, pattern: &str) -> Result<Self> {
        self.cdrom_pattern = Regex::new(pattern)
            .map_err(|e| Error::config(format!("invalid cdrom device pattern: {}", e)))?;
        Ok(self)
    }

    /// Enable or disable mounting unmounted devices.
    pub fn with_mount_devices(mut self, mount_devices: bool) -> Self {
        self.mount_devices = mount_devices;
        self
    }

    /// Use different external programs for device discovery and mounting.
    pub fn with_tools(mut self, tools: MountTools) -> Self {
        self.tools = tools;
        self
    }

    /// Whether `device` looks like a CD-ROM that may hold seed media.
    pub fn is_cdrom_device(&self, device: &str) -> bool {
        maybe_cdrom_device(&self.cdrom_pattern, device)
    }

    fn search_mounted(
        &self,
        diagnostics: &dyn Diagnostics,
        inspected: &mut HashSet<String>,
    ) -> Option<String> {
        let table = match fs::read_to_string(&self.mounts_path) {
            Ok(table) => table,
            Err(e) => {
                diagnostics.report(DiagnosticEvent::ReadFailed {
                    path: self.mounts_path.clone(),
                    detail: e.to_string(),
                });
                return None;
            }
        };

        for entry in parse_mounts(&table) {
            if entry.fs_type != ISO9660 || !self.is_cdrom_device(&entry.device) {
                continue;
            }
            inspected.insert(entry.device.clone());
            if let Some(content) = find_env_file(&entry.mount_point, diagnostics) {
                return Some(content);
            }
        }

        None
    }

    fn search_unmounted(
        &self,
        diagnostics: &dyn Diagnostics,
        inspected: &HashSet<String>,
    ) -> Option<String> {
        let args = [
            "-t".to_string(),
            format!("TYPE={}", ISO9660),
            "-o".to_string(),
            "device".to_string(),
        ];
        let listing = match run_command(self.tools.blkid.as_os_str(), &args) {
            Ok(listing) => listing,
            Err(err) => {
                report_command_error(diagnostics, err);
                return None;
            }
        };

        let devices = listing
            .lines()
            .map(str::trim)
            .filter(|dev| !dev.is_empty() && !inspected.contains(*dev))
            .filter(|dev| self.is_cdrom_device(dev));

        for device in devices {
            if let Some(content) = self.read_from_device(device, diagnostics) {
                return Some(content);
            }
        }

        None
    }

    fn read_from_device(&self, device: &str, diagnostics: &dyn Diagnostics) -> Option<String> {
        let mount_failed = |detail: String| {
            diagnostics.report(DiagnosticEvent::MountFailed {
                device: device.to_string(),
                detail,
            });
        };

        let dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                mount_failed(e.to_string());
                return None;
            }
        };
        let target = dir.path().to_string_lossy().into_owned();

        let args = [
            "-o".to_string(),
            "ro".to_string(),
            "-t".to_string(),
            ISO9660.to_string(),
            device.to_string(),
            target.clone(),
        ];
        if let Err(err) = run_command(self.tools.mount.as_os_str(), &args) {
            mount_failed(err.to_string());
            return None;
        }

        let content = find_env_file(dir.path(), diagnostics);

        if let Err(err) = run_command(self.tools.umount.as_os_str(), &[target]) {
            report_command_error(diagnostics, err);
        }

        content
    }
}

impl Default for IsoTransport {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNTS_PATH)
    }
}

impl Transport for IsoTransport {
    fn name(&self) -> &str {
        ISO_TRANSPORT
    }

    fn fetch(&self, diagnostics: &dyn Diagnostics) -> Option<String> {
        let mut inspected = HashSet::new();

        if let Some(content) = self.search_mounted(diagnostics, &mut inspected) {
            return Some(content);
        }

        for dir in &self.seed_dirs {
            if let Some(content) = find_env_file(dir, diagnostics) {
                return Some(content);
            }
        }

        if self.mount_devices {
            return self.search_unmounted(diagnostics, &inspected);
        }

        None
    }
}

/// One line of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    /// Mounted device, e.g. `/dev/sr0`.
    pub device: String,
    /// Where it is mounted.
    pub mount_point: PathBuf,
    /// Filesystem type, e.g. `iso9660`.
    pub fs_type: String,
}

/// Parse a `/proc/mounts` style table, decoding `\040` style escapes.
pub fn parse_mounts(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            let fs_type = fields.next()?;
            Some(MountEntry {
                device: unescape_mount_field(device),
                mount_point: PathBuf::from(unescape_mount_field(mount_point)),
                fs_type: fs_type.to_string(),
            })
        })
        .collect()
}

/// Decode the octal escapes the kernel uses for spaces, tabs and the like.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|b| (b'0'..=b'7').contains(b))
}

/// Whether `device` names a CD-ROM-like block device.
///
/// Accepts kernel names (`sr0`) and direct children of `/dev/`. Any other
/// path is rejected, including subdirectories of `/dev/` and paths that
/// escape it through `..`.
pub fn maybe_cdrom_device(pattern: &Regex, device: &str) -> bool {
    if device.is_empty() {
        return false;
    }

    let normalized = normalize_path(device);
    let name = normalized
        .strip_prefix("/dev/")
        .unwrap_or(normalized.as_str());

    !name.is_empty() && !name.contains('/') && pattern.is_match(name)
}

/// Lexically resolve `.`, `..` and repeated separators.
fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            part => parts.push(part),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else {
        joined
    }
}

/// Read the first environment file present in `dir`.
///
/// Files that exist but cannot be read are reported and skipped.
pub fn find_env_file(dir: &Path, diagnostics: &dyn Diagnostics) -> Option<String> {
    for name in ENV_FILE_NAMES {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        match fs::read(&path) {
            Ok(bytes) => return Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => diagnostics.report(DiagnosticEvent::ReadFailed {
                path,
                detail: e.to_string(),
            }),
        }
    }

    None
}

fn default_cdrom_pattern() -> Regex {
    // The default pattern is a literal known to compile.
    Regex::new(DEFAULT_CDROM_DEVICE_PATTERN).expect("default cdrom pattern is valid")
}

/// Render a command line for logs.
fn command_line(program: &OsStr, args: &[String]) -> String {
    let mut line = program.to_string_lossy().into_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Run a command to completion and return its stdout.
fn run_command(program: &OsStr, args: &[String]) -> Result<String> {
    let cmd = command_line(program, args);
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| Error::transport_execution(&cmd, e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            output.status.to_string()
        } else {
            format!("{}\nstderr: {}", output.status, stderr.trim())
        };
        return Err(Error::transport_execution(cmd, message));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn report_command_error(diagnostics: &dyn Diagnostics, err: Error) {
    match err {
        Error::TransportExecution { command, message } => {
            diagnostics.report(DiagnosticEvent::CommandFailed {
                command,
                detail: message,
            })
        }
        other => diagnostics.report(DiagnosticEvent::CommandFailed {
            command: String::new(),
            detail: other.to_string(),
        }),
    }
}
