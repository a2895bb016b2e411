use std::collections::BTreeMap;
use std::fmt::Formatter;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::{BrokerError, BrokerKind};

pub const SO_FILENAME_METADATA_KEY: &str = "org.khronos.openxr.OpenXRRuntime.SoFilename";
pub const MAJOR_VERSION_METADATA_KEY: &str = "org.khronos.openxr.OpenXRRuntime.MajorVersion";
pub const FUNCTIONS_METADATA_PREFIX: &str = "org.khronos.openxr.OpenXRRuntime.Functions.";

// UpperCamelCase words glued after the `xr` marker, e.g. xrCreateInstance.
static FUNCTION_NAME: Lazy<Regex> =
    Lazy::new(|| match Regex::new(r"^xr[A-Z][a-z0-9]*([0-9A-Z][a-z0-9]*)*$") {
        Ok(regex) => regex,
        Err(err) => panic!("function name grammar failed to compile: {err}"),
    });

#[must_use]
pub fn is_function_name(value: &str) -> bool {
    FUNCTION_NAME.is_match(value)
}

/// One declared metadata value on a discovered component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for MetadataValue {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Ordered key/value metadata of a component.
///
/// Keys are kept in declaration order and duplicates are retained, so scanning
/// order is observable by the function-table builder.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataBag(Vec<(String, MetadataValue)>);

impl MetadataBag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.0.push((key.to_string(), value.into()));
        self
    }

    /// First value declared under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.iter().find_map(|(candidate, value)| (candidate == key).then_some(value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetadataValue)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, MetadataValue)> for MetadataBag {
    fn from_iter<T: IntoIterator<Item = (String, MetadataValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serialize for MetadataBag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for MetadataBag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BagVisitor;

        impl<'de> Visitor<'de> for BagVisitor {
            type Value = MetadataBag;

            fn expecting(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
                formatter.write_str("a metadata object")
            }

            fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, MetadataValue>()? {
                    entries.push((key, value));
                }
                Ok(MetadataBag(entries))
            }
        }

        deserializer.deserialize_map(BagVisitor)
    }
}

/// Raw discovery entry: a component identity plus its metadata bag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentDescriptor {
    pub package_id: String,
    #[serde(default)]
    pub component_name: Option<String>,
    pub native_library_dir: String,
    #[serde(default)]
    pub abi_library_dirs: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata: MetadataBag,
}

/// Lookup key of a component inside the [`DiscoverySnapshot`] it came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SourceHandle(pub usize);

/// Immutable, cheaply cloned list of discovered components in platform ranking order.
#[derive(Debug, Clone, Default)]
pub struct DiscoverySnapshot {
    components: Arc<[ComponentDescriptor]>,
}

impl DiscoverySnapshot {
    #[must_use]
    pub fn new(components: Vec<ComponentDescriptor>) -> Self {
        Self {
            components: components.into(),
        }
    }

    #[must_use]
    pub fn get(&self, handle: SourceHandle) -> Option<&ComponentDescriptor> {
        self.components.get(handle.0)
    }

    pub fn entries(&self) -> impl Iterator<Item = (SourceHandle, &ComponentDescriptor)> {
        self.components
            .iter()
            .enumerate()
            .map(|(index, component)| (SourceHandle(index), component))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}

impl From<Vec<ComponentDescriptor>> for DiscoverySnapshot {
    fn from(components: Vec<ComponentDescriptor>) -> Self {
        Self::new(components)
    }
}

/// Maps a component and architecture to the directory holding its library.
pub trait LibraryDirResolver: Send + Sync {
    fn native_library_dir(&self, component: &ComponentDescriptor, architecture: &str) -> String;
}

/// Uses the per-architecture directory when the component declares one.
///
/// Otherwise falls back to the component's default library directory, which may
/// belong to a different architecture.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstallDirResolver;

impl LibraryDirResolver for InstallDirResolver {
    fn native_library_dir(&self, component: &ComponentDescriptor, architecture: &str) -> String {
        component
            .abi_library_dirs
            .get(architecture)
            .cloned()
            .unwrap_or_else(|| component.native_library_dir.clone())
    }
}

/// One validated runtime candidate.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct CandidateRecord {
    package_id: String,
    native_library_dir: String,
    so_filename: String,
    major_version: u32,
    functions: BTreeMap<String, String>,
    broker_kind: BrokerKind,
    #[serde(skip)]
    source: Option<SourceHandle>,
}

impl CandidateRecord {
    /// Build a record from already-extracted fields.
    ///
    /// # Errors
    /// Returns [`BrokerError::InvalidArgument`] when the package id or library
    /// filename is empty, a function name breaks the naming grammar, or a
    /// symbol name is empty.
    pub fn new(
        package_id: &str,
        native_library_dir: &str,
        so_filename: &str,
        major_version: u32,
        functions: BTreeMap<String, String>,
        broker_kind: Option<BrokerKind>,
    ) -> Result<Self, BrokerError> {
        if package_id.is_empty() {
            return Err(BrokerError::InvalidArgument("package_id MUST be non-empty".to_string()));
        }
        if so_filename.is_empty() {
            return Err(BrokerError::InvalidArgument("so_filename MUST be non-empty".to_string()));
        }
        for (function, symbol) in &functions {
            if !is_function_name(function) {
                return Err(BrokerError::InvalidArgument(format!(
                    "function name does not follow the xrUpperCamelCase grammar: {function}"
                )));
            }
            if symbol.is_empty() {
                return Err(BrokerError::InvalidArgument(format!(
                    "symbol name for {function} MUST be non-empty"
                )));
            }
        }

        Ok(Self {
            package_id: package_id.to_string(),
            native_library_dir: native_library_dir.to_string(),
            so_filename: so_filename.to_string(),
            major_version,
            functions,
            broker_kind: broker_kind.unwrap_or(BrokerKind::Installable),
            source: None,
        })
    }

    #[must_use]
    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    #[must_use]
    pub fn native_library_dir(&self) -> &str {
        &self.native_library_dir
    }

    #[must_use]
    pub fn so_filename(&self) -> &str {
        &self.so_filename
    }

    #[must_use]
    pub fn major_version(&self) -> u32 {
        self.major_version
    }

    #[must_use]
    pub fn functions(&self) -> &BTreeMap<String, String> {
        &self.functions
    }

    #[must_use]
    pub fn has_functions(&self) -> bool {
        !self.functions.is_empty()
    }

    #[must_use]
    pub fn broker_kind(&self) -> BrokerKind {
        self.broker_kind
    }

    #[must_use]
    pub fn source(&self) -> Option<SourceHandle> {
        self.source
    }

    /// Same record, answered on behalf of `broker_kind`.
    #[must_use]
    pub fn with_broker_kind(mut self, broker_kind: BrokerKind) -> Self {
        self.broker_kind = broker_kind;
        self
    }
}

/// Turn one discovery entry into a candidate for `architecture`.
///
/// Returns `None` when the entry does not declare a library filename and an
/// integer major version. Individual function entries that are malformed are
/// dropped without rejecting the entry.
#[must_use]
pub fn build_candidate(
    component: &ComponentDescriptor,
    handle: SourceHandle,
    architecture: &str,
    libraries: &dyn LibraryDirResolver,
) -> Option<CandidateRecord> {
    if component.package_id.is_empty() {
        debug!(?handle, "component without package id skipped");
        return None;
    }

    let Some(so_filename) = component
        .metadata
        .get(SO_FILENAME_METADATA_KEY)
        .and_then(MetadataValue::as_str)
        .filter(|value| !value.is_empty())
    else {
        debug!(package = %component.package_id, "missing {SO_FILENAME_METADATA_KEY}");
        return None;
    };

    let Some(major_version) = component
        .metadata
        .get(MAJOR_VERSION_METADATA_KEY)
        .and_then(MetadataValue::as_integer)
        .and_then(|value| u32::try_from(value).ok())
    else {
        debug!(
            package = %component.package_id,
            "missing or non-integer {MAJOR_VERSION_METADATA_KEY}"
        );
        return None;
    };

    Some(CandidateRecord {
        package_id: component.package_id.clone(),
        native_library_dir: libraries.native_library_dir(component, architecture),
        so_filename: so_filename.to_string(),
        major_version,
        functions: collect_functions(&component.package_id, &component.metadata),
        broker_kind: BrokerKind::Installable,
        source: Some(handle),
    })
}

fn collect_functions(package_id: &str, metadata: &MetadataBag) -> BTreeMap<String, String> {
    let mut functions = BTreeMap::new();
    for (key, value) in metadata.iter() {
        let Some(function) = key.strip_prefix(FUNCTIONS_METADATA_PREFIX) else {
            continue;
        };
        if !is_function_name(function) {
            debug!(package = package_id, key, "function key does not name an API function");
            continue;
        }
        let Some(symbol) = value.as_str().filter(|symbol| !symbol.is_empty()) else {
            debug!(package = package_id, key, "function symbol is not a non-empty string");
            continue;
        };
        match functions.get(function) {
            Some(existing) if existing != symbol => {
                debug!(
                    package = package_id,
                    function,
                    kept = %existing,
                    "duplicate function entry ignored"
                );
            }
            Some(_) => {}
            None => {
                functions.insert(function.to_string(), symbol.to_string());
            }
        }
    }
    functions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(metadata: MetadataBag) -> ComponentDescriptor {
        ComponentDescriptor {
            package_id: "com.example.runtime".to_string(),
            component_name: Some("com.example.runtime.OpenXRService".to_string()),
            native_library_dir: "/data/app/com.example.runtime/lib/arm64".to_string(),
            abi_library_dirs: BTreeMap::new(),
            metadata,
        }
    }

    fn required() -> MetadataBag {
        MetadataBag::new()
            .with(SO_FILENAME_METADATA_KEY, "libexample_openxr.so")
            .with(MAJOR_VERSION_METADATA_KEY, 1)
    }

    fn build(metadata: MetadataBag) -> Option<CandidateRecord> {
        build_candidate(&component(metadata), SourceHandle(0), "arm64-v8a", &InstallDirResolver)
    }

    #[test]
    fn entry_missing_required_metadata_is_rejected() {
        assert!(build(MetadataBag::new().with(MAJOR_VERSION_METADATA_KEY, 1)).is_none());
        assert!(build(MetadataBag::new().with(SO_FILENAME_METADATA_KEY, "libx.so")).is_none());
        assert!(build(
            MetadataBag::new()
                .with(SO_FILENAME_METADATA_KEY, "libx.so")
                .with(MAJOR_VERSION_METADATA_KEY, "1")
        )
        .is_none());
        assert!(build(
            MetadataBag::new()
                .with(SO_FILENAME_METADATA_KEY, "libx.so")
                .with(MAJOR_VERSION_METADATA_KEY, -1)
        )
        .is_none());
        assert!(build(
            MetadataBag::new()
                .with(SO_FILENAME_METADATA_KEY, "")
                .with(MAJOR_VERSION_METADATA_KEY, 1)
        )
        .is_none());
    }

    #[test]
    fn function_entries_become_the_remapping_table() {
        let record = build(required().with(
            "org.khronos.openxr.OpenXRRuntime.Functions.xrCreateInstance",
            "xrCreateInstance_impl",
        ));
        let Some(record) = record else {
            panic!("candidate should build");
        };

        let expected = BTreeMap::from([(
            "xrCreateInstance".to_string(),
            "xrCreateInstance_impl".to_string(),
        )]);
        assert_eq!(record.functions(), &expected);
        assert!(record.has_functions());
        assert_eq!(record.so_filename(), "libexample_openxr.so");
        assert_eq!(record.major_version(), 1);
        assert_eq!(record.broker_kind(), BrokerKind::Installable);
        assert_eq!(record.source(), Some(SourceHandle(0)));
    }

    #[test]
    fn malformed_function_entries_are_dropped_without_rejecting_the_candidate() {
        let record = build(
            required()
                .with("org.khronos.openxr.OpenXRRuntime.Functions.notAFunction", "sym")
                .with("org.khronos.openxr.OpenXRRuntime.Functions.xrcreateInstance", "sym")
                .with("org.khronos.openxr.OpenXRRuntime.Functions.xrGetSystem", "")
                .with("org.khronos.openxr.OpenXRRuntime.Functions.xrPollEvent", 3)
                .with("org.khronos.openxr.OpenXRRuntime.Functions.xrGetInstanceProcAddr", "gipa"),
        );
        let Some(record) = record else {
            panic!("candidate should build despite malformed function entries");
        };

        assert_eq!(record.functions().len(), 1);
        assert_eq!(
            record.functions().get("xrGetInstanceProcAddr").map(String::as_str),
            Some("gipa")
        );
    }

    #[test]
    fn first_declared_symbol_wins_for_duplicate_function_names() {
        let key = "org.khronos.openxr.OpenXRRuntime.Functions.xrCreateSession";
        let record = build(required().with(key, "first_symbol").with(key, "second_symbol"));
        let Some(record) = record else {
            panic!("candidate should build");
        };
        assert_eq!(
            record.functions().get("xrCreateSession").map(String::as_str),
            Some("first_symbol")
        );
    }

    #[test]
    fn library_dir_prefers_architecture_specific_directory() {
        let mut descriptor = component(required());
        descriptor
            .abi_library_dirs
            .insert("armeabi-v7a".to_string(), "/data/app/com.example.runtime/lib/arm".to_string());

        let arm = build_candidate(&descriptor, SourceHandle(3), "armeabi-v7a", &InstallDirResolver);
        let x86 = build_candidate(&descriptor, SourceHandle(3), "x86_64", &InstallDirResolver);

        assert_eq!(
            arm.as_ref().map(CandidateRecord::native_library_dir),
            Some("/data/app/com.example.runtime/lib/arm")
        );
        assert_eq!(
            x86.as_ref().map(CandidateRecord::native_library_dir),
            Some("/data/app/com.example.runtime/lib/arm64")
        );
    }

    #[test]
    fn function_name_grammar_matches_api_naming() {
        for name in [
            "xrCreateInstance",
            "xrGetVulkanGraphicsRequirements2KHR",
            "xrA",
            "xrCreateSwapchainAndroidSurfaceKHR",
        ] {
            assert!(is_function_name(name), "{name} should match");
        }
        for name in ["notAFunction", "xr", "xrcreate", "XrCreate", "xrCreate_Instance", ""] {
            assert!(!is_function_name(name), "{name} should not match");
        }
    }

    #[test]
    fn new_enforces_record_invariants() {
        let bad_name = BTreeMap::from([("createInstance".to_string(), "sym".to_string())]);
        let empty_symbol = BTreeMap::from([("xrCreateInstance".to_string(), String::new())]);

        assert!(CandidateRecord::new("pkg", "/lib", "", 1, BTreeMap::new(), None).is_err());
        assert!(CandidateRecord::new("", "/lib", "lib.so", 1, BTreeMap::new(), None).is_err());
        assert!(CandidateRecord::new("pkg", "/lib", "lib.so", 1, bad_name, None).is_err());
        assert!(CandidateRecord::new("pkg", "/lib", "lib.so", 1, empty_symbol, None).is_err());

        match CandidateRecord::new("pkg", "/lib", "lib.so", 1, BTreeMap::new(), None) {
            Ok(record) => assert_eq!(record.broker_kind(), BrokerKind::Installable),
            Err(err) => panic!("record should build: {err}"),
        }
    }

    #[test]
    fn metadata_bag_keeps_declaration_order_and_duplicates() {
        let json = r#"{
            "org.khronos.openxr.OpenXRRuntime.SoFilename": "libx.so",
            "org.khronos.openxr.OpenXRRuntime.MajorVersion": 1,
            "org.khronos.openxr.OpenXRRuntime.Functions.xrCreateInstance": "a",
            "org.khronos.openxr.OpenXRRuntime.Functions.xrCreateInstance": "b",
            "vendor.flag": true
        }"#;
        let bag: MetadataBag = match serde_json::from_str(json) {
            Ok(bag) => bag,
            Err(err) => panic!("metadata should deserialize: {err}"),
        };

        assert_eq!(bag.len(), 5);
        assert_eq!(bag.get("vendor.flag"), Some(&MetadataValue::Bool(true)));
        let record = build(bag);
        assert_eq!(
            record
                .as_ref()
                .and_then(|record| record.functions().get("xrCreateInstance"))
                .map(String::as_str),
            Some("a")
        );
    }
}
