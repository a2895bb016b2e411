use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use runtime_broker_core::{
    Address, AddressParser, BrokerError, BrokerKind, BrokerQueryService, CandidateRecord,
    ComponentDescriptor, DiscoverySnapshot, Resolver, SelectionPolicy, SupportedAbis, TableKind,
    TabularResult,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const DEFAULT_SNAPSHOT_PATH: &str = "./runtime_snapshot.json";

/// Settings shared by every transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub snapshot: PathBuf,
    pub supported_abis: SupportedAbis,
    pub proxy_system_broker: bool,
    pub preferred_runtime: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            snapshot: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            supported_abis: SupportedAbis::host(),
            proxy_system_broker: true,
            preferred_runtime: None,
        }
    }
}

/// On-disk discovery snapshot, one component list per broker kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SnapshotDocument {
    #[serde(default)]
    pub installable: Vec<ComponentDescriptor>,
    #[serde(default)]
    pub system: Vec<ComponentDescriptor>,
}

/// One immutable view of the snapshot file, taken at the start of an api call.
#[derive(Debug, Clone, Default)]
pub struct BrokerSnapshot {
    pub snapshot_id: Option<String>,
    pub installable: DiscoverySnapshot,
    pub system: DiscoverySnapshot,
}

impl BrokerSnapshot {
    /// Read `path`; a missing or unparsable file is logged and yields an empty snapshot.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(path = %path.display(), %err, "discovery snapshot unreadable");
                return Self::default();
            }
        };
        let document = match serde_json::from_slice::<SnapshotDocument>(&bytes) {
            Ok(document) => document,
            Err(err) => {
                warn!(path = %path.display(), %err, "discovery snapshot malformed");
                return Self::default();
            }
        };
        let snapshot_id = compute_snapshot_id(&bytes);
        debug!(
            path = %path.display(),
            %snapshot_id,
            installable = document.installable.len(),
            system = document.system.len(),
            "loaded discovery snapshot"
        );
        Self {
            snapshot_id: Some(snapshot_id),
            installable: DiscoverySnapshot::new(document.installable),
            system: DiscoverySnapshot::new(document.system),
        }
    }
}

#[must_use]
pub fn compute_snapshot_id(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("snap_{}", &digest_hex[..16])
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MakeAddressRequest {
    pub broker_kind: BrokerKind,
    pub table: TableKind,
    pub major_version: u32,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub package_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AddressResponse {
    pub uri: String,
    pub mime_type: String,
    pub address: Address,
}

impl From<Address> for AddressResponse {
    fn from(address: Address) -> Self {
        Self {
            uri: address.to_uri(),
            mime_type: address.mime_type(),
            address,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParseAddressRequest {
    pub uri: String,
    /// Parser to bind; every broker kind is tried when absent.
    #[serde(default)]
    pub broker_kind: Option<BrokerKind>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ParseAddressResponse {
    pub uri: String,
    pub matched: bool,
    pub address: Option<AddressResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRequest {
    pub uri: String,
    #[serde(default)]
    pub broker_kind: Option<BrokerKind>,
    #[serde(default)]
    pub projection: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueryResponse {
    pub snapshot_id: Option<String>,
    pub broker_kind: BrokerKind,
    pub uri: String,
    pub mime_type: String,
    pub result: TabularResult,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ListRuntimesRequest {
    #[serde(default)]
    pub major_version: Option<u32>,
    #[serde(default)]
    pub architecture: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuntimeEntry {
    pub broker_kind: BrokerKind,
    pub package_id: String,
    pub major_version: u32,
    pub native_library_dir: String,
    pub so_filename: String,
    pub function_count: usize,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuntimeListing {
    pub snapshot_id: Option<String>,
    pub architecture: String,
    pub runtimes: Vec<RuntimeEntry>,
}

#[derive(Debug, Clone)]
pub struct RuntimeBrokerApi {
    config: BrokerConfig,
}

impl RuntimeBrokerApi {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn open_snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot::load(&self.config.snapshot)
    }

    fn system_resolver(snapshot: &BrokerSnapshot) -> Resolver {
        Resolver::new(BrokerKind::SystemProvided, Arc::new(snapshot.system.clone()))
    }

    fn installable_resolver(&self, snapshot: &BrokerSnapshot) -> Resolver {
        let policy = match &self.config.preferred_runtime {
            Some(package_id) => SelectionPolicy::Preferred(package_id.clone()),
            None => SelectionPolicy::FirstMatch,
        };
        let resolver =
            Resolver::new(BrokerKind::Installable, Arc::new(snapshot.installable.clone()))
                .with_policy(policy);
        if self.config.proxy_system_broker {
            resolver.with_proxy(Self::system_resolver(snapshot))
        } else {
            resolver
        }
    }

    fn resolver(&self, snapshot: &BrokerSnapshot, broker_kind: BrokerKind) -> Resolver {
        match broker_kind {
            BrokerKind::Installable => self.installable_resolver(snapshot),
            BrokerKind::SystemProvided => Self::system_resolver(snapshot),
        }
    }

    /// Build the canonical address for a table of one broker.
    ///
    /// # Errors
    /// Returns an error when a functions address lacks a package id, or the
    /// inputs violate the address contract.
    pub fn make_address(&self, input: MakeAddressRequest) -> Result<AddressResponse> {
        let abis = &self.config.supported_abis;
        let architecture = input.architecture.as_deref();
        let address = match input.table {
            TableKind::ActiveRuntime => {
                Address::active_runtime(input.broker_kind, input.major_version, architecture, abis)?
            }
            TableKind::Functions => {
                let package_id = input.package_id.as_deref().ok_or_else(|| {
                    BrokerError::InvalidArgument(
                        "package_id is required for the functions table".to_string(),
                    )
                })?;
                Address::functions(
                    input.broker_kind,
                    input.major_version,
                    package_id,
                    architecture,
                    abis,
                )?
            }
        };
        Ok(AddressResponse::from(address))
    }

    /// Decode a URI; a URI that names no broker table is reported, not rejected.
    #[must_use]
    pub fn parse_address(&self, input: &ParseAddressRequest) -> ParseAddressResponse {
        let address = parse_for(input.broker_kind, &input.uri);
        ParseAddressResponse {
            uri: input.uri.clone(),
            matched: address.is_some(),
            address: address.map(AddressResponse::from),
        }
    }

    /// Answer a broker URI against a fresh snapshot.
    ///
    /// # Errors
    /// Returns an error when the URI is not an address of the requested broker,
    /// or the projection names an unknown column.
    pub fn query(&self, input: QueryRequest) -> Result<QueryResponse> {
        let address = parse_for(input.broker_kind, &input.uri).ok_or_else(|| {
            BrokerError::MalformedAddress(format!("{} is not a broker address", input.uri))
        })?;
        let snapshot = self.open_snapshot();
        let service = BrokerQueryService::new(self.resolver(&snapshot, address.broker_kind()));
        let result = service
            .handle_projected(&address, input.projection.as_deref())
            .with_context(|| format!("query {}", input.uri))?;

        Ok(QueryResponse {
            snapshot_id: snapshot.snapshot_id,
            broker_kind: address.broker_kind(),
            uri: address.to_uri(),
            mime_type: address.mime_type(),
            result,
        })
    }

    /// Every valid runtime of both brokers, newest major version first.
    ///
    /// # Errors
    /// Returns an error when no architecture is given and none is configured.
    pub fn list_runtimes(&self, input: &ListRuntimesRequest) -> Result<RuntimeListing> {
        let architecture = match &input.architecture {
            Some(architecture) => architecture.clone(),
            None => self
                .config
                .supported_abis
                .primary()
                .map(ToString::to_string)
                .ok_or_else(|| {
                    anyhow!("architecture omitted and no supported architecture is configured")
                })?,
        };

        let snapshot = self.open_snapshot();
        let installable = self.installable_resolver(&snapshot);
        let system = Self::system_resolver(&snapshot);

        let mut candidates = installable.candidates(&architecture);
        candidates.extend(system.candidates(&architecture));
        if let Some(major_version) = input.major_version {
            candidates.retain(|candidate| candidate.major_version() == major_version);
        }
        candidates.sort_by(|left, right| right.major_version().cmp(&left.major_version()));

        // Versions are contiguous after sorting, so one cached answer suffices.
        let mut active: Option<(u32, Option<CandidateRecord>)> = None;
        let runtimes = candidates
            .into_iter()
            .map(|candidate| {
                let major_version = candidate.major_version();
                let selected = match &active {
                    Some((version, selected)) if *version == major_version => selected.clone(),
                    _ => {
                        let selected = installable
                            .active_runtime(major_version, &architecture)
                            .or_else(|| system.active_runtime(major_version, &architecture));
                        active = Some((major_version, selected.clone()));
                        selected
                    }
                };
                let is_active = selected.is_some_and(|selected| {
                    selected.broker_kind() == candidate.broker_kind()
                        && selected.package_id() == candidate.package_id()
                });
                RuntimeEntry {
                    broker_kind: candidate.broker_kind(),
                    package_id: candidate.package_id().to_string(),
                    major_version,
                    native_library_dir: candidate.native_library_dir().to_string(),
                    so_filename: candidate.so_filename().to_string(),
                    function_count: candidate.functions().len(),
                    active: is_active,
                }
            })
            .collect();

        Ok(RuntimeListing {
            snapshot_id: snapshot.snapshot_id,
            architecture,
            runtimes,
        })
    }
}

fn parse_for(broker_kind: Option<BrokerKind>, uri: &str) -> Option<Address> {
    match broker_kind {
        Some(broker_kind) => AddressParser::new(broker_kind).parse(uri),
        None => BrokerKind::ALL.into_iter().find_map(|kind| AddressParser::new(kind).parse(uri)),
    }
}
