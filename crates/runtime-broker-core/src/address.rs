//! Canonical content addresses understood by a runtime broker.
//!
//! `content://<authority>/openxr/<major>/abi/<arch>/runtimes/active/0` names the
//! active-runtime singleton, `.../runtimes/<package>/functions` names the function
//! remapping table of one runtime package.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::BrokerError;

pub const CONTENT_SCHEME: &str = "content";
pub const BASE_PATH: &str = "openxr";
pub const ABI_PATH: &str = "abi";
pub const RUNTIMES_PATH: &str = "runtimes";
pub const ACTIVE_RUNTIME_TABLE_PATH: &str = "active";
pub const FUNCTIONS_TABLE_PATH: &str = "functions";

const AUTHORITY_TABLE: [(BrokerKind, &str); 2] = [
    (BrokerKind::Installable, "org.khronos.openxr.runtime_broker"),
    (BrokerKind::SystemProvided, "org.khronos.openxr.system_runtime_broker"),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    Installable,
    SystemProvided,
}

impl BrokerKind {
    pub const ALL: [Self; 2] = [Self::Installable, Self::SystemProvided];

    /// Fixed URI authority answering for this broker kind.
    #[must_use]
    pub fn authority(self) -> &'static str {
        AUTHORITY_TABLE
            .iter()
            .find_map(|(kind, authority)| (*kind == self).then_some(*authority))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn from_authority(authority: &str) -> Option<Self> {
        AUTHORITY_TABLE
            .iter()
            .find_map(|(kind, candidate)| (*candidate == authority).then_some(*kind))
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installable => "installable",
            Self::SystemProvided => "system_provided",
        }
    }
}

impl Display for BrokerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TableKind {
    ActiveRuntime,
    Functions,
}

impl TableKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ActiveRuntime => "active_runtime",
            Self::Functions => "functions",
        }
    }
}

/// The table an address points into, carrying the fields only that table has.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum BrokerTable {
    ActiveRuntime { row: u32 },
    Functions { package_id: String },
}

impl BrokerTable {
    #[must_use]
    pub fn kind(&self) -> TableKind {
        match self {
            Self::ActiveRuntime { .. } => TableKind::ActiveRuntime,
            Self::Functions { .. } => TableKind::Functions,
        }
    }
}

/// Ordered list of architectures the caller can load, most preferred first.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(transparent)]
pub struct SupportedAbis(Vec<String>);

impl SupportedAbis {
    #[must_use]
    pub fn new(abis: Vec<String>) -> Self {
        Self(abis)
    }

    /// Architecture list for the CPU this process was compiled for.
    #[must_use]
    pub fn host() -> Self {
        let abi = match std::env::consts::ARCH {
            "aarch64" => "arm64-v8a",
            "arm" => "armeabi-v7a",
            "x86" => "x86",
            other => other,
        };
        Self(vec![abi.to_string()])
    }

    #[must_use]
    pub fn primary(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// A validated, immutable broker address.
///
/// Only the constructors and [`AddressParser::parse`] produce values of this type,
/// so every `Address` in circulation satisfies the table/package invariants.
#[derive(Debug, Clone, Serialize, Eq, PartialEq, Hash)]
pub struct Address {
    broker_kind: BrokerKind,
    major_version: u32,
    architecture: String,
    #[serde(flatten)]
    table: BrokerTable,
}

impl Address {
    /// Address of the active-runtime row for `major_version` and `architecture`.
    ///
    /// When `architecture` is `None` the primary entry of `abis` is used.
    ///
    /// # Errors
    /// Returns [`BrokerError::InvalidArgument`] when `major_version` is zero, or the
    /// architecture is missing or not a canonical path token.
    pub fn active_runtime(
        broker_kind: BrokerKind,
        major_version: u32,
        architecture: Option<&str>,
        abis: &SupportedAbis,
    ) -> Result<Self, BrokerError> {
        validate_major_version(major_version)?;
        let architecture = resolve_architecture(architecture, abis)?;
        Ok(Self {
            broker_kind,
            major_version,
            architecture,
            table: BrokerTable::ActiveRuntime { row: 0 },
        })
    }

    /// Address of the function remapping table of `package_id`.
    ///
    /// # Errors
    /// Returns [`BrokerError::InvalidArgument`] when `major_version` is zero, the
    /// package id is empty or not a canonical path token, or the architecture is invalid.
    pub fn functions(
        broker_kind: BrokerKind,
        major_version: u32,
        package_id: &str,
        architecture: Option<&str>,
        abis: &SupportedAbis,
    ) -> Result<Self, BrokerError> {
        validate_major_version(major_version)?;
        validate_token("package_id", package_id)?;
        let architecture = resolve_architecture(architecture, abis)?;
        Ok(Self {
            broker_kind,
            major_version,
            architecture,
            table: BrokerTable::Functions {
                package_id: package_id.to_string(),
            },
        })
    }

    #[must_use]
    pub fn broker_kind(&self) -> BrokerKind {
        self.broker_kind
    }

    #[must_use]
    pub fn major_version(&self) -> u32 {
        self.major_version
    }

    #[must_use]
    pub fn architecture(&self) -> &str {
        &self.architecture
    }

    #[must_use]
    pub fn table(&self) -> &BrokerTable {
        &self.table
    }

    #[must_use]
    pub fn table_kind(&self) -> TableKind {
        self.table.kind()
    }

    #[must_use]
    pub fn package_id(&self) -> Option<&str> {
        match &self.table {
            BrokerTable::Functions { package_id } => Some(package_id),
            BrokerTable::ActiveRuntime { .. } => None,
        }
    }

    #[must_use]
    pub fn row(&self) -> Option<u32> {
        match &self.table {
            BrokerTable::ActiveRuntime { row } => Some(*row),
            BrokerTable::Functions { .. } => None,
        }
    }

    /// Canonical string form, bit-exact across transports.
    #[must_use]
    pub fn to_uri(&self) -> String {
        self.to_string()
    }

    /// Content type advertised for this address.
    #[must_use]
    pub fn mime_type(&self) -> String {
        let (cardinality, table) = match self.table {
            BrokerTable::ActiveRuntime { .. } => ("item", "activeRuntime"),
            BrokerTable::Functions { .. } => ("dir", FUNCTIONS_TABLE_PATH),
        };
        format!("vnd.android.cursor.{cardinality}/vnd.{}.{table}", self.broker_kind.authority())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{CONTENT_SCHEME}://{}/{BASE_PATH}/{}/{ABI_PATH}/{}/{RUNTIMES_PATH}/",
            self.broker_kind.authority(),
            self.major_version,
            self.architecture
        )?;
        match &self.table {
            BrokerTable::ActiveRuntime { row } => write!(f, "{ACTIVE_RUNTIME_TABLE_PATH}/{row}"),
            BrokerTable::Functions { package_id } => {
                write!(f, "{package_id}/{FUNCTIONS_TABLE_PATH}")
            }
        }
    }
}

fn validate_major_version(major_version: u32) -> Result<(), BrokerError> {
    if major_version == 0 {
        return Err(BrokerError::InvalidArgument("major_version MUST be > 0".to_string()));
    }
    Ok(())
}

fn validate_token(field: &str, value: &str) -> Result<(), BrokerError> {
    if value.is_empty() {
        return Err(BrokerError::InvalidArgument(format!("{field} MUST be non-empty")));
    }
    if value == "." || value == ".." {
        return Err(BrokerError::InvalidArgument(format!("{field} MUST NOT be a dot segment")));
    }
    if !value.chars().all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-')) {
        return Err(BrokerError::InvalidArgument(format!(
            "{field} MUST contain only ASCII alphanumerics, '.', '_' or '-': {value}"
        )));
    }
    Ok(())
}

fn resolve_architecture(
    architecture: Option<&str>,
    abis: &SupportedAbis,
) -> Result<String, BrokerError> {
    let architecture = match architecture {
        Some(architecture) => architecture,
        None => abis.primary().ok_or_else(|| {
            BrokerError::InvalidArgument(
                "architecture omitted and no supported architecture is known".to_string(),
            )
        })?,
    };
    validate_token("architecture", architecture)?;
    Ok(architecture.to_string())
}

/// Decoder bound to one broker kind.
///
/// An address carrying the other broker's authority is "not mine" and yields
/// `None`, the same as any malformed input.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AddressParser {
    broker_kind: BrokerKind,
}

impl AddressParser {
    #[must_use]
    pub const fn new(broker_kind: BrokerKind) -> Self {
        Self { broker_kind }
    }

    #[must_use]
    pub fn broker_kind(&self) -> BrokerKind {
        self.broker_kind
    }

    /// Decode `candidate`; never fails, only reports absence.
    #[must_use]
    pub fn parse(&self, candidate: &str) -> Option<Address> {
        let url = match Url::parse(candidate) {
            Ok(url) => url,
            Err(err) => {
                debug!(uri = candidate, %err, "not a URI");
                return None;
            }
        };
        if url.scheme() != CONTENT_SCHEME {
            debug!(uri = candidate, scheme = url.scheme(), "unexpected URI scheme");
            return None;
        }
        let authority = self.broker_kind.authority();
        if url.host_str() != Some(authority) {
            debug!(uri = candidate, expected = authority, "URI authority belongs elsewhere");
            return None;
        }
        if !url.username().is_empty()
            || url.password().is_some()
            || url.port().is_some()
            || url.query().is_some()
            || url.fragment().is_some()
        {
            debug!(uri = candidate, "URI carries components outside the broker contract");
            return None;
        }

        let segments = url.path_segments()?.collect::<Vec<_>>();
        let Some(address) = match_segments(self.broker_kind, &segments) else {
            debug!(uri = candidate, "URI path does not match a broker table");
            return None;
        };
        // Url::parse normalizes its input; only the exact canonical spelling matches.
        if address.to_uri() != candidate {
            debug!(uri = candidate, canonical = %address, "URI is not in canonical form");
            return None;
        }
        Some(address)
    }
}

fn match_segments(broker_kind: BrokerKind, segments: &[&str]) -> Option<Address> {
    let [base, version, abi, architecture, runtimes, rest @ ..] = segments else {
        return None;
    };
    if *base != BASE_PATH || *abi != ABI_PATH || *runtimes != RUNTIMES_PATH {
        return None;
    }
    if architecture.is_empty() {
        return None;
    }
    let major_version = parse_number(version).filter(|value| *value > 0)?;

    let table = match rest {
        [ACTIVE_RUNTIME_TABLE_PATH, row] if parse_number(row).is_some() => {
            BrokerTable::ActiveRuntime {
                row: parse_number(row)?,
            }
        }
        [package_id, FUNCTIONS_TABLE_PATH] if !package_id.is_empty() => {
            BrokerTable::Functions {
                package_id: (*package_id).to_string(),
            }
        }
        _ => return None,
    };

    Some(Address {
        broker_kind,
        major_version,
        architecture: (*architecture).to_string(),
        table,
    })
}

fn parse_number(segment: &str) -> Option<u32> {
    if segment.is_empty() || !segment.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}
