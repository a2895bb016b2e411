//! Broker protocol and resolution model for locating the active OpenXR runtime.
//!
//! The crate is transport-agnostic: callers hand it a discovery snapshot and a
//! canonical content address, and receive structured addresses, candidate
//! records, and tabular results back.

pub mod address;
pub mod candidate;
pub mod query;
pub mod resolver;

pub use address::{
    Address, AddressParser, BrokerKind, BrokerTable, SupportedAbis, TableKind, ABI_PATH,
    ACTIVE_RUNTIME_TABLE_PATH, BASE_PATH, CONTENT_SCHEME, FUNCTIONS_TABLE_PATH, RUNTIMES_PATH,
};
pub use candidate::{
    build_candidate, is_function_name, CandidateRecord, ComponentDescriptor, DiscoverySnapshot,
    InstallDirResolver, LibraryDirResolver, MetadataBag, MetadataValue, SourceHandle,
    FUNCTIONS_METADATA_PREFIX, MAJOR_VERSION_METADATA_KEY, SO_FILENAME_METADATA_KEY,
};
pub use query::{
    active_runtime_columns, functions_columns, BrokerQueryService, Cell, TabularResult,
    FUNCTION_NAME_COLUMN, HAS_FUNCTIONS_COLUMN, ID_COLUMN, NATIVE_LIB_DIR_COLUMN,
    PACKAGE_NAME_COLUMN, SO_FILENAME_COLUMN, SYMBOL_NAME_COLUMN,
};
pub use resolver::{select_first_match, DiscoverySource, Resolver, SelectionPolicy};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BrokerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("malformed address: {0}")]
    MalformedAddress(String),
    #[error("invalid column: {0}")]
    InvalidColumn(String),
}

/// Failure reported by an external discovery collaborator.
///
/// The resolver never propagates this; it is logged and treated as an empty
/// candidate set.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("discovery failed: {0}")]
pub struct DiscoveryError(pub String);
