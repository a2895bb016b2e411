use serde::{Deserialize, Serialize};
use tracing::info;

use crate::address::{AddressParser, BrokerTable};
use crate::candidate::CandidateRecord;
use crate::resolver::Resolver;
use crate::{Address, BrokerError, BrokerKind};

pub const ID_COLUMN: &str = "_id";
pub const PACKAGE_NAME_COLUMN: &str = "package_name";
pub const NATIVE_LIB_DIR_COLUMN: &str = "native_lib_dir";
pub const SO_FILENAME_COLUMN: &str = "so_filename";
pub const HAS_FUNCTIONS_COLUMN: &str = "has_functions";
pub const FUNCTION_NAME_COLUMN: &str = "function_name";
pub const SYMBOL_NAME_COLUMN: &str = "symbol_name";

const ACTIVE_RUNTIME_COLUMNS: [&str; 5] = [
    ID_COLUMN,
    PACKAGE_NAME_COLUMN,
    NATIVE_LIB_DIR_COLUMN,
    SO_FILENAME_COLUMN,
    HAS_FUNCTIONS_COLUMN,
];
const FUNCTIONS_COLUMNS: [&str; 2] = [FUNCTION_NAME_COLUMN, SYMBOL_NAME_COLUMN];
// Selectable on the functions table but not part of its default column set.
const FUNCTIONS_HIDDEN_COLUMNS: [&str; 1] = [ID_COLUMN];

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum Cell {
    Integer(i64),
    Text(String),
}

impl Cell {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            Self::Integer(_) => None,
        }
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Text(_) => None,
        }
    }
}

/// Column names plus zero or more rows, each with one cell per column.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct TabularResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl TabularResult {
    #[must_use]
    pub fn empty(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Cell of `column` in row `row`.
    #[must_use]
    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let index = self.columns.iter().position(|name| name == column)?;
        self.rows.get(row)?.get(index)
    }
}

#[must_use]
pub fn active_runtime_columns() -> Vec<String> {
    ACTIVE_RUNTIME_COLUMNS.iter().map(ToString::to_string).collect()
}

#[must_use]
pub fn functions_columns() -> Vec<String> {
    FUNCTIONS_COLUMNS.iter().map(ToString::to_string).collect()
}

/// Answers broker addresses with tabular results on behalf of one broker kind.
#[derive(Debug, Clone)]
pub struct BrokerQueryService {
    resolver: Resolver,
    parser: AddressParser,
}

impl BrokerQueryService {
    #[must_use]
    pub fn new(resolver: Resolver) -> Self {
        let parser = AddressParser::new(resolver.broker_kind());
        Self { resolver, parser }
    }

    #[must_use]
    pub fn broker_kind(&self) -> BrokerKind {
        self.resolver.broker_kind()
    }

    #[must_use]
    pub fn parser(&self) -> AddressParser {
        self.parser
    }

    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Answer `address` with the table's default columns.
    ///
    /// Missing runtimes and runtimes without functions produce zero rows.
    ///
    /// # Errors
    /// Returns [`BrokerError::MalformedAddress`] when `address` belongs to the
    /// other broker kind.
    pub fn handle(&self, address: &Address) -> Result<TabularResult, BrokerError> {
        self.handle_projected(address, None)
    }

    /// Answer `address`, keeping only `projection` columns in the requested order.
    ///
    /// # Errors
    /// Returns [`BrokerError::MalformedAddress`] when `address` belongs to the
    /// other broker kind, and [`BrokerError::InvalidColumn`] when the projection
    /// names a column the table does not have.
    pub fn handle_projected(
        &self,
        address: &Address,
        projection: Option<&[String]>,
    ) -> Result<TabularResult, BrokerError> {
        if address.broker_kind() != self.broker_kind() {
            return Err(BrokerError::MalformedAddress(format!(
                "{} broker cannot answer {address}",
                self.broker_kind()
            )));
        }

        let (defaults, hidden): (&[&str], &[&str]) = match address.table() {
            BrokerTable::ActiveRuntime { .. } => {
                (ACTIVE_RUNTIME_COLUMNS.as_slice(), [].as_slice())
            }
            BrokerTable::Functions { .. } => {
                (FUNCTIONS_COLUMNS.as_slice(), FUNCTIONS_HIDDEN_COLUMNS.as_slice())
            }
        };
        let columns = match projection {
            None => defaults.iter().map(ToString::to_string).collect::<Vec<_>>(),
            Some(requested) => {
                for column in requested {
                    let known = defaults.iter().chain(hidden).any(|name| *name == column.as_str());
                    if !known {
                        return Err(BrokerError::InvalidColumn(format!(
                            "{column} is not a column of the {} table",
                            address.table_kind().as_str()
                        )));
                    }
                }
                requested.to_vec()
            }
        };

        let rows = match address.table() {
            BrokerTable::ActiveRuntime { row } => {
                self.active_runtime_rows(address, *row, &columns)
            }
            BrokerTable::Functions { package_id } => {
                self.function_rows(address, package_id, &columns)
            }
        };
        Ok(TabularResult { columns, rows })
    }

    /// Decode `uri` with this broker's parser and answer it.
    ///
    /// # Errors
    /// Returns [`BrokerError::MalformedAddress`] when `uri` is not an address of
    /// this broker, and [`BrokerError::InvalidColumn`] for an unknown projection column.
    pub fn handle_uri(
        &self,
        uri: &str,
        projection: Option<&[String]>,
    ) -> Result<TabularResult, BrokerError> {
        let Some(address) = self.parser.parse(uri) else {
            return Err(BrokerError::MalformedAddress(format!(
                "{uri} is not a {} broker address",
                self.broker_kind()
            )));
        };
        self.handle_projected(&address, projection)
    }

    /// Content type of `uri`, when it is an address of this broker.
    #[must_use]
    pub fn mime_type(&self, uri: &str) -> Option<String> {
        self.parser.parse(uri).as_ref().map(Address::mime_type)
    }

    fn active_runtime_rows(
        &self,
        address: &Address,
        row: u32,
        columns: &[String],
    ) -> Vec<Vec<Cell>> {
        if row != 0 {
            return Vec::new();
        }
        let Some(runtime) =
            self.resolver.active_runtime(address.major_version(), address.architecture())
        else {
            return Vec::new();
        };
        info!(
            broker = %self.broker_kind(),
            major_version = address.major_version(),
            architecture = address.architecture(),
            package = runtime.package_id(),
            provided_by = %runtime.broker_kind(),
            "active runtime"
        );
        vec![columns.iter().filter_map(|column| active_runtime_cell(&runtime, column)).collect()]
    }

    fn function_rows(
        &self,
        address: &Address,
        package_id: &str,
        columns: &[String],
    ) -> Vec<Vec<Cell>> {
        let Some(runtime) = self.resolver.find_runtime(
            address.major_version(),
            address.architecture(),
            package_id,
        ) else {
            return Vec::new();
        };
        runtime
            .functions()
            .iter()
            .zip(0_i64..)
            .map(|((function, symbol), id)| {
                columns
                    .iter()
                    .filter_map(|column| match column.as_str() {
                        ID_COLUMN => Some(Cell::Integer(id)),
                        FUNCTION_NAME_COLUMN => Some(Cell::Text(function.clone())),
                        SYMBOL_NAME_COLUMN => Some(Cell::Text(symbol.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .collect()
    }
}

fn active_runtime_cell(runtime: &CandidateRecord, column: &str) -> Option<Cell> {
    let cell = match column {
        ID_COLUMN => Cell::Integer(0),
        PACKAGE_NAME_COLUMN => Cell::Text(runtime.package_id().to_string()),
        NATIVE_LIB_DIR_COLUMN => Cell::Text(runtime.native_library_dir().to_string()),
        SO_FILENAME_COLUMN => Cell::Text(runtime.so_filename().to_string()),
        HAS_FUNCTIONS_COLUMN => Cell::Integer(i64::from(runtime.has_functions())),
        _ => return None,
    };
    Some(cell)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::address::SupportedAbis;
    use crate::candidate::{
        ComponentDescriptor, DiscoverySnapshot, LibraryDirResolver, MetadataBag,
        FUNCTIONS_METADATA_PREFIX, MAJOR_VERSION_METADATA_KEY, SO_FILENAME_METADATA_KEY,
    };

    const ARCH: &str = "arm64-v8a";

    fn runtime(package_id: &str, functions: &[(&str, &str)]) -> ComponentDescriptor {
        let mut metadata = MetadataBag::new()
            .with(SO_FILENAME_METADATA_KEY, "libopenxr_runtime.so")
            .with(MAJOR_VERSION_METADATA_KEY, 1);
        for (function, symbol) in functions {
            metadata = metadata.with(&format!("{FUNCTIONS_METADATA_PREFIX}{function}"), *symbol);
        }
        ComponentDescriptor {
            package_id: package_id.to_string(),
            component_name: None,
            native_library_dir: format!("/data/app/{package_id}/lib/arm64"),
            abi_library_dirs: BTreeMap::new(),
            metadata,
        }
    }

    fn service(kind: BrokerKind, components: Vec<ComponentDescriptor>) -> BrokerQueryService {
        BrokerQueryService::new(Resolver::new(kind, Arc::new(DiscoverySnapshot::new(components))))
    }

    fn abis() -> SupportedAbis {
        SupportedAbis::new(vec![ARCH.to_string()])
    }

    fn active(kind: BrokerKind) -> Address {
        match Address::active_runtime(kind, 1, Some(ARCH), &abis()) {
            Ok(address) => address,
            Err(err) => panic!("address should build: {err}"),
        }
    }

    fn functions(kind: BrokerKind, package_id: &str) -> Address {
        match Address::functions(kind, 1, package_id, Some(ARCH), &abis()) {
            Ok(address) => address,
            Err(err) => panic!("address should build: {err}"),
        }
    }

    fn answer(result: Result<TabularResult, BrokerError>) -> TabularResult {
        match result {
            Ok(result) => result,
            Err(err) => panic!("query should succeed: {err}"),
        }
    }

    #[test]
    fn active_runtime_query_returns_single_row() {
        let service = service(
            BrokerKind::Installable,
            vec![runtime("com.example.runtime", &[("xrCreateInstance", "impl_create")])],
        );
        let result = answer(service.handle(&active(BrokerKind::Installable)));

        assert_eq!(result.columns, active_runtime_columns());
        assert_eq!(result.row_count(), 1);
        assert_eq!(result.cell(0, ID_COLUMN), Some(&Cell::Integer(0)));
        assert_eq!(
            result.cell(0, PACKAGE_NAME_COLUMN).and_then(Cell::as_str),
            Some("com.example.runtime")
        );
        assert_eq!(
            result.cell(0, NATIVE_LIB_DIR_COLUMN).and_then(Cell::as_str),
            Some("/data/app/com.example.runtime/lib/arm64")
        );
        assert_eq!(
            result.cell(0, SO_FILENAME_COLUMN).and_then(Cell::as_str),
            Some("libopenxr_runtime.so")
        );
        assert_eq!(result.cell(0, HAS_FUNCTIONS_COLUMN), Some(&Cell::Integer(1)));
    }

    struct FixedLibDir;

    impl LibraryDirResolver for FixedLibDir {
        fn native_library_dir(
            &self,
            _component: &ComponentDescriptor,
            architecture: &str,
        ) -> String {
            format!("/opt/openxr/lib/{architecture}")
        }
    }

    #[test]
    fn native_lib_dir_column_comes_from_injected_library_dir_resolver() {
        let resolver = Resolver::new(
            BrokerKind::Installable,
            Arc::new(DiscoverySnapshot::new(vec![runtime("com.example.runtime", &[])])),
        )
        .with_library_dirs(Arc::new(FixedLibDir));
        let service = BrokerQueryService::new(resolver);

        let result = answer(service.handle(&active(BrokerKind::Installable)));
        assert_eq!(
            result.cell(0, NATIVE_LIB_DIR_COLUMN).and_then(Cell::as_str),
            Some("/opt/openxr/lib/arm64-v8a")
        );
    }

    #[test]
    fn missing_runtime_yields_zero_rows_not_an_error() {
        let service = service(BrokerKind::Installable, Vec::new());
        let result = answer(service.handle(&active(BrokerKind::Installable)));
        assert!(result.is_empty());
        assert_eq!(result.columns, active_runtime_columns());

        let result =
            answer(service.handle(&functions(BrokerKind::Installable, "com.example.none")));
        assert!(result.is_empty());
        assert_eq!(result.columns, functions_columns());
    }

    #[test]
    fn non_zero_active_row_is_empty() {
        let service = service(BrokerKind::Installable, vec![runtime("com.example.runtime", &[])]);
        let result = answer(service.handle_uri(
            "content://org.khronos.openxr.runtime_broker/openxr/1/abi/arm64-v8a/runtimes/active/1",
            None,
        ));
        assert!(result.is_empty());
    }

    #[test]
    fn function_table_lists_sorted_pairs() {
        let service = service(
            BrokerKind::Installable,
            vec![runtime(
                "com.example.runtime",
                &[("xrGetSystem", "impl_system"), ("xrCreateInstance", "impl_create")],
            )],
        );
        let result =
            answer(service.handle(&functions(BrokerKind::Installable, "com.example.runtime")));

        assert_eq!(result.columns, functions_columns());
        assert_eq!(
            result.rows,
            vec![
                vec![
                    Cell::Text("xrCreateInstance".to_string()),
                    Cell::Text("impl_create".to_string())
                ],
                vec![Cell::Text("xrGetSystem".to_string()), Cell::Text("impl_system".to_string())],
            ]
        );
    }

    #[test]
    fn runtime_without_functions_reports_flag_and_empty_table() {
        let service = service(BrokerKind::Installable, vec![runtime("com.example.plain", &[])]);
        let active = answer(service.handle(&active(BrokerKind::Installable)));
        assert_eq!(active.cell(0, HAS_FUNCTIONS_COLUMN), Some(&Cell::Integer(0)));

        let table =
            answer(service.handle(&functions(BrokerKind::Installable, "com.example.plain")));
        assert!(table.is_empty());
    }

    #[test]
    fn projection_selects_and_orders_columns() {
        let service = service(
            BrokerKind::Installable,
            vec![runtime("com.example.runtime", &[("xrCreateInstance", "impl_create")])],
        );
        let projection = vec![SO_FILENAME_COLUMN.to_string(), ID_COLUMN.to_string()];
        let result =
            answer(service.handle_projected(&active(BrokerKind::Installable), Some(&projection)));
        assert_eq!(result.columns, projection);
        assert_eq!(
            result.rows,
            vec![vec![Cell::Text("libopenxr_runtime.so".to_string()), Cell::Integer(0)]]
        );

        let projection = vec![ID_COLUMN.to_string(), SYMBOL_NAME_COLUMN.to_string()];
        let result = answer(service.handle_projected(
            &functions(BrokerKind::Installable, "com.example.runtime"),
            Some(&projection),
        ));
        assert_eq!(
            result.rows,
            vec![vec![Cell::Integer(0), Cell::Text("impl_create".to_string())]]
        );
    }

    #[test]
    fn unknown_projection_column_is_rejected() {
        let service = service(BrokerKind::Installable, Vec::new());
        let projection = vec![FUNCTION_NAME_COLUMN.to_string()];
        let result = service.handle_projected(&active(BrokerKind::Installable), Some(&projection));
        assert!(matches!(result, Err(BrokerError::InvalidColumn(_))), "got {result:?}");
    }

    #[test]
    fn foreign_or_unparsable_addresses_are_malformed() {
        let service = service(BrokerKind::Installable, Vec::new());
        let foreign = service.handle(&active(BrokerKind::SystemProvided));
        assert!(matches!(foreign, Err(BrokerError::MalformedAddress(_))), "got {foreign:?}");

        let garbage = service.handle_uri("content://elsewhere/openxr/1", None);
        assert!(matches!(garbage, Err(BrokerError::MalformedAddress(_))), "got {garbage:?}");
    }

    #[test]
    fn system_runtime_is_served_through_installable_broker() {
        let system = Resolver::new(
            BrokerKind::SystemProvided,
            Arc::new(DiscoverySnapshot::new(vec![runtime(
                "com.vendor.system",
                &[("xrCreateInstance", "vendor_create")],
            )])),
        );
        let installable = BrokerQueryService::new(
            Resolver::new(BrokerKind::Installable, Arc::new(DiscoverySnapshot::default()))
                .with_proxy(system),
        );

        let active = answer(installable.handle(&active(BrokerKind::Installable)));
        assert_eq!(
            active.cell(0, PACKAGE_NAME_COLUMN).and_then(Cell::as_str),
            Some("com.vendor.system")
        );
        let table =
            answer(installable.handle(&functions(BrokerKind::Installable, "com.vendor.system")));
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn mime_type_follows_address_table() {
        let service = service(BrokerKind::SystemProvided, Vec::new());
        assert_eq!(
            service.mime_type(&functions(BrokerKind::SystemProvided, "pkg").to_uri()).as_deref(),
            Some("vnd.android.cursor.dir/vnd.org.khronos.openxr.system_runtime_broker.functions")
        );
        assert_eq!(service.mime_type(&active(BrokerKind::Installable).to_uri()), None);
    }
}
