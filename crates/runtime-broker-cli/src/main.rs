use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use runtime_broker_api::{
    BrokerConfig, ListRuntimesRequest, MakeAddressRequest, ParseAddressRequest, QueryRequest,
    RuntimeBrokerApi, API_CONTRACT_VERSION, DEFAULT_SNAPSHOT_PATH,
};
use runtime_broker_core::{BrokerKind, SupportedAbis, TableKind};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "xrb")]
#[command(about = "OpenXR runtime broker CLI")]
struct Cli {
    #[arg(long, default_value = DEFAULT_SNAPSHOT_PATH)]
    snapshot: PathBuf,

    /// Supported architecture, most preferred first; repeat for more.
    #[arg(long = "abi")]
    abis: Vec<String>,

    #[arg(long, default_value_t = false)]
    no_system_proxy: bool,

    #[arg(long)]
    preferred_runtime: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Address {
        #[command(subcommand)]
        command: AddressCommand,
    },
    Parse(ParseArgs),
    Query(QueryArgs),
    Runtimes {
        #[command(subcommand)]
        command: RuntimesCommand,
    },
}

#[derive(Debug, Subcommand)]
enum AddressCommand {
    Active(AddressArgs),
    Functions(FunctionsAddressArgs),
}

#[derive(Debug, Args)]
struct AddressArgs {
    #[arg(long, value_enum, default_value_t = BrokerArg::Installable)]
    broker: BrokerArg,
    #[arg(long)]
    major: u32,
    #[arg(long)]
    arch: Option<String>,
}

#[derive(Debug, Args)]
struct FunctionsAddressArgs {
    #[command(flatten)]
    address: AddressArgs,
    #[arg(long)]
    package: String,
}

#[derive(Debug, Args)]
struct ParseArgs {
    uri: String,
    #[arg(long, value_enum)]
    broker: Option<BrokerArg>,
}

#[derive(Debug, Args)]
struct QueryArgs {
    uri: String,
    #[arg(long, value_enum)]
    broker: Option<BrokerArg>,
    /// Column to return, in order; repeat for more. All columns when omitted.
    #[arg(long = "column")]
    columns: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum RuntimesCommand {
    List(ListArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    major: Option<u32>,
    #[arg(long)]
    arch: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BrokerArg {
    Installable,
    System,
}

impl From<BrokerArg> for BrokerKind {
    fn from(value: BrokerArg) -> Self {
        match value {
            BrokerArg::Installable => Self::Installable,
            BrokerArg::System => Self::SystemProvided,
        }
    }
}

impl Cli {
    fn config(&self) -> BrokerConfig {
        BrokerConfig {
            snapshot: self.snapshot.clone(),
            supported_abis: if self.abis.is_empty() {
                SupportedAbis::host()
            } else {
                SupportedAbis::new(self.abis.clone())
            },
            proxy_system_broker: !self.no_system_proxy,
            preferred_runtime: self.preferred_runtime.clone(),
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    let value = serde_json::to_value(value).context("failed to serialize command output")?;
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let api = RuntimeBrokerApi::new(cli.config());
    debug!(snapshot = %cli.snapshot.display(), "xrb starting");
    match cli.command {
        Command::Address { command } => run_address(&api, command),
        Command::Parse(args) => run_parse(&api, args),
        Command::Query(args) => run_query(&api, args),
        Command::Runtimes { command } => match command {
            RuntimesCommand::List(args) => run_runtimes_list(&api, args),
        },
    }
}

fn run_address(api: &RuntimeBrokerApi, command: AddressCommand) -> Result<()> {
    let request = match command {
        AddressCommand::Active(args) => MakeAddressRequest {
            broker_kind: args.broker.into(),
            table: TableKind::ActiveRuntime,
            major_version: args.major,
            architecture: args.arch,
            package_id: None,
        },
        AddressCommand::Functions(args) => MakeAddressRequest {
            broker_kind: args.address.broker.into(),
            table: TableKind::Functions,
            major_version: args.address.major,
            architecture: args.address.arch,
            package_id: Some(args.package),
        },
    };
    emit_json(&api.make_address(request)?)
}

fn run_parse(api: &RuntimeBrokerApi, args: ParseArgs) -> Result<()> {
    let request = ParseAddressRequest {
        uri: args.uri,
        broker_kind: args.broker.map(Into::into),
    };
    emit_json(&api.parse_address(&request))
}

fn run_query(api: &RuntimeBrokerApi, args: QueryArgs) -> Result<()> {
    let projection = if args.columns.is_empty() { None } else { Some(args.columns) };
    let response = api.query(QueryRequest {
        uri: args.uri,
        broker_kind: args.broker.map(Into::into),
        projection,
    })?;
    emit_json(&response)
}

fn run_runtimes_list(api: &RuntimeBrokerApi, args: ListArgs) -> Result<()> {
    let listing = api.list_runtimes(&ListRuntimesRequest {
        major_version: args.major,
        architecture: args.arch,
    })?;
    emit_json(&listing)
}
