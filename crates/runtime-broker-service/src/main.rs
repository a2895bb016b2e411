use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use runtime_broker_api::{
    AddressResponse, BrokerConfig, ListRuntimesRequest, MakeAddressRequest, ParseAddressRequest,
    ParseAddressResponse, QueryRequest, QueryResponse, RuntimeBrokerApi, RuntimeListing,
    API_CONTRACT_VERSION, DEFAULT_SNAPSHOT_PATH,
};
use runtime_broker_core::SupportedAbis;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: RuntimeBrokerApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "runtime-broker-service")]
#[command(about = "Local HTTP service answering OpenXR runtime broker queries")]
struct Args {
    #[arg(long, default_value = DEFAULT_SNAPSHOT_PATH)]
    snapshot: PathBuf,
    /// Supported architecture, most preferred first; repeat for more.
    #[arg(long = "abi")]
    abis: Vec<String>,
    #[arg(long)]
    no_system_proxy: bool,
    #[arg(long)]
    preferred_runtime: Option<String>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl Args {
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

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(err: &anyhow::Error) -> ServiceError {
        warn!(error = %format!("{err:#}"), "request rejected");
        ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: format!("{err:#}"),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/address", post(address_make))
        .route("/v1/address/parse", post(address_parse))
        .route("/v1/query", post(query))
        .route("/v1/runtimes", get(runtimes_list))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let state = ServiceState {
        api: RuntimeBrokerApi::new(args.config()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(
        bind = %args.bind,
        snapshot = %args.snapshot.display(),
        "runtime broker service listening"
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn address_make(
    State(state): State<ServiceState>,
    Json(request): Json<MakeAddressRequest>,
) -> Result<Json<ServiceEnvelope<AddressResponse>>, ServiceError> {
    let address = state.api.make_address(request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(address)))
}

async fn address_parse(
    State(state): State<ServiceState>,
    Json(request): Json<ParseAddressRequest>,
) -> Json<ServiceEnvelope<ParseAddressResponse>> {
    Json(envelope(state.api.parse_address(&request)))
}

async fn query(
    State(state): State<ServiceState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<ServiceEnvelope<QueryResponse>>, ServiceError> {
    let response = state.api.query(request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(response)))
}

async fn runtimes_list(
    State(state): State<ServiceState>,
    Query(request): Query<ListRuntimesRequest>,
) -> Result<Json<ServiceEnvelope<RuntimeListing>>, ServiceError> {
    let listing = state.api.list_runtimes(&request).map_err(|err| ServiceState::error(&err))?;
    Ok(Json(envelope(listing)))
}
