pub mod error;
pub mod federation_gateway;
pub mod query_executor;
pub mod query_planner;
pub mod supergraph;

pub use federation_gateway::{FederationGateway, GatewayConfig};
pub use query_executor::{ExecutionContext, HttpTransport, QueryExecutor, Response, Transport};
pub use query_planner::{Plan, QueryPlanner, Step, StepKind};
pub use supergraph::{SubGraph, SuperGraph};

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct GraphQLRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(rename = "operationName", default)]
    pub operation_name: Option<String>,
}
