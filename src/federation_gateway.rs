//! Gateway facade: loads the supergraph configuration, composes the
//! subgraphs, and runs the parse -> plan -> execute pipeline per request.
//! The composed supergraph is published by swap, so in-flight requests
//! always read one consistent snapshot.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use graphql_parser::parse_query;
use graphql_parser::schema::Document as SchemaDocument;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::error::{GatewayError, RequestError};
use crate::query_executor::{ExecutionContext, HttpTransport, QueryExecutor, Response, Transport};
use crate::query_planner::QueryPlanner;
use crate::supergraph::{SubGraph, SuperGraph};
use crate::GraphQLRequest;

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    pub subgraphs: BTreeMap<String, SubgraphConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overall request deadline, e.g. "5s".
    #[serde(default = "default_timeout")]
    pub timeout: String,
    #[serde(default = "default_true")]
    pub forward_request_headers: bool,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            endpoint: default_endpoint(),
            port: default_port(),
            timeout: default_timeout(),
            forward_request_headers: default_true(),
        }
    }
}

fn default_endpoint() -> String {
    "/graphql".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_timeout() -> String {
    "5s".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SubgraphConfig {
    pub routing_url: String,
    pub schema: SchemaConfig,
}

#[derive(Debug, Deserialize)]
pub struct SchemaConfig {
    /// Path to the subgraph SDL, relative to the config file.
    pub file: String,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let contents = fs::read_to_string(path).map_err(|e| GatewayError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        serde_yaml::from_str(&contents).map_err(|e| GatewayError::Config(e.to_string()))
    }
}

pub struct FederationGateway {
    supergraph: ArcSwap<SuperGraph>,
    executor: QueryExecutor,
    config_dir: PathBuf,
    pub endpoint: String,
    pub port: u16,
    timeout: Duration,
    forward_headers: bool,
}

impl FederationGateway {
    pub fn from_config_file(path: &Path) -> Result<Self, GatewayError> {
        Self::with_transport(path, Arc::new(HttpTransport::new()))
    }

    /// Builds the gateway with an injected transport; this is also the
    /// testing seam.
    pub fn with_transport(
        path: &Path,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, GatewayError> {
        let config = GatewayConfig::load(path)?;
        let config_dir = path.parent().unwrap_or_else(|| Path::new("")).to_path_buf();

        let timeout = humantime::parse_duration(&config.gateway.timeout)
            .map_err(|e| GatewayError::Config(format!("bad timeout: {e}")))?;
        let supergraph = build_supergraph(&config, &config_dir)?;
        info!(
            subgraphs = supergraph.subgraphs().len(),
            endpoint = %config.gateway.endpoint,
            "composed supergraph"
        );

        Ok(FederationGateway {
            supergraph: ArcSwap::from_pointee(supergraph),
            executor: QueryExecutor::new(transport),
            config_dir,
            endpoint: config.gateway.endpoint,
            port: config.gateway.port,
            timeout,
            forward_headers: config.gateway.forward_request_headers,
        })
    }

    /// Rebuilds the supergraph from the given config and publishes it by
    /// swap. The live instance is never mutated.
    pub fn reload(&self, config: &GatewayConfig) -> Result<(), GatewayError> {
        let supergraph = build_supergraph(config, &self.config_dir)?;
        self.supergraph.store(Arc::new(supergraph));
        info!("published reloaded supergraph");
        Ok(())
    }

    pub fn supergraph(&self) -> Arc<SuperGraph> {
        self.supergraph.load_full()
    }

    /// Runs one request through parse, plan and execute. Parse and plan
    /// errors reject the request with no partial data; execution always
    /// yields a (possibly partial) response.
    pub async fn process_request(
        &self,
        request: GraphQLRequest,
        headers: HashMap<String, String>,
    ) -> Result<Response, RequestError> {
        let document = parse_query::<String>(&request.query)
            .map_err(|e| RequestError::Parse(e.to_string()))?
            .into_static();

        let variables = match request.variables {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let graph = self.supergraph.load_full();
        let plan = QueryPlanner::new(&graph).plan(
            &document,
            request.operation_name.as_deref(),
            &variables,
        )?;

        let ctx = ExecutionContext::new()
            .with_headers(headers)
            .forward_headers(self.forward_headers)
            .with_deadline(self.timeout);

        Ok(self.executor.execute(&ctx, &graph, &plan).await)
    }
}

fn build_supergraph(
    config: &GatewayConfig,
    config_dir: &Path,
) -> Result<SuperGraph, GatewayError> {
    let mut subgraphs = Vec::with_capacity(config.subgraphs.len());
    for (name, subgraph) in &config.subgraphs {
        let schema_path = config_dir.join(&subgraph.schema.file);
        let sdl = fs::read_to_string(&schema_path).map_err(|e| GatewayError::Io {
            path: schema_path.display().to_string(),
            message: e.to_string(),
        })?;
        subgraphs.push(SubGraph::new(name.clone(), sdl, subgraph.routing_url.clone())?);
    }

    let mut supergraph = SuperGraph::new(
        SchemaDocument {
            definitions: vec![],
        },
        subgraphs,
    );
    supergraph.merge()?;
    Ok(supergraph)
}
