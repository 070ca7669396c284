//! End-to-end pipeline tests: parse -> plan -> execute against an
//! in-process mock transport, using the repository's schema fixtures.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meshgate::error::{RequestError, TransportError};
use meshgate::{FederationGateway, GraphQLRequest, Transport};
use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};

const PRODUCTS_HOST: &str = "http://localhost:4001/graphql";
const REVIEWS_HOST: &str = "http://localhost:4002/graphql";

struct MockTransport {
    responses: HashMap<String, Result<Value, String>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    fn new(responses: Vec<(&str, Result<Value, String>)>) -> Arc<Self> {
        Arc::new(MockTransport {
            responses: responses
                .into_iter()
                .map(|(host, r)| (host.to_string(), r))
                .collect(),
            delay: None,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        host: &str,
        _query: &str,
        _variables: &Map<String, Value>,
        _headers: &HashMap<String, String>,
    ) -> Result<Value, TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.calls.lock().unwrap().push(host.to_string());
        match self.responses.get(host) {
            Some(Ok(body)) => Ok(body.clone()),
            Some(Err(message)) => Err(TransportError::Network(message.clone())),
            None => Err(TransportError::Network(format!("no route to {host}"))),
        }
    }
}

fn config_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(name)
}

fn gateway(transport: Arc<MockTransport>) -> FederationGateway {
    FederationGateway::with_transport(&config_path("schemas/supergraph.yaml"), transport).unwrap()
}

fn request(query: &str) -> GraphQLRequest {
    GraphQLRequest {
        query: query.to_string(),
        variables: None,
        operation_name: None,
    }
}

#[tokio::test]
async fn single_subgraph_query_round_trips() {
    let transport = MockTransport::new(vec![(
        PRODUCTS_HOST,
        Ok(json!({ "data": { "products": [
            { "upc": "1", "name": "Widget", "price": 10 }
        ] } })),
    )]);
    let gateway = gateway(Arc::clone(&transport));

    let response = gateway
        .process_request(request("{ products { upc name price } }"), HashMap::new())
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({ "data": { "products": [
            { "upc": "1", "name": "Widget", "price": 10 }
        ] } })
    );
    assert_eq!(*transport.calls.lock().unwrap(), vec![PRODUCTS_HOST.to_string()]);
}

#[tokio::test]
async fn transport_failure_yields_partial_response() {
    let transport = MockTransport::new(vec![(
        PRODUCTS_HOST,
        Err("connection refused".to_string()),
    )]);
    let gateway = gateway(transport);

    let response = gateway
        .process_request(request("{ products { upc name price } }"), HashMap::new())
        .await
        .unwrap();

    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["data"], json!({ "products": null }));
    assert_eq!(value["errors"].as_array().unwrap().len(), 1);
    assert_eq!(value["errors"][0]["path"], json!(["products"]));
}

#[tokio::test]
async fn cross_subgraph_query_merges_entity_extensions() {
    let transport = MockTransport::new(vec![
        (
            PRODUCTS_HOST,
            Ok(json!({ "data": { "products": [
                { "upc": "1", "name": "Widget" }
            ] } })),
        ),
        (
            REVIEWS_HOST,
            Ok(json!({ "data": { "_entities": [
                { "reviews": [{ "body": "solid", "author": "ada" }] }
            ] } })),
        ),
    ]);
    let gateway = gateway(Arc::clone(&transport));

    let response = gateway
        .process_request(
            request("{ products { name reviews { body author } } }"),
            HashMap::new(),
        )
        .await
        .unwrap();

    // the injected upc key is pruned from the final shape
    assert_eq!(
        serde_json::to_value(&response).unwrap(),
        json!({ "data": { "products": [
            { "name": "Widget", "reviews": [{ "body": "solid", "author": "ada" }] }
        ] } })
    );

    let calls = transport.calls.lock().unwrap();
    assert_eq!(
        *calls,
        vec![PRODUCTS_HOST.to_string(), REVIEWS_HOST.to_string()]
    );
}

#[tokio::test]
async fn planning_errors_reject_the_request_without_dispatch() {
    let transport = MockTransport::new(vec![]);
    let gateway = gateway(Arc::clone(&transport));

    let err = gateway
        .process_request(
            request("query ($upc: String!) { product(upc: $upc) { name } }"),
            HashMap::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, RequestError::Plan(_)));
    assert!(transport.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_queries_are_parse_errors() {
    let gateway = gateway(MockTransport::new(vec![]));

    let err = gateway
        .process_request(request("{ products {"), HashMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RequestError::Parse(_)));
}

#[tokio::test]
async fn configured_deadline_bounds_slow_subgraphs() {
    let mut transport = MockTransport::new(vec![(
        PRODUCTS_HOST,
        Ok(json!({ "data": { "products": [] } })),
    )]);
    Arc::get_mut(&mut transport).unwrap().delay = Some(Duration::from_secs(3));

    let gateway = FederationGateway::with_transport(
        &config_path("tests/fixtures/supergraph_fast.yaml"),
        Arc::clone(&transport) as Arc<dyn Transport>,
    )
    .unwrap();

    let started = std::time::Instant::now();
    let response = gateway
        .process_request(request("{ products { upc } }"), HashMap::new())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["data"], json!({ "products": null }));
    assert!(value["errors"][0]["message"]
        .as_str()
        .unwrap()
        .contains("deadline"));
}
