//! Plan execution: dispatches ready steps concurrently over an injected
//! transport, merges partial results into one response tree and aggregates
//! per-step failures GraphQL-style.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StepError, TransportError};
use crate::query_planner::{Plan, Step, StepKind};
use crate::supergraph::SuperGraph;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Dispatch seam between the executor and subgraph services.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        host: &str,
        query: &str,
        variables: &Map<String, Value>,
        headers: &HashMap<String, String>,
    ) -> Result<Value, TransportError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        HttpTransport {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        host: &str,
        query: &str,
        variables: &Map<String, Value>,
        headers: &HashMap<String, String>,
    ) -> Result<Value, TransportError> {
        let mut request = self
            .client
            .post(host)
            .json(&json!({ "query": query, "variables": variables }));
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// Request-scoped execution state: caller headers, correlation id, deadline
/// and the cancel signal shared with in-flight dispatches.
#[derive(Clone)]
pub struct ExecutionContext {
    pub headers: HashMap<String, String>,
    pub forward_headers: bool,
    pub request_id: String,
    pub deadline: Option<Duration>,
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new() -> Self {
        ExecutionContext {
            headers: HashMap::new(),
            forward_headers: true,
            request_id: Uuid::new_v4().to_string(),
            deadline: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// Attaches caller headers; an `x-request-id` among them becomes the
    /// correlation id.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        if let Some(id) = headers.get(REQUEST_ID_HEADER) {
            self.request_id = id.clone();
        }
        self.headers = headers;
        self
    }

    pub fn forward_headers(mut self, forward: bool) -> Self {
        self.forward_headers = forward;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn dispatch_headers(&self) -> HashMap<String, String> {
        let mut headers = if self.forward_headers {
            self.headers.clone()
        } else {
            HashMap::new()
        };
        headers
            .entry(REQUEST_ID_HEADER.to_string())
            .or_insert_with(|| self.request_id.clone());
        headers
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseError {
    pub message: String,
    pub path: Vec<String>,
}

/// GraphQL-style partial response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub data: Value,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ResponseError>,
}

#[derive(Clone, Copy, PartialEq)]
enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

type DispatchFuture = Pin<Box<dyn Future<Output = (usize, Result<Value, StepError>)> + Send>>;

enum Prepared {
    /// Nothing to send, e.g. an entity step whose parent produced no objects.
    Skip,
    Fail(StepError),
    Dispatch(DispatchFuture),
}

pub struct QueryExecutor {
    transport: Arc<dyn Transport>,
}

impl QueryExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        QueryExecutor { transport }
    }

    /// Runs every ready step concurrently, respecting the dependency order.
    /// Never fails for per-step errors: the result is always a `{data,
    /// errors}` response with failures confined to their response paths.
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        graph: &SuperGraph,
        plan: &Plan,
    ) -> Response {
        let steps = &plan.steps;
        let n = steps.len();
        let mut status = vec![StepStatus::Pending; n];
        let mut indegree: Vec<usize> = steps.iter().map(|s| s.depends_on.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for step in steps {
            for &dep in &step.depends_on {
                dependents[dep].push(step.id);
            }
        }

        // Root keys are seeded in plan order so that step completion order
        // cannot reorder the response shape.
        let mut root = Map::new();
        for step in steps {
            if matches!(step.kind, StepKind::Root) {
                for field in &step.fields {
                    root.insert(field.clone(), Value::Null);
                }
            }
        }
        let mut data = Value::Object(root);
        let mut errors: Vec<ResponseError> = Vec::new();
        let mut running: FuturesUnordered<DispatchFuture> = FuturesUnordered::new();
        let headers = ctx.dispatch_headers();
        let deadline = ctx.deadline.map(|d| tokio::time::Instant::now() + d);

        'drive: loop {
            // A cancellation observed before dispatch skips the remaining
            // pending steps silently; only steps already in flight get a
            // Cancelled entry.
            if ctx.cancellation.is_cancelled() {
                abort(steps, &mut status, &mut data, &mut errors, |s| StepError::Cancelled {
                    subgraph: s.subgraph.clone(),
                });
                break;
            }

            // Dispatch everything that became ready; trivially completed
            // steps may ready their dependents in the same pass.
            loop {
                let mut progressed = false;
                for i in 0..n {
                    if status[i] != StepStatus::Pending || indegree[i] != 0 {
                        continue;
                    }
                    match self.prepare(i, &steps[i], graph, &data, &headers) {
                        Prepared::Skip => {
                            status[i] = StepStatus::Completed;
                            for &d in &dependents[i] {
                                indegree[d] -= 1;
                            }
                            progressed = true;
                        }
                        Prepared::Fail(err) => {
                            fail_step(
                                i,
                                err,
                                steps,
                                &dependents,
                                &mut status,
                                &mut data,
                                &mut errors,
                            );
                            progressed = true;
                        }
                        Prepared::Dispatch(future) => {
                            status[i] = StepStatus::Running;
                            running.push(future);
                        }
                    }
                }
                if !progressed {
                    break;
                }
            }

            if running.is_empty() {
                break;
            }

            let (i, result) = tokio::select! {
                biased;
                _ = ctx.cancellation.cancelled() => {
                    abort(steps, &mut status, &mut data, &mut errors, |s| StepError::Cancelled {
                        subgraph: s.subgraph.clone(),
                    });
                    break 'drive;
                }
                _ = wait_deadline(deadline) => {
                    abort(steps, &mut status, &mut data, &mut errors, |s| StepError::Timeout {
                        subgraph: s.subgraph.clone(),
                    });
                    break 'drive;
                }
                completed = running.next() => match completed {
                    Some(outcome) => outcome,
                    None => break 'drive,
                },
            };

            match result.and_then(|value| splice(&mut data, &steps[i], value)) {
                Ok(()) => {
                    status[i] = StepStatus::Completed;
                    for &d in &dependents[i] {
                        indegree[d] -= 1;
                    }
                }
                Err(err) => {
                    warn!(step = i, subgraph = %steps[i].subgraph, error = %err, "step failed");
                    fail_step(i, err, steps, &dependents, &mut status, &mut data, &mut errors);
                }
            }
        }

        for path in &plan.injected_keys {
            prune(&mut data, path);
        }

        debug!(errors = errors.len(), "plan execution finished");
        Response { data, errors }
    }

    fn prepare(
        &self,
        i: usize,
        step: &Step,
        graph: &SuperGraph,
        data: &Value,
        headers: &HashMap<String, String>,
    ) -> Prepared {
        let Some(subgraph) = graph.subgraph(&step.subgraph) else {
            return Prepared::Fail(StepError::Transport {
                subgraph: step.subgraph.clone(),
                message: "subgraph is not configured in the supergraph".to_string(),
            });
        };

        let mut variables = step.variables.clone();
        if let StepKind::Entity { type_name, keys } = &step.kind {
            let representations = representations_at(data, &step.path, type_name, keys);
            if representations.is_empty() {
                return Prepared::Skip;
            }
            variables.insert(
                "representations".to_string(),
                Value::Array(representations),
            );
        }

        let transport = Arc::clone(&self.transport);
        let host = subgraph.host.clone();
        let query = step.query.clone();
        let headers = headers.clone();
        let name = step.subgraph.clone();

        Prepared::Dispatch(Box::pin(async move {
            let result = transport
                .send(&host, &query, &variables, &headers)
                .await
                .map_err(|e| match e {
                    TransportError::Network(message) => StepError::Transport {
                        subgraph: name.clone(),
                        message,
                    },
                    TransportError::Malformed(message) => StepError::Response {
                        subgraph: name.clone(),
                        message,
                    },
                });
            (i, result)
        }))
    }
}

async fn wait_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Fails a dispatched step: one error entry, null at its paths, dependents
/// skipped silently.
fn fail_step(
    i: usize,
    err: StepError,
    steps: &[Step],
    dependents: &[Vec<usize>],
    status: &mut [StepStatus],
    data: &mut Value,
    errors: &mut Vec<ResponseError>,
) {
    status[i] = StepStatus::Failed;
    null_fields(data, &steps[i]);
    errors.push(ResponseError {
        message: err.to_string(),
        path: error_path(&steps[i]),
    });

    let mut stack: Vec<usize> = dependents[i].clone();
    while let Some(d) = stack.pop() {
        if status[d] == StepStatus::Pending {
            status[d] = StepStatus::Failed;
            null_fields(data, &steps[d]);
            stack.extend(dependents[d].iter().copied());
        }
    }
}

/// Deadline or cancellation: running steps were dispatched and get one error
/// entry each; pending steps are skipped silently.
fn abort(
    steps: &[Step],
    status: &mut [StepStatus],
    data: &mut Value,
    errors: &mut Vec<ResponseError>,
    make_error: impl Fn(&Step) -> StepError,
) {
    for (i, step) in steps.iter().enumerate() {
        match status[i] {
            StepStatus::Running => {
                status[i] = StepStatus::Failed;
                null_fields(data, step);
                errors.push(ResponseError {
                    message: make_error(step).to_string(),
                    path: error_path(step),
                });
            }
            StepStatus::Pending => {
                status[i] = StepStatus::Failed;
                null_fields(data, step);
            }
            _ => {}
        }
    }
}

fn error_path(step: &Step) -> Vec<String> {
    if step.path.is_empty() {
        step.fields.first().cloned().into_iter().collect()
    } else {
        step.path.clone()
    }
}

/// Splices a well-formed subgraph response body into the shared tree at the
/// step's response-path.
fn splice(data: &mut Value, step: &Step, body: Value) -> Result<(), StepError> {
    let payload = match body.get("data") {
        Some(payload) if !payload.is_null() => payload.clone(),
        _ => {
            let message = body
                .get("errors")
                .and_then(|e| e.get(0))
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("response body carries no data")
                .to_string();
            return Err(StepError::Response {
                subgraph: step.subgraph.clone(),
                message,
            });
        }
    };

    match &step.kind {
        StepKind::Root => {
            let Value::Object(mut payload) = payload else {
                return Err(StepError::Response {
                    subgraph: step.subgraph.clone(),
                    message: "data is not an object".to_string(),
                });
            };
            let Value::Object(root) = data else {
                return Err(StepError::Response {
                    subgraph: step.subgraph.clone(),
                    message: "response tree root is not an object".to_string(),
                });
            };
            for field in &step.fields {
                let value = payload.remove(field).unwrap_or(Value::Null);
                root.insert(field.clone(), value);
            }
            Ok(())
        }
        StepKind::Entity { .. } => {
            let entities = match payload.get("_entities") {
                Some(Value::Array(entities)) => entities.clone(),
                _ => {
                    return Err(StepError::Response {
                        subgraph: step.subgraph.clone(),
                        message: "data._entities is not a list".to_string(),
                    })
                }
            };
            let objects = collect_objects(data, &step.path);
            for (object, entity) in objects.into_iter().zip(entities) {
                if let Value::Object(entity) = entity {
                    for (key, value) in entity {
                        object.insert(key, value);
                    }
                }
            }
            Ok(())
        }
    }
}

/// Builds `_entities` representations from the parent's already-merged data:
/// `__typename` plus the entity's key fields, broadcasting over lists.
fn representations_at(
    data: &Value,
    path: &[String],
    type_name: &str,
    keys: &[String],
) -> Vec<Value> {
    let mut out = Vec::new();
    for object in collect_objects_ref(data, path) {
        let mut rep = Map::new();
        rep.insert(
            "__typename".to_string(),
            Value::String(type_name.to_string()),
        );
        for key in keys {
            rep.insert(key.clone(), object.get(key).cloned().unwrap_or(Value::Null));
        }
        out.push(Value::Object(rep));
    }
    out
}

fn null_fields(data: &mut Value, step: &Step) {
    for object in collect_objects(data, &step.path) {
        for field in &step.fields {
            object.insert(field.clone(), Value::Null);
        }
    }
}

/// Removes a planner-injected key field from every object at the path.
fn prune(data: &mut Value, path: &[String]) {
    let Some((field, parent)) = path.split_last() else {
        return;
    };
    for object in collect_objects(data, parent) {
        object.remove(field);
    }
}

fn collect_objects<'v>(value: &'v mut Value, path: &[String]) -> Vec<&'v mut Map<String, Value>> {
    match value {
        Value::Array(items) => items
            .iter_mut()
            .flat_map(|item| collect_objects(item, path))
            .collect(),
        Value::Object(map) => match path.split_first() {
            None => vec![map],
            Some((head, rest)) => map
                .get_mut(head)
                .map(|inner| collect_objects(inner, rest))
                .unwrap_or_default(),
        },
        _ => Vec::new(),
    }
}

fn collect_objects_ref<'v>(value: &'v Value, path: &[String]) -> Vec<&'v Map<String, Value>> {
    match value {
        Value::Array(items) => items
            .iter()
            .flat_map(|item| collect_objects_ref(item, path))
            .collect(),
        Value::Object(map) => match path.split_first() {
            None => vec![map],
            Some((head, rest)) => map
                .get(head)
                .map(|inner| collect_objects_ref(inner, rest))
                .unwrap_or_default(),
        },
        _ => Vec::new(),
    }
}
