use thiserror::Error;

/// Composition-time failures. Fatal: the gateway refuses to serve until the
/// subgraph set composes cleanly.
#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("failed to parse schema for subgraph {subgraph}: {message}")]
    Parse { subgraph: String, message: String },

    #[error("conflicting definitions of {type_name}.{field} in subgraphs {}", owners.join(", "))]
    SchemaConflict {
        type_name: String,
        field: String,
        owners: Vec<String>,
    },

    #[error("no subgraph owns {type_name}.{field}")]
    UnresolvedOwner { type_name: String, field: String },

    #[error("subgraph {subgraph} extends unknown type {type_name}")]
    UnknownExtensionTarget { subgraph: String, type_name: String },
}

/// Planning-time failures. The whole request is rejected before any subgraph
/// is contacted.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("cannot resolve an owning subgraph for {type_name}.{field}")]
    UnresolvedFieldOwner { type_name: String, field: String },

    #[error("variable ${name} is not defined and has no default")]
    UndefinedVariable { name: String },

    #[error("operation {0:?} not found in document")]
    UnknownOperation(Option<String>),

    #[error("fragment {0} is not defined in the document")]
    UnknownFragment(String),

    #[error("internal planner invariant violated: {0}")]
    Internal(String),
}

/// Startup/reload failures around composition: unreadable files, bad
/// configuration, or a composition error.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("invalid gateway configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Compose(#[from] ComposeError),
}

/// Why a request was rejected before any subgraph was contacted.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to parse query: {0}")]
    Parse(String),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Raw dispatch failures, mapped onto per-step errors by the executor.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("unreadable body: {0}")]
    Malformed(String),
}

/// Execution-time, per-step failures. Confined to the failing step and its
/// dependents; sibling steps still complete.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("transport error from subgraph {subgraph}: {message}")]
    Transport { subgraph: String, message: String },

    #[error("malformed response from subgraph {subgraph}: {message}")]
    Response { subgraph: String, message: String },

    #[error("request to subgraph {subgraph} exceeded the deadline")]
    Timeout { subgraph: String },

    #[error("request to subgraph {subgraph} was cancelled")]
    Cancelled { subgraph: String },
}
