//! Query planning: walks a parsed operation against the supergraph's
//! ownership index and produces a DAG of per-subgraph fetch steps.

use std::collections::{HashMap, HashSet};

use graphql_parser::query::{
    Definition, Document, Field, FragmentDefinition, OperationDefinition, Selection, SelectionSet,
    Type, TypeCondition, Value as QueryValue, VariableDefinition,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::PlanError;
use crate::supergraph::SuperGraph;

/// How a step's result is spliced into the response tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StepKind {
    /// Targets a root field of the operation; the result's fields merge at
    /// the step's path.
    Root,
    /// Extends entity objects already produced by the step's dependency via
    /// the `_entities` operation.
    Entity { type_name: String, keys: Vec<String> },
}

/// One unit of execution bound to a single subgraph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub id: usize,
    pub subgraph: String,
    pub query: String,
    /// Only the variables referenced inside this step's sub-selection.
    pub variables: Map<String, Value>,
    pub depends_on: Vec<usize>,
    /// Response-path of the enclosing object(s) this step writes into.
    pub path: Vec<String>,
    /// Response keys this step contributes at `path`.
    pub fields: Vec<String>,
    pub kind: StepKind,
}

/// The DAG of steps computed for one query, flat and index-addressed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub steps: Vec<Step>,
    /// Paths of key fields the planner added so entity representations can
    /// be built; the executor prunes them from the final tree.
    pub injected_keys: Vec<Vec<String>>,
}

pub struct QueryPlanner<'a> {
    graph: &'a SuperGraph,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(graph: &'a SuperGraph) -> Self {
        QueryPlanner { graph }
    }

    pub fn plan(
        &self,
        document: &Document<'static, String>,
        operation_name: Option<&str>,
        variables: &Map<String, Value>,
    ) -> Result<Plan, PlanError> {
        let op = select_operation(document, operation_name)?;

        let mut fragments = HashMap::new();
        for def in &document.definitions {
            if let Definition::Fragment(fragment) = def {
                fragments.insert(fragment.name.as_str(), fragment);
            }
        }

        let mut builder = PlanBuilder {
            graph: self.graph,
            fragments,
            drafts: Vec::new(),
            injected: Vec::new(),
            leaves: HashSet::new(),
        };
        builder.plan_roots(op.root_type, op.selection_set)?;

        let mut steps = Vec::with_capacity(builder.drafts.len());
        for (id, draft) in builder.drafts.iter().enumerate() {
            steps.push(finalize_step(
                id,
                draft,
                op.keyword,
                op.variable_definitions,
                variables,
            )?);
        }

        let plan = Plan {
            steps,
            injected_keys: builder.injected,
        };
        debug!(steps = plan.steps.len(), "planned query");
        Ok(plan)
    }
}

struct OpParts<'q> {
    keyword: &'static str,
    root_type: &'static str,
    variable_definitions: &'q [VariableDefinition<'static, String>],
    selection_set: &'q SelectionSet<'static, String>,
}

fn select_operation<'q>(
    document: &'q Document<'static, String>,
    name: Option<&str>,
) -> Result<OpParts<'q>, PlanError> {
    let operations: Vec<&OperationDefinition<'static, String>> = document
        .definitions
        .iter()
        .filter_map(|def| match def {
            Definition::Operation(op) => Some(op),
            Definition::Fragment(_) => None,
        })
        .collect();

    let chosen = match name {
        Some(wanted) => operations.into_iter().find(|op| match op {
            OperationDefinition::Query(q) => q.name.as_deref() == Some(wanted),
            OperationDefinition::Mutation(m) => m.name.as_deref() == Some(wanted),
            _ => false,
        }),
        None => {
            if operations.len() == 1 {
                Some(operations[0])
            } else {
                None
            }
        }
    };

    match chosen {
        Some(OperationDefinition::SelectionSet(selection_set)) => Ok(OpParts {
            keyword: "query",
            root_type: "Query",
            variable_definitions: &[],
            selection_set,
        }),
        Some(OperationDefinition::Query(q)) => Ok(OpParts {
            keyword: "query",
            root_type: "Query",
            variable_definitions: &q.variable_definitions,
            selection_set: &q.selection_set,
        }),
        Some(OperationDefinition::Mutation(m)) => Ok(OpParts {
            keyword: "mutation",
            root_type: "Mutation",
            variable_definitions: &m.variable_definitions,
            selection_set: &m.selection_set,
        }),
        _ => Err(PlanError::UnknownOperation(name.map(str::to_string))),
    }
}

/// Rendered selection node: alias, name, arguments, children.
struct SelNode {
    alias: Option<String>,
    name: String,
    arguments: Vec<(String, QueryValue<'static, String>)>,
    children: Vec<SelNode>,
}

impl SelNode {
    fn leaf(name: &str) -> Self {
        SelNode {
            alias: None,
            name: name.to_string(),
            arguments: Vec::new(),
            children: Vec::new(),
        }
    }

    fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

struct StepDraft {
    subgraph: String,
    depends_on: Vec<usize>,
    path: Vec<String>,
    fields: Vec<String>,
    kind: StepKind,
    roots: Vec<SelNode>,
}

struct PlanBuilder<'a, 'q> {
    graph: &'a SuperGraph,
    fragments: HashMap<&'q str, &'q FragmentDefinition<'static, String>>,
    drafts: Vec<StepDraft>,
    injected: Vec<Vec<String>>,
    leaves: HashSet<Vec<String>>,
}

impl<'a, 'q> PlanBuilder<'a, 'q> {
    fn plan_roots(
        &mut self,
        root_type: &str,
        selection_set: &'q SelectionSet<'static, String>,
    ) -> Result<(), PlanError> {
        let expanded = self.expand(&selection_set.items, root_type)?;

        let mut i = 0;
        while i < expanded.len() {
            let owner = self.owner_of(root_type, expanded[i])?.to_string();
            let mut run = Vec::new();
            while i < expanded.len() && self.owner_of(root_type, expanded[i])? == owner {
                run.push(expanded[i]);
                i += 1;
            }

            let draft = self.new_draft(
                owner.clone(),
                Vec::new(),
                Vec::new(),
                run.iter().map(|f| response_key(f).to_string()).collect(),
                StepKind::Root,
            );
            self.populate(draft, &owner, root_type, &run, &[])?;
        }
        Ok(())
    }

    fn new_draft(
        &mut self,
        subgraph: String,
        depends_on: Vec<usize>,
        path: Vec<String>,
        fields: Vec<String>,
        kind: StepKind,
    ) -> usize {
        self.drafts.push(StepDraft {
            subgraph,
            depends_on,
            path,
            fields,
            kind,
            roots: Vec::new(),
        });
        self.drafts.len() - 1
    }

    fn populate(
        &mut self,
        draft: usize,
        owner: &str,
        parent_type: &str,
        fields: &[&'q Field<'static, String>],
        base_path: &[String],
    ) -> Result<(), PlanError> {
        let mut nodes = Vec::with_capacity(fields.len());
        for &field in fields {
            nodes.push(self.build_field(draft, owner, parent_type, field, base_path)?);
        }
        self.drafts[draft].roots.extend(nodes);
        Ok(())
    }

    fn build_field(
        &mut self,
        draft: usize,
        owner: &str,
        enclosing_type: &str,
        field: &'q Field<'static, String>,
        path_prefix: &[String],
    ) -> Result<SelNode, PlanError> {
        let key = response_key(field);
        let mut path = path_prefix.to_vec();
        path.push(key.to_string());

        let mut node = SelNode {
            alias: field.alias.clone(),
            name: field.name.clone(),
            arguments: field.arguments.clone(),
            children: Vec::new(),
        };

        if field.selection_set.items.is_empty() {
            self.record_leaf(path)?;
            return Ok(node);
        }

        let child_type = self
            .graph
            .field_type(enclosing_type, &field.name)
            .ok_or_else(|| PlanError::UnresolvedFieldOwner {
                type_name: enclosing_type.to_string(),
                field: field.name.clone(),
            })?
            .to_string();
        let expanded = self.expand(&field.selection_set.items, &child_type)?;

        // Contiguous foreign-owner runs become entity steps after the same-
        // owner children (and any injected keys) are in place.
        let mut entity_runs: Vec<(String, Vec<&'q Field<'static, String>>)> = Vec::new();
        let mut i = 0;
        while i < expanded.len() {
            let child = expanded[i];
            if child.name == "__typename" {
                node.children.push(SelNode::leaf("__typename"));
                i += 1;
                continue;
            }
            let child_owner = self.owner_of(&child_type, child)?.to_string();
            if child_owner == owner {
                node.children
                    .push(self.build_field(draft, owner, &child_type, child, &path)?);
                i += 1;
            } else {
                if self.graph.entity(&child_type).is_none() {
                    return Err(PlanError::UnresolvedFieldOwner {
                        type_name: child_type.clone(),
                        field: child.name.clone(),
                    });
                }
                let mut run = Vec::new();
                while i < expanded.len()
                    && expanded[i].name != "__typename"
                    && self.owner_of(&child_type, expanded[i])? == child_owner
                {
                    run.push(expanded[i]);
                    i += 1;
                }
                entity_runs.push((child_owner, run));
            }
        }

        if !entity_runs.is_empty() {
            let entity = self
                .graph
                .entity(&child_type)
                .cloned()
                .ok_or_else(|| PlanError::Internal("entity vanished during planning".into()))?;

            // The parent step must produce the key fields whether or not the
            // query asked for them.
            for keyfield in &entity.keys {
                if !node.children.iter().any(|c| c.response_key() == keyfield) {
                    node.children.push(SelNode::leaf(keyfield));
                    let mut injected = path.clone();
                    injected.push(keyfield.clone());
                    self.injected.push(injected);
                }
            }

            for (run_owner, run) in entity_runs {
                let child_draft = self.new_draft(
                    run_owner.clone(),
                    vec![draft],
                    path.clone(),
                    run.iter().map(|f| response_key(f).to_string()).collect(),
                    StepKind::Entity {
                        type_name: child_type.clone(),
                        keys: entity.keys.clone(),
                    },
                );
                self.populate(child_draft, &run_owner, &child_type, &run, &path)?;
            }
        }

        Ok(node)
    }

    fn owner_of(
        &self,
        type_name: &str,
        field: &Field<'static, String>,
    ) -> Result<&str, PlanError> {
        self.graph
            .owner_of(type_name, &field.name)
            .ok_or_else(|| PlanError::UnresolvedFieldOwner {
                type_name: type_name.to_string(),
                field: field.name.clone(),
            })
    }

    fn record_leaf(&mut self, path: Vec<String>) -> Result<(), PlanError> {
        if !self.leaves.insert(path.clone()) {
            return Err(PlanError::Internal(format!(
                "two steps claim response path {}",
                path.join(".")
            )));
        }
        Ok(())
    }

    /// Flattens fragment spreads and matching inline fragments into a field
    /// list, preserving order.
    fn expand(
        &self,
        items: &'q [Selection<'static, String>],
        type_name: &str,
    ) -> Result<Vec<&'q Field<'static, String>>, PlanError> {
        let mut fields = Vec::new();
        for item in items {
            match item {
                Selection::Field(field) => fields.push(field),
                Selection::InlineFragment(fragment) => {
                    let matches = match &fragment.type_condition {
                        None => true,
                        Some(TypeCondition::On(on)) => on == type_name,
                    };
                    if matches {
                        fields.extend(self.expand(&fragment.selection_set.items, type_name)?);
                    }
                }
                Selection::FragmentSpread(spread) => {
                    let fragment: &'q FragmentDefinition<'static, String> = self
                        .fragments
                        .get(spread.fragment_name.as_str())
                        .copied()
                        .ok_or_else(|| {
                            PlanError::UnknownFragment(spread.fragment_name.clone())
                        })?;
                    let TypeCondition::On(on) = &fragment.type_condition;
                    if on == type_name {
                        fields.extend(self.expand(&fragment.selection_set.items, type_name)?);
                    }
                }
            }
        }
        Ok(fields)
    }
}

fn response_key<'q>(field: &'q Field<'static, String>) -> &'q str {
    field.alias.as_deref().unwrap_or(&field.name)
}

fn render_type(ty: &Type<'static, String>) -> String {
    match ty {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) => format!("[{}]", render_type(inner)),
        Type::NonNullType(inner) => format!("{}!", render_type(inner)),
    }
}

fn finalize_step(
    id: usize,
    draft: &StepDraft,
    keyword: &str,
    variable_definitions: &[VariableDefinition<'static, String>],
    variables: &Map<String, Value>,
) -> Result<Step, PlanError> {
    let mut referenced = Vec::new();
    for node in &draft.roots {
        collect_variables(node, &mut referenced);
    }

    let mut partition = Map::new();
    for name in &referenced {
        if let Some(value) = variables.get(name) {
            partition.insert(name.clone(), value.clone());
            continue;
        }
        let default = variable_definitions
            .iter()
            .find(|def| &def.name == name)
            .and_then(|def| def.default_value.as_ref());
        match default {
            Some(value) => {
                partition.insert(name.clone(), const_value_to_json(value));
            }
            None => return Err(PlanError::UndefinedVariable { name: name.clone() }),
        }
    }

    let mut declarations: Vec<String> = Vec::new();
    if let StepKind::Entity { .. } = draft.kind {
        declarations.push("$representations: [_Any!]!".to_string());
    }
    for name in &referenced {
        if let Some(def) = variable_definitions.iter().find(|def| &def.name == name) {
            declarations.push(format!("${}: {}", name, render_type(&def.var_type)));
        }
    }
    let declarations = if declarations.is_empty() {
        String::new()
    } else {
        format!(" ({})", declarations.join(", "))
    };

    let body = render_nodes(&draft.roots);
    let query = match &draft.kind {
        StepKind::Root => format!("{}{} {{ {} }}", keyword, declarations, body),
        StepKind::Entity { type_name, .. } => format!(
            "query{} {{ _entities(representations: $representations) {{ ... on {} {{ {} }} }} }}",
            declarations, type_name, body
        ),
    };

    Ok(Step {
        id,
        subgraph: draft.subgraph.clone(),
        query,
        variables: partition,
        depends_on: draft.depends_on.clone(),
        path: draft.path.clone(),
        fields: draft.fields.clone(),
        kind: draft.kind.clone(),
    })
}

fn collect_variables(node: &SelNode, out: &mut Vec<String>) {
    for (_, value) in &node.arguments {
        collect_value_variables(value, out);
    }
    for child in &node.children {
        collect_variables(child, out);
    }
}

fn collect_value_variables(value: &QueryValue<'static, String>, out: &mut Vec<String>) {
    match value {
        QueryValue::Variable(name) => {
            if !out.contains(name) {
                out.push(name.clone());
            }
        }
        QueryValue::List(items) => {
            for item in items {
                collect_value_variables(item, out);
            }
        }
        QueryValue::Object(map) => {
            for item in map.values() {
                collect_value_variables(item, out);
            }
        }
        _ => {}
    }
}

fn const_value_to_json(value: &QueryValue<'static, String>) -> Value {
    match value {
        QueryValue::Int(n) => Value::from(n.as_i64().unwrap_or_default()),
        QueryValue::Float(f) => {
            serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null)
        }
        QueryValue::String(s) => Value::String(s.clone()),
        QueryValue::Boolean(b) => Value::Bool(*b),
        QueryValue::Enum(e) => Value::String(e.clone()),
        QueryValue::List(items) => Value::Array(items.iter().map(const_value_to_json).collect()),
        QueryValue::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), const_value_to_json(item));
            }
            Value::Object(out)
        }
        QueryValue::Null | QueryValue::Variable(_) => Value::Null,
    }
}

fn render_nodes(nodes: &[SelNode]) -> String {
    nodes.iter().map(render_node).collect::<Vec<_>>().join(" ")
}

fn render_node(node: &SelNode) -> String {
    let mut out = String::new();
    if let Some(alias) = &node.alias {
        out.push_str(alias);
        out.push_str(": ");
    }
    out.push_str(&node.name);
    if !node.arguments.is_empty() {
        let args: Vec<String> = node
            .arguments
            .iter()
            .map(|(name, value)| format!("{}: {}", name, render_value(value)))
            .collect();
        out.push('(');
        out.push_str(&args.join(", "));
        out.push(')');
    }
    if !node.children.is_empty() {
        out.push_str(" { ");
        out.push_str(&render_nodes(&node.children));
        out.push_str(" }");
    }
    out
}

fn render_value(value: &QueryValue<'static, String>) -> String {
    match value {
        QueryValue::Variable(name) => format!("${}", name),
        QueryValue::Int(n) => n.as_i64().unwrap_or_default().to_string(),
        QueryValue::Float(f) => f.to_string(),
        QueryValue::String(s) => quote_string(s),
        QueryValue::Boolean(b) => b.to_string(),
        QueryValue::Null => "null".to_string(),
        QueryValue::Enum(e) => e.clone(),
        QueryValue::List(items) => {
            let items: Vec<String> = items.iter().map(render_value).collect();
            format!("[{}]", items.join(", "))
        }
        QueryValue::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(key, item)| format!("{}: {}", key, render_value(item)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

fn quote_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}
