//! Schema composition: merges subgraph schemas into one supergraph and
//! derives the field-ownership index the planner routes with.

use std::collections::{BTreeMap, HashMap, HashSet};

use graphql_parser::parse_schema;
use graphql_parser::schema::{
    Definition, Directive, Document, Field, ObjectType, ObjectTypeExtension, Type, TypeDefinition,
    TypeExtension, Value,
};
use tracing::debug;

use crate::error::ComposeError;

/// One backend service and the slice of schema it owns.
#[derive(Debug)]
pub struct SubGraph {
    pub name: String,
    pub host: String,
    pub sdl: String,
    pub schema: Document<'static, String>,
    integrated: bool,
}

impl SubGraph {
    pub fn new(
        name: impl Into<String>,
        sdl: impl Into<String>,
        host: impl Into<String>,
    ) -> Result<Self, ComposeError> {
        let name = name.into();
        let sdl = sdl.into();
        let schema = parse_schema::<String>(&sdl)
            .map_err(|e| ComposeError::Parse {
                subgraph: name.clone(),
                message: e.to_string(),
            })?
            .into_static();

        Ok(SubGraph {
            name,
            host: host.into(),
            sdl,
            schema,
            integrated: false,
        })
    }

    pub fn is_integrated(&self) -> bool {
        self.integrated
    }
}

/// Base subgraph and key fields of a type split across subgraphs.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityKeys {
    pub owner: String,
    pub keys: Vec<String>,
}

/// The composed schema plus the ownership data derived from it. Immutable
/// once merged; the gateway publishes rebuilt instances by swap, never by
/// mutating a live one.
pub struct SuperGraph {
    subgraphs: Vec<SubGraph>,
    objects: BTreeMap<String, ObjectType<'static, String>>,
    object_owner: HashMap<String, String>,
    misc: BTreeMap<String, Definition<'static, String>>,
    ownership: HashMap<(String, String), String>,
    field_types: HashMap<(String, String), String>,
    entities: HashMap<String, EntityKeys>,
    composed: Document<'static, String>,
}

impl SuperGraph {
    pub fn new(root: Document<'static, String>, subgraphs: Vec<SubGraph>) -> Self {
        let mut graph = SuperGraph {
            subgraphs,
            objects: BTreeMap::new(),
            object_owner: HashMap::new(),
            misc: BTreeMap::new(),
            ownership: HashMap::new(),
            field_types: HashMap::new(),
            entities: HashMap::new(),
            composed: Document {
                definitions: Vec::new(),
            },
        };

        // Root definitions participate in the composed schema but claim no
        // ownership; fields only they declare must be picked up by a
        // subgraph or validation fails.
        for def in root.definitions {
            if let Definition::TypeDefinition(typedef) = def {
                // register_type cannot conflict without an owner
                let _ = graph.register_type(None, typedef);
            }
        }
        graph
    }

    pub fn from_source(src: &str) -> Result<Self, ComposeError> {
        let root = parse_schema::<String>(src)
            .map_err(|e| ComposeError::Parse {
                subgraph: "<root>".to_string(),
                message: e.to_string(),
            })?
            .into_static();
        Ok(SuperGraph::new(root, Vec::new()))
    }

    /// Integrates every subgraph not yet marked integrated, recomputes the
    /// composed schema and validates ownership. Idempotent: integrated
    /// subgraphs are skipped and repeat calls render byte-identical SDL.
    pub fn merge(&mut self) -> Result<(), ComposeError> {
        let pending: Vec<usize> = (0..self.subgraphs.len())
            .filter(|&i| !self.subgraphs[i].integrated)
            .collect();

        // Definitions before extensions, across all pending subgraphs, so
        // integration order between disjoint subgraphs cannot matter.
        for &i in &pending {
            let owner = self.subgraphs[i].name.clone();
            let defs = self.subgraphs[i].schema.definitions.clone();
            for def in defs {
                if let Definition::TypeDefinition(typedef) = def {
                    self.register_type(Some(&owner), typedef)?;
                }
            }
        }
        for &i in &pending {
            let owner = self.subgraphs[i].name.clone();
            let defs = self.subgraphs[i].schema.definitions.clone();
            for def in defs {
                if let Definition::TypeExtension(TypeExtension::Object(ext)) = def {
                    self.register_extension(&owner, ext)?;
                }
            }
        }

        for i in pending {
            self.subgraphs[i].integrated = true;
            debug!(subgraph = %self.subgraphs[i].name, "integrated subgraph");
        }

        self.recompute_composed();
        self.validate()
    }

    fn register_type(
        &mut self,
        owner: Option<&str>,
        typedef: TypeDefinition<'static, String>,
    ) -> Result<(), ComposeError> {
        let obj = match typedef {
            TypeDefinition::Object(obj) => obj,
            other => {
                // Scalars, enums, unions, interfaces and inputs are value
                // types; the first declaration wins.
                self.misc
                    .entry(type_definition_name(&other).to_string())
                    .or_insert(Definition::TypeDefinition(other));
                return Ok(());
            }
        };

        let type_name = obj.name.clone();
        if let (Some(owner), Some(keys)) = (owner, key_fields(&obj.directives)) {
            self.entities
                .entry(type_name.clone())
                .or_insert_with(|| EntityKeys {
                    owner: owner.to_string(),
                    keys,
                });
        }

        for field in &obj.fields {
            self.claim_field(owner, &type_name, field)?;
        }

        match self.objects.get_mut(&type_name) {
            Some(existing) => {
                for field in obj.fields {
                    if !existing.fields.iter().any(|f| f.name == field.name) {
                        existing.fields.push(field);
                    }
                }
            }
            None => {
                if let Some(owner) = owner {
                    self.object_owner.insert(type_name.clone(), owner.to_string());
                }
                self.objects.insert(type_name, obj);
            }
        }
        Ok(())
    }

    fn register_extension(
        &mut self,
        owner: &str,
        ext: ObjectTypeExtension<'static, String>,
    ) -> Result<(), ComposeError> {
        let type_name = ext.name.clone();
        if !self.objects.contains_key(&type_name) {
            return Err(ComposeError::UnknownExtensionTarget {
                subgraph: owner.to_string(),
                type_name,
            });
        }

        // An extension repeating @key marks the target as an entity even if
        // the base subgraph was registered without one.
        if !self.entities.contains_key(&type_name) {
            if let Some(keys) = key_fields(&ext.directives) {
                let base_owner = self
                    .object_owner
                    .get(&type_name)
                    .cloned()
                    .unwrap_or_else(|| owner.to_string());
                self.entities.insert(
                    type_name.clone(),
                    EntityKeys {
                        owner: base_owner,
                        keys,
                    },
                );
            }
        }

        for field in &ext.fields {
            self.claim_field(Some(owner), &type_name, field)?;
        }

        let base = self
            .objects
            .get_mut(&type_name)
            .ok_or_else(|| ComposeError::UnknownExtensionTarget {
                subgraph: owner.to_string(),
                type_name: type_name.clone(),
            })?;
        for field in ext.fields {
            if !base.fields.iter().any(|f| f.name == field.name) {
                base.fields.push(field);
            }
        }
        Ok(())
    }

    fn claim_field(
        &mut self,
        owner: Option<&str>,
        type_name: &str,
        field: &Field<'static, String>,
    ) -> Result<(), ComposeError> {
        let key = (type_name.to_string(), field.name.clone());
        self.field_types
            .insert(key.clone(), named_type(&field.field_type).to_string());

        // @external fields are references to another subgraph's field, not
        // declarations.
        if is_external(field) {
            return Ok(());
        }
        let Some(owner) = owner else { return Ok(()) };

        match self.ownership.get(&key) {
            Some(existing) if existing != owner => Err(ComposeError::SchemaConflict {
                type_name: type_name.to_string(),
                field: field.name.clone(),
                owners: vec![existing.clone(), owner.to_string()],
            }),
            _ => {
                self.ownership.insert(key, owner.to_string());
                Ok(())
            }
        }
    }

    fn recompute_composed(&mut self) {
        // Deterministic rendering: definitions sorted by type name, fields
        // sorted by name, so repeat merges and reordered disjoint subgraphs
        // render identical SDL.
        let mut all = self.misc.clone();
        for (name, obj) in &self.objects {
            let mut obj = obj.clone();
            obj.fields.sort_by(|a, b| a.name.cmp(&b.name));
            all.insert(
                name.clone(),
                Definition::TypeDefinition(TypeDefinition::Object(obj)),
            );
        }
        self.composed = Document {
            definitions: all.into_values().collect(),
        };
    }

    /// Every field reachable from the root operation types must have exactly
    /// one owning subgraph.
    fn validate(&self) -> Result<(), ComposeError> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = ["Query", "Mutation", "Subscription"]
            .into_iter()
            .filter(|name| self.objects.contains_key(*name))
            .collect();
        seen.extend(stack.iter().copied());

        while let Some(type_name) = stack.pop() {
            let obj = &self.objects[type_name];
            for field in &obj.fields {
                let key = (type_name.to_string(), field.name.clone());
                if !self.ownership.contains_key(&key) {
                    return Err(ComposeError::UnresolvedOwner {
                        type_name: type_name.to_string(),
                        field: field.name.clone(),
                    });
                }
                let inner = named_type(&field.field_type);
                if let Some((name, _)) = self.objects.get_key_value(inner) {
                    if seen.insert(name.as_str()) {
                        stack.push(name.as_str());
                    }
                }
            }
        }
        Ok(())
    }

    pub fn composed_sdl(&self) -> String {
        self.composed.to_string()
    }

    pub fn owner_of(&self, type_name: &str, field: &str) -> Option<&str> {
        self.ownership
            .get(&(type_name.to_string(), field.to_string()))
            .map(String::as_str)
    }

    pub fn field_type(&self, type_name: &str, field: &str) -> Option<&str> {
        self.field_types
            .get(&(type_name.to_string(), field.to_string()))
            .map(String::as_str)
    }

    pub fn entity(&self, type_name: &str) -> Option<&EntityKeys> {
        self.entities.get(type_name)
    }

    pub fn subgraph(&self, name: &str) -> Option<&SubGraph> {
        self.subgraphs.iter().find(|s| s.name == name)
    }

    pub fn subgraphs(&self) -> &[SubGraph] {
        &self.subgraphs
    }
}

fn named_type<'a>(ty: &'a Type<'static, String>) -> &'a str {
    match ty {
        Type::NamedType(name) => name,
        Type::ListType(inner) | Type::NonNullType(inner) => named_type(inner),
    }
}

fn is_external(field: &Field<'static, String>) -> bool {
    field.directives.iter().any(|d| d.name == "external")
}

fn key_fields(directives: &[Directive<'static, String>]) -> Option<Vec<String>> {
    let key = directives.iter().find(|d| d.name == "key")?;
    let (_, value) = key.arguments.iter().find(|(name, _)| name == "fields")?;
    match value {
        Value::String(fields) => Some(fields.split_whitespace().map(str::to_string).collect()),
        _ => None,
    }
}

fn type_definition_name<'a>(typedef: &'a TypeDefinition<'static, String>) -> &'a str {
    match typedef {
        TypeDefinition::Scalar(t) => &t.name,
        TypeDefinition::Object(t) => &t.name,
        TypeDefinition::Interface(t) => &t.name,
        TypeDefinition::Union(t) => &t.name,
        TypeDefinition::Enum(t) => &t.name,
        TypeDefinition::InputObject(t) => &t.name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PRODUCTS_SDL: &str = r#"
        type Query {
            products: [Product]
        }

        type Product @key(fields: "upc") {
            upc: String!
            name: String
            price: Int
        }
    "#;

    const REVIEWS_SDL: &str = r#"
        extend type Product @key(fields: "upc") {
            upc: String! @external
            reviews: [Review]
        }

        type Review {
            body: String
            author: String
        }
    "#;

    fn two_subgraph_supergraph() -> SuperGraph {
        let subgraphs = vec![
            SubGraph::new("products", PRODUCTS_SDL, "http://products:4001/graphql").unwrap(),
            SubGraph::new("reviews", REVIEWS_SDL, "http://reviews:4002/graphql").unwrap(),
        ];
        SuperGraph::new(Document { definitions: vec![] }, subgraphs)
    }

    #[test]
    fn merge_resolves_ownership_across_subgraphs() {
        let mut graph = two_subgraph_supergraph();
        graph.merge().unwrap();

        assert_eq!(graph.owner_of("Query", "products"), Some("products"));
        assert_eq!(graph.owner_of("Product", "name"), Some("products"));
        assert_eq!(graph.owner_of("Product", "reviews"), Some("reviews"));
        assert_eq!(graph.owner_of("Review", "body"), Some("reviews"));
        // @external reference never claims ownership
        assert_eq!(graph.owner_of("Product", "upc"), Some("products"));

        assert_eq!(
            graph.entity("Product"),
            Some(&EntityKeys {
                owner: "products".to_string(),
                keys: vec!["upc".to_string()],
            })
        );
        assert_eq!(graph.field_type("Query", "products"), Some("Product"));
        assert_eq!(graph.field_type("Product", "reviews"), Some("Review"));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut graph = two_subgraph_supergraph();
        graph.merge().unwrap();
        let first = graph.composed_sdl();

        graph.merge().unwrap();
        let second = graph.composed_sdl();

        assert_eq!(first, second);
        assert!(graph.subgraphs().iter().all(SubGraph::is_integrated));
        // extension fields were not re-registered
        assert_eq!(second.matches("reviews: [Review]").count(), 1);
    }

    #[test]
    fn composition_order_does_not_matter_for_disjoint_subgraphs() {
        let accounts = "type Query { me: User } type User { id: ID! }";
        let inventory = "type Query { warehouses: [String] }";

        let mut forward = SuperGraph::new(
            Document { definitions: vec![] },
            vec![
                SubGraph::new("accounts", accounts, "http://accounts/graphql").unwrap(),
                SubGraph::new("inventory", inventory, "http://inventory/graphql").unwrap(),
            ],
        );
        forward.merge().unwrap();

        let mut reverse = SuperGraph::new(
            Document { definitions: vec![] },
            vec![
                SubGraph::new("inventory", inventory, "http://inventory/graphql").unwrap(),
                SubGraph::new("accounts", accounts, "http://accounts/graphql").unwrap(),
            ],
        );
        reverse.merge().unwrap();

        assert_eq!(forward.composed_sdl(), reverse.composed_sdl());
    }

    #[test]
    fn conflicting_field_definitions_fail_naming_both_owners() {
        let first = "type Query { product: Product } type Product { price: Int }";
        let second = "type Product { price: Float }";

        let mut graph = SuperGraph::new(
            Document { definitions: vec![] },
            vec![
                SubGraph::new("catalog", first, "http://catalog/graphql").unwrap(),
                SubGraph::new("pricing", second, "http://pricing/graphql").unwrap(),
            ],
        );

        match graph.merge() {
            Err(ComposeError::SchemaConflict {
                type_name,
                field,
                owners,
            }) => {
                assert_eq!(type_name, "Product");
                assert_eq!(field, "price");
                assert!(owners.contains(&"catalog".to_string()));
                assert!(owners.contains(&"pricing".to_string()));
            }
            other => panic!("expected SchemaConflict, got {:?}", other.err()),
        }
    }

    #[test]
    fn reachable_field_without_owner_fails_composition() {
        let mut graph = SuperGraph::from_source("type Query { ghost: String }").unwrap();
        match graph.merge() {
            Err(ComposeError::UnresolvedOwner { type_name, field }) => {
                assert_eq!(type_name, "Query");
                assert_eq!(field, "ghost");
            }
            other => panic!("expected UnresolvedOwner, got {:?}", other.err()),
        }
    }

    #[test]
    fn malformed_schema_source_is_a_parse_error() {
        let err = SubGraph::new("broken", "type Query {", "http://broken/graphql").unwrap_err();
        assert!(matches!(err, ComposeError::Parse { .. }));
    }
}
