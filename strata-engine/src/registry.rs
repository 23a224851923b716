//! Typed field-accessor registry
//!
//! Each entity kind registers its queryable fields once, at startup. A field
//! name is resolved into a JSON pointer and a declared type at registration;
//! filters are compiled against the registry so evaluating them per record is
//! a pointer walk and a comparison, never a name lookup.

use crate::core::{Value, key_kind};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),

    #[error("unknown field {field} on {kind}")]
    UnknownField { kind: String, field: String },

    #[error("entity kind {0} is already registered")]
    DuplicateKind(String),

    #[error("field {field} is declared twice on {kind}")]
    DuplicateField { kind: String, field: String },

    #[error("invalid field path: {0}")]
    InvalidPath(String),

    #[error("field {field} expects {expected:?}, got {got}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        got: String,
    },

    #[error("operator {op:?} is not supported on {field} ({ty:?})")]
    UnsupportedOperator {
        field: String,
        op: FilterOp,
        ty: FieldType,
    },
}

/// Declared type of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Bool,
    /// Arrays, objects or mixed values; equality and containment only
    Any,
}

impl FieldType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Any => true,
        }
    }

    fn is_ordered(&self) -> bool {
        matches!(self, Self::String | Self::Integer | Self::Float)
    }
}

/// Resolved accessor for one field
#[derive(Debug, Clone)]
pub struct FieldAccessor {
    name: String,
    pointer: String,
    ty: FieldType,
}

impl FieldAccessor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.ty
    }

    /// Read the field out of an entity document
    pub fn read<'a>(&self, entity: &'a Value) -> Option<&'a Value> {
        entity.pointer(&self.pointer)
    }
}

/// Queryable fields of one entity kind
#[derive(Debug, Clone)]
pub struct EntitySchema {
    kind: String,
    fields: HashMap<String, FieldAccessor>,
}

impl EntitySchema {
    pub fn builder(kind: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn accessor(&self, field: &str) -> Option<&FieldAccessor> {
        self.fields.get(field)
    }
}

pub struct SchemaBuilder {
    kind: String,
    fields: Vec<(String, String, FieldType)>,
}

impl SchemaBuilder {
    /// Top-level field
    pub fn field(self, name: &str, ty: FieldType) -> Self {
        self.nested(name, name, ty)
    }

    /// Field at a dotted path (`profile.age`)
    pub fn nested(mut self, name: &str, path: &str, ty: FieldType) -> Self {
        self.fields.push((name.to_string(), path.to_string(), ty));
        self
    }

    pub fn build(self) -> Result<EntitySchema, RegistryError> {
        let mut fields = HashMap::with_capacity(self.fields.len());
        for (name, path, ty) in self.fields {
            if path.is_empty() || path.split('.').any(str::is_empty) {
                return Err(RegistryError::InvalidPath(path));
            }
            let pointer = path
                .split('.')
                .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
                .collect::<String>();
            let accessor = FieldAccessor {
                name: name.clone(),
                pointer,
                ty,
            };
            if fields.insert(name.clone(), accessor).is_some() {
                return Err(RegistryError::DuplicateField {
                    kind: self.kind,
                    field: name,
                });
            }
        }
        Ok(EntitySchema {
            kind: self.kind,
            fields,
        })
    }
}

/// Filter operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
}

impl FilterOp {
    /// Parse the textual operator used by the CLI (`=`, `!=`, `>`, `~` ...)
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "=" | "==" | "eq" => Some(Self::Eq),
            "!=" | "ne" => Some(Self::Ne),
            ">" | "gt" => Some(Self::Gt),
            ">=" | "gte" => Some(Self::Gte),
            "<" | "lt" => Some(Self::Lt),
            "<=" | "lte" => Some(Self::Lte),
            "~" | "contains" => Some(Self::Contains),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

/// Uncompiled simple-filter query over one entity kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub kind: String,
    pub conditions: Vec<Condition>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            conditions: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, field: &str, op: FilterOp, value: Value) -> Self {
        self.conditions.push(Condition {
            field: field.to_string(),
            op,
            value,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone)]
struct Predicate {
    accessor: FieldAccessor,
    op: FilterOp,
    operand: Value,
}

impl Predicate {
    fn matches(&self, entity: &Value) -> bool {
        let Some(actual) = self.accessor.read(entity) else {
            return self.op == FilterOp::Ne;
        };
        match self.op {
            FilterOp::Eq => values_equal(actual, &self.operand),
            FilterOp::Ne => !values_equal(actual, &self.operand),
            FilterOp::Gt => compare(actual, &self.operand) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare(actual, &self.operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::Lt => compare(actual, &self.operand) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare(actual, &self.operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Contains => match (actual, &self.operand) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
                _ => false,
            },
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Query resolved against the registry
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    kind: String,
    predicates: Vec<Predicate>,
    limit: Option<usize>,
}

impl CompiledFilter {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// True if the key belongs to the filtered kind
    pub fn matches_key(&self, key: &str) -> bool {
        key_kind(key) == self.kind
    }

    /// True if the entity satisfies every condition
    pub fn matches(&self, entity: &Value) -> bool {
        self.predicates.iter().all(|p| p.matches(entity))
    }
}

/// Registry of entity schemas, built once at startup
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    schemas: HashMap<String, Arc<EntitySchema>>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: EntitySchema) -> Result<(), RegistryError> {
        if self.schemas.contains_key(&schema.kind) {
            return Err(RegistryError::DuplicateKind(schema.kind));
        }
        self.schemas.insert(schema.kind.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn schema(&self, kind: &str) -> Option<Arc<EntitySchema>> {
        self.schemas.get(kind).cloned()
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.schemas.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Resolve field names and check operand types
    pub fn compile(&self, query: &Query) -> Result<CompiledFilter, RegistryError> {
        let schema = self
            .schemas
            .get(&query.kind)
            .ok_or_else(|| RegistryError::UnknownKind(query.kind.clone()))?;

        let mut predicates = Vec::with_capacity(query.conditions.len());
        for condition in &query.conditions {
            let accessor =
                schema
                    .accessor(&condition.field)
                    .ok_or_else(|| RegistryError::UnknownField {
                        kind: query.kind.clone(),
                        field: condition.field.clone(),
                    })?;
            let ty = accessor.field_type();

            let ordered = matches!(
                condition.op,
                FilterOp::Gt | FilterOp::Gte | FilterOp::Lt | FilterOp::Lte
            );
            if (ordered && !ty.is_ordered())
                || (condition.op == FilterOp::Contains
                    && !matches!(ty, FieldType::String | FieldType::Any))
            {
                return Err(RegistryError::UnsupportedOperator {
                    field: condition.field.clone(),
                    op: condition.op,
                    ty,
                });
            }
            if condition.op != FilterOp::Contains && !ty.accepts(&condition.value) {
                return Err(RegistryError::TypeMismatch {
                    field: condition.field.clone(),
                    expected: ty,
                    got: condition.value.to_string(),
                });
            }

            predicates.push(Predicate {
                accessor: accessor.clone(),
                op: condition.op,
                operand: condition.value.clone(),
            });
        }

        Ok(CompiledFilter {
            kind: query.kind.clone(),
            predicates,
            limit: query.limit,
        })
    }
}
