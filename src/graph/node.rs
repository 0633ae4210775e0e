//! Resource nodes and property references.
//!
//! A [`ResourceNode`] is the typed record of one declared resource. Its
//! property bag is a [`PropertyValue`] tree in which `${node.attribute}`
//! expressions have been parsed into explicit [`Reference`] values, so the
//! resolver can read edges off the tree instead of re-scanning strings.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use tracing::trace;

use crate::config::{ReplaceStrategy, ResourceConfig, StackConfig};
use crate::error::{ConfigError, GraphError, Result, StackError};

/// A pointer from a property to another node's output attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Target node id.
    pub node: String,
    /// Output attribute of the target.
    pub attribute: String,
}

/// One piece of an interpolated string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text.
    Text(String),
    /// A reference whose value is rendered as text.
    Ref(Reference),
}

/// A property value that may contain references.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// A scalar with no references.
    Literal(serde_json::Value),
    /// A whole-string reference; resolves to the raw output value.
    Reference(Reference),
    /// A string with embedded references; resolves to a string.
    Interpolate(Vec<Segment>),
    /// A list of values.
    List(Vec<PropertyValue>),
    /// A nested object.
    Map(BTreeMap<String, PropertyValue>),
}

/// A declared resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Unique id within the graph.
    pub id: String,
    /// Type tag, `provider:service:Kind`.
    pub type_tag: String,
    /// Property bag.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Explicit dependency ids.
    pub depends_on: Vec<String>,
    /// Properties whose change forces a replacement.
    pub immutable: BTreeSet<String>,
    /// Replacement strategy preference.
    pub replace_strategy: ReplaceStrategy,
}

impl Reference {
    /// Creates a reference to `node.attribute`.
    #[must_use]
    pub fn new(node: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}}}", self.node, self.attribute)
    }
}

impl PropertyValue {
    /// Parses a JSON value, turning `${node.attr}` expressions into references
    /// and substituting `${var.name}` from `variables`.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed expressions or undefined variables.
    pub fn parse(
        node_id: &str,
        value: &serde_json::Value,
        variables: &dyn Fn(&str) -> Option<serde_json::Value>,
    ) -> Result<Self> {
        match value {
            serde_json::Value::String(s) => parse_string(node_id, s, variables),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| Self::parse(node_id, item, variables))
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            serde_json::Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), Self::parse(node_id, v, variables)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Self::Map),
            other => Ok(Self::Literal(other.clone())),
        }
    }

    /// Calls `visit` for every reference in this value, with its property path.
    pub fn visit_references<'a>(&'a self, path: &str, visit: &mut dyn FnMut(&str, &'a Reference)) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => visit(path, r),
            Self::Interpolate(segments) => {
                for segment in segments {
                    if let Segment::Ref(r) = segment {
                        visit(path, r);
                    }
                }
            }
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.visit_references(&format!("{path}[{i}]"), visit);
                }
            }
            Self::Map(map) => {
                for (key, item) in map {
                    item.visit_references(&format!("{path}.{key}"), visit);
                }
            }
        }
    }

    /// Resolves this value to plain JSON.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` has no value for.
    pub fn resolve<F>(&self, lookup: &F) -> std::result::Result<serde_json::Value, Reference>
    where
        F: Fn(&Reference) -> Option<serde_json::Value>,
    {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Reference(r) => lookup(r).ok_or_else(|| r.clone()),
            Self::Interpolate(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Ref(r) => {
                            let value = lookup(r).ok_or_else(|| r.clone())?;
                            out.push_str(&value_as_text(&value));
                        }
                    }
                }
                Ok(serde_json::Value::String(out))
            }
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(serde_json::Value::Array),
            Self::Map(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.resolve(lookup)?)))
                .collect::<std::result::Result<serde_json::Map<_, _>, _>>()
                .map(serde_json::Value::Object),
        }
    }

    /// Returns true if the value holds at least one reference.
    #[must_use]
    pub fn has_references(&self) -> bool {
        let mut found = false;
        self.visit_references("", &mut |_, _| found = true);
        found
    }
}

impl ResourceNode {
    /// Creates a node from a type tag and raw property bag.
    ///
    /// `${var.*}` expressions are rejected; use [`ResourceNode::from_config`]
    /// to build nodes with variables and defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a property holds a malformed expression.
    pub fn new(
        id: impl Into<String>,
        type_tag: impl Into<String>,
        properties: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let id = id.into();
        let properties = parse_properties(&id, properties, &|_| None)?;
        Ok(Self {
            id,
            type_tag: type_tag.into(),
            properties,
            depends_on: Vec::new(),
            immutable: BTreeSet::new(),
            replace_strategy: ReplaceStrategy::Auto,
        })
    }

    /// Adds explicit dependencies.
    #[must_use]
    pub fn with_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Marks properties as immutable.
    #[must_use]
    pub fn with_immutable<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable.extend(fields.into_iter().map(Into::into));
        self
    }

    /// Sets the replacement strategy.
    #[must_use]
    pub const fn with_replace_strategy(mut self, strategy: ReplaceStrategy) -> Self {
        self.replace_strategy = strategy;
        self
    }

    /// Builds a node from its declaration, merging `extends` defaults under
    /// the declared properties and substituting variables.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown defaults, undefined variables or
    /// malformed expressions.
    pub fn from_config(resource: &ResourceConfig, stack: &StackConfig) -> Result<Self> {
        let mut merged = serde_json::Map::new();
        for name in &resource.extends {
            let block = stack.defaults.get(name).ok_or_else(|| {
                StackError::Config(ConfigError::UnknownDefaults {
                    name: name.clone(),
                    resource: resource.id.clone(),
                })
            })?;
            deep_merge(&mut merged, block);
        }
        deep_merge(&mut merged, &resource.properties);

        let variables = |name: &str| stack.variables.get(name).cloned();
        let properties = parse_properties(&resource.id, &merged, &variables)?;

        trace!(
            "Built node '{}' ({}) with {} properties",
            resource.id,
            resource.type_tag,
            properties.len()
        );

        Ok(Self {
            id: resource.id.clone(),
            type_tag: resource.type_tag.clone(),
            properties,
            depends_on: resource.depends_on.clone(),
            immutable: resource.immutable.iter().cloned().collect(),
            replace_strategy: resource.replace_strategy,
        })
    }

    /// Returns every reference in the property bag with its property path.
    #[must_use]
    pub fn references(&self) -> Vec<(String, &Reference)> {
        let mut refs = Vec::new();
        for (key, value) in &self.properties {
            value.visit_references(key, &mut |path, r| refs.push((path.to_string(), r)));
        }
        refs
    }

    /// Returns the ids this node depends on: referenced nodes first, in
    /// property order, then explicit dependencies. Each id appears once.
    #[must_use]
    pub fn dependency_ids(&self) -> Vec<&str> {
        let mut ids: IndexSet<&str> = IndexSet::new();
        for (_, r) in self.references() {
            ids.insert(r.node.as_str());
        }
        for dep in &self.depends_on {
            ids.insert(dep.as_str());
        }
        ids.into_iter().collect()
    }

    /// Checks that every reference and explicit dependency names a node in
    /// `known`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DanglingReference`] for the first unknown target.
    pub fn validate_references(&self, known: &HashSet<&str>) -> std::result::Result<(), GraphError> {
        for (path, r) in self.references() {
            if !known.contains(r.node.as_str()) {
                return Err(GraphError::DanglingReference {
                    node: self.id.clone(),
                    target: r.node.clone(),
                    location: format!("properties.{path}"),
                });
            }
        }
        for dep in &self.depends_on {
            if !known.contains(dep.as_str()) {
                return Err(GraphError::DanglingReference {
                    node: self.id.clone(),
                    target: dep.clone(),
                    location: String::from("depends_on"),
                });
            }
        }
        Ok(())
    }

    /// Resolves the property bag to plain JSON.
    ///
    /// # Errors
    ///
    /// Returns the first reference `lookup` has no value for.
    pub fn resolve<F>(&self, lookup: &F) -> std::result::Result<serde_json::Value, Reference>
    where
        F: Fn(&Reference) -> Option<serde_json::Value>,
    {
        self.properties
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.resolve(lookup)?)))
            .collect::<std::result::Result<serde_json::Map<_, _>, _>>()
            .map(serde_json::Value::Object)
    }
}

/// Builds the nodes enabled by the stack's endpoint setting, validating every
/// reference against that set.
///
/// # Errors
///
/// Returns the first construction or dangling-reference error.
pub fn build_nodes(stack: &StackConfig) -> Result<Vec<ResourceNode>> {
    let nodes = stack
        .active_resources()
        .map(|r| ResourceNode::from_config(r, stack))
        .collect::<Result<Vec<_>>>()?;

    let known: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    for node in &nodes {
        node.validate_references(&known)?;
    }

    Ok(nodes)
}

fn parse_properties(
    node_id: &str,
    properties: &serde_json::Map<String, serde_json::Value>,
    variables: &dyn Fn(&str) -> Option<serde_json::Value>,
) -> Result<BTreeMap<String, PropertyValue>> {
    properties
        .iter()
        .map(|(k, v)| Ok((k.clone(), PropertyValue::parse(node_id, v, variables)?)))
        .collect()
}

/// Deep-merges `overlay` into `base`. Nested objects merge; anything else in
/// `overlay` replaces the value in `base`.
pub fn deep_merge(
    base: &mut serde_json::Map<String, serde_json::Value>,
    overlay: &serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(serde_json::Value::Object(existing)), serde_json::Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Renders a resolved value inside an interpolated string.
fn value_as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// An expression found inside `${...}`.
enum Expression {
    Variable(serde_json::Value),
    Reference(Reference),
}

fn parse_expression(
    node_id: &str,
    raw: &str,
    variables: &dyn Fn(&str) -> Option<serde_json::Value>,
) -> Result<Expression> {
    let invalid = |reason: &str| {
        StackError::Graph(GraphError::InvalidReference {
            node: node_id.to_string(),
            expression: format!("${{{raw}}}"),
            reason: reason.to_string(),
        })
    };

    let (target, attribute) = raw
        .trim()
        .split_once('.')
        .ok_or_else(|| invalid("expected '<resource>.<attribute>'"))?;

    if target.is_empty() || attribute.is_empty() {
        return Err(invalid("expected '<resource>.<attribute>'"));
    }

    if target == "var" {
        return variables(attribute).map(Expression::Variable).ok_or_else(|| {
            StackError::Config(ConfigError::UndefinedVariable {
                name: attribute.to_string(),
                resource: node_id.to_string(),
            })
        });
    }

    Ok(Expression::Reference(Reference::new(target, attribute)))
}

fn parse_string(
    node_id: &str,
    s: &str,
    variables: &dyn Fn(&str) -> Option<serde_json::Value>,
) -> Result<PropertyValue> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut text = String::new();
    let mut rest = s;
    // A lone expression keeps the raw type of its value.
    let mut whole: Option<Expression> = None;
    let mut pieces = 0usize;

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix("$${") {
            text.push_str("${");
            rest = after;
            continue;
        }
        if let Some(after) = rest.strip_prefix("${") {
            let end = after.find('}').ok_or_else(|| {
                StackError::Graph(GraphError::InvalidReference {
                    node: node_id.to_string(),
                    expression: s.to_string(),
                    reason: String::from("unterminated '${'"),
                })
            })?;
            let expression = parse_expression(node_id, &after[..end], variables)?;
            rest = &after[end + 1..];

            if !text.is_empty() {
                segments.push(Segment::Text(std::mem::take(&mut text)));
                pieces += 1;
            }
            pieces += 1;
            match expression {
                Expression::Variable(value) => {
                    segments.push(Segment::Text(value_as_text(&value)));
                    whole = Some(Expression::Variable(value));
                }
                Expression::Reference(r) => {
                    segments.push(Segment::Ref(r.clone()));
                    whole = Some(Expression::Reference(r));
                }
            }
            continue;
        }

        let next = rest.find('$').map_or(rest.len(), |i| if i == 0 { 1 } else { i });
        text.push_str(&rest[..next]);
        rest = &rest[next..];
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
        pieces += 1;
    }

    if pieces == 1 {
        match whole {
            Some(Expression::Reference(r)) => return Ok(PropertyValue::Reference(r)),
            Some(Expression::Variable(value)) => return Ok(PropertyValue::Literal(value)),
            None => {}
        }
    }

    if segments.iter().all(|seg| matches!(seg, Segment::Text(_))) {
        let joined: String = segments
            .into_iter()
            .map(|seg| match seg {
                Segment::Text(t) => t,
                Segment::Ref(_) => String::new(),
            })
            .collect();
        return Ok(PropertyValue::Literal(serde_json::Value::String(joined)));
    }

    Ok(PropertyValue::Interpolate(segments))
}
