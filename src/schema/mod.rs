//! Graph schema definition and DDL validation.
//!
//! A [`GraphSchema`] is immutable once built; DDL produces a new copy via
//! [`GraphSchema::apply_ddl`], which is what the coordinator publishes at
//! the snapshot the DDL became effective.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::SnapshotId;

/// Value type of a declared property.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PropertyType {
    /// Signed 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// UTF-8 string.
    Str,
    /// Boolean.
    Bool,
}

/// Declared property of a vertex or edge type.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Property name.
    pub name: String,
    /// Property value type.
    pub kind: PropertyType,
}

impl PropertyDef {
    /// Builds a property definition.
    pub fn new(name: impl Into<String>, kind: PropertyType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Vertex type definition.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VertexTypeDef {
    /// Label.
    pub label: String,
    /// Declared properties.
    pub properties: Vec<PropertyDef>,
}

/// Edge type definition with the `(src, dst)` vertex label pairs it may connect.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct EdgeTypeDef {
    /// Label.
    pub label: String,
    /// Declared properties.
    pub properties: Vec<PropertyDef>,
    /// Allowed `(src_label, dst_label)` pairs.
    pub kinds: BTreeSet<(String, String)>,
}

/// Single schema mutation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum DdlOperation {
    /// Declares a new vertex type.
    CreateVertexType(VertexTypeDef),
    /// Removes a vertex type no edge kind references.
    DropVertexType {
        /// Label to drop.
        label: String,
    },
    /// Declares a new edge type with no kinds.
    CreateEdgeType {
        /// Label.
        label: String,
        /// Declared properties.
        properties: Vec<PropertyDef>,
    },
    /// Removes an edge type that has no kinds left.
    DropEdgeType {
        /// Label to drop.
        label: String,
    },
    /// Allows an edge type to connect `src` to `dst`.
    AddEdgeKind {
        /// Edge label.
        edge: String,
        /// Source vertex label.
        src: String,
        /// Destination vertex label.
        dst: String,
    },
    /// Disallows an edge type from connecting `src` to `dst`.
    RemoveEdgeKind {
        /// Edge label.
        edge: String,
        /// Source vertex label.
        src: String,
        /// Destination vertex label.
        dst: String,
    },
}

/// Human-readable reason a DDL batch was rejected.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DdlConflict(pub String);

impl fmt::Display for DdlConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Versioned graph schema. `version` is the snapshot id of the last DDL applied.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GraphSchema {
    /// Snapshot id at which this definition became effective.
    pub version: SnapshotId,
    /// Vertex types by label.
    pub vertex_types: BTreeMap<String, VertexTypeDef>,
    /// Edge types by label.
    pub edge_types: BTreeMap<String, EdgeTypeDef>,
}

impl GraphSchema {
    /// Returns `true` when `label` names a vertex type.
    pub fn has_vertex_type(&self, label: &str) -> bool {
        self.vertex_types.contains_key(label)
    }

    /// Returns `true` when `label` names an edge type.
    pub fn has_edge_type(&self, label: &str) -> bool {
        self.edge_types.contains_key(label)
    }

    /// Validates `ops` in order against this schema and returns the mutated copy.
    ///
    /// The batch is all-or-nothing: the first conflicting operation rejects it.
    /// The returned schema keeps this schema's version; callers stamp the
    /// effective snapshot with [`GraphSchema::with_version`].
    pub fn apply_ddl(&self, ops: &[DdlOperation]) -> Result<GraphSchema, DdlConflict> {
        if ops.is_empty() {
            return Err(DdlConflict("empty ddl batch".into()));
        }
        let mut next = self.clone();
        for op in ops {
            next.apply_one(op)?;
        }
        Ok(next)
    }

    /// Returns a copy stamped with `version`.
    pub fn with_version(mut self, version: SnapshotId) -> Self {
        self.version = version;
        self
    }

    fn apply_one(&mut self, op: &DdlOperation) -> Result<(), DdlConflict> {
        match op {
            DdlOperation::CreateVertexType(def) => {
                if def.label.is_empty() {
                    return Err(DdlConflict("vertex label must not be empty".into()));
                }
                if self.has_vertex_type(&def.label) || self.has_edge_type(&def.label) {
                    return Err(DdlConflict(format!("label '{}' already exists", def.label)));
                }
                check_unique_properties(&def.label, &def.properties)?;
                self.vertex_types.insert(def.label.clone(), def.clone());
            }
            DdlOperation::DropVertexType { label } => {
                if !self.has_vertex_type(label) {
                    return Err(DdlConflict(format!("vertex type '{label}' does not exist")));
                }
                let referenced = self.edge_types.values().find(|edge| {
                    edge.kinds
                        .iter()
                        .any(|(src, dst)| src == label || dst == label)
                });
                if let Some(edge) = referenced {
                    return Err(DdlConflict(format!(
                        "vertex type '{label}' is still referenced by edge type '{}'",
                        edge.label
                    )));
                }
                self.vertex_types.remove(label);
            }
            DdlOperation::CreateEdgeType { label, properties } => {
                if label.is_empty() {
                    return Err(DdlConflict("edge label must not be empty".into()));
                }
                if self.has_vertex_type(label) || self.has_edge_type(label) {
                    return Err(DdlConflict(format!("label '{label}' already exists")));
                }
                check_unique_properties(label, properties)?;
                self.edge_types.insert(
                    label.clone(),
                    EdgeTypeDef {
                        label: label.clone(),
                        properties: properties.clone(),
                        kinds: BTreeSet::new(),
                    },
                );
            }
            DdlOperation::DropEdgeType { label } => {
                let Some(edge) = self.edge_types.get(label) else {
                    return Err(DdlConflict(format!("edge type '{label}' does not exist")));
                };
                if !edge.kinds.is_empty() {
                    return Err(DdlConflict(format!(
                        "edge type '{label}' still has {} kind(s)",
                        edge.kinds.len()
                    )));
                }
                self.edge_types.remove(label);
            }
            DdlOperation::AddEdgeKind { edge, src, dst } => {
                for vertex in [src, dst] {
                    if !self.has_vertex_type(vertex) {
                        return Err(DdlConflict(format!("vertex type '{vertex}' does not exist")));
                    }
                }
                let Some(def) = self.edge_types.get_mut(edge) else {
                    return Err(DdlConflict(format!("edge type '{edge}' does not exist")));
                };
                if !def.kinds.insert((src.clone(), dst.clone())) {
                    return Err(DdlConflict(format!(
                        "edge kind '{src}'-['{edge}']->'{dst}' already exists"
                    )));
                }
            }
            DdlOperation::RemoveEdgeKind { edge, src, dst } => {
                let Some(def) = self.edge_types.get_mut(edge) else {
                    return Err(DdlConflict(format!("edge type '{edge}' does not exist")));
                };
                if !def.kinds.remove(&(src.clone(), dst.clone())) {
                    return Err(DdlConflict(format!(
                        "edge kind '{src}'-['{edge}']->'{dst}' does not exist"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn check_unique_properties(label: &str, properties: &[PropertyDef]) -> Result<(), DdlConflict> {
    let mut seen = BTreeSet::new();
    for prop in properties {
        if !seen.insert(prop.name.as_str()) {
            return Err(DdlConflict(format!(
                "property '{}' declared twice on '{label}'",
                prop.name
            )));
        }
    }
    Ok(())
}
