//! Pattern validation and compilation.
//!
//! Validation runs once per statement, before any instance exists. It rejects
//! malformed or non-numeric repeat bounds, range repeats without an until
//! clause, conflicting tag declarations and references to tags that are not
//! yet bound. The valid
//! tree is flattened into an arena indexed by [`NodeId`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use chrono::Duration;

use crate::error::{CepError, CepResult, ValidationError};
use crate::predicate::FilterPredicate;

use super::{CompiledBounds, FilterSpec, PatternNode};

/// Index of a node in a compiled pattern arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeId(usize);

/// Compiled node kinds.
pub(crate) enum NodeKind {
    Filter {
        event_type: String,
        tag: Option<String>,
        predicate: Option<Arc<dyn FilterPredicate>>,
    },
    Timer {
        interval: Duration,
    },
    Sequence(Vec<NodeId>),
    And(Vec<NodeId>),
    Or(Vec<NodeId>),
    Not(NodeId),
    Repeat(RepeatSpec),
    Every(NodeId),
}

/// Normalized repeat: `min..=max` iterations of `child`, closed early by `until`.
#[derive(Debug, Clone)]
pub(crate) struct RepeatSpec {
    pub(crate) child: NodeId,
    pub(crate) bounds: CompiledBounds,
    pub(crate) until: Option<NodeId>,
    /// Tags bound inside `child`; these become arrays.
    pub(crate) tags: Vec<String>,
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filter {
                event_type,
                tag,
                predicate,
            } => f
                .debug_struct("Filter")
                .field("event_type", event_type)
                .field("tag", tag)
                .field("predicate", predicate)
                .finish(),
            Self::Timer { interval } => f.debug_struct("Timer").field("interval", interval).finish(),
            Self::Sequence(c) => f.debug_tuple("Sequence").field(c).finish(),
            Self::And(c) => f.debug_tuple("And").field(c).finish(),
            Self::Or(c) => f.debug_tuple("Or").field(c).finish(),
            Self::Not(c) => f.debug_tuple("Not").field(c).finish(),
            Self::Repeat(spec) => f.debug_tuple("Repeat").field(spec).finish(),
            Self::Every(c) => f.debug_tuple("Every").field(c).finish(),
        }
    }
}

/// A validated pattern, shared read-only by all of its instances.
#[derive(Debug)]
pub struct CompiledPattern {
    nodes: Vec<NodeKind>,
    root: NodeId,
    expression: String,
    tags: Vec<String>,
}

impl CompiledPattern {
    /// Validates `node` and compiles it.
    ///
    /// # Errors
    ///
    /// Returns `CepError::Pattern` carrying the offending expression text.
    pub fn compile(node: &PatternNode) -> CepResult<Arc<Self>> {
        let expression = node.to_string();
        let mut compiler = Compiler::default();
        let root = compiler
            .visit(node, &BTreeSet::new(), false)
            .map_err(|error| CepError::pattern(error, expression.clone()))?;

        let mut tags: Vec<String> = compiler.declared.into_keys().collect();
        tags.sort();

        Ok(Arc::new(Self {
            nodes: compiler.nodes,
            root,
            expression,
            tags,
        }))
    }

    /// The rendered expression text.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Number of nodes in the compiled tree.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Every tag declared anywhere in the pattern, sorted.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub(crate) const fn root(&self) -> NodeId {
        self.root
    }

    pub(crate) fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0]
    }

    pub(crate) fn is_guard(&self, id: NodeId) -> bool {
        matches!(self.kind(id), NodeKind::Not(_))
    }
}

impl fmt::Display for CompiledPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expression)
    }
}

#[derive(Default)]
struct Compiler {
    nodes: Vec<NodeKind>,
    /// tag -> (event type, declared under a repeat)
    declared: HashMap<String, (String, bool)>,
}

impl Compiler {
    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(kind);
        NodeId(self.nodes.len() - 1)
    }

    /// `available` holds the tags bound before this node is armed.
    fn visit(
        &mut self,
        node: &PatternNode,
        available: &BTreeSet<String>,
        repeated: bool,
    ) -> Result<NodeId, ValidationError> {
        match node {
            PatternNode::Filter(spec) => self.visit_filter(spec, available, repeated),
            PatternNode::Timer { interval } => {
                if *interval <= Duration::zero() {
                    return Err(ValidationError::NonPositiveInterval {
                        millis: interval.num_milliseconds(),
                    });
                }
                Ok(self.push(NodeKind::Timer { interval: *interval }))
            }
            PatternNode::Sequence(children) => {
                require_operands("followed-by", children)?;
                let mut seen = available.clone();
                let mut ids = Vec::with_capacity(children.len());
                for child in children {
                    ids.push(self.visit(child, &seen, repeated)?);
                    collect_tags(child, &mut seen);
                }
                Ok(self.push(NodeKind::Sequence(ids)))
            }
            PatternNode::And(children) => {
                require_operands("and", children)?;
                let ids = self.visit_all(children, available, repeated)?;
                Ok(self.push(NodeKind::And(ids)))
            }
            PatternNode::Or(children) => {
                require_operands("or", children)?;
                let ids = self.visit_all(children, available, repeated)?;
                Ok(self.push(NodeKind::Or(ids)))
            }
            PatternNode::Not(child) => {
                let id = self.visit(child, available, repeated)?;
                Ok(self.push(NodeKind::Not(id)))
            }
            PatternNode::Every(child) => {
                let id = self.visit(child, available, repeated)?;
                Ok(self.push(NodeKind::Every(id)))
            }
            PatternNode::Repeat { child, bounds, until } => {
                let bounds = CompiledBounds::compile(bounds, until.is_some(), available)?;
                let child_id = self.visit(child, available, true)?;
                let until_id = match until {
                    Some(u) => Some(self.visit(u, available, repeated)?),
                    None => None,
                };
                let mut tags = BTreeSet::new();
                collect_tags(child, &mut tags);
                Ok(self.push(NodeKind::Repeat(RepeatSpec {
                    child: child_id,
                    bounds,
                    until: until_id,
                    tags: tags.into_iter().collect(),
                })))
            }
        }
    }

    fn visit_all(
        &mut self,
        children: &[PatternNode],
        available: &BTreeSet<String>,
        repeated: bool,
    ) -> Result<Vec<NodeId>, ValidationError> {
        children
            .iter()
            .map(|child| self.visit(child, available, repeated))
            .collect()
    }

    fn visit_filter(
        &mut self,
        spec: &FilterSpec,
        available: &BTreeSet<String>,
        repeated: bool,
    ) -> Result<NodeId, ValidationError> {
        if spec.event_type.trim().is_empty() {
            return Err(ValidationError::EmptyEventType);
        }

        for tag in spec.referenced_tags() {
            if !available.contains(&tag) {
                return Err(ValidationError::UnboundTagReference {
                    tag,
                    event_type: spec.event_type.clone(),
                });
            }
        }

        if let Some(tag) = &spec.tag {
            if let Some((previous_type, previous_repeated)) = self.declared.get(tag) {
                if *previous_repeated || repeated {
                    return Err(ValidationError::RepeatTagReused {
                        tag: tag.clone(),
                        event_type: spec.event_type.clone(),
                    });
                }
                return Err(ValidationError::DuplicateTag {
                    tag: tag.clone(),
                    event_type: spec.event_type.clone(),
                    previous_type: previous_type.clone(),
                });
            }
            self.declared
                .insert(tag.clone(), (spec.event_type.clone(), repeated));
        }

        Ok(self.push(NodeKind::Filter {
            event_type: spec.event_type.clone(),
            tag: spec.tag.clone(),
            predicate: spec.predicate.clone(),
        }))
    }
}

fn require_operands(operator: &'static str, children: &[PatternNode]) -> Result<(), ValidationError> {
    if children.len() < 2 {
        return Err(ValidationError::MissingOperands { operator, required: 2 });
    }
    Ok(())
}

/// Adds every tag declared in `node` to `out`.
fn collect_tags(node: &PatternNode, out: &mut BTreeSet<String>) {
    match node {
        PatternNode::Filter(spec) => {
            if let Some(tag) = &spec.tag {
                out.insert(tag.clone());
            }
        }
        PatternNode::Timer { .. } => {}
        PatternNode::Sequence(children) | PatternNode::And(children) | PatternNode::Or(children) => {
            for child in children {
                collect_tags(child, out);
            }
        }
        PatternNode::Not(child) | PatternNode::Every(child) => collect_tags(child, out),
        PatternNode::Repeat { child, until, .. } => {
            collect_tags(child, out);
            if let Some(u) = until {
                collect_tags(u, out);
            }
        }
    }
}
