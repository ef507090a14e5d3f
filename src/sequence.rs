//! Submitted macro sequences.
//!
//! A submission is a tree: an ordered list of macro nodes, each carrying raw
//! parameter tokens and optionally hook children attached to named hook
//! places of the parent. The flat token form (`name p1 p2 ...`) is the
//! common single-macro case; the tree form is what sequence editors submit.
//!
//! Every node carries a `macro_line`, a human-readable `name(p1, p2, ...)`
//! rendering used in logs and error messages.

use serde::{Deserialize, Serialize};

use crate::error::{MacroError, MacroResult};

/// One macro invocation in a submitted tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceNode {
    /// Macro name.
    pub name: String,
    /// Raw parameter tokens, in schema order.
    #[serde(default)]
    pub params: Vec<String>,
    /// Client-assigned instance id. Internally assigned (negative,
    /// decrementing) when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Hook children attached to this node.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hooks: Vec<HookNode>,
}

/// A hook: a macro node attached to named hook places of its parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookNode {
    /// Hook places this node runs at. Empty means the parent's generic
    /// hook point.
    #[serde(default)]
    pub places: Vec<String>,
    /// The hook macro itself.
    pub node: SequenceNode,
}

impl SequenceNode {
    /// Build a node with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            id: None,
            hooks: Vec::new(),
        }
    }

    /// Append one raw parameter token.
    pub fn with_param(mut self, token: impl Into<String>) -> Self {
        self.params.push(token.into());
        self
    }

    /// Append several raw parameter tokens.
    pub fn with_params<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(tokens.into_iter().map(Into::into));
        self
    }

    /// Set a client-assigned instance id.
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    /// Attach a hook at the given places.
    pub fn with_hook<I, S>(mut self, node: SequenceNode, places: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hooks.push(HookNode {
            places: places.into_iter().map(Into::into).collect(),
            node,
        });
        self
    }

    /// `name(p1, p2, ...)` rendering for logs and errors.
    pub fn macro_line(&self) -> String {
        format!("{}({})", self.name, self.params.join(", "))
    }
}

/// A submitted tree: an ordered list of top-level macro nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sequence {
    /// Top-level nodes, executed in order.
    pub macros: Vec<SequenceNode>,
}

impl Sequence {
    /// Single-node sequence.
    pub fn single(node: SequenceNode) -> Self {
        Self { macros: vec![node] }
    }

    /// Build a single-macro sequence from flat tokens: the first token is
    /// the macro name, the rest are its parameters.
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> MacroResult<Self> {
        let mut iter = tokens.iter();
        let name = iter
            .next()
            .ok_or_else(|| MacroError::WrongParam("empty macro command".to_string()))?;
        let node = SequenceNode::new(name.as_ref())
            .with_params(iter.map(|t| t.as_ref().to_string()));
        Ok(Self::single(node))
    }

    /// Total node count, hooks included.
    pub fn node_count(&self) -> usize {
        fn count(node: &SequenceNode) -> usize {
            1 + node.hooks.iter().map(|h| count(&h.node)).sum::<usize>()
        }
        self.macros.iter().map(count).sum()
    }
}
