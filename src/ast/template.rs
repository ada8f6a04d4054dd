use std::sync::Arc;

use super::expr::Pipeline;
use super::span::Spanned;

/// A named, parsed template body. Every `{{define}}` and `{{block}}` in a
/// source produces its own tree next to the tree of the surrounding body.
#[derive(Debug, Clone)]
pub struct Tree {
    pub name: String,
    pub root: List,
    /// Full source text the spans of this tree point into.
    pub source: Arc<str>,
}

impl Tree {
    /// A tree is empty when it holds nothing but whitespace text. Empty
    /// trees never replace an existing definition of the same name.
    pub fn is_empty(&self) -> bool {
        self.root.nodes.iter().all(|node| match &node.node {
            NodeKind::Text(text) => text.trim().is_empty(),
            _ => false,
        })
    }
}

/// A sequence of nodes whose output is concatenated.
#[derive(Debug, Clone, Default)]
pub struct List {
    pub nodes: Vec<Node>,
}

pub type Node = Spanned<NodeKind>;

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Raw text between actions, already trimmed by `{{-`/`-}}` markers.
    Text(String),

    /// `{{pipeline}}`. Prints the result unless the pipeline declares or
    /// assigns a variable.
    Action(Pipeline),

    /// `{{if p}} list {{else}} else_list {{end}}`. An `{{else if}}` chain is
    /// represented as a nested `If` in the else list.
    If(Branch),

    /// `{{range p}} list {{else}} else_list {{end}}`
    Range(Branch),

    /// `{{with p}} list {{else}} else_list {{end}}`
    With(Branch),

    /// `{{template "name" p}}`, also produced by `{{block}}`.
    Template {
        name: String,
        pipe: Option<Pipeline>,
    },

    /// `{{break}}`
    Break,

    /// `{{continue}}`
    Continue,
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub pipe: Pipeline,
    pub list: List,
    pub else_list: Option<List>,
}
