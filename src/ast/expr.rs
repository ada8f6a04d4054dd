use super::{
    span::{Span, Spanned},
    value::Value,
};

/// A pipeline: an optional variable declaration followed by commands
/// chained with `|`. Each command's result is passed as the final argument
/// of the next one.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Declared or assigned variables, including the leading `$`.
    pub decl: Vec<String>,
    /// `true` for `$x = ...`, `false` for `$x := ...`.
    pub is_assign: bool,
    pub cmds: Vec<Command>,
    pub span: Span,
}

/// One stage of a pipeline: a function name followed by its arguments, or
/// a single non-function operand.
#[derive(Debug, Clone)]
pub struct Command {
    pub args: Vec<Operand>,
    pub span: Span,
}

pub type Operand = Spanned<OperandKind>;

#[derive(Debug, Clone)]
pub enum OperandKind {
    /// The cursor: `.`
    Dot,
    /// `nil`
    Nil,
    /// String, number or boolean literal.
    Literal(Value),
    /// Field chain on the cursor: `.Author.Name`
    Field(Vec<String>),
    /// Variable with an optional field chain: `$`, `$v`, `$v.Name`
    Variable { name: String, fields: Vec<String> },
    /// Function name: `bind`, `eq`, user registered names.
    Func(String),
    /// Parenthesized pipeline with an optional field chain: `(index . 0).ID`
    Pipe {
        pipe: Box<Pipeline>,
        fields: Vec<String>,
    },
}
