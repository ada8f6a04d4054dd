//! Template parser, built on [pest](https://pest.rs/).
//!
//! The grammar is defined in `template.pest`. Parsing happens in two
//! passes: pest pairs are first converted into a flat list of text and
//! action items, with trim markers applied to neighbouring text, and the
//! items are then assembled into one [`Tree`] per template. The second pass
//! is where control structures are matched with their `{{end}}` and where
//! variables and function names are checked.
//!
//! Use [`parse`] to convert source text into trees, which the executor in
//! [`crate::eval`] runs.

use std::sync::Arc;

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;

use crate::ast::expr::*;
use crate::ast::span::{Span, Spanned};
use crate::ast::template::*;
use crate::ast::value::Value;
use crate::error::ParseError;

#[derive(Parser)]
#[grammar = "parser/template.pest"]
struct TemplateParser;

/// Parse `source` as the body of the template `name`.
///
/// Returns the tree for `name` first, followed by one tree per
/// `{{define}}` and `{{block}}` in the source. `is_func` decides whether an
/// identifier names a callable function.
pub fn parse(
    name: &str,
    source: &str,
    is_func: &dyn Fn(&str) -> bool,
) -> Result<Vec<Tree>, ParseError> {
    let pairs = TemplateParser::parse(Rule::template, source).map_err(|e| {
        let span = pest_span_to_span(&e);
        ParseError::new(span, e.variant.message().into_owned())
    })?;

    let mut items = Vec::new();
    for pair in pairs {
        if pair.as_rule() == Rule::template {
            for inner in pair.into_inner() {
                match inner.as_rule() {
                    Rule::EOI => break,
                    _ => items.push(build_item(inner)?),
                }
            }
        }
    }
    apply_trim_markers(&mut items);

    let source: Arc<str> = Arc::from(source);
    let mut builder = TreeBuilder {
        items: items.into_iter(),
        vars: vec!["$".to_string()],
        range_depth: 0,
        depth: 0,
        source: Arc::clone(&source),
        is_func,
        defined: Vec::new(),
    };

    let root = match builder.list()? {
        (list, Terminator::Eof) => list,
        (_, term) => return Err(term.unexpected()),
    };

    let mut trees = Vec::with_capacity(builder.defined.len() + 1);
    trees.push(Tree {
        name: name.to_string(),
        root,
        source,
    });
    trees.append(&mut builder.defined);
    Ok(trees)
}

fn pest_span_to_span(e: &pest::error::Error<Rule>) -> Span {
    match &e.location {
        pest::error::InputLocation::Pos(p) => Span::new(*p, *p + 1),
        pest::error::InputLocation::Span((s, e)) => Span::new(*s, *e),
    }
}

fn pair_span(pair: &Pair<Rule>) -> Span {
    let s = pair.as_span();
    Span::new(s.start(), s.end())
}

// ── Flat items ──────────────────────────────────────────────────────────

struct Item {
    kind: ItemKind,
    span: Span,
    trim_left: bool,
    trim_right: bool,
}

enum ItemKind {
    Text(String),
    Comment,
    Stmt(Stmt),
}

enum Stmt {
    If(Pipeline),
    ElseIf(Pipeline),
    ElseWith(Pipeline),
    Else,
    End,
    Range(Pipeline),
    With(Pipeline),
    Define(String),
    Block(String, Pipeline),
    Template(String, Option<Pipeline>),
    Break,
    Continue,
    Pipeline(Pipeline),
}

fn build_item(pair: Pair<Rule>) -> Result<Item, ParseError> {
    let span = pair_span(&pair);
    let rule = pair.as_rule();

    if rule == Rule::text {
        return Ok(Item {
            kind: ItemKind::Text(pair.as_str().to_string()),
            span,
            trim_left: false,
            trim_right: false,
        });
    }

    let mut trim_left = false;
    let mut trim_right = false;
    let mut kind = ItemKind::Comment;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::open => trim_left = inner.into_inner().next().is_some(),
            Rule::close => trim_right = inner.into_inner().next().is_some(),
            Rule::statement => kind = ItemKind::Stmt(build_statement(inner)?),
            _ => {}
        }
    }

    Ok(Item {
        kind,
        span,
        trim_left,
        trim_right,
    })
}

fn build_statement(pair: Pair<Rule>) -> Result<Stmt, ParseError> {
    let inner = pair.into_inner().next().unwrap();
    let rule = inner.as_rule();
    if rule == Rule::pipeline {
        return Ok(Stmt::Pipeline(build_pipeline(inner)?));
    }
    let mut parts = inner.into_inner();

    let stmt = match rule {
        Rule::if_open => Stmt::If(build_pipeline(parts.next().unwrap())?),
        Rule::else_if => Stmt::ElseIf(build_pipeline(parts.next().unwrap())?),
        Rule::else_with => Stmt::ElseWith(build_pipeline(parts.next().unwrap())?),
        Rule::else_tag => Stmt::Else,
        Rule::end_tag => Stmt::End,
        Rule::range_open => Stmt::Range(build_pipeline(parts.next().unwrap())?),
        Rule::with_open => Stmt::With(build_pipeline(parts.next().unwrap())?),
        Rule::define_open => Stmt::Define(build_template_name(parts.next().unwrap())),
        Rule::block_open => {
            let name = build_template_name(parts.next().unwrap());
            Stmt::Block(name, build_pipeline(parts.next().unwrap())?)
        }
        Rule::template_call => {
            let name = build_template_name(parts.next().unwrap());
            let pipe = parts.next().map(build_pipeline).transpose()?;
            Stmt::Template(name, pipe)
        }
        Rule::break_tag => Stmt::Break,
        Rule::continue_tag => Stmt::Continue,
        _ => unreachable!("unexpected statement rule: {rule:?}"),
    };
    Ok(stmt)
}

fn build_template_name(pair: Pair<Rule>) -> String {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::raw_string => raw_string_content(inner),
        _ => extract_string_content(inner),
    }
}

// ── Pipeline building ───────────────────────────────────────────────────

fn build_pipeline(pair: Pair<Rule>) -> Result<Pipeline, ParseError> {
    let span = pair_span(&pair);
    let mut decl = Vec::new();
    let mut is_assign = false;
    let mut cmds = Vec::new();

    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::declaration => {
                for part in inner.into_inner() {
                    match part.as_rule() {
                        Rule::variable => decl.push(part.as_str().to_string()),
                        Rule::decl_op => is_assign = part.as_str() == "=",
                        _ => {}
                    }
                }
            }
            Rule::command => cmds.push(build_command(inner)?),
            _ => {}
        }
    }

    Ok(Pipeline {
        decl,
        is_assign,
        cmds,
        span,
    })
}

fn build_command(pair: Pair<Rule>) -> Result<Command, ParseError> {
    let span = pair_span(&pair);
    let args = pair
        .into_inner()
        .map(build_operand)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Command { args, span })
}

fn build_operand(pair: Pair<Rule>) -> Result<Operand, ParseError> {
    // operand wraps exactly one alternative
    let inner = pair.into_inner().next().unwrap();
    let span = pair_span(&inner);

    let kind = match inner.as_rule() {
        Rule::dot => OperandKind::Dot,
        Rule::nil_lit => OperandKind::Nil,
        Rule::bool_lit => OperandKind::Literal(Value::Bool(inner.as_str() == "true")),
        Rule::number => OperandKind::Literal(build_number(&inner)?),
        Rule::string_lit => OperandKind::Literal(Value::from(extract_string_content(inner))),
        Rule::raw_string => OperandKind::Literal(Value::from(raw_string_content(inner))),
        Rule::identifier => OperandKind::Func(inner.as_str().to_string()),
        Rule::field_ref => OperandKind::Field(split_fields(inner.as_str())),
        Rule::variable_ref => {
            let mut parts = inner.into_inner();
            let name = parts.next().unwrap().as_str().to_string();
            let fields = parts.next().map(|f| split_fields(f.as_str())).unwrap_or_default();
            OperandKind::Variable { name, fields }
        }
        Rule::paren_expr => {
            let mut parts = inner.into_inner();
            let pipe = build_pipeline(parts.next().unwrap())?;
            let fields = parts.next().map(|f| split_fields(f.as_str())).unwrap_or_default();
            OperandKind::Pipe {
                pipe: Box::new(pipe),
                fields,
            }
        }
        rule => {
            return Err(ParseError::new(
                span,
                format!("unexpected rule in operand position: {rule:?}"),
            ));
        }
    };

    Ok(Spanned::new(kind, span))
}

fn build_number(pair: &Pair<Rule>) -> Result<Value, ParseError> {
    let text = pair.as_str();
    let invalid = || ParseError::new(pair_span(pair), format!("invalid number: {text}"));

    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };

    if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        let n = i64::from_str_radix(hex, 16).map_err(|_| invalid())?;
        return Ok(Value::Int(if negative { -n } else { n }));
    }

    if !digits.contains(['.', 'e', 'E'])
        && let Ok(n) = text.parse::<i64>()
    {
        return Ok(Value::Int(n));
    }

    text.parse::<f64>().map(Value::Float).map_err(|_| invalid())
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn split_fields(chain: &str) -> Vec<String> {
    chain
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn extract_string_content(pair: Pair<Rule>) -> String {
    // string_lit = ${ "\"" ~ string_inner ~ "\"" }
    let inner = pair.into_inner().next().map(|p| p.as_str()).unwrap_or("");

    // Process escape sequences
    let mut result = String::new();
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some('0') => result.push('\0'),
                Some('"') => result.push('"'),
                Some('\'') => result.push('\''),
                Some('\\') => result.push('\\'),
                Some(c) => {
                    result.push('\\');
                    result.push(c);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(ch);
        }
    }
    result
}

fn raw_string_content(pair: Pair<Rule>) -> String {
    pair.into_inner()
        .next()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default()
}

// ── Trim markers ────────────────────────────────────────────────────────
//
// `{{- ` strips all trailing white space from the text before the action
// and ` -}}` strips all leading white space from the text after it. Text
// left empty by trimming is dropped together with comments, which produce
// no output.

fn is_space(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\r' | '\n')
}

fn apply_trim_markers(items: &mut Vec<Item>) {
    for i in 0..items.len() {
        let (trim_left, trim_right) = (items[i].trim_left, items[i].trim_right);

        if trim_left
            && i > 0
            && let ItemKind::Text(text) = &mut items[i - 1].kind
        {
            let len = text.trim_end_matches(is_space).len();
            text.truncate(len);
        }

        if trim_right
            && let Some(next) = items.get_mut(i + 1)
            && let ItemKind::Text(text) = &mut next.kind
        {
            let start = text.len() - text.trim_start_matches(is_space).len();
            text.drain(..start);
        }
    }

    items.retain(|item| match &item.kind {
        ItemKind::Text(text) => !text.is_empty(),
        ItemKind::Comment => false,
        ItemKind::Stmt(_) => true,
    });

    // Removing a comment can leave two text items next to each other.
    let mut merged: Vec<Item> = Vec::with_capacity(items.len());
    for item in items.drain(..) {
        if let ItemKind::Text(text) = &item.kind
            && let Some(prev) = merged.last_mut()
            && let ItemKind::Text(prev_text) = &mut prev.kind
        {
            prev_text.push_str(text);
            prev.span = prev.span.merge(item.span);
            continue;
        }
        merged.push(item);
    }
    *items = merged;
}

// ── Tree building ───────────────────────────────────────────────────────

/// What ended a list of nodes.
enum Terminator {
    Eof,
    End(Span),
    Else(Span),
    ElseIf(Pipeline, Span),
    ElseWith(Pipeline, Span),
}

impl Terminator {
    fn unexpected(self) -> ParseError {
        match self {
            Terminator::Eof => ParseError::new(Span::default(), "unexpected EOF"),
            Terminator::End(span) => ParseError::new(span, "unexpected {{end}}"),
            Terminator::Else(span) => ParseError::new(span, "unexpected {{else}}"),
            Terminator::ElseIf(_, span) => ParseError::new(span, "unexpected {{else if}}"),
            Terminator::ElseWith(_, span) => ParseError::new(span, "unexpected {{else with}}"),
        }
    }
}

fn outside_range(keyword: &str, span: Span) -> ParseError {
    ParseError::new(span, format!("{{{{{keyword}}}}} outside {{{{range}}}}"))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Control {
    If,
    Range,
    With,
}

impl Control {
    fn context(self) -> &'static str {
        match self {
            Control::If => "if",
            Control::Range => "range",
            Control::With => "with",
        }
    }
}

struct TreeBuilder<'a> {
    items: std::vec::IntoIter<Item>,
    /// Variables in scope, innermost last. `$` is always the first entry.
    vars: Vec<String>,
    range_depth: usize,
    /// Nesting depth of control structures and definitions.
    depth: usize,
    source: Arc<str>,
    is_func: &'a dyn Fn(&str) -> bool,
    defined: Vec<Tree>,
}

impl TreeBuilder<'_> {
    fn eof_span(&self) -> Span {
        Span::new(self.source.len(), self.source.len())
    }

    /// Collect nodes until a terminating action or the end of input.
    fn list(&mut self) -> Result<(List, Terminator), ParseError> {
        let mut list = List::default();

        while let Some(item) = self.items.next() {
            let span = item.span;
            let stmt = match item.kind {
                ItemKind::Text(text) => {
                    list.nodes.push(Spanned::new(NodeKind::Text(text), span));
                    continue;
                }
                ItemKind::Comment => continue,
                ItemKind::Stmt(stmt) => stmt,
            };

            let node = match stmt {
                Stmt::End => return Ok((list, Terminator::End(span))),
                Stmt::Else => return Ok((list, Terminator::Else(span))),
                Stmt::ElseIf(pipe) => return Ok((list, Terminator::ElseIf(pipe, span))),
                Stmt::ElseWith(pipe) => return Ok((list, Terminator::ElseWith(pipe, span))),

                Stmt::Pipeline(pipe) => {
                    self.check_pipeline(&pipe, "command")?;
                    NodeKind::Action(pipe)
                }
                Stmt::If(pipe) => self.control(Control::If, pipe, span)?,
                Stmt::Range(pipe) => self.control(Control::Range, pipe, span)?,
                Stmt::With(pipe) => self.control(Control::With, pipe, span)?,

                Stmt::Define(name) => {
                    if self.depth > 0 {
                        return Err(ParseError::new(
                            span,
                            format!("unexpected {{{{define {name:?}}}}} below top level"),
                        )
                        .with_hint("move the definition outside of other actions"));
                    }
                    self.definition(name, span)?;
                    continue;
                }
                Stmt::Block(name, pipe) => {
                    self.check_pipeline(&pipe, "block")?;
                    self.definition(name.clone(), span)?;
                    NodeKind::Template {
                        name,
                        pipe: Some(pipe),
                    }
                }
                Stmt::Template(name, pipe) => {
                    if let Some(pipe) = &pipe {
                        self.check_pipeline(pipe, "template clause")?;
                    }
                    NodeKind::Template { name, pipe }
                }

                Stmt::Break if self.range_depth == 0 => return Err(outside_range("break", span)),
                Stmt::Continue if self.range_depth == 0 => {
                    return Err(outside_range("continue", span));
                }
                Stmt::Break => NodeKind::Break,
                Stmt::Continue => NodeKind::Continue,
            };

            list.nodes.push(Spanned::new(node, span));
        }

        Ok((list, Terminator::Eof))
    }

    /// Parse an `if`, `range` or `with` whose opening action has been
    /// consumed, through its `{{end}}`.
    fn control(&mut self, kind: Control, pipe: Pipeline, span: Span) -> Result<NodeKind, ParseError> {
        let mark = self.vars.len();
        self.check_pipeline(&pipe, kind.context())?;

        self.depth += 1;
        if kind == Control::Range {
            self.range_depth += 1;
        }
        let (list, term) = self.list()?;
        if kind == Control::Range {
            self.range_depth -= 1;
        }

        let else_list = match term {
            Terminator::End(_) => None,
            Terminator::Else(_) => match self.list()? {
                (list, Terminator::End(_)) => Some(list),
                (_, Terminator::Eof) => return Err(self.unclosed(kind, span)),
                (_, term) => return Err(term.unexpected()),
            },
            // `{{else if b}}` is `{{else}}{{if b}}`. Chained onto an `if` the
            // two `{{end}}`s merge; anywhere else the outer one is still needed.
            Terminator::ElseIf(pipe, else_span) => {
                let nested = self.control(Control::If, pipe, else_span)?;
                Some(self.else_chain(kind, span, Spanned::new(nested, else_span), kind == Control::If)?)
            }
            Terminator::ElseWith(pipe, else_span) => {
                let nested = self.control(Control::With, pipe, else_span)?;
                Some(self.else_chain(kind, span, Spanned::new(nested, else_span), kind == Control::With)?)
            }
            Terminator::Eof => return Err(self.unclosed(kind, span)),
            term => return Err(term.unexpected()),
        };

        self.depth -= 1;
        self.vars.truncate(mark);

        let branch = Branch {
            pipe,
            list,
            else_list,
        };
        Ok(match kind {
            Control::If => NodeKind::If(branch),
            Control::Range => NodeKind::Range(branch),
            Control::With => NodeKind::With(branch),
        })
    }

    fn unclosed(&self, kind: Control, open: Span) -> ParseError {
        let (line, _) = open.line_col(&self.source);
        ParseError::new(
            self.eof_span(),
            format!("unexpected EOF: {{{{{}}}}} opened at line {line} has no {{{{end}}}}", kind.context()),
        )
    }

    /// The else list of `kind` when it opens with the chained control
    /// `nested`. Unless that control shares the outer `{{end}}`, the list
    /// continues up to the outer control's own `{{end}}`.
    fn else_chain(&mut self, kind: Control, open: Span, nested: Node, merged_end: bool) -> Result<List, ParseError> {
        if merged_end {
            return Ok(List { nodes: vec![nested] });
        }
        match self.list()? {
            (mut rest, Terminator::End(_)) => {
                rest.nodes.insert(0, nested);
                Ok(rest)
            }
            (_, Terminator::Eof) => Err(self.unclosed(kind, open)),
            (_, term) => Err(term.unexpected()),
        }
    }

    /// Parse the body of a `define` or `block` through its `{{end}}` and
    /// record it as a separate tree.
    fn definition(&mut self, name: String, span: Span) -> Result<(), ParseError> {
        let vars = std::mem::replace(&mut self.vars, vec!["$".to_string()]);
        let range_depth = std::mem::take(&mut self.range_depth);
        self.depth += 1;

        let root = match self.list()? {
            (list, Terminator::End(_)) => list,
            (_, Terminator::Eof) => {
                return Err(ParseError::new(
                    self.eof_span(),
                    format!("unexpected EOF in definition of {name:?}"),
                )
                .with_hint("close the definition with {{end}}"));
            }
            (_, term) => return Err(term.unexpected()),
        };

        self.depth -= 1;
        self.range_depth = range_depth;
        self.vars = vars;

        if name.is_empty() {
            return Err(ParseError::new(span, "template name must not be empty"));
        }
        self.defined.push(Tree {
            name,
            root,
            source: Arc::clone(&self.source),
        });
        Ok(())
    }

    // ── Checks ──────────────────────────────────────────────────────────

    /// Check every operand of `pipe` and bring its declared variables into
    /// scope.
    fn check_pipeline(&mut self, pipe: &Pipeline, context: &str) -> Result<(), ParseError> {
        let max_decl = if context == "range" { 2 } else { 1 };
        if pipe.decl.len() > max_decl {
            return Err(ParseError::new(
                pipe.span,
                format!("too many declarations in {context}"),
            ));
        }

        for (stage, cmd) in pipe.cmds.iter().enumerate() {
            if stage > 0
                && let Some(first) = cmd.args.first()
                && matches!(
                    first.node,
                    OperandKind::Dot | OperandKind::Nil | OperandKind::Literal(_)
                )
            {
                // With A|B|C, pipeline stage 2 is B
                return Err(ParseError::new(
                    cmd.span,
                    format!("non executable command in pipeline stage {}", stage + 1),
                ));
            }
            for arg in &cmd.args {
                self.check_operand(arg)?;
            }
        }

        if pipe.is_assign {
            for var in &pipe.decl {
                if !self.vars.contains(var) {
                    return Err(ParseError::new(pipe.span, format!("undefined variable {var:?}")));
                }
            }
        } else {
            self.vars.extend(pipe.decl.iter().cloned());
        }
        Ok(())
    }

    fn check_operand(&mut self, operand: &Operand) -> Result<(), ParseError> {
        match &operand.node {
            OperandKind::Variable { name, .. } if !self.vars.contains(name) => Err(
                ParseError::new(operand.span, format!("undefined variable {name:?}")),
            ),
            OperandKind::Func(name) if !(self.is_func)(name) => Err(ParseError::new(
                operand.span,
                format!("function {name:?} not defined"),
            )
            .with_hint("register it with Template::funcs before parsing")),
            OperandKind::Pipe { pipe, .. } => {
                if !pipe.decl.is_empty() {
                    return Err(ParseError::new(
                        pipe.span,
                        "parenthesized pipeline cannot declare variables",
                    ));
                }
                self.check_pipeline(pipe, "parenthesized pipeline")
            }
            _ => Ok(()),
        }
    }
}
