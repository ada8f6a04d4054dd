//! Template execution engine.
//!
//! The [`Executor`] walks the parsed trees of a namespace and writes the
//! output into a [`Query`]. Functions are dispatched through a per-execution
//! table, a snapshot of the registry with the binding interceptor layered on
//! top, falling back to the builtins.
//!
//! Variables are managed internally: `$` is the data the template was
//! invoked with, and variables declared in an action stay in scope until the
//! enclosing control structure ends.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ast::expr::*;
use crate::ast::template::*;
use crate::ast::value::Value;
use crate::error::{EvalError, EvalErrorKind, FuncError};
use crate::query::Query;
use crate::registry::{FuncRef, builtins};

mod context;

pub use context::CallContext;

/// Default limit on nested `{{template}}` invocations.
pub const DEFAULT_MAX_DEPTH: usize = 200;

// ── Execution options ───────────────────────────────────────────────────

/// What a field chain yields when a map has no entry for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingKey {
    /// The missing entry reads as nil.
    Null,
    /// Execution stops with a [`MissingKey`](EvalErrorKind::MissingKey)
    /// error.
    #[default]
    Error,
}

/// Configuration for template execution.
///
/// Create with [`ExecOptions::new()`] and chain builder methods:
///
/// ```rust
/// use pgtmpl::{ExecOptions, MissingKey};
///
/// let opts = ExecOptions::new().missing_key(MissingKey::Null).max_depth(50);
/// assert_eq!(opts.max_depth, 50);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    pub missing_key: MissingKey,

    /// Maximum nesting of `{{template}}` invocations before execution fails
    /// with a [`RecursionLimit`](EvalErrorKind::RecursionLimit) error.
    pub max_depth: usize,
}

impl ExecOptions {
    /// Create a new `ExecOptions` with all defaults (missing keys are
    /// errors, depth limited to [`DEFAULT_MAX_DEPTH`]).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn missing_key(mut self, policy: MissingKey) -> Self {
        self.missing_key = policy;
        self
    }

    pub fn max_depth(mut self, limit: usize) -> Self {
        self.max_depth = limit;
        self
    }
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            missing_key: MissingKey::Error,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

// ── Executor ────────────────────────────────────────────────────────────

static NULL: Value = Value::Null;

/// Control flow signal out of a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Normal,
    Break,
    Continue,
}

/// Runs one execution of a template against its namespace.
pub struct Executor<'a> {
    trees: &'a HashMap<String, Arc<Tree>>,
    funcs: &'a HashMap<String, FuncRef>,
    query: &'a mut Query,
    options: &'a ExecOptions,
    /// Variables in scope, innermost last.
    vars: Vec<(String, Value)>,
    /// Name of the template currently being walked.
    name: &'a str,
    depth: usize,
}

impl<'a> Executor<'a> {
    pub fn new(
        trees: &'a HashMap<String, Arc<Tree>>,
        funcs: &'a HashMap<String, FuncRef>,
        query: &'a mut Query,
        options: &'a ExecOptions,
    ) -> Self {
        Self {
            trees,
            funcs,
            query,
            options,
            vars: Vec::new(),
            name: "",
            depth: 0,
        }
    }

    /// Execute the template `name` with `data` as both `.` and `$`.
    pub fn run(&mut self, name: &str, data: Value) -> Result<(), EvalError> {
        let trees = self.trees;
        let tree = trees
            .get(name)
            .ok_or_else(|| EvalError::undefined_template(name))?;

        self.vars = vec![("$".to_string(), data)];
        self.name = tree.name.as_str();
        let dot = self.vars[0].1.clone();
        self.walk_list(&tree.root, &dot)
            .map(|_| ())
            .map_err(|e| e.locate(&tree.name, &tree.source))
    }

    // ── Variables ───────────────────────────────────────────────────────

    fn lookup_var(&self, name: &str) -> Result<&Value, EvalError> {
        self.vars
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| EvalError::undefined_variable(name))
    }

    fn assign_var(&mut self, name: &str, value: Value) -> Result<(), EvalError> {
        match self.vars.iter_mut().rev().find(|(n, _)| n == name) {
            Some((_, slot)) => {
                *slot = value;
                Ok(())
            }
            None => Err(EvalError::undefined_variable(name)),
        }
    }

    fn set_var(&mut self, name: &str, is_assign: bool, value: Value) -> Result<(), EvalError> {
        if is_assign {
            self.assign_var(name, value)
        } else {
            self.vars.push((name.to_string(), value));
            Ok(())
        }
    }

    // ── Lists and control structures ────────────────────────────────────

    fn walk_list(&mut self, list: &List, dot: &Value) -> Result<Flow, EvalError> {
        for node in &list.nodes {
            let flow = self
                .walk_node(&node.node, dot)
                .map_err(|e| e.with_span(node.span))?;
            if flow != Flow::Normal {
                return Ok(flow);
            }
        }
        Ok(Flow::Normal)
    }

    fn walk_node(&mut self, node: &NodeKind, dot: &Value) -> Result<Flow, EvalError> {
        match node {
            NodeKind::Text(text) => self.query.push_str(text),
            NodeKind::Action(pipe) => {
                let value = self.eval_pipeline(pipe, dot)?;
                if pipe.decl.is_empty() {
                    self.print(&value);
                }
            }
            NodeKind::If(branch) => return self.walk_if_or_with(branch, dot, false),
            NodeKind::With(branch) => return self.walk_if_or_with(branch, dot, true),
            NodeKind::Range(branch) => return self.walk_range(branch, dot),
            NodeKind::Template { name, pipe } => {
                let data = match pipe {
                    Some(pipe) => self.eval_pipeline(pipe, dot)?,
                    None => Value::Null,
                };
                self.walk_template(name, data)?;
            }
            NodeKind::Break => return Ok(Flow::Break),
            NodeKind::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    fn walk_if_or_with(&mut self, branch: &Branch, dot: &Value, is_with: bool) -> Result<Flow, EvalError> {
        let mark = self.vars.len();
        let value = self.eval_pipeline(&branch.pipe, dot)?;

        let flow = if value.is_truthy() {
            let dot = if is_with { &value } else { dot };
            self.walk_list(&branch.list, dot)
        } else if let Some(else_list) = &branch.else_list {
            self.walk_list(else_list, dot)
        } else {
            Ok(Flow::Normal)
        };

        self.vars.truncate(mark);
        flow
    }

    fn walk_range(&mut self, branch: &Branch, dot: &Value) -> Result<Flow, EvalError> {
        let mark = self.vars.len();
        let pipe = &branch.pipe;
        let value = self.eval_pipeline(pipe, dot)?;

        let items: Vec<(Value, Value)> = match value {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| (Value::from(i), item))
                .collect(),
            Value::Map(entries) => entries
                .into_iter()
                .map(|(key, item)| (Value::from(key), item))
                .collect(),
            Value::Int(n) => (0..n.max(0)).map(|i| (Value::Int(i), Value::Int(i))).collect(),
            Value::Null => Vec::new(),
            other => return Err(EvalError::not_iterable(other.type_name())),
        };

        if items.is_empty() {
            let flow = match &branch.else_list {
                Some(else_list) => self.walk_list(else_list, dot)?,
                None => Flow::Normal,
            };
            self.vars.truncate(mark);
            return Ok(flow);
        }

        for (key, item) in items {
            // The declared variables are the innermost of their names here.
            match pipe.decl.as_slice() {
                [elem] => self.assign_var(elem, item.clone())?,
                [index, elem] => {
                    self.assign_var(index, key)?;
                    self.assign_var(elem, item.clone())?;
                }
                _ => {}
            }

            let iteration = self.vars.len();
            let flow = self.walk_list(&branch.list, &item)?;
            self.vars.truncate(iteration);
            if flow == Flow::Break {
                break;
            }
        }

        self.vars.truncate(mark);
        Ok(Flow::Normal)
    }

    fn walk_template(&mut self, name: &str, data: Value) -> Result<(), EvalError> {
        if self.depth >= self.options.max_depth {
            return Err(EvalError::new(
                EvalErrorKind::RecursionLimit,
                format!(
                    "exceeded maximum template depth ({})",
                    self.options.max_depth
                ),
            ));
        }
        let trees = self.trees;
        let tree = trees
            .get(name)
            .ok_or_else(|| EvalError::undefined_template(name))?;

        self.depth += 1;
        let vars = std::mem::replace(&mut self.vars, vec![("$".to_string(), data.clone())]);
        let caller = std::mem::replace(&mut self.name, tree.name.as_str());

        let result = self
            .walk_list(&tree.root, &data)
            .map_err(|e| e.locate(&tree.name, &tree.source));

        self.name = caller;
        self.vars = vars;
        self.depth -= 1;
        result.map(|_| ())
    }

    fn print(&mut self, value: &Value) {
        match value {
            Value::String(s) => self.query.push_str(s),
            other => self.query.push_str(&other.to_string()),
        }
    }

    // ── Pipelines ───────────────────────────────────────────────────────

    /// Evaluate a pipeline and apply its declaration, if any.
    fn eval_pipeline(&mut self, pipe: &Pipeline, dot: &Value) -> Result<Value, EvalError> {
        let value = self.eval_commands(pipe, dot)?;
        for var in &pipe.decl {
            self.set_var(var, pipe.is_assign, value.clone())?;
        }
        Ok(value)
    }

    /// Evaluate the commands of a pipeline, passing each result as the final
    /// argument of the next command.
    fn eval_commands(&mut self, pipe: &Pipeline, dot: &Value) -> Result<Value, EvalError> {
        let mut value = None;
        for cmd in &pipe.cmds {
            let result = self
                .eval_command(cmd, dot, value.take())
                .map_err(|e| e.with_span(cmd.span))?;
            value = Some(result);
        }
        Ok(value.unwrap_or_default())
    }

    fn eval_command(&mut self, cmd: &Command, dot: &Value, last: Option<Value>) -> Result<Value, EvalError> {
        let Some((first, args)) = cmd.args.split_first() else {
            return Ok(last.unwrap_or_default());
        };

        match &first.node {
            OperandKind::Func(name) => return self.call_func(name, args, dot, last),
            OperandKind::Nil => {
                return Err(EvalError::new(EvalErrorKind::TypeError, "nil is not a command"));
            }
            _ => {}
        }

        if !args.is_empty() || last.is_some() {
            return Err(EvalError::new(
                EvalErrorKind::TypeError,
                format!("can't give argument to non-function {}", describe(&first.node)),
            ));
        }
        self.eval_arg(first, dot)
    }

    fn eval_arg(&mut self, operand: &Operand, dot: &Value) -> Result<Value, EvalError> {
        let value = match &operand.node {
            OperandKind::Dot => Ok(dot.clone()),
            OperandKind::Nil => Ok(Value::Null),
            OperandKind::Literal(value) => Ok(value.clone()),
            OperandKind::Field(fields) => self.eval_fields(dot, fields),
            OperandKind::Variable { name, fields } => self
                .lookup_var(name)
                .and_then(|value| self.eval_fields(value, fields)),
            OperandKind::Func(name) => self.call_func(name, &[], dot, None),
            OperandKind::Pipe { pipe, fields } => {
                let value = self.eval_commands(pipe, dot)?;
                self.eval_fields(&value, fields)
            }
        };
        value.map_err(|e| e.with_span(operand.span))
    }

    /// Walk a field chain through nested maps.
    fn eval_fields(&self, receiver: &Value, fields: &[String]) -> Result<Value, EvalError> {
        let mut current = receiver;
        for field in fields {
            current = match current {
                Value::Map(entries) => match entries.get(field) {
                    Some(value) => value,
                    None if self.options.missing_key == MissingKey::Null => &NULL,
                    None => return Err(EvalError::missing_key(field)),
                },
                Value::Null => {
                    return Err(EvalError::new(
                        EvalErrorKind::TypeError,
                        format!("nil pointer evaluating field {field}"),
                    ));
                }
                other => {
                    return Err(EvalError::new(
                        EvalErrorKind::TypeError,
                        format!("can't evaluate field {field} in type {}", other.type_name()),
                    ));
                }
            };
        }
        Ok(current.clone())
    }

    // ── Function calls ──────────────────────────────────────────────────

    fn call_func(
        &mut self,
        name: &str,
        args: &[Operand],
        dot: &Value,
        last: Option<Value>,
    ) -> Result<Value, EvalError> {
        if matches!(name, "and" | "or") && !self.funcs.contains_key(name) {
            return self.short_circuit(name == "and", args, dot, last);
        }

        let func = self
            .funcs
            .get(name)
            .cloned()
            .or_else(|| builtins::get(name))
            .ok_or_else(|| EvalError::undefined_function(name))?;

        let mut values = Vec::with_capacity(args.len() + 1);
        for arg in args {
            values.push(self.eval_arg(arg, dot)?);
        }
        values.extend(last);

        let mut ctx = CallContext::new(&mut *self.query, self.name);
        func.call(values, &mut ctx)
            .map_err(|e| func_error(name, e))
    }

    /// `and`/`or` stop evaluating operands once the result is decided.
    fn short_circuit(
        &mut self,
        is_and: bool,
        args: &[Operand],
        dot: &Value,
        last: Option<Value>,
    ) -> Result<Value, EvalError> {
        let name = if is_and { "and" } else { "or" };
        let got = args.len() + usize::from(last.is_some());
        if got == 0 {
            return Err(func_error(name, FuncError::at_least(1, 0)));
        }

        let decided = |value: &Value| value.is_truthy() != is_and;
        let mut result = Value::Null;
        for arg in args {
            result = self.eval_arg(arg, dot)?;
            if decided(&result) {
                return Ok(result);
            }
        }
        if let Some(last) = last {
            result = last;
        }
        Ok(result)
    }
}

fn func_error(name: &str, error: FuncError) -> EvalError {
    match error {
        FuncError::WrongArgCount { expected, got } => EvalError::new(
            EvalErrorKind::WrongArgCount,
            format!("wrong number of args for {name}: want {expected}, got {got}"),
        ),
        FuncError::Bind(inner) => EvalError::new(
            EvalErrorKind::BindFunction,
            format!("error calling {name}: {inner}"),
        )
        .with_source(*inner),
        FuncError::Type { .. } => EvalError::new(
            EvalErrorKind::TypeError,
            format!("error calling {name}: {error}"),
        )
        .with_source(error),
        FuncError::Failed(_) => EvalError::new(
            EvalErrorKind::FuncCall,
            format!("error calling {name}: {error}"),
        )
        .with_source(error),
    }
}

/// Short source-like rendering of an operand for diagnostics.
fn describe(operand: &OperandKind) -> String {
    let chain = |fields: &[String]| fields.iter().map(|f| format!(".{f}")).collect::<String>();
    match operand {
        OperandKind::Dot => ".".to_string(),
        OperandKind::Nil => "nil".to_string(),
        OperandKind::Literal(Value::String(s)) => format!("{:?}", &**s),
        OperandKind::Literal(value) => value.to_string(),
        OperandKind::Field(fields) => chain(fields),
        OperandKind::Variable { name, fields } => format!("{name}{}", chain(fields)),
        OperandKind::Func(name) => name.clone(),
        OperandKind::Pipe { fields, .. } => format!("(...){}", chain(fields)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::value::to_value;
    use crate::bind::{BIND, BindInterceptor, IdentityBind};
    use crate::registry::{ClosureFunc, Registry};
    use serde_json::json;

    struct Fixture {
        trees: HashMap<String, Arc<Tree>>,
        funcs: HashMap<String, FuncRef>,
        options: ExecOptions,
    }

    impl Fixture {
        fn new(source: &str) -> Self {
            Self::with_funcs(source, Registry::new())
        }

        fn with_funcs(source: &str, registry: Registry) -> Self {
            let is_func = |name: &str| crate::registry::is_func(&registry, name);
            let trees = crate::parser::parse("main", source, &is_func)
                .unwrap()
                .into_iter()
                .map(|tree| (tree.name.clone(), Arc::new(tree)))
                .collect();
            let mut funcs = registry.snapshot();
            funcs.insert(BIND.to_string(), Arc::new(BindInterceptor::new(Arc::new(IdentityBind))));
            Self {
                trees,
                funcs,
                options: ExecOptions::default(),
            }
        }

        fn run(&self, data: serde_json::Value) -> Result<Query, EvalError> {
            let mut q = Query::new();
            Executor::new(&self.trees, &self.funcs, &mut q, &self.options)
                .run("main", to_value(&data).unwrap())?;
            Ok(q)
        }

        fn render(&self, data: serde_json::Value) -> String {
            self.run(data).unwrap().as_str().to_string()
        }
    }

    #[test]
    fn test_text_and_fields() {
        let f = Fixture::new("SELECT {{.a.b}} FROM {{.t}}");
        assert_eq!(f.render(json!({"a": {"b": 1}, "t": "x"})), "SELECT 1 FROM x");
    }

    #[test]
    fn test_bind_in_range() {
        let f = Fixture::new("IN({{range $i, $v := .}}{{if $i}},{{end}}{{bind $v}}{{end}})");
        let q = f.run(json!([100, 12, 334])).unwrap();
        assert_eq!(q.as_str(), "IN($1,$2,$3)");
        assert_eq!(q.args(), &[Value::Int(100), Value::Int(12), Value::Int(334)]);
    }

    #[test]
    fn test_range_map_int_and_else() {
        let f = Fixture::new("{{range $k, $v := .m}}{{$k}}={{$v}};{{end}}|{{range 3}}{{.}}{{end}}|{{range .e}}x{{else}}empty{{end}}");
        assert_eq!(f.render(json!({"m": {"b": 2, "a": 1}, "e": []})), "a=1;b=2;|012|empty");
    }

    #[test]
    fn test_break_and_continue() {
        let f = Fixture::new("{{range .}}{{if eq . 2}}{{continue}}{{end}}{{if eq . 4}}{{break}}{{end}}{{.}}{{end}}");
        assert_eq!(f.render(json!([1, 2, 3, 4, 5])), "13");
    }

    #[test]
    fn test_with_and_else_with() {
        let f = Fixture::new("{{with .a}}{{.}}{{else with .b}}b={{.}}{{else}}none{{end}}");
        assert_eq!(f.render(json!({"a": "A", "b": "B"})), "A");
        assert_eq!(f.render(json!({"a": "", "b": "B"})), "b=B");
        assert_eq!(f.render(json!({"a": 0, "b": null})), "none");
    }

    #[test]
    fn test_variables_and_assignment() {
        let f = Fixture::new("{{$x := 1}}{{if true}}{{$x = 2}}{{end}}{{$x}} {{$.n}}");
        assert_eq!(f.render(json!({"n": "root"})), "2 root");
    }

    #[test]
    fn test_pipelines_and_parens() {
        let f = Fixture::new(r#"{{.n | printf "%03d"}} {{(index .l 1)}} {{len (slice .s 1)}}"#);
        assert_eq!(f.render(json!({"n": 7, "l": ["a", "b"], "s": "abc"})), "007 b 2");
    }

    #[test]
    fn test_and_or_short_circuit() {
        let registry = Registry::new();
        registry.merge(crate::registry::FuncMap::new().func("boom", |_| Err(FuncError::failed("boom"))));
        let f = Fixture::with_funcs("{{or .a boom}}|{{and .b boom}}", registry);
        assert_eq!(f.render(json!({"a": "yes", "b": 0})), "yes|0");
    }

    #[test]
    fn test_template_invocation_gets_fresh_scope() {
        let f = Fixture::new(r#"{{define "T"}}[{{.}}{{$}}]{{end}}{{$x := 1}}{{template "T" .v}}{{template "T"}}"#);
        assert_eq!(f.render(json!({"v": "v"})), "[vv][<no value><no value>]");
    }

    #[test]
    fn test_missing_key_policies() {
        let mut f = Fixture::new("a{{.missing}}b");
        let err = f.run(json!({})).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::MissingKey);
        assert_eq!(err.to_string(), r#"executing "main" at 1:4: map has no entry for key "missing""#);

        f.options = ExecOptions::new().missing_key(MissingKey::Null);
        assert_eq!(f.render(json!({})), "a<no value>b");
    }

    #[test]
    fn test_field_on_non_map() {
        let f = Fixture::new("{{.a.b}}");
        let err = f.run(json!({"a": 1})).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::TypeError);
        assert!(err.message.contains("can't evaluate field b in type int"));
    }

    #[test]
    fn test_range_over_scalar_fails() {
        let f = Fixture::new("{{range .}}x{{end}}");
        let err = f.run(json!("abc")).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::NotIterable);
    }

    #[test]
    fn test_non_function_with_arguments() {
        let f = Fixture::new("{{.a 1}}");
        let err = f.run(json!({"a": 1})).unwrap_err();
        assert_eq!(err.message, "can't give argument to non-function .a");
    }

    #[test]
    fn test_recursion_limit() {
        let mut f = Fixture::new(r#"{{define "R"}}{{template "R" .}}{{end}}{{template "R" .}}"#);
        f.options = ExecOptions::new().max_depth(10);
        let err = f.run(json!(null)).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::RecursionLimit);
        assert_eq!(err.location.as_deref(), Some(r#"executing "R" at 1:15"#));
    }

    #[test]
    fn test_bounded_recursion() {
        let f = Fixture::new(r#"{{define "C"}}{{if .}}{{len .}}{{template "C" slice . 1}}{{end}}{{end}}{{template "C" .}}"#);
        assert_eq!(f.render(json!([1, 2, 3])), "321");
    }

    #[test]
    fn test_function_errors_are_classified() {
        let registry = Registry::new();
        registry.merge(crate::registry::FuncMap::new().with(
            "fail",
            ClosureFunc::new(|_| Err(FuncError::failed("nope"))),
        ));
        let f = Fixture::with_funcs("{{fail}}{{bind 1 2}}", registry);
        let err = f.run(json!(null)).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::FuncCall);
        assert_eq!(err.message, "error calling fail: nope");

        let f = Fixture::new("{{bind 1 2}}");
        let err = f.run(json!(null)).unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::WrongArgCount);
        assert_eq!(err.message, "wrong number of args for bind: want 1, got 2");
    }
}
