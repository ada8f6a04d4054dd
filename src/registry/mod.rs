//! Function registration for pgtmpl.
//!
//! The [`Registry`] maps directive names to callables that templates invoke
//! by name, as in `{{bind .ID}}` or `{{upper .Name}}`. One registry is
//! created with each root template and shared by reference with every
//! template created from or cloned from it, so a function added through any
//! of them is visible to all.
//!
//! There are two ways to provide a callable:
//!
//! - **Closure-based**: wrap a closure in [`ClosureFunc`], or use
//!   [`FuncMap::func`], for functions that only look at their arguments.
//! - **Trait-based**: implement [`TemplateFunc`] directly when the function
//!   needs the [`CallContext`] of the execution.
//!
//! Builtin functions (`and`, `eq`, `printf`, ...) live outside the registry;
//! a registered function of the same name takes precedence.

pub(crate) mod builtins;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::ast::value::Value;
use crate::bind::{BIND, IdentityBind};
use crate::error::FuncError;
use crate::eval::CallContext;

// ── Trait definitions ───────────────────────────────────────────────────

/// A callable invoked by name from a template.
///
/// Arguments arrive fully evaluated, in source order; in a pipeline the
/// result of the previous command is the final argument. Returning an
/// error aborts the execution.
pub trait TemplateFunc: Send + Sync {
    fn call(&self, args: Vec<Value>, ctx: &mut CallContext<'_>) -> Result<Value, FuncError>;
}

/// Shared handle to a registered function.
pub type FuncRef = Arc<dyn TemplateFunc>;

// ── Closure-based convenience wrapper ───────────────────────────────────

/// A [`TemplateFunc`] implementation backed by a closure.
///
/// Closure functions do not receive the call context. For functions that
/// need it, implement [`TemplateFunc`] directly.
///
/// ```rust
/// use pgtmpl::{ClosureFunc, FuncError, Value};
///
/// let upper = ClosureFunc::new(|args: Vec<Value>| match args.as_slice() {
///     [Value::String(s)] => Ok(Value::from(s.to_uppercase())),
///     [other] => Err(FuncError::Type { expected: "string", got: other.type_name() }),
///     _ => Err(FuncError::arity(1, args.len())),
/// });
/// ```
pub struct ClosureFunc<F>
where
    F: Fn(Vec<Value>) -> Result<Value, FuncError> + Send + Sync,
{
    func: F,
}

impl<F> ClosureFunc<F>
where
    F: Fn(Vec<Value>) -> Result<Value, FuncError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> TemplateFunc for ClosureFunc<F>
where
    F: Fn(Vec<Value>) -> Result<Value, FuncError> + Send + Sync,
{
    fn call(&self, args: Vec<Value>, _ctx: &mut CallContext<'_>) -> Result<Value, FuncError> {
        (self.func)(args)
    }
}

// ── Function maps ───────────────────────────────────────────────────────

/// A set of named functions to merge into a registry with
/// [`Template::funcs`](crate::Template::funcs).
///
/// ```rust
/// use pgtmpl::{FuncMap, Value};
///
/// let funcs = FuncMap::new()
///     .func("upper", |args| Ok(Value::from(args[0].to_string().to_uppercase())))
///     .func("bind", |mut args| Ok(args.pop().unwrap_or_default()));
/// assert_eq!(funcs.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct FuncMap {
    funcs: HashMap<String, FuncRef>,
}

impl FuncMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a function. If a function with the same name already exists, it
    /// is replaced.
    pub fn insert(&mut self, name: impl Into<String>, func: impl TemplateFunc + 'static) -> &mut Self {
        self.funcs.insert(name.into(), Arc::new(func));
        self
    }

    pub fn with(mut self, name: impl Into<String>, func: impl TemplateFunc + 'static) -> Self {
        self.insert(name, func);
        self
    }

    /// Add a closure as a function.
    pub fn func<F>(self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, FuncError> + Send + Sync + 'static,
    {
        self.with(name, ClosureFunc::new(func))
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.funcs.contains_key(name)
    }
}

impl std::fmt::Debug for FuncMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.funcs.keys().collect();
        names.sort();
        f.debug_struct("FuncMap").field("funcs", &names).finish()
    }
}

// ── Registry ────────────────────────────────────────────────────────────

/// Shared, read/write locked map from directive name to function.
///
/// Cloning a `Registry` clones the handle, not the map: both handles see
/// every later registration. Writers take the lock exclusively while
/// merging; executions take it shared only long enough to copy the table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<HashMap<String, FuncRef>>>,
}

impl Registry {
    /// A registry holding only the default `bind`, which passes its
    /// argument through unchanged.
    pub fn new() -> Self {
        let mut funcs: HashMap<String, FuncRef> = HashMap::new();
        funcs.insert(BIND.to_string(), Arc::new(IdentityBind));
        Self {
            inner: Arc::new(RwLock::new(funcs)),
        }
    }

    /// Merge `funcs` into the registry. Last write wins per name.
    pub fn merge(&self, funcs: FuncMap) {
        self.inner.write().extend(funcs.funcs);
    }

    pub fn get(&self, name: &str) -> Option<FuncRef> {
        self.inner.read().get(name).cloned()
    }

    /// Whether `name` is registered. Builtins are not included.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }

    /// Copy of the current table, taken under the read lock.
    pub fn snapshot(&self) -> HashMap<String, FuncRef> {
        self.inner.read().clone()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether both handles refer to the same table.
    pub fn ptr_eq(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("funcs", &self.names()).finish()
    }
}

/// Whether `name` can be called from a template backed by `registry`.
pub(crate) fn is_func(registry: &Registry, name: &str) -> bool {
    registry.contains(name) || builtins::contains(name)
}
