//! The `bind` directive.
//!
//! Every registry starts with an identity `bind`. Registering a different
//! `bind` installs a transform applied to each value before it is bound,
//! for example to wrap values for a driver:
//!
//! ```rust
//! use pgtmpl::{FuncError, FuncMap, Query, Template, Value};
//!
//! let tpl = Template::new("q")
//!     .funcs(FuncMap::new().func("bind", |args| match args.as_slice() {
//!         [Value::String(s)] => Ok(Value::from(s.trim())),
//!         [other] => Ok(other.clone()),
//!         _ => Err(FuncError::arity(1, args.len())),
//!     }))
//!     .parse("SELECT {{bind .}}")?;
//!
//! let mut q = Query::new();
//! tpl.execute(&mut q, " padded ")?;
//! assert_eq!(q.as_str(), "SELECT $1");
//! assert_eq!(q.args(), &[Value::from("padded")]);
//! # Ok::<(), pgtmpl::Error>(())
//! ```
//!
//! At execution time the registered `bind` is wrapped by a
//! [`BindInterceptor`] that records the transformed value on the
//! execution's accumulator and prints its placeholder in place of the
//! value itself.

use tracing::trace;

use crate::ast::value::Value;
use crate::error::FuncError;
use crate::eval::CallContext;
use crate::placeholder::placeholder;
use crate::registry::{FuncRef, TemplateFunc};

/// Name of the binding directive.
pub const BIND: &str = "bind";

/// Default `bind`: returns its argument unchanged.
pub(crate) struct IdentityBind;

impl TemplateFunc for IdentityBind {
    fn call(&self, args: Vec<Value>, _ctx: &mut CallContext<'_>) -> Result<Value, FuncError> {
        let [value] = <[Value; 1]>::try_from(args).map_err(|args| FuncError::arity(1, args.len()))?;
        Ok(value)
    }
}

/// Per-execution `bind` layered over the registered one.
///
/// Calls the registered function first; if it succeeds the result is
/// appended to the accumulator and the placeholder for its position is
/// returned as the action's output.
pub struct BindInterceptor {
    prior: FuncRef,
}

impl BindInterceptor {
    pub fn new(prior: FuncRef) -> Self {
        Self { prior }
    }
}

impl TemplateFunc for BindInterceptor {
    fn call(&self, args: Vec<Value>, ctx: &mut CallContext<'_>) -> Result<Value, FuncError> {
        if args.len() != 1 {
            return Err(FuncError::arity(1, args.len()));
        }

        let value = self.prior.call(args, ctx).map_err(|e| match e {
            FuncError::WrongArgCount { .. } | FuncError::Bind(_) => e,
            other => FuncError::Bind(Box::new(other)),
        })?;

        let position = ctx.bind(value);
        trace!(template = ctx.template_name(), position, "bound argument");
        Ok(Value::String(placeholder(position)))
    }
}
