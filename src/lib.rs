//! # pgtmpl
//!
//! Text templates that produce SQL statements together with their
//! positional arguments. Templates use Go's `text/template` syntax; the
//! `bind` directive replaces a value with the next `$N` placeholder and
//! records the value as argument `N`.
//!
//! The crate is split into three layers:
//!
//! - **The language** (parsing, AST, execution) knows nothing about SQL
//!   beyond writing text.
//! - **The namespace** ([`Template`]) holds named templates and the shared
//!   function [`Registry`], and installs the binding interceptor for each
//!   execution.
//! - **The accumulator** ([`Query`]) collects the text and arguments of one
//!   or more executions, and can be recycled through a [`QueryPool`].
//!
//! ## Quick start
//!
//! ```rust
//! use pgtmpl::{Query, Template, Value};
//!
//! let tpl = Template::new("author").parse(
//!     "SELECT * FROM author WHERE name = {{bind .name}} AND age > {{bind .age}}",
//! )?;
//!
//! let mut q = Query::new();
//! tpl.execute(&mut q, &serde_json::json!({"name": "Ann", "age": 30}))?;
//! assert_eq!(q.as_str(), "SELECT * FROM author WHERE name = $1 AND age > $2");
//! assert_eq!(q.args(), &[Value::from("Ann"), Value::Int(30)]);
//! # Ok::<(), pgtmpl::Error>(())
//! ```
//!
//! ## Batches
//!
//! Executing into a query that already holds a statement appends `;` and
//! continues the placeholder numbering:
//!
//! ```rust
//! use pgtmpl::{Query, Template};
//!
//! let root = Template::new("root");
//! let q1 = root.new_template("Q1").parse("SELECT 1, {{bind .}}")?;
//! let q2 = root.new_template("Q2").parse("SELECT 2, {{bind .}}")?;
//!
//! let mut q = Query::new();
//! q1.execute(&mut q, &1)?;
//! q2.execute(&mut q, &2)?;
//! assert_eq!(q.as_str(), "SELECT 1, $1;SELECT 2, $2");
//! # Ok::<(), pgtmpl::Error>(())
//! ```
//!
//! ## Execution options
//!
//! ```rust
//! use pgtmpl::{ExecOptions, MissingKey, Query, Template};
//!
//! let tpl = Template::new("q")
//!     .options(ExecOptions::new().missing_key(MissingKey::Null))
//!     .parse("SELECT {{if .limit}}{{bind .limit}}{{else}}ALL{{end}}")?;
//!
//! let mut q = Query::new();
//! tpl.execute(&mut q, &serde_json::json!({}))?;
//! assert_eq!(q.as_str(), "SELECT ALL");
//! # Ok::<(), pgtmpl::Error>(())
//! ```

pub mod ast;
pub mod bind;
pub mod error;
pub mod eval;
pub mod fs;
mod parser;
pub mod placeholder;
pub mod pool;
pub mod query;
pub mod registry;
pub mod template;

pub use ast::span::{Span, Spanned};
pub use ast::ser::SerializeError;
pub use ast::value::{Value, to_value};
pub use bind::{BIND, BindInterceptor};
pub use error::{Error, EvalError, EvalErrorKind, FuncError, ParseError};
pub use eval::{CallContext, ExecOptions, MissingKey};
pub use fs::{DirFs, MemFs, TemplateFs};
pub use placeholder::placeholder;
pub use pool::{PooledQuery, QueryPool};
pub use query::{Query, QueryView};
pub use registry::{ClosureFunc, FuncMap, FuncRef, Registry, TemplateFunc};
pub use template::{Template, must, parse_files, parse_fs, parse_glob, render};
