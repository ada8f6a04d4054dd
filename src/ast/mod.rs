//! Abstract syntax tree types for pgtmpl templates.
//!
//! The AST has two layers:
//!
//! - **Template layer** ([`template`]): a [`Tree`] per named template,
//!   holding a [`List`] of [`Node`]s whose output is concatenated into the
//!   query text.
//! - **Expression layer** ([`expr`]): pipelines, commands and operands that
//!   evaluate to [`Value`]s. A value reaches the query text only when an
//!   action prints it.

pub mod expr;
pub mod ser;
pub mod span;
pub mod template;
pub mod value;

// Convenience re-exports
pub use expr::*;
pub use span::{Span, Spanned};
pub use template::*;
pub use ser::SerializeError;
pub use value::{Value, to_value};
