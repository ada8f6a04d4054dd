//! The output accumulator.
//!
//! A [`Query`] collects the rendered SQL text and the arguments bound by
//! `{{bind}}` while a template executes. The Nth argument belongs to the
//! placeholder `$N` in the text. Several executions may write into the same
//! query: statements are separated by `;` and placeholder numbering carries
//! on across them, so one query can hold a batch sharing one argument list.

use std::fmt;
use std::io;

use crate::ast::value::Value;

/// Rendered statement text plus its positional arguments.
///
/// ```rust
/// use pgtmpl::{Query, Template, Value};
///
/// let tpl = Template::new("by_id").parse("SELECT * FROM author WHERE id = {{bind .}}")?;
/// let mut q = Query::new();
/// tpl.execute(&mut q, &42)?;
/// assert_eq!(q.as_str(), "SELECT * FROM author WHERE id = $1");
/// assert_eq!(q.args(), &[Value::Int(42)]);
/// # Ok::<(), pgtmpl::Error>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    text: String,
    args: Vec<Value>,
    name: String,
}

impl Query {
    /// An empty query with no allocated storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty query with room for `text` bytes and `args` arguments.
    pub fn with_capacity(text: usize, args: usize) -> Self {
        Self {
            text: String::with_capacity(text),
            args: Vec::with_capacity(args),
            name: String::new(),
        }
    }

    /// Length of the accumulated text in bytes.
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Capacity of the text buffer in bytes.
    pub fn capacity(&self) -> usize {
        self.text.capacity()
    }

    /// Reserve room for at least `additional` more bytes of text.
    pub fn reserve(&mut self, additional: usize) {
        self.text.reserve(additional);
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Bound arguments in placeholder order.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Name of the template that most recently wrote into this query.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name.clear();
        self.name.push_str(name);
    }

    pub fn push_str(&mut self, s: &str) {
        self.text.push_str(s);
    }

    pub fn push(&mut self, ch: char) {
        self.text.push(ch);
    }

    /// Append an argument and return its 1-based position.
    pub fn bind_arg(&mut self, value: Value) -> usize {
        self.args.push(value);
        self.args.len()
    }

    /// Clear text, arguments and name, keeping the allocated storage.
    pub fn reset(&mut self) {
        self.text.clear();
        self.args.clear();
        self.name.clear();
    }

    /// Split into the statement text and its arguments.
    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.text, self.args)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Write for Query {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.text.push_str(s);
        Ok(())
    }
}

/// Byte-oriented writes. The query text is UTF-8, so each write must be
/// valid UTF-8 on its own.
impl io::Write for Query {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = std::str::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.text.push_str(s);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read access to a query that may be absent. Every method returns the
/// zero value for `None`.
pub trait QueryView {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn args(&self) -> &[Value];
    fn as_str(&self) -> &str;
    fn name(&self) -> &str;
}

impl QueryView for Option<&Query> {
    fn len(&self) -> usize {
        self.map_or(0, Query::len)
    }

    fn args(&self) -> &[Value] {
        self.map_or(&[], Query::args)
    }

    fn as_str(&self) -> &str {
        self.map_or("", Query::as_str)
    }

    fn name(&self) -> &str {
        self.map_or("", Query::name)
    }
}
