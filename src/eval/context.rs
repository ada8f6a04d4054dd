use crate::ast::value::Value;
use crate::query::Query;

/// Execution state handed to a registered function.
///
/// Functions normally only look at their arguments. The context lets a
/// function record additional bound arguments on the execution's
/// accumulator, which is how `bind` produces its placeholders.
///
/// Executions never share a context: each one writes into its own
/// [`Query`], so functions need no synchronization of their own.
pub struct CallContext<'q> {
    query: &'q mut Query,
    template: &'q str,
}

impl<'q> CallContext<'q> {
    pub(crate) fn new(query: &'q mut Query, template: &'q str) -> Self {
        Self { query, template }
    }

    /// Append `value` to the accumulator's arguments and return its
    /// 1-based position.
    pub fn bind(&mut self, value: Value) -> usize {
        self.query.bind_arg(value)
    }

    /// Arguments bound so far, including those of earlier executions into
    /// the same accumulator.
    pub fn bound(&self) -> &[Value] {
        self.query.args()
    }

    /// Name of the template being executed.
    pub fn template_name(&self) -> &str {
        self.template
    }
}
