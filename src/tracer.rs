use indexmap::IndexSet;
use std::fmt::Arguments;

const EVERYTHING: &str = "*";

/// Per-theory switch deciding which tables get their evaluation steps logged.
#[derive(Debug, Clone, Default)]
pub struct Tracer {
    expressions: IndexSet<String>,
}

impl Tracer {
    pub fn new(expressions: &[String]) -> Self {
        Tracer {
            expressions: expressions.iter().cloned().collect(),
        }
    }
    pub fn trace(&mut self, table: &str) {
        self.expressions.insert(table.to_string());
    }
    pub fn untrace(&mut self, table: &str) {
        self.expressions.shift_remove(table);
    }
    pub fn is_traced(&self, table: Option<&str>) -> bool {
        if self.expressions.contains(EVERYTHING) {
            return true;
        }

        table.map_or(false, |table| self.expressions.contains(table))
    }
    pub fn log(&self, theory: &str, table: Option<&str>, depth: usize, message: Arguments<'_>) {
        if self.is_traced(table) {
            tracing::trace!(theory, "{}{}", "| ".repeat(depth), message);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tracer::Tracer;

    #[test]
    fn test_trace_selection() {
        let mut tracer = Tracer::default();
        assert!(!tracer.is_traced(Some("p")));
        tracer.trace("p");
        assert!(tracer.is_traced(Some("p")));
        assert!(!tracer.is_traced(Some("q")));
        assert!(!tracer.is_traced(None));
        tracer.trace("*");
        assert!(tracer.is_traced(Some("q")));
        assert!(tracer.is_traced(None));
        tracer.untrace("*");
        assert!(!tracer.is_traced(Some("q")));
    }
}
