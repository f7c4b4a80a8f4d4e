use crate::error::PolicyError;
use ahash::HashMap;
use datalog_syntax::{Literal, Term};
use indexmap::IndexMap;

/// Undo record for [`Schema::update`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaChange {
    pub table: String,
    /// Set when the table itself appeared or disappeared.
    pub columns: Option<Vec<String>>,
    pub insert: bool,
}

/// Column names per table. Tables defined by rule heads are registered on the fly with
/// positional column names and counted, so they vanish with their last defining rule.
#[derive(Clone, Debug, Default)]
pub struct Schema {
    tables: IndexMap<String, Vec<String>>,
    complete: bool,
    counts: HashMap<String, usize>,
}

impl Schema {
    pub fn new(complete: bool) -> Self {
        Schema {
            complete,
            ..Default::default()
        }
    }
    pub fn declare(&mut self, table: &str, columns: &[&str]) {
        self.tables
            .insert(table.to_string(), columns.iter().map(|column| column.to_string()).collect());
    }
    pub fn is_complete(&self) -> bool {
        self.complete
    }
    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }
    pub fn columns(&self, table: &str) -> Option<&[String]> {
        self.tables.get(table).map(Vec::as_slice)
    }
    pub fn arity(&self, table: &str) -> Option<usize> {
        self.tables.get(table).map(Vec::len)
    }
    pub fn column_index(&self, table: &str, column: &str) -> Option<usize> {
        self.columns(table)?.iter().position(|name| name == column)
    }
    pub fn tables(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }
    pub fn update(&mut self, head: &Literal, insert: bool) -> Option<SchemaChange> {
        let table = head.table.table.clone();
        if self.contains(&table) && !self.counts.contains_key(&table) {
            return None;
        }

        if insert {
            if let Some(count) = self.counts.get_mut(&table) {
                *count += 1;
                return Some(SchemaChange {
                    table,
                    columns: None,
                    insert,
                });
            }
            let columns: Vec<String> = (0..head.arity()).map(|i| format!("Col{}", i)).collect();
            self.tables.insert(table.clone(), columns.clone());
            self.counts.insert(table.clone(), 1);

            return Some(SchemaChange {
                table,
                columns: Some(columns),
                insert,
            });
        }

        let count = self.counts.get_mut(&table)?;
        *count -= 1;
        if *count > 0 {
            return Some(SchemaChange {
                table,
                columns: None,
                insert,
            });
        }
        self.counts.remove(&table);
        let columns = self.tables.shift_remove(&table);

        Some(SchemaChange {
            table,
            columns,
            insert,
        })
    }
    pub fn revert(&mut self, change: SchemaChange) {
        match (change.insert, change.columns) {
            (true, None) => {
                if let Some(count) = self.counts.get_mut(&change.table) {
                    *count -= 1;
                }
            }
            (true, Some(_)) => {
                self.tables.shift_remove(&change.table);
                self.counts.remove(&change.table);
            }
            (false, None) => {
                *self.counts.entry(change.table).or_default() += 1;
            }
            (false, Some(columns)) => {
                self.tables.insert(change.table.clone(), columns);
                self.counts.insert(change.table, 1);
            }
        }
    }
    /// Rewrites named arguments into positions and pads declared tables with fresh variables
    /// named `{prefix}{index}`, `{prefix}{index + 1}`, and so on.
    pub fn eliminate_column_references(
        &self,
        literal: &Literal,
        index: usize,
        prefix: &str,
    ) -> Result<Literal, PolicyError> {
        let table = &literal.table.table;
        let Some(columns) = self.columns(table) else {
            if literal.named_arguments.is_empty() {
                return Ok(literal.clone());
            }
            return Err(PolicyError::MissingSchema {
                literal: literal.to_string(),
                table: table.clone(),
            });
        };

        if literal.named_arguments.is_empty() && literal.arity() >= columns.len() {
            return Ok(literal.clone());
        }
        if literal.arity() > columns.len() {
            return Err(PolicyError::ArityMismatch {
                literal: literal.to_string(),
                found: literal.arity(),
                expected: columns.len(),
            });
        }
        if let Some(column) = literal
            .named_arguments
            .keys()
            .find(|column| !columns.contains(column))
        {
            return Err(PolicyError::UnknownColumn {
                literal: literal.to_string(),
                column: column.clone(),
            });
        }
        if let Some(column) = columns[..literal.arity()]
            .iter()
            .find(|column| literal.named_arguments.contains_key(*column))
        {
            return Err(PolicyError::ColumnConflict {
                literal: literal.to_string(),
                column: column.clone(),
            });
        }

        let mut fresh = index;
        let arguments = columns
            .iter()
            .enumerate()
            .map(|(position, column)| {
                if let Some(term) = literal.arguments.get(position) {
                    return term.clone();
                }
                if let Some(term) = literal.named_arguments.get(column) {
                    return term.clone();
                }
                fresh += 1;
                Term::Variable(format!("{}{}", prefix, fresh - 1))
            })
            .collect();

        Ok(Literal {
            table: literal.table.clone(),
            arguments,
            named_arguments: Default::default(),
            negated: literal.negated,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::error::PolicyError;
    use crate::schema::Schema;
    use datalog_syntax::*;
    use datalog_syntax_macros::literal;

    fn servers() -> Schema {
        let mut schema = Schema::new(true);
        schema.declare("servers", &["id", "name", "status"]);
        schema
    }

    #[test]
    fn test_named_arguments_become_positions() {
        let schema = servers();
        let named = literal!(servers(?x, status = "ACTIVE"));

        let positional = schema.eliminate_column_references(&named, 0, "_x").unwrap();
        assert_eq!(literal!(servers(?x, ?_x0, "ACTIVE")), positional);
        assert_eq!(
            positional,
            schema.eliminate_column_references(&positional, 0, "_x").unwrap()
        );

        let padded = schema.eliminate_column_references(&literal!(servers(1)), 3, "v").unwrap();
        assert_eq!(literal!(servers(1, ?v3, ?v4)), padded);
    }

    #[test]
    fn test_column_errors() {
        let schema = servers();
        assert!(matches!(
            schema.eliminate_column_references(&literal!(servers(?x, flavor = 1)), 0, "_"),
            Err(PolicyError::UnknownColumn { .. })
        ));
        assert!(matches!(
            schema.eliminate_column_references(&literal!(servers(?x, id = 1)), 0, "_"),
            Err(PolicyError::ColumnConflict { .. })
        ));
        assert!(matches!(
            schema.eliminate_column_references(&literal!(ports(?x, id = 1)), 0, "_"),
            Err(PolicyError::MissingSchema { .. })
        ));
        assert_eq!(
            literal!(ports(?x)),
            schema.eliminate_column_references(&literal!(ports(?x)), 0, "_").unwrap()
        );
    }

    #[test]
    fn test_head_registration_is_counted_and_revertible() {
        let mut schema = servers();
        assert!(schema.update(&literal!(servers(1, 2, 3)), true).is_none());

        let first = schema.update(&literal!(p(?x, ?y)), true).unwrap();
        assert_eq!(Some(&["Col0".to_string(), "Col1".to_string()][..]), schema.columns("p"));
        let second = schema.update(&literal!(p(?a, ?b)), true).unwrap();
        assert!(second.columns.is_none());

        schema.revert(second);
        let removed = schema.update(&literal!(p(?x, ?y)), false).unwrap();
        assert!(removed.columns.is_some());
        assert!(!schema.contains("p"));

        schema.revert(removed);
        assert_eq!(Some(2), schema.arity("p"));
        schema.revert(first);
        assert!(!schema.contains("p"));
    }
}
