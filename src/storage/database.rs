use crate::config::PolicyKind;
use crate::engine::event::{Event, ProofCollection, ProofTree};
use crate::engine::theory::Theory;
use crate::error::{PolicyError, PolicyErrors};
use crate::evaluation::topdown::{Candidate, RuleSource};
use crate::rewriting::safety::fact_errors;
use crate::storage::factset::Row;
use crate::tracer::Tracer;
use datalog_syntax::{Formula, Literal, Rule, Tablename, Term};
use indexmap::IndexMap;
use std::collections::BTreeSet;
use tracing::{debug, warn};

pub type Relation = IndexMap<Row, ProofCollection>;

/// Ground tuples per table, each carrying the proofs that justify it.
#[derive(Debug, Default, Clone)]
pub struct Database {
    pub(crate) name: String,
    pub(crate) tables: IndexMap<String, Relation>,
    pub(crate) tracer: Tracer,
}

fn row_of(atom: &Literal) -> Option<Row> {
    atom.argument_values()
}

impl Database {
    pub fn new(name: &str) -> Self {
        Database {
            name: name.to_string(),
            ..Default::default()
        }
    }
    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }
    pub fn get_relation(&self, table: &str) -> Option<&Relation> {
        self.tables.get(table)
    }
    pub fn contains(&self, atom: &Literal) -> bool {
        self.explain(atom).is_some()
    }
    /// Proofs of a ground atom, `None` when it is not stored.
    pub fn explain(&self, atom: &Literal) -> Option<&ProofCollection> {
        let row = row_of(atom)?;

        self.tables.get(&atom.table.table)?.get(&row)
    }
    pub fn arity(&self, table: &str) -> Option<usize> {
        self.tables
            .get(table)
            .and_then(|relation| relation.keys().next())
            .map(Row::len)
    }
    pub fn tablenames(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
    pub fn len(&self) -> usize {
        self.tables.values().map(IndexMap::len).sum()
    }
    /// Stored tuples as literals, optionally restricted to some tables.
    pub fn content(&self, tables: Option<&[String]>) -> Vec<Literal> {
        self.tables
            .iter()
            .filter(|(table, _)| tables.map_or(true, |tables| tables.contains(table)))
            .flat_map(|(table, relation)| {
                relation.keys().map(move |row| {
                    Literal::new(
                        Tablename::new(table),
                        row.iter().cloned().map(Term::Constant).collect(),
                    )
                })
            })
            .collect()
    }
    /// True if applying the event would leave the database unchanged.
    pub fn is_noop(&self, event: &Event) -> bool {
        let Some(atom) = event.literal() else {
            return true;
        };
        let existing = self.explain(&atom);
        match (event.insert, existing) {
            (true, None) => false,
            (true, Some(proofs)) => event.proofs.is_subset(proofs),
            (false, None) => true,
            (false, Some(proofs)) => !event.proofs.is_subset(proofs),
        }
    }
    /// True if the event makes an absent tuple appear or a present one disappear.
    pub fn changes_truth(&self, event: &Event) -> bool {
        let Some(atom) = event.literal() else {
            return false;
        };
        match (event.insert, self.explain(&atom)) {
            (true, existing) => existing.is_none(),
            (false, None) => false,
            (false, Some(proofs)) => {
                event.proofs.is_subset(proofs) && proofs.iter().all(|proof| event.proofs.contains(proof))
            }
        }
    }
    /// Applies the event, returning it if it was not a no-op.
    pub fn modify(&mut self, event: &Event) -> Option<Event> {
        if self.is_noop(event) {
            return None;
        }
        let atom = event.literal()?;
        let changed = if event.insert {
            self.insert_actual(&atom, &event.proofs)
        } else {
            self.delete_actual(&atom, &event.proofs)
        };

        if changed {
            self.tracer.log(
                &self.name,
                Some(&atom.table.table),
                0,
                format_args!("{:?}", event),
            );
            Some(event.clone())
        } else {
            None
        }
    }
    pub fn insert(&mut self, atom: &Literal, proofs: ProofCollection) -> Option<Event> {
        self.modify(&Event::insert(atom.clone()).with_proofs(proofs))
    }
    pub fn delete(&mut self, atom: &Literal, proofs: ProofCollection) -> Option<Event> {
        self.modify(&Event::delete(atom.clone()).with_proofs(proofs))
    }
    fn insert_actual(&mut self, atom: &Literal, proofs: &ProofCollection) -> bool {
        let Some(row) = row_of(atom) else {
            return false;
        };
        let relation = self.tables.entry(atom.table.table.clone()).or_default();
        match relation.get_mut(&row) {
            Some(existing) => existing.union_with(proofs),
            None => {
                relation.insert(row, proofs.clone());
                true
            }
        }
    }
    fn delete_actual(&mut self, atom: &Literal, proofs: &ProofCollection) -> bool {
        let Some(row) = row_of(atom) else {
            return false;
        };
        let Some(relation) = self.tables.get_mut(&atom.table.table) else {
            return false;
        };
        let Some(existing) = relation.get_mut(&row) else {
            return false;
        };
        existing.difference_with(proofs);
        if existing.is_empty() {
            relation.shift_remove(&row);
            if relation.is_empty() {
                self.tables.shift_remove(&atom.table.table);
            }
        }

        true
    }
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

impl RuleSource for Database {
    fn name(&self) -> &str {
        &self.name
    }
    fn head_index(&self, literal: &Literal) -> Vec<Candidate> {
        let Some(relation) = self.tables.get(&literal.table.table) else {
            return vec![];
        };

        relation
            .keys()
            .filter(|row| {
                row.len() == literal.arity()
                    && literal
                        .arguments
                        .iter()
                        .zip(row.iter())
                        .all(|(term, value)| term.as_constant().map_or(true, |bound| bound == value))
            })
            .cloned()
            .map(Candidate::Tuple)
            .collect()
    }
    fn tracer(&self) -> Option<&Tracer> {
        Some(&self.tracer)
    }
}

impl Theory for Database {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Database
    }
    fn as_source(&self) -> &dyn RuleSource {
        self
    }
    fn update(&mut self, events: Vec<Event>) -> Result<Vec<Event>, PolicyErrors> {
        let errors = self.update_errors(&events);
        if !errors.is_empty() {
            let errors = PolicyErrors(errors);
            warn!(theory = %self.name, %errors, "rejected update");
            return Err(errors);
        }
        let changes: Vec<Event> = events.iter().filter_map(|event| self.modify(event)).collect();
        debug!(theory = %self.name, changes = changes.len(), "applied update");

        Ok(changes)
    }
    fn update_errors(&self, events: &[Event]) -> Vec<PolicyError> {
        events
            .iter()
            .flat_map(|event| match event.literal() {
                Some(atom) => fact_errors(&atom, None, &self.name),
                None => vec![PolicyError::UnsupportedFormula {
                    formula: event.formula.to_string(),
                    kind: PolicyKind::Database.to_string(),
                }],
            })
            .collect()
    }
    fn explain(&self, atom: &Literal) -> Option<ProofTree> {
        Database::explain(self, atom).map(|_| ProofTree::leaf(atom.clone()))
    }
    fn consequences(&self) -> BTreeSet<Literal> {
        Database::content(self, None).into_iter().collect()
    }
    fn content(&self) -> Vec<Formula> {
        Database::content(self, None).into_iter().map(Formula::Literal).collect()
    }
    fn policy(&self) -> Vec<Rule> {
        vec![]
    }
    fn arity(&self, table: &str) -> Option<usize> {
        Database::arity(self, table)
    }
    fn contains(&self, formula: &Formula) -> bool {
        formula
            .as_literal()
            .map_or(false, |atom| Database::contains(self, &atom))
    }
}
