use crate::analysis::dependency::{GraphChange, RuleDependencyGraph};
use crate::config::PolicyKind;
use crate::engine::event::{Event, ProofTree};
use crate::error::{PolicyError, PolicyErrors};
use crate::evaluation::topdown::{Federation, RuleSource, TopDown};
use crate::rewriting::safety::{fact_errors, reorder_for_safety, rule_errors};
use crate::schema::{Schema, SchemaChange};
use datalog_syntax::{Formula, Literal, Rule};
use indexmap::IndexMap;
use std::collections::BTreeSet;

/// A named, independently evaluable collection of rules and facts.
pub trait Theory: RuleSource {
    fn kind(&self) -> PolicyKind;
    fn as_source(&self) -> &dyn RuleSource;
    /// Applies the events as one batch. Nothing is applied when any of them is rejected.
    fn update(&mut self, events: Vec<Event>) -> Result<Vec<Event>, PolicyErrors>;
    /// What [`Theory::update`] would reject, without applying anything.
    fn update_errors(&self, events: &[Event]) -> Vec<PolicyError>;
    fn explain(&self, atom: &Literal) -> Option<ProofTree>;
    /// Every true instance of a table defined here.
    fn consequences(&self) -> BTreeSet<Literal>;
    fn content(&self) -> Vec<Formula>;
    fn policy(&self) -> Vec<Rule>;
    fn arity(&self, table: &str) -> Option<usize>;
    fn contains(&self, formula: &Formula) -> bool;

    fn insert(&mut self, formula: Formula) -> Result<Vec<Event>, PolicyErrors> {
        self.update(vec![Event::insert(formula)])
    }
    fn delete(&mut self, formula: Formula) -> Result<Vec<Event>, PolicyErrors> {
        self.update(vec![Event::delete(formula)])
    }
    fn select(&self, query: &Literal) -> Vec<Literal> {
        TopDown::new(self.as_source()).select(query, true)
    }
    fn select_in(&self, query: &Literal, federation: &Federation<'_>) -> Vec<Literal> {
        TopDown::new(self.as_source())
            .with_federation(federation)
            .select(query, true)
    }
    /// Rules whose heads are instances of `query` (or of its head) and whose bodies list the
    /// literals from `tables` that would have to hold for that instance.
    fn abduce(&self, query: &Formula, tables: &[String]) -> Vec<Rule> {
        let (literals, output) = match query {
            Formula::Rule(rule) => (rule.body.clone(), rule.head().clone()),
            atom => match atom.as_literal() {
                Some(literal) => (vec![literal.clone()], literal),
                None => return vec![],
            },
        };
        let save = |literal: &Literal| tables.contains(&literal.tablename());

        TopDown::new(self.as_source())
            .abduce(&output.variables(), &literals, true, &save)
            .into_iter()
            .map(|result| Rule::new(output.plug(&result.binding), result.support))
            .collect()
    }
}

/// Everything a theory supplies to validate a batch.
pub(crate) struct Admission<'a> {
    pub theory: &'a str,
    pub kind: PolicyKind,
    pub present: &'a dyn Fn(&Formula) -> bool,
    pub is_view: &'a dyn Fn(&str) -> bool,
}

/// Changes made to the schema and the dependency graph while admitting a batch.
#[derive(Default)]
pub(crate) struct Admitted {
    pub events: Vec<Event>,
    pub schema_changes: Vec<SchemaChange>,
    pub graph_changes: Vec<GraphChange>,
}

impl Admitted {
    pub fn undo(self, schema: &mut Option<Schema>, graph: &mut RuleDependencyGraph) {
        graph.undo_changes(self.graph_changes);
        if let Some(schema) = schema.as_mut() {
            for change in self.schema_changes.into_iter().rev() {
                schema.revert(change);
            }
        }
    }
}

fn is_local(literal: &Literal, theory: &str) -> bool {
    literal.table.service.as_deref().map_or(true, |service| service == theory)
}

fn eliminate_columns(literal: &Literal, position: usize, schema: Option<&Schema>, theory: &str) -> Result<Literal, PolicyError> {
    match schema {
        Some(schema) if is_local(literal, theory) => {
            schema.eliminate_column_references(literal, 0, &format!("_x{}_", position))
        }
        _ => Ok(literal.clone()),
    }
}

/// Positional arguments everywhere, and rule bodies ordered for left-to-right evaluation.
pub(crate) fn normalize(formula: &Formula, schema: Option<&Schema>, theory: &str) -> Result<Formula, Vec<PolicyError>> {
    match formula {
        Formula::Rule(rule) => {
            let mut errors = vec![];
            let mut rewrite = |literals: &[Literal], offset: usize| -> Vec<Literal> {
                literals
                    .iter()
                    .enumerate()
                    .map(|(position, literal)| {
                        eliminate_columns(literal, offset + position, schema, theory).unwrap_or_else(|error| {
                            errors.push(error);
                            literal.clone()
                        })
                    })
                    .collect()
            };
            let heads = rewrite(&rule.heads, 0);
            let body = rewrite(&rule.body, rule.heads.len());
            if !errors.is_empty() {
                return Err(errors);
            }
            let rewritten = Rule {
                heads,
                body,
                id: rule.id.clone(),
                name: rule.name.clone(),
            };
            let head = rewritten.head();
            if rewritten.body.is_empty() && rewritten.is_regular() && head.is_ground() && head.table.modal.is_none() {
                return Ok(Formula::Literal(head.clone()));
            }

            Ok(Formula::Rule(reorder_for_safety(&rewritten).unwrap_or(rewritten)))
        }
        atom => {
            let Some(literal) = atom.as_literal() else {
                return Ok(atom.clone());
            };
            eliminate_columns(&literal, 0, schema, theory)
                .map(Formula::Literal)
                .map_err(|error| vec![error])
        }
    }
}

/// Drops events that would change nothing: inserting what is present, deleting what is absent,
/// repeats inside the batch.
pub(crate) fn actual_events(events: Vec<Event>, present: &dyn Fn(&Formula) -> bool) -> Vec<Event> {
    let mut state: IndexMap<Formula, bool> = IndexMap::new();
    events
        .into_iter()
        .filter(|event| {
            let current = *state
                .entry(event.formula.clone())
                .or_insert_with(|| present(&event.formula));
            if current == event.insert {
                return false;
            }
            state.insert(event.formula.clone(), event.insert);
            true
        })
        .collect()
}

fn structural_errors(event: &Event, schema: Option<&Schema>, admission: &Admission) -> Vec<PolicyError> {
    match (&event.formula, admission.kind) {
        (Formula::Rule(rule), PolicyKind::Database) => vec![PolicyError::UnsupportedFormula {
            formula: rule.to_string(),
            kind: admission.kind.to_string(),
        }],
        (Formula::Rule(rule), PolicyKind::Action) => rule_errors(rule, schema, admission.theory)
            .into_iter()
            .filter(|error| match error {
                PolicyError::HeadNamesPolicy { .. } => !rule.heads.iter().all(Literal::is_update),
                _ => true,
            })
            .collect(),
        (Formula::Rule(rule), _) => rule_errors(rule, schema, admission.theory),
        (atom, _) => {
            let Some(literal) = atom.as_literal() else {
                return vec![];
            };
            let mut errors = fact_errors(&literal, schema, admission.theory);
            if admission.kind == PolicyKind::Materialized && (admission.is_view)(&literal.table.table) {
                errors.push(PolicyError::ViewModification(literal.table.table.clone()));
            }
            errors
        }
    }
}

fn graph_errors(graph: &RuleDependencyGraph, kind: PolicyKind) -> Vec<PolicyError> {
    match kind {
        PolicyKind::Nonrecursive | PolicyKind::Action if graph.is_recursive() => {
            let cycles: Vec<String> = graph.cycles().iter().map(|cycle| cycle.join(" -> ")).collect();
            vec![PolicyError::Recursive {
                cycles: cycles.join("; "),
            }]
        }
        PolicyKind::Materialized if !graph.is_stratified() => vec![PolicyError::Unstratified],
        _ => vec![],
    }
}

/// Normalizes and validates a batch, registering rule heads in the schema and rules in the
/// graph. On rejection every such change is already undone.
pub(crate) fn admit(
    events: Vec<Event>,
    admission: &Admission,
    schema: &mut Option<Schema>,
    graph: &mut RuleDependencyGraph,
) -> Result<Admitted, PolicyErrors> {
    let mut errors = vec![];
    let mut normalized = vec![];
    for event in events {
        match normalize(&event.formula, schema.as_ref(), admission.theory) {
            Ok(formula) => normalized.push(Event { formula, ..event }),
            Err(found) => errors.extend(found),
        }
    }

    let mut admitted = Admitted {
        events: actual_events(normalized, admission.present),
        ..Default::default()
    };
    if let Some(schema) = schema.as_mut() {
        for event in &admitted.events {
            if let Formula::Rule(rule) = &event.formula {
                let local = rule
                    .heads
                    .iter()
                    .filter(|head| head.table.modal.is_none() && is_local(head, admission.theory));
                for head in local {
                    admitted.schema_changes.extend(schema.update(head, event.insert));
                }
            }
        }
    }
    for event in &admitted.events {
        errors.extend(structural_errors(event, schema.as_ref(), admission));
    }

    let rules: Vec<Event> = admitted
        .events
        .iter()
        .filter(|event| !event.is_atom())
        .cloned()
        .collect();
    admitted.graph_changes = graph.formula_update(&rules);
    errors.extend(graph_errors(graph, admission.kind));

    if errors.is_empty() {
        return Ok(admitted);
    }
    admitted.undo(schema, graph);

    Err(PolicyErrors(errors))
}

#[cfg(test)]
mod tests {
    use crate::engine::event::Event;
    use crate::engine::theory::{actual_events, normalize};
    use crate::schema::Schema;
    use datalog_syntax::*;
    use datalog_syntax_macros::{literal, rule};

    #[test]
    fn test_actual_events_drop_noops_and_repeats() {
        let present: Formula = literal!(p(1)).into();
        let is_present = |formula: &Formula| formula == &present;
        let events = vec![
            Event::insert(literal!(p(1))),
            Event::insert(literal!(p(2))),
            Event::insert(literal!(p(2))),
            Event::delete(literal!(p(3))),
            Event::delete(literal!(p(1))),
            Event::insert(literal!(p(1))),
        ];

        let actual: Vec<String> = actual_events(events, &is_present)
            .iter()
            .map(|event| event.to_string())
            .collect();
        assert_eq!(vec!["+p(2)", "-p(1)", "+p(1)"], actual);
    }

    #[test]
    fn test_normalize_rule() {
        let mut schema = Schema::new(false);
        schema.declare("servers", &["id", "status"]);
        let rule = Rule::new(
            literal!(p(?x)),
            vec![literal!(!r(?x)), literal!(servers(?x, status = "ACTIVE"))],
        );

        let normalized = normalize(&rule.into(), Some(&schema), "test").unwrap();
        assert_eq!(
            Formula::Rule(rule!(p(?x) <- [servers(?x, "ACTIVE"), !r(?x)])),
            normalized
        );
    }
}
