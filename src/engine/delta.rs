use crate::engine::event::Event;
use crate::evaluation::builtins::builtin_for;
use crate::rewriting::safety::reorder_for_safety;
use datalog_syntax::{Literal, Rule, Tablename, Term, Variable};
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};
use tracing::debug;

/// Prefix of the tables holding copies used to break self-joins.
pub const JOIN_HELPER_PREFIX: &str = "___";

pub fn is_join_helper(table: &str) -> bool {
    table.starts_with(JOIN_HELPER_PREFIX)
}

/// A rule specialised to one body literal: when a fact matching `trigger` changes, `body`
/// evaluated under the trigger's binding yields the affected instances of `head`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeltaRule {
    pub trigger: Literal,
    pub head: Literal,
    pub body: Vec<Literal>,
    pub original: Rule,
}

impl DeltaRule {
    pub fn variables(&self) -> BTreeSet<Variable> {
        std::iter::once(&self.trigger)
            .chain(std::iter::once(&self.head))
            .chain(self.body.iter())
            .flat_map(Literal::variables)
            .collect()
    }
    pub fn tablenames(&self) -> BTreeSet<String> {
        std::iter::once(&self.trigger)
            .chain(std::iter::once(&self.head))
            .chain(self.body.iter())
            .filter(|literal| builtin_for(literal).is_none())
            .map(|literal| literal.table.table.clone())
            .collect()
    }
}

impl Display for DeltaRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let body: Vec<String> = self.body.iter().map(|literal| literal.to_string()).collect();
        write!(f, "<{}>: {} :- {}", self.trigger, self.head, body.join(", "))
    }
}

impl Debug for DeltaRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// One delta rule per head and per non-builtin body literal.
pub fn compute_delta_rules(rules: &[Rule]) -> Vec<DeltaRule> {
    let mut deltas = vec![];
    for rule in rules {
        let rule = reorder_for_safety(rule).unwrap_or_else(|_| rule.clone());
        for (position, trigger) in rule.body.iter().enumerate() {
            if builtin_for(trigger).is_some() {
                continue;
            }
            let body: Vec<Literal> = rule
                .body
                .iter()
                .enumerate()
                .filter(|(other, _)| *other != position)
                .map(|(_, literal)| literal.clone())
                .collect();
            for head in &rule.heads {
                deltas.push(DeltaRule {
                    trigger: trigger.clone(),
                    head: head.clone(),
                    body: body.clone(),
                    original: rule.clone(),
                });
            }
        }
    }

    deltas
}

fn join_helper(literal: &Literal, occurrence: usize) -> (Literal, Rule) {
    let arity = literal.arity();
    let name = format!("{}{}_{}_{}", JOIN_HELPER_PREFIX, literal.table.table, arity, occurrence);
    let variables: Vec<Term> = (0..arity).map(|i| Term::variable(&format!("x{}", i))).collect();
    let copy = Rule::new(
        Literal::new(Tablename::new(&name), variables.clone()),
        vec![Literal::new(literal.table.clone(), variables)],
    );
    let renamed = Literal {
        table: Tablename::new(&name),
        ..literal.clone()
    };

    (renamed, copy)
}

/// Renames every repeated occurrence of a body table to its own copy table, so that each delta
/// rule body misses the table of its trigger. Returns the rewritten rule and the copy rules it
/// needs.
pub fn split_self_joins(rule: &Rule) -> (Rule, Vec<Rule>) {
    let mut seen: IndexMap<(String, usize), usize> = IndexMap::new();
    let mut helpers = vec![];
    let body = rule
        .body
        .iter()
        .map(|literal| {
            if builtin_for(literal).is_some() {
                return literal.clone();
            }
            let occurrence = seen.entry((literal.table.name(), literal.arity())).or_default();
            *occurrence += 1;
            if *occurrence == 1 {
                return literal.clone();
            }
            let (renamed, copy) = join_helper(literal, *occurrence - 1);
            helpers.push(copy);
            renamed
        })
        .collect();

    let rewritten = Rule {
        heads: rule.heads.clone(),
        body,
        id: rule.id.clone(),
        name: rule.name.clone(),
    };

    (rewritten, helpers)
}

pub fn eliminate_self_joins(rules: &[Rule]) -> Vec<Rule> {
    let mut rewritten = vec![];
    let mut helpers: IndexSet<Rule> = IndexSet::new();
    for rule in rules {
        let (rule, copies) = split_self_joins(rule);
        rewritten.push(rule);
        helpers.extend(copies);
    }
    rewritten.extend(helpers);

    rewritten
}

fn increment(counts: &mut IndexMap<String, usize>, table: &str) {
    *counts.entry(table.to_string()).or_default() += 1;
}

fn decrement(counts: &mut IndexMap<String, usize>, table: &str) {
    if let Some(count) = counts.get_mut(table) {
        *count -= 1;
        if *count == 0 {
            counts.shift_remove(table);
        }
    }
}

/// Delta rules indexed by trigger table, with counts of the tables rules define and mention.
#[derive(Debug, Default, Clone)]
pub struct DeltaRuleTheory {
    name: String,
    rules: IndexMap<String, IndexSet<DeltaRule>>,
    originals: IndexSet<Rule>,
    views: IndexMap<String, usize>,
    all_tables: IndexMap<String, usize>,
}

impl DeltaRuleTheory {
    pub fn new(name: &str) -> Self {
        DeltaRuleTheory {
            name: name.to_string(),
            ..Default::default()
        }
    }
    /// Applies a rule event; facts are ignored. Returns whether anything changed.
    pub fn modify(&mut self, event: &Event) -> bool {
        match event.rule() {
            Some(rule) if event.insert => self.insert(rule),
            Some(rule) => self.delete(rule),
            None => false,
        }
    }
    pub fn insert(&mut self, rule: &Rule) -> bool {
        if !self.originals.insert(rule.clone()) {
            return false;
        }
        for head in &rule.heads {
            increment(&mut self.views, &head.table.table);
        }
        for table in mentioned_tables(rule) {
            increment(&mut self.all_tables, &table);
        }
        for delta in compute_delta_rules(std::slice::from_ref(rule)) {
            debug!(theory = %self.name, %delta, "adding delta rule");
            self.rules
                .entry(delta.trigger.table.table.clone())
                .or_default()
                .insert(delta);
        }

        true
    }
    pub fn delete(&mut self, rule: &Rule) -> bool {
        if !self.originals.shift_remove(rule) {
            return false;
        }
        for head in &rule.heads {
            decrement(&mut self.views, &head.table.table);
        }
        for table in mentioned_tables(rule) {
            decrement(&mut self.all_tables, &table);
        }
        for delta in compute_delta_rules(std::slice::from_ref(rule)) {
            let table = &delta.trigger.table.table;
            if let Some(deltas) = self.rules.get_mut(table) {
                deltas.shift_remove(&delta);
                if deltas.is_empty() {
                    self.rules.shift_remove(table);
                }
            }
        }

        true
    }
    pub fn rules_with_trigger(&self, table: &str) -> Vec<DeltaRule> {
        self.rules
            .get(table)
            .map(|deltas| deltas.iter().cloned().collect())
            .unwrap_or_default()
    }
    pub fn is_view(&self, table: &str) -> bool {
        self.views.contains_key(table)
    }
    pub fn is_known(&self, table: &str) -> bool {
        self.all_tables.contains_key(table)
    }
    pub fn base_tables(&self) -> Vec<String> {
        self.all_tables
            .keys()
            .filter(|table| !self.is_view(table))
            .cloned()
            .collect()
    }
    pub fn policy(&self) -> Vec<Rule> {
        self.originals.iter().cloned().collect()
    }
    pub fn contains(&self, rule: &Rule) -> bool {
        self.originals.contains(rule)
    }
    pub fn arity(&self, table: &str) -> Option<usize> {
        self.originals
            .iter()
            .flat_map(|rule| rule.heads.iter().chain(rule.body.iter()))
            .find(|literal| literal.table.table == table)
            .map(Literal::arity)
    }
    pub fn len(&self) -> usize {
        self.rules.values().map(IndexSet::len).sum()
    }
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn mentioned_tables(rule: &Rule) -> IndexSet<String> {
    rule.heads
        .iter()
        .chain(rule.body.iter())
        .filter(|literal| builtin_for(literal).is_none())
        .map(|literal| literal.table.table.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::engine::delta::{compute_delta_rules, eliminate_self_joins, split_self_joins, DeltaRuleTheory};
    use crate::engine::event::Event;
    use datalog_syntax::*;
    use datalog_syntax_macros::{literal, rule};

    #[test]
    fn test_one_delta_rule_per_trigger() {
        let rule = rule!(p(?x) <- [q(?x, ?y), !r(?y), lt(?x, ?y)]);
        let deltas = compute_delta_rules(&[rule.clone()]);

        assert_eq!(2, deltas.len());
        assert_eq!(literal!(q(?x, ?y)), deltas[0].trigger);
        assert_eq!(vec![literal!(!r(?y)), literal!(lt(?x, ?y))], deltas[0].body);
        assert_eq!(literal!(!r(?y)), deltas[1].trigger);
        assert!(deltas.iter().all(|delta| delta.original == rule));
        assert_eq!(
            vec!["p", "q", "r"],
            deltas[0].tablenames().into_iter().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_self_joins_are_split() {
        let rule = rule!(p(?x) <- [q(?x, ?y), q(?y, ?z), q(?z, ?w), r(?x)]);
        let (rewritten, helpers) = split_self_joins(&rule);

        assert_eq!(
            rule!(p(?x) <- [q(?x, ?y), ___q_2_1(?y, ?z), ___q_2_2(?z, ?w), r(?x)]),
            rewritten
        );
        assert_eq!(
            vec![
                rule!(___q_2_1(?x0, ?x1) <- [q(?x0, ?x1)]),
                rule!(___q_2_2(?x0, ?x1) <- [q(?x0, ?x1)]),
            ],
            helpers
        );

        let shared = eliminate_self_joins(&[
            rule!(p(?x) <- [q(?x, ?y), q(?y, ?z)]),
            rule!(s(?x) <- [q(?x, ?y), q(?y, ?x)]),
        ]);
        assert_eq!(3, shared.len());
    }

    #[test]
    fn test_theory_bookkeeping() {
        let mut theory = DeltaRuleTheory::new("test");
        let rule = rule!(p(?x) <- [q(?x), !r(?x)]);

        assert!(theory.modify(&Event::insert(rule.clone())));
        assert!(!theory.insert(&rule));
        assert!(!theory.modify(&Event::insert(literal!(q(1)))));
        assert_eq!(2, theory.len());
        assert_eq!(1, theory.rules_with_trigger("r").len());
        assert!(theory.is_view("p"));
        assert!(theory.is_known("r"));
        assert_eq!(vec!["q".to_string(), "r".to_string()], theory.base_tables());
        assert_eq!(Some(1), theory.arity("q"));

        assert!(theory.modify(&Event::delete(rule.clone())));
        assert!(theory.is_empty());
        assert!(!theory.is_known("q"));
        assert!(theory.policy().is_empty());
    }
}
