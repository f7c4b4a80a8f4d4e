use crate::evaluation::topdown::Candidate;
use crate::storage::factset::{FactSet, Row};
use datalog_syntax::{Literal, Rule, Tablename, Term};
use indexmap::{IndexMap, IndexSet};

/// Rules keyed by the table of their head. Ground facts go to a [`FactSet`], everything else to
/// an insertion-ordered set.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    facts: IndexMap<String, FactSet>,
    rules: IndexMap<String, IndexSet<Rule>>,
}

fn as_row(rule: &Rule) -> Option<Row> {
    if !rule.body.is_empty() || !rule.is_regular() {
        return None;
    }
    let head = rule.head();
    if head.negated || !head.named_arguments.is_empty() || head.table.modal.is_some() {
        return None;
    }

    head.argument_values()
}

fn fact_rule(key: &str, row: &Row) -> Rule {
    let arguments = row.iter().cloned().map(Term::Constant).collect();

    Rule::new(Literal::new(Tablename::new(key), arguments), vec![])
}

impl RuleSet {
    pub fn add_rule(&mut self, key: &str, rule: Rule) -> bool {
        if let Some(row) = as_row(&rule) {
            return self.facts.entry(key.to_string()).or_default().add(row);
        }

        self.rules.entry(key.to_string()).or_default().insert(rule)
    }
    pub fn discard_rule(&mut self, key: &str, rule: &Rule) -> bool {
        if let Some(row) = as_row(rule) {
            let Some(facts) = self.facts.get_mut(key) else {
                return false;
            };
            let changed = facts.remove(&row);
            if facts.is_empty() {
                self.facts.shift_remove(key);
            }

            return changed;
        }

        let Some(rules) = self.rules.get_mut(key) else {
            return false;
        };
        let changed = rules.shift_remove(rule);
        if rules.is_empty() {
            self.rules.shift_remove(key);
        }

        changed
    }
    pub fn contains(&self, key: &str, rule: &Rule) -> bool {
        match as_row(rule) {
            Some(row) => self.facts.get(key).map_or(false, |facts| facts.contains(&row)),
            None => self.rules.get(key).map_or(false, |rules| rules.contains(rule)),
        }
    }
    /// Facts first, narrowed by the constants of `match_literal` when given, then rules.
    pub fn get_rules(&self, key: &str, match_literal: Option<&Literal>) -> Vec<Candidate> {
        let mut candidates = vec![];
        if let Some(facts) = self.facts.get(key) {
            let bound: Vec<_> = match_literal
                .map(|literal| {
                    literal
                        .arguments
                        .iter()
                        .enumerate()
                        .filter_map(|(column, term)| term.as_constant().map(|value| (column, value.clone())))
                        .collect()
                })
                .unwrap_or_default();
            candidates.extend(facts.find(&bound).into_iter().map(Candidate::Tuple));
        }
        if let Some(rules) = self.rules.get(key) {
            candidates.extend(rules.iter().cloned().map(Candidate::Rule));
        }

        candidates
    }
    /// Every stored formula of a table, facts rendered as bodiless rules.
    pub fn table_rules(&self, key: &str) -> Vec<Rule> {
        let facts = self
            .facts
            .get(key)
            .into_iter()
            .flat_map(|facts| facts.iter().map(|row| fact_rule(key, row)));
        let rules = self.rules.get(key).into_iter().flat_map(|rules| rules.iter().cloned());

        facts.chain(rules).collect()
    }
    pub fn keys(&self) -> IndexSet<String> {
        self.facts.keys().chain(self.rules.keys()).cloned().collect()
    }
    pub fn content(&self) -> Vec<Rule> {
        self.keys().iter().flat_map(|key| self.table_rules(key)).collect()
    }
    pub fn arity(&self, key: &str) -> Option<usize> {
        if let Some(row) = self.facts.get(key).and_then(|facts| facts.iter().next()) {
            return Some(row.len());
        }

        self.rules
            .get(key)
            .and_then(|rules| rules.iter().next())
            .map(|rule| rule.head().arity())
    }
    pub fn len(&self) -> usize {
        self.facts.values().map(FactSet::len).sum::<usize>()
            + self.rules.values().map(IndexSet::len).sum::<usize>()
    }
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty() && self.rules.is_empty()
    }
    pub fn clear(&mut self) {
        self.facts.clear();
        self.rules.clear();
    }
    pub fn clear_table(&mut self, key: &str) {
        self.facts.shift_remove(key);
        self.rules.shift_remove(key);
    }
}

#[cfg(test)]
mod tests {
    use crate::evaluation::topdown::Candidate;
    use crate::storage::ruleset::RuleSet;
    use datalog_syntax::*;
    use datalog_syntax_macros::{literal, program, rule};

    #[test]
    fn test_routes_facts_and_rules() {
        let mut rules = RuleSet::default();
        let fact = rule!(p(1, 2) <- []);
        let derived = rule!(p(?x, ?y) <- [q(?x, ?y)]);

        assert!(rules.add_rule("p", derived.clone()));
        assert!(rules.add_rule("p", fact.clone()));
        assert!(!rules.add_rule("p", fact.clone()));
        assert!(rules.contains("p", &fact));
        assert_eq!(2, rules.len());

        let candidates = rules.get_rules("p", None);
        assert!(matches!(candidates[0], Candidate::Tuple(_)));
        assert!(matches!(candidates[1], Candidate::Rule(_)));
        assert_eq!(vec![fact.clone(), derived.clone()], rules.table_rules("p"));

        assert!(rules.discard_rule("p", &fact));
        assert!(!rules.discard_rule("p", &fact));
        assert!(rules.discard_rule("p", &derived));
        assert!(rules.is_empty());
    }

    #[test]
    fn test_bound_arguments_narrow_facts() {
        let mut rules = RuleSet::default();
        let edges = program! {
            e(1, 2) <- [],
            e(1, 3) <- [],
            e(2, 3) <- [],
        };
        for edge in edges {
            rules.add_rule("e", edge);
        }
        rules.add_rule("f", rule!(f(1) <- []));

        let from_one = rules.get_rules("e", Some(&literal!(e(1, ?y))));
        assert_eq!(2, from_one.len());
        let exact = rules.get_rules("e", Some(&literal!(e(2, 3))));
        assert_eq!(1, exact.len());
        assert_eq!(3, rules.get_rules("e", Some(&literal!(e(?x, ?y)))).len());

        rules.clear_table("e");
        assert!(rules.get_rules("e", None).is_empty());
        assert_eq!(Some(1), rules.arity("f"));
    }
}
