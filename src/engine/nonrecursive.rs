use crate::analysis::dependency::{find_subpolicy, RuleDependencyGraph};
use crate::config::{PolicyKind, TheoryConfig};
use crate::engine::event::{Event, ProofTree};
use crate::engine::theory::{admit, Admission, Theory};
use crate::error::{PolicyError, PolicyErrors};
use crate::evaluation::builtins::builtin_for;
use crate::evaluation::topdown::{Candidate, RuleSource, TopDown};
use crate::rewriting::unify::instance;
use crate::schema::Schema;
use crate::storage::ruleset::RuleSet;
use crate::tracer::Tracer;
use datalog_syntax::{Bindings, Formula, Literal, Rule, Tablename, Term};
use indexmap::IndexSet;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Where a formula lives in the rule set: one regular rule per head.
fn parts(formula: &Formula) -> Vec<(String, Rule)> {
    match formula {
        Formula::Rule(rule) => rule
            .heads
            .iter()
            .map(|head| (head.table.table.clone(), Rule::new(head.clone(), rule.body.clone())))
            .collect(),
        atom => atom
            .as_literal()
            .map(|literal| (literal.table.table.clone(), Rule::new(literal, vec![])))
            .into_iter()
            .collect(),
    }
}

fn stored(rules: &RuleSet, formula: &Formula) -> bool {
    parts(formula).iter().all(|(key, rule)| rules.contains(key, rule))
}

fn query_for(table: &str, arity: usize) -> Literal {
    let arguments = (0..arity).map(|i| Term::variable(&format!("x{}", i))).collect();

    Literal::new(Tablename::new(table), arguments)
}

/// Rules evaluated on demand by top-down search. Recursion is rejected at update time.
#[derive(Debug, Clone)]
pub struct NonrecursiveRuleTheory {
    config: TheoryConfig,
    rules: RuleSet,
    /// Rules as admitted, multi-head rules whole. The graph and schema count these.
    originals: IndexSet<Rule>,
    schema: Option<Schema>,
    graph: RuleDependencyGraph,
    tracer: Tracer,
}

impl NonrecursiveRuleTheory {
    pub fn new(config: TheoryConfig) -> Self {
        NonrecursiveRuleTheory {
            tracer: Tracer::new(&config.traced),
            config,
            rules: RuleSet::default(),
            originals: IndexSet::new(),
            schema: None,
            graph: RuleDependencyGraph::default(),
        }
    }
    pub fn config(&self) -> &TheoryConfig {
        &self.config
    }
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }
    /// Replaces the schema, registering the heads of the rules already stored.
    pub fn set_schema(&mut self, mut schema: Schema) {
        for rule in &self.originals {
            for head in rule.heads.iter().filter(|head| self.registers(head)) {
                schema.update(head, true);
            }
        }
        self.schema = Some(schema);
    }
    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }
    pub fn dependency_graph(&self) -> &RuleDependencyGraph {
        &self.graph
    }
    pub fn len(&self) -> usize {
        self.rules.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
    fn registers(&self, head: &Literal) -> bool {
        head.table.modal.is_none()
            && head
                .table
                .service
                .as_deref()
                .map_or(true, |service| service == self.config.name)
    }
    /// Drops `table` from every rule defining it. A multi-head rule leaves the graph whole and
    /// comes back without that head.
    fn forget(&mut self, table: &str) {
        let defining: Vec<Rule> = self
            .originals
            .iter()
            .filter(|rule| rule.heads.iter().any(|head| head.table.table == table))
            .cloned()
            .collect();
        for rule in defining {
            self.originals.shift_remove(&rule);
            self.graph.formula_delete(&Formula::Rule(rule.clone()), None);
            let (dropped, kept): (Vec<Literal>, Vec<Literal>) =
                rule.heads.iter().cloned().partition(|head| head.table.table == table);
            let unregistered: Vec<Literal> = dropped.into_iter().filter(|head| self.registers(head)).collect();
            if let Some(schema) = self.schema.as_mut() {
                for head in &unregistered {
                    schema.update(head, false);
                }
            }
            if kept.is_empty() {
                continue;
            }
            let reduced = Rule { heads: kept, ..rule };
            self.graph.formula_insert(&Formula::Rule(reduced.clone()), None);
            self.originals.insert(reduced);
        }
        self.rules.clear_table(table);
    }
    /// Removes everything stored for `tables` (all tables when `None`), or for every other table
    /// when `invert` is set.
    pub fn empty(&mut self, tables: Option<&[String]>, invert: bool) {
        let doomed: Vec<String> = self
            .rules
            .keys()
            .into_iter()
            .filter(|key| tables.map_or(true, |tables| tables.contains(key) != invert))
            .collect();
        for table in doomed {
            self.forget(&table);
        }
    }
    /// Bulk load: clears `tables` and stores `facts` without validation. Facts outside `tables`
    /// are skipped.
    pub fn initialize_tables(&mut self, tables: &[String], facts: impl IntoIterator<Item = Literal>) {
        for table in tables {
            self.forget(table);
        }
        let mut loaded = 0;
        for fact in facts {
            let key = fact.table.table.clone();
            if !tables.contains(&key) {
                warn!(theory = %self.config.name, %fact, "fact outside the initialized tables");
                continue;
            }
            if self.rules.add_rule(&key, Rule::new(fact, vec![])) {
                loaded += 1;
            }
        }
        info!(theory = %self.config.name, tables = tables.len(), loaded, "initialized tables");
    }
    /// Replaces the whole content with `formulas`.
    pub fn define(&mut self, formulas: Vec<Formula>) -> Result<Vec<Event>, PolicyErrors> {
        self.empty(None, false);

        self.update(formulas.into_iter().map(Event::insert).collect())
    }
    pub fn find_subpolicy(
        &self,
        required: &IndexSet<String>,
        prohibited: &IndexSet<String>,
        outputs: &IndexSet<String>,
    ) -> Vec<Rule> {
        find_subpolicy(&self.policy(), required, prohibited, outputs)
    }
    fn admission_errors(&self, events: Vec<Event>, schema: &mut Option<Schema>, graph: &mut RuleDependencyGraph) -> Result<Vec<Event>, PolicyErrors> {
        let rules = &self.rules;
        let present = |formula: &Formula| stored(rules, formula);
        let is_view = |_: &str| false;
        let admission = Admission {
            theory: &self.config.name,
            kind: self.kind(),
            present: &present,
            is_view: &is_view,
        };

        admit(events, &admission, schema, graph).map(|admitted| admitted.events)
    }
    fn explain_literal(&self, literal: &Literal) -> Option<ProofTree> {
        let topdown = TopDown::new(self);
        if literal.negated || builtin_for(literal).is_some() {
            return topdown.prove(literal).then(|| ProofTree::leaf(literal.clone()));
        }

        let goal = Formula::Literal(literal.clone());
        for candidate in self.head_index(literal) {
            match candidate {
                Candidate::Tuple(row) => {
                    if literal.argument_values().as_ref() == Some(&row) {
                        return Some(ProofTree::leaf(literal.clone()));
                    }
                }
                Candidate::Rule(rule) => {
                    let Some(binding) = instance(&goal, &Formula::Literal(rule.head().clone())) else {
                        continue;
                    };
                    let body: Vec<Literal> = rule.body.iter().map(|literal| literal.plug(&binding)).collect();
                    let variables: BTreeSet<_> = body.iter().flat_map(Literal::variables).collect();
                    for found in topdown.evaluate(&variables, &body, &Bindings::new(), true) {
                        let children: Option<Vec<ProofTree>> = body
                            .iter()
                            .map(|literal| self.explain_literal(&literal.plug(&found)))
                            .collect();
                        if let Some(children) = children {
                            return Some(ProofTree {
                                root: literal.clone(),
                                children,
                            });
                        }
                    }
                }
            }
        }

        None
    }
}

impl RuleSource for NonrecursiveRuleTheory {
    fn name(&self) -> &str {
        &self.config.name
    }
    fn head_index(&self, literal: &Literal) -> Vec<Candidate> {
        self.rules.get_rules(&literal.table.table, Some(literal))
    }
    fn tracer(&self) -> Option<&Tracer> {
        Some(&self.tracer)
    }
}

impl Theory for NonrecursiveRuleTheory {
    fn kind(&self) -> PolicyKind {
        match self.config.kind {
            PolicyKind::Action => PolicyKind::Action,
            _ => PolicyKind::Nonrecursive,
        }
    }
    fn as_source(&self) -> &dyn RuleSource {
        self
    }
    fn update(&mut self, events: Vec<Event>) -> Result<Vec<Event>, PolicyErrors> {
        let mut schema = self.schema.take();
        let mut graph = std::mem::take(&mut self.graph);
        let admitted = self.admission_errors(events, &mut schema, &mut graph);
        self.schema = schema;
        self.graph = graph;

        let events = match admitted {
            Ok(events) => events,
            Err(errors) => {
                warn!(theory = %self.config.name, %errors, "rejected update");
                return Err(errors);
            }
        };
        for event in &events {
            if let Some(rule) = event.rule() {
                if event.insert {
                    self.originals.insert(rule.clone());
                } else {
                    self.originals.shift_remove(rule);
                }
            }
            for (key, rule) in parts(&event.formula) {
                if event.insert {
                    self.rules.add_rule(&key, rule);
                } else {
                    self.rules.discard_rule(&key, &rule);
                }
                self.tracer
                    .log(&self.config.name, Some(&key), 0, format_args!("{}", event));
            }
        }
        debug!(theory = %self.config.name, events = events.len(), "applied update");

        Ok(events)
    }
    fn update_errors(&self, events: &[Event]) -> Vec<PolicyError> {
        let mut schema = self.schema.clone();
        let mut graph = self.graph.clone();

        match self.admission_errors(events.to_vec(), &mut schema, &mut graph) {
            Ok(_) => vec![],
            Err(errors) => errors.0,
        }
    }
    fn explain(&self, atom: &Literal) -> Option<ProofTree> {
        self.explain_literal(atom)
    }
    fn consequences(&self) -> BTreeSet<Literal> {
        self.rules
            .keys()
            .iter()
            .filter_map(|key| Some(query_for(key, self.arity(key)?)))
            .flat_map(|query| self.select(&query))
            .collect()
    }
    fn content(&self) -> Vec<Formula> {
        self.rules
            .content()
            .into_iter()
            .map(|rule| {
                if rule.body.is_empty() && rule.head().is_ground() {
                    Formula::Literal(rule.head().clone())
                } else {
                    Formula::Rule(rule)
                }
            })
            .collect()
    }
    fn policy(&self) -> Vec<Rule> {
        self.rules
            .content()
            .into_iter()
            .filter(|rule| !rule.body.is_empty())
            .collect()
    }
    fn arity(&self, table: &str) -> Option<usize> {
        self.schema
            .as_ref()
            .and_then(|schema| schema.arity(table))
            .or_else(|| self.rules.arity(table))
    }
    fn contains(&self, formula: &Formula) -> bool {
        stored(&self.rules, formula)
    }
}
