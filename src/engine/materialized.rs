use crate::analysis::dependency::RuleDependencyGraph;
use crate::config::{PolicyKind, TheoryConfig};
use crate::engine::delta::{is_join_helper, split_self_joins, DeltaRuleTheory};
use crate::engine::event::{Event, EventQueue, Proof, ProofCollection, ProofTree};
use crate::engine::theory::{admit, Admission, Theory};
use crate::error::{PolicyError, PolicyErrors};
use crate::evaluation::builtins::builtin_for;
use crate::evaluation::topdown::{Candidate, RuleSource, TopDown};
use crate::rewriting::unify::UnifierArena;
use crate::schema::Schema;
use crate::storage::database::Database;
use crate::tracer::Tracer;
use datalog_syntax::{Bindings, Formula, Literal, Rule, Tablename};
use indexmap::{IndexMap, IndexSet};
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, warn};

fn is_internal(event: &Event) -> bool {
    match &event.formula {
        Formula::Rule(rule) => rule.heads.iter().any(|head| is_join_helper(&head.table.table)),
        atom => atom
            .as_literal()
            .map_or(false, |literal| is_join_helper(&literal.table.table)),
    }
}

/// Every consequence of the rules kept stored and maintained incrementally: each fact change is
/// pushed through the delta rules it triggers instead of recomputing views.
#[derive(Debug)]
pub struct MaterializedViewTheory {
    config: TheoryConfig,
    database: Database,
    delta_rules: DeltaRuleTheory,
    queue: EventQueue,
    join_helpers: IndexMap<Rule, usize>,
    policy: IndexSet<Rule>,
    schema: Option<Schema>,
    graph: RuleDependencyGraph,
}

impl MaterializedViewTheory {
    pub fn new(config: TheoryConfig) -> Self {
        let mut database = Database::new(&config.name);
        *database.tracer_mut() = Tracer::new(&config.traced);

        MaterializedViewTheory {
            delta_rules: DeltaRuleTheory::new(&config.name),
            config,
            database,
            queue: EventQueue::default(),
            join_helpers: IndexMap::new(),
            policy: IndexSet::new(),
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
    pub fn set_schema(&mut self, mut schema: Schema) {
        for rule in &self.policy {
            for head in rule.heads.iter().filter(|head| head.table.modal.is_none()) {
                schema.update(head, true);
            }
        }
        self.schema = Some(schema);
    }
    pub fn tracer_mut(&mut self) -> &mut Tracer {
        self.database.tracer_mut()
    }
    pub fn database(&self) -> &Database {
        &self.database
    }
    pub fn delta_rules(&self) -> &DeltaRuleTheory {
        &self.delta_rules
    }
    pub fn dependency_graph(&self) -> &RuleDependencyGraph {
        &self.graph
    }
    fn admission(&self, events: Vec<Event>, schema: &mut Option<Schema>, graph: &mut RuleDependencyGraph) -> Result<Vec<Event>, PolicyErrors> {
        let defined: IndexSet<String> = events
            .iter()
            .filter(|event| event.insert)
            .filter_map(Event::rule)
            .flat_map(|rule| rule.heads.iter().map(|head| head.table.table.clone()))
            .collect();
        let present = |formula: &Formula| match formula {
            Formula::Rule(rule) => self.policy.contains(rule),
            atom => atom
                .as_literal()
                .map_or(false, |literal| self.database.contains(&literal)),
        };
        let is_view = |table: &str| self.delta_rules.is_view(table) || defined.contains(table);
        let admission = Admission {
            theory: &self.config.name,
            kind: PolicyKind::Materialized,
            present: &present,
            is_view: &is_view,
        };

        admit(events, &admission, schema, graph).map(|admitted| admitted.events)
    }
    /// Queues a user event. Rules are queued with their self-joins split out; copy rules are
    /// shared between rules and queued on first use and last release.
    fn enqueue_any(&mut self, event: Event) {
        let Some(rule) = event.rule().cloned() else {
            self.queue.enqueue(event);
            return;
        };

        let (rewritten, helpers) = split_self_joins(&rule);
        if event.insert {
            self.policy.insert(rule);
        } else {
            self.policy.shift_remove(&rule);
        }
        self.queue.enqueue(Event::new(rewritten, event.insert));

        for helper in helpers {
            let count = self.join_helpers.entry(helper.clone()).or_default();
            if event.insert {
                *count += 1;
                if *count == 1 {
                    self.queue.enqueue(Event::insert(helper));
                }
                continue;
            }
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.join_helpers.shift_remove(&helper);
                self.queue.enqueue(Event::delete(helper));
            }
        }
    }
    fn process_queue(&mut self) -> Vec<Event> {
        let mut history = vec![];
        while let Some(event) = self.queue.dequeue() {
            debug!(theory = %self.config.name, %event, "processing event");
            let Some(rule) = event.rule().cloned() else {
                if self.database.changes_truth(&event) {
                    self.propagate(&event);
                }
                if let Some(change) = self.database.modify(&event) {
                    debug!(theory = %self.config.name, change = ?change, "database changed");
                    if !is_internal(&change) {
                        history.push(change);
                    }
                }
                continue;
            };

            if !self.delta_rules.modify(&event) {
                continue;
            }
            let bindings = TopDown::new(&self.database).evaluate(&rule.variables(), &rule.body, &Bindings::new(), true);
            for head in &rule.heads {
                self.process_new_bindings(&bindings, head, event.insert, &rule);
            }
            if !is_internal(&event) {
                history.push(event);
            }
        }

        history
    }
    /// Queues the head changes caused by a fact change, one delta rule at a time.
    fn propagate(&mut self, event: &Event) {
        let Some(atom) = event.literal() else {
            return;
        };
        for delta in self.delta_rules.rules_with_trigger(&atom.table.table) {
            let mut arena = UnifierArena::default();
            let trigger = arena.fresh();
            let changed = arena.fresh();
            let unified = arena.bi_unify_atoms(&delta.trigger, trigger, &atom, changed, Some(&self.config.name));
            if unified.is_none() {
                continue;
            }

            let seed = arena.bindings(&delta.trigger.variables(), trigger);
            let bindings = TopDown::new(&self.database).evaluate(&delta.variables(), &delta.body, &seed, true);
            debug!(
                theory = %self.config.name,
                %delta,
                bindings = bindings.len(),
                "fired delta rule"
            );
            // A change to a negated trigger flips the change it causes.
            let insert = event.insert != delta.trigger.negated;
            self.process_new_bindings(&bindings, &delta.head, insert, &delta.original);
        }
    }
    fn process_new_bindings(&mut self, bindings: &[Bindings], head: &Literal, insert: bool, rule: &Rule) {
        let mut grouped: IndexMap<Literal, ProofCollection> = IndexMap::new();
        for binding in bindings {
            grouped
                .entry(head.plug(binding))
                .or_default()
                .insert(Proof::new(binding.clone(), rule.clone()));
        }
        for (atom, proofs) in grouped {
            self.queue.enqueue(Event::new(atom, insert).with_proofs(proofs));
        }
    }
    /// View tuples with no proof grounded in base tuples. Support counting keeps tuples of a
    /// recursive view that only prove each other, so these are found by rederiving from the base.
    fn unfounded(&self) -> Vec<Literal> {
        let views: Vec<Literal> = self
            .database
            .content(None)
            .into_iter()
            .filter(|literal| self.delta_rules.is_view(&literal.table.table))
            .collect();
        let mut founded: HashSet<Literal> = HashSet::new();
        loop {
            let grown: Vec<Literal> = views
                .iter()
                .filter(|literal| !founded.contains(*literal) && self.is_founded(literal, &founded))
                .cloned()
                .collect();
            if grown.is_empty() {
                break;
            }
            founded.extend(grown);
        }

        views.into_iter().filter(|literal| !founded.contains(literal)).collect()
    }
    fn is_founded(&self, atom: &Literal, founded: &HashSet<Literal>) -> bool {
        let Some(proofs) = self.database.explain(atom) else {
            return false;
        };
        proofs.iter().any(|proof| {
            proof
                .rule
                .body
                .iter()
                .filter(|premise| !premise.negated && builtin_for(premise).is_none())
                .map(|premise| premise.plug(&proof.binding))
                .all(|premise| {
                    if !self.delta_rules.is_view(&premise.table.table) {
                        return self.database.contains(&premise);
                    }
                    let local = Literal::new(Tablename::new(&premise.table.table), premise.arguments);
                    founded.contains(&local)
                })
        })
    }
    /// Deletes unfounded view tuples one at a time, with the proofs they hold when dequeued, until
    /// every remaining tuple is founded.
    fn retract_unfounded(&mut self) -> Vec<Event> {
        let mut history = vec![];
        loop {
            let unfounded = self.unfounded();
            if unfounded.is_empty() {
                return history;
            }
            debug!(theory = %self.config.name, count = unfounded.len(), "retracting unfounded tuples");
            for atom in unfounded {
                let Some(proofs) = self.database.explain(&atom).cloned() else {
                    continue;
                };
                self.queue.enqueue(Event::delete(atom).with_proofs(proofs));
                history.extend(self.process_queue());
            }
        }
    }
    fn explain_literal(&self, literal: &Literal) -> Option<ProofTree> {
        if literal.negated || builtin_for(literal).is_some() {
            return TopDown::new(&self.database)
                .prove(literal)
                .then(|| ProofTree::leaf(literal.clone()));
        }
        let proofs = self.database.explain(literal)?;
        let Some(proof) = proofs.first() else {
            return Some(ProofTree::leaf(literal.clone()));
        };

        let instance = proof.rule.plug(&proof.binding);
        let children = instance
            .body
            .iter()
            .map(|literal| {
                let tree = self.explain_literal(literal)?;
                if is_join_helper(&tree.root.table.table) && tree.children.len() == 1 {
                    return tree.children.into_iter().next();
                }
                Some(tree)
            })
            .collect::<Option<Vec<_>>>()?;

        Some(ProofTree {
            root: literal.clone(),
            children,
        })
    }
}

impl RuleSource for MaterializedViewTheory {
    fn name(&self) -> &str {
        &self.config.name
    }
    fn head_index(&self, literal: &Literal) -> Vec<Candidate> {
        self.database.head_index(literal)
    }
    fn tracer(&self) -> Option<&Tracer> {
        self.database.tracer()
    }
}

impl Theory for MaterializedViewTheory {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Materialized
    }
    fn as_source(&self) -> &dyn RuleSource {
        self
    }
    fn update(&mut self, events: Vec<Event>) -> Result<Vec<Event>, PolicyErrors> {
        let mut schema = self.schema.take();
        let mut graph = std::mem::take(&mut self.graph);
        let admitted = self.admission(events, &mut schema, &mut graph);
        self.schema = schema;
        self.graph = graph;

        let events = match admitted {
            Ok(events) => events,
            Err(errors) => {
                warn!(theory = %self.config.name, %errors, "rejected update");
                return Err(errors);
            }
        };
        let accepted = events.len();
        let retracts = events.iter().any(|event| !event.insert);
        for event in events {
            self.enqueue_any(event);
        }
        let mut changes = self.process_queue();
        if retracts || changes.iter().any(|change| !change.insert) {
            changes.extend(self.retract_unfounded());
        }
        debug!(theory = %self.config.name, accepted, changes = changes.len(), "applied update");

        Ok(changes)
    }
    fn update_errors(&self, events: &[Event]) -> Vec<PolicyError> {
        let mut schema = self.schema.clone();
        let mut graph = self.graph.clone();

        match self.admission(events.to_vec(), &mut schema, &mut graph) {
            Ok(_) => vec![],
            Err(errors) => errors.0,
        }
    }
    fn explain(&self, atom: &Literal) -> Option<ProofTree> {
        self.explain_literal(atom)
    }
    fn consequences(&self) -> BTreeSet<Literal> {
        self.database
            .content(None)
            .into_iter()
            .filter(|literal| {
                let table = &literal.table.table;
                self.delta_rules.is_view(table) && !is_join_helper(table)
            })
            .collect()
    }
    fn content(&self) -> Vec<Formula> {
        self.database
            .content(None)
            .into_iter()
            .filter(|literal| !is_join_helper(&literal.table.table))
            .map(Formula::Literal)
            .collect()
    }
    fn policy(&self) -> Vec<Rule> {
        self.policy.iter().cloned().collect()
    }
    fn arity(&self, table: &str) -> Option<usize> {
        self.database
            .arity(table)
            .or_else(|| self.delta_rules.arity(table))
            .or_else(|| self.schema.as_ref().and_then(|schema| schema.arity(table)))
    }
    fn contains(&self, formula: &Formula) -> bool {
        match formula {
            Formula::Rule(rule) => self.policy.contains(rule),
            atom => atom
                .as_literal()
                .map_or(false, |literal| self.database.contains(&literal)),
        }
    }
}
