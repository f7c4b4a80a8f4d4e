use crate::analysis::graph::{BagGraph, ModalIndex};
use crate::engine::event::Event;
use datalog_syntax::{Formula, Literal, Rule, Tablename};
use indexmap::{IndexMap, IndexSet};
use std::ops::Deref;

type Edge = (String, String, bool);

/// One step of [`RuleDependencyGraph::formula_update`], kept so the update can be undone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphChange {
    Node { table: String, insert: bool },
    Edge { edge: Edge, insert: bool },
    Modal { modals: ModalIndex, insert: bool },
}

/// Table dependencies of a rule set: an edge per head and body table pair of every rule,
/// labeled with whether the body literal is negated.
#[derive(Clone, Debug)]
pub struct RuleDependencyGraph {
    graph: BagGraph<String, bool>,
    modal_index: ModalIndex,
    head_to_body: bool,
}

impl Default for RuleDependencyGraph {
    fn default() -> Self {
        RuleDependencyGraph::new(true)
    }
}

impl Deref for RuleDependencyGraph {
    type Target = BagGraph<String, bool>;

    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

fn table_of(literal: &Literal, theory: Option<&str>) -> String {
    literal.table.name_with_default(theory)
}

impl RuleDependencyGraph {
    pub fn new(head_to_body: bool) -> Self {
        RuleDependencyGraph {
            graph: BagGraph::default(),
            modal_index: ModalIndex::default(),
            head_to_body,
        }
    }
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a Rule>, head_to_body: bool) -> Self {
        let mut graph = RuleDependencyGraph::new(head_to_body);
        for rule in rules {
            graph.formula_insert(&Formula::Rule(rule.clone()), None);
        }

        graph
    }
    fn nodes_edges(&self, formula: &Formula, theory: Option<&str>) -> (IndexSet<String>, IndexSet<Edge>, ModalIndex) {
        let mut nodes = IndexSet::new();
        let mut edges = IndexSet::new();
        let mut modals = ModalIndex::default();
        match formula {
            Formula::Fact(fact) => {
                nodes.insert(Tablename::parse(&fact.table).name_with_default(theory));
            }
            Formula::Literal(literal) => {
                let table = table_of(literal, theory);
                if let Some(modal) = &literal.table.modal {
                    modals.add(modal, &table);
                }
                nodes.insert(table);
            }
            Formula::Rule(rule) => {
                for head in &rule.heads {
                    let head_table = table_of(head, theory);
                    if let Some(modal) = &head.table.modal {
                        modals.add(modal, &head_table);
                    }
                    nodes.insert(head_table.clone());
                    for literal in &rule.body {
                        let body_table = table_of(literal, theory);
                        nodes.insert(body_table.clone());
                        if self.head_to_body {
                            edges.insert((head_table.clone(), body_table, literal.negated));
                        } else {
                            edges.insert((body_table, head_table.clone(), literal.negated));
                        }
                    }
                }
            }
        }

        (nodes, edges, modals)
    }
    /// Applies the formulas of `events`, returning what changed.
    pub fn formula_update(&mut self, events: &[Event]) -> Vec<GraphChange> {
        let mut changes = vec![];
        for event in events {
            let (nodes, edges, modals) = self.nodes_edges(&event.formula, event.target.as_deref());
            let insert = event.insert;
            for table in nodes {
                if insert {
                    self.graph.add_node(table.clone());
                } else {
                    self.graph.delete_node(&table);
                }
                changes.push(GraphChange::Node { table, insert });
            }
            for edge in edges {
                let (source, target, label) = edge.clone();
                if insert {
                    self.graph.add_edge(source, target, label);
                } else {
                    self.graph.delete_edge(&source, &target, &label);
                }
                changes.push(GraphChange::Edge { edge, insert });
            }
            if insert {
                self.modal_index.merge(&modals);
            } else {
                self.modal_index.subtract(&modals);
            }
            changes.push(GraphChange::Modal { modals, insert });
        }

        changes
    }
    pub fn undo_changes(&mut self, changes: Vec<GraphChange>) {
        for change in changes.into_iter().rev() {
            match change {
                GraphChange::Node { table, insert: true } => self.graph.delete_node(&table),
                GraphChange::Node { table, insert: false } => self.graph.add_node(table),
                GraphChange::Edge {
                    edge: (source, target, label),
                    insert: true,
                } => self.graph.delete_edge(&source, &target, &label),
                GraphChange::Edge {
                    edge: (source, target, label),
                    insert: false,
                } => self.graph.add_edge(source, target, label),
                GraphChange::Modal { modals, insert: true } => self.modal_index.subtract(&modals),
                GraphChange::Modal { modals, insert: false } => self.modal_index.merge(&modals),
            }
        }
    }
    pub fn formula_insert(&mut self, formula: &Formula, theory: Option<&str>) -> Vec<GraphChange> {
        let mut event = Event::insert(formula.clone());
        event.target = theory.map(str::to_string);

        self.formula_update(&[event])
    }
    pub fn formula_delete(&mut self, formula: &Formula, theory: Option<&str>) -> Vec<GraphChange> {
        let mut event = Event::delete(formula.clone());
        event.target = theory.map(str::to_string);

        self.formula_update(&[event])
    }
    pub fn tables_with_modal(&self, modal: &str) -> Vec<String> {
        self.modal_index.tables(modal)
    }
    pub fn is_recursive(&self) -> bool {
        self.graph.has_cycle()
    }
    /// Strata with negation as the only layer-raising label.
    pub fn strata(&self) -> Option<IndexMap<String, usize>> {
        self.graph.stratification(&[true])
    }
    pub fn is_stratified(&self) -> bool {
        self.strata().is_some()
    }
}

pub fn is_recursive(rules: &[Rule]) -> bool {
    RuleDependencyGraph::from_rules(rules, true).is_recursive()
}

pub fn stratification(rules: &[Rule]) -> Option<IndexMap<String, usize>> {
    RuleDependencyGraph::from_rules(rules, true).strata()
}

pub fn is_stratified(rules: &[Rule]) -> bool {
    stratification(rules).is_some()
}

/// Rules defining `outputs` that build on some `required` table without building on a
/// `prohibited` one. Dependencies passing through an output table are not followed.
pub fn find_subpolicy(
    rules: &[Rule],
    required: &IndexSet<String>,
    prohibited: &IndexSet<String>,
    outputs: &IndexSet<String>,
) -> Vec<Rule> {
    let mut subpolicy: Vec<Rule> = rules.to_vec();
    loop {
        let body_to_head = RuleDependencyGraph::from_rules(&subpolicy, false);

        let mut tainted: IndexSet<String> = prohibited.clone();
        let mut frontier: Vec<String> = prohibited.iter().cloned().collect();
        while let Some(table) = frontier.pop() {
            if outputs.contains(&table) {
                continue;
            }
            for next in body_to_head.successors(&table) {
                if tainted.insert(next.clone()) {
                    frontier.push(next.clone());
                }
            }
        }
        let supported = body_to_head.find_reachable_nodes(required.iter());

        let kept: Vec<Rule> = subpolicy
            .iter()
            .filter(|rule| {
                let tables: Vec<String> = rule.body.iter().map(|literal| table_of(literal, None)).collect();
                tables.iter().any(|table| supported.contains(table))
                    && !tables.iter().any(|table| tainted.contains(table))
            })
            .cloned()
            .collect();

        let head_to_body = RuleDependencyGraph::from_rules(&kept, true);
        let needed = head_to_body.find_reachable_nodes(outputs.iter());
        let kept: Vec<Rule> = kept
            .into_iter()
            .filter(|rule| needed.contains(&table_of(rule.head(), None)))
            .collect();

        if kept.len() == subpolicy.len() {
            return kept;
        }
        subpolicy = kept;
    }
}
