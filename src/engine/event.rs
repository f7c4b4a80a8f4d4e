use datalog_syntax::{Bindings, Formula, Literal, Rule};
use std::collections::VecDeque;
use std::fmt::{Debug, Display, Formatter};

/// The rule instance that justifies a derived tuple. Bindings are flattened at capture time.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Proof {
    pub binding: Bindings,
    pub rule: Rule,
}

impl Proof {
    pub fn new(binding: Bindings, rule: Rule) -> Self {
        Proof { binding, rule }
    }
}

impl Display for Proof {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let binding: Vec<String> = self
            .binding
            .iter()
            .map(|(variable, term)| format!("{}: {}", variable, term))
            .collect();

        write!(f, "apply({{{}}}, {})", binding.join(", "), self.rule)
    }
}

/// Ordered set of proofs with set algebra.
pub struct ProofCollection {
    proofs: indexset::BTreeSet<Proof>,
}

impl ProofCollection {
    pub fn new() -> Self {
        ProofCollection {
            proofs: indexset::BTreeSet::new(),
        }
    }
    pub fn len(&self) -> usize {
        self.proofs.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn insert(&mut self, proof: Proof) -> bool {
        self.proofs.insert(proof)
    }
    pub fn contains(&self, proof: &Proof) -> bool {
        self.proofs.contains(proof)
    }
    pub fn iter(&self) -> impl Iterator<Item = &Proof> {
        self.proofs.iter()
    }
    pub fn first(&self) -> Option<&Proof> {
        self.proofs.iter().next()
    }
    pub fn is_subset(&self, other: &ProofCollection) -> bool {
        self.iter().all(|proof| other.contains(proof))
    }
    /// Returns whether anything was added.
    pub fn union_with(&mut self, other: &ProofCollection) -> bool {
        let mut changed = false;
        for proof in other.iter() {
            changed |= self.proofs.insert(proof.clone());
        }

        changed
    }
    /// Returns whether anything was removed.
    pub fn difference_with(&mut self, other: &ProofCollection) -> bool {
        let mut changed = false;
        for proof in other.iter() {
            changed |= self.proofs.remove(proof);
        }

        changed
    }
}

impl Default for ProofCollection {
    fn default() -> Self {
        ProofCollection::new()
    }
}

impl Clone for ProofCollection {
    fn clone(&self) -> Self {
        self.iter().cloned().collect()
    }
}

impl PartialEq for ProofCollection {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_subset(other)
    }
}

impl Eq for ProofCollection {}

impl FromIterator<Proof> for ProofCollection {
    fn from_iter<T: IntoIterator<Item = Proof>>(iter: T) -> Self {
        let mut collection = ProofCollection::new();
        for proof in iter {
            collection.insert(proof);
        }

        collection
    }
}

impl Debug for ProofCollection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter().map(|proof| proof.to_string())).finish()
    }
}

/// A proposed insertion or deletion.
#[derive(Clone, PartialEq, Eq)]
pub struct Event {
    pub formula: Formula,
    pub insert: bool,
    pub proofs: ProofCollection,
    pub target: Option<String>,
}

impl Event {
    pub fn new(formula: impl Into<Formula>, insert: bool) -> Self {
        Event {
            formula: formula.into(),
            insert,
            proofs: ProofCollection::new(),
            target: None,
        }
    }
    pub fn insert(formula: impl Into<Formula>) -> Self {
        Event::new(formula, true)
    }
    pub fn delete(formula: impl Into<Formula>) -> Self {
        Event::new(formula, false)
    }
    pub fn with_proofs(mut self, proofs: ProofCollection) -> Self {
        self.proofs = proofs;
        self
    }
    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }
    pub fn is_atom(&self) -> bool {
        self.formula.is_atom()
    }
    pub fn literal(&self) -> Option<Literal> {
        self.formula.as_literal()
    }
    pub fn rule(&self) -> Option<&Rule> {
        self.formula.as_rule()
    }
    pub fn tablenames(&self) -> Vec<String> {
        self.formula.tablenames().into_iter().collect()
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let sign = if self.insert { "+" } else { "-" };
        match &self.target {
            Some(target) => write!(f, "{}{} (target {})", sign, self.formula, target),
            None => write!(f, "{}{}", sign, self.formula),
        }
    }
}

impl Debug for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.proofs.is_empty() {
            write!(f, "{}", self)
        } else {
            write!(f, "{} with proofs {:?}", self, self.proofs)
        }
    }
}

#[derive(Debug, Default)]
pub struct EventQueue {
    queue: VecDeque<Event>,
}

impl EventQueue {
    pub fn enqueue(&mut self, event: Event) {
        self.queue.push_back(event);
    }
    pub fn dequeue(&mut self) -> Option<Event> {
        self.queue.pop_front()
    }
    pub fn len(&self) -> usize {
        self.queue.len()
    }
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Explanation of why an atom holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofTree {
    pub root: Literal,
    pub children: Vec<ProofTree>,
}

impl ProofTree {
    pub fn leaf(root: Literal) -> Self {
        ProofTree {
            root,
            children: vec![],
        }
    }
    pub fn leaves(&self) -> Vec<&Literal> {
        if self.children.is_empty() {
            return vec![&self.root];
        }

        self.children.iter().flat_map(ProofTree::leaves).collect()
    }
    fn render(&self, depth: usize, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}{}", "  ".repeat(depth), self.root)?;
        for child in &self.children {
            child.render(depth + 1, f)?;
        }

        Ok(())
    }
}

impl Display for ProofTree {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.render(0, f)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::event::{Event, EventQueue, Proof, ProofCollection, ProofTree};
    use datalog_syntax::*;
    use datalog_syntax_macros::{literal, rule};

    fn proof(value: i64) -> Proof {
        let binding: Bindings = vec![("x".to_string(), Term::from(value))].into_iter().collect();

        Proof::new(binding, rule!(p(?x) <- [q(?x)]))
    }

    #[test]
    fn test_proof_collection_algebra() {
        let mut left: ProofCollection = vec![proof(1), proof(2)].into_iter().collect();
        let right: ProofCollection = vec![proof(2), proof(3)].into_iter().collect();
        assert!(!right.is_subset(&left));

        assert!(left.union_with(&right));
        assert!(!left.union_with(&right));
        assert_eq!(3, left.len());
        assert!(right.is_subset(&left));

        assert!(left.difference_with(&right));
        assert_eq!(vec![proof(1)], left.iter().cloned().collect::<Vec<_>>());
        assert_eq!(left.clone(), left);
    }

    #[test]
    fn test_queue_is_fifo() {
        let mut queue = EventQueue::default();
        queue.enqueue(Event::insert(literal!(p(1))));
        queue.enqueue(Event::delete(literal!(p(2))));
        assert_eq!(2, queue.len());
        assert_eq!("+p(1)", queue.dequeue().unwrap().to_string());
        assert_eq!("-p(2)", queue.dequeue().unwrap().to_string());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_proof_tree_leaves() {
        let tree = ProofTree {
            root: literal!(p(1)),
            children: vec![ProofTree::leaf(literal!(q(1))), ProofTree::leaf(literal!(r(1)))],
        };
        assert_eq!(vec![&literal!(q(1)), &literal!(r(1))], tree.leaves());
        assert_eq!("p(1)\n  q(1)\n  r(1)\n", tree.to_string());
    }
}
