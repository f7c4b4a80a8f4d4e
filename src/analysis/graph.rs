use ahash::HashMap;
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::hash::Hash;
use std::ops::Deref;

/// Directed graph with labeled edges. Several edges with different labels may join the same
/// pair of nodes.
#[derive(Clone)]
pub struct Graph<N, L> {
    nodes: IndexSet<N>,
    edges: IndexMap<N, IndexSet<(N, L)>>,
}

impl<N, L> Default for Graph<N, L> {
    fn default() -> Self {
        Graph {
            nodes: IndexSet::new(),
            edges: IndexMap::new(),
        }
    }
}

impl<N, L> Graph<N, L>
where
    N: Clone + Eq + Hash + Ord,
    L: Clone + Eq + Hash,
{
    pub fn add_node(&mut self, node: N) -> bool {
        self.nodes.insert(node)
    }
    /// Removes the node and its outgoing edges.
    pub fn delete_node(&mut self, node: &N) {
        self.nodes.shift_remove(node);
        self.edges.shift_remove(node);
    }
    pub fn add_edge(&mut self, source: N, target: N, label: L) {
        self.add_node(source.clone());
        self.add_node(target.clone());
        self.edges.entry(source).or_default().insert((target, label));
    }
    /// Leaves both nodes in place.
    pub fn delete_edge(&mut self, source: &N, target: &N, label: &L) {
        if let Some(outgoing) = self.edges.get_mut(source) {
            outgoing.shift_remove(&(target.clone(), label.clone()));
            if outgoing.is_empty() {
                self.edges.shift_remove(source);
            }
        }
    }
    pub fn contains_node(&self, node: &N) -> bool {
        self.nodes.contains(node)
    }
    pub fn contains_edge(&self, source: &N, target: &N, label: &L) -> bool {
        self.edges
            .get(source)
            .map_or(false, |outgoing| outgoing.contains(&(target.clone(), label.clone())))
    }
    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.nodes.iter()
    }
    pub fn edges(&self) -> impl Iterator<Item = (&N, &N, &L)> {
        self.edges
            .iter()
            .flat_map(|(source, outgoing)| outgoing.iter().map(move |(target, label)| (source, target, label)))
    }
    pub fn successors(&self, node: &N) -> impl Iterator<Item = &N> {
        self.edges
            .get(node)
            .into_iter()
            .flat_map(|outgoing| outgoing.iter().map(|(target, _)| target))
    }
    pub fn node_len(&self) -> usize {
        self.nodes.len()
    }
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
    /// Every node reachable from `roots`, the roots included.
    pub fn find_reachable_nodes<'a>(&'a self, roots: impl IntoIterator<Item = &'a N>) -> IndexSet<N> {
        let mut reached: IndexSet<N> = IndexSet::new();
        let mut stack: Vec<&N> = roots.into_iter().filter(|node| self.contains_node(node)).collect();
        while let Some(node) = stack.pop() {
            if reached.insert(node.clone()) {
                stack.extend(self.successors(node));
            }
        }

        reached
    }
    /// Nodes reachable from `node`, `None` if it is not in the graph.
    pub fn dependencies(&self, node: &N) -> Option<IndexSet<N>> {
        if !self.contains_node(node) {
            return None;
        }

        Some(self.find_reachable_nodes([node]))
    }
    /// Nodes from which one of `nodes` can be reached.
    pub fn find_dependent_nodes<'a>(&'a self, nodes: impl IntoIterator<Item = &'a N>) -> IndexSet<N> {
        let mut marked: IndexSet<N> = nodes.into_iter().cloned().collect();
        let mut changed = true;
        while changed {
            changed = false;
            for (source, outgoing) in &self.edges {
                if !marked.contains(source) && outgoing.iter().any(|(target, _)| marked.contains(target)) {
                    marked.insert(source.clone());
                    changed = true;
                }
            }
        }

        marked
    }
    /// Nodes without incoming edges.
    pub fn roots(&self) -> IndexSet<N> {
        let targets: IndexSet<&N> = self.edges.values().flatten().map(|(target, _)| target).collect();

        self.nodes
            .iter()
            .filter(|node| !targets.contains(node))
            .cloned()
            .collect()
    }
    fn paths_back(&self, target: &N, node: &N, visited: &mut IndexSet<N>, path: &mut Vec<N>, found: &mut Vec<Vec<N>>) {
        path.push(node.clone());
        if node == target && path.len() > 1 {
            found.push(path.clone());
        }
        if visited.insert(node.clone()) {
            for next in self.successors(node) {
                self.paths_back(target, next, visited, path, found);
            }
        }
        path.pop();
    }
    /// Cycles found by searching from every node back to itself, each listed as a closed path.
    pub fn cycles(&self) -> Vec<Vec<N>> {
        let mut seen: IndexSet<BTreeSet<(N, N)>> = IndexSet::new();
        let mut cycles = vec![];
        for node in &self.nodes {
            let mut found = vec![];
            self.paths_back(node, node, &mut IndexSet::new(), &mut vec![], &mut found);
            for path in found {
                let edges: BTreeSet<(N, N)> = path.windows(2).map(|pair| (pair[0].clone(), pair[1].clone())).collect();
                if seen.insert(edges) {
                    cycles.push(path);
                }
            }
        }

        cycles
    }
    pub fn has_cycle(&self) -> bool {
        self.nodes
            .iter()
            .any(|node| self.successors(node).any(|next| self.find_reachable_nodes([next]).contains(node)))
    }
    /// Stratum per node, raised by one across every edge whose label is in `labels`. `None` when
    /// no assignment exists.
    pub fn stratification(&self, labels: &[L]) -> Option<IndexMap<N, usize>> {
        let mut stratum: IndexMap<N, usize> = self.nodes.iter().map(|node| (node.clone(), 1)).collect();
        let mut changed = true;
        while changed {
            changed = false;
            for (source, target, label) in self.edges() {
                let below = stratum.get(target).copied().unwrap_or(1);
                let required = if labels.contains(label) { below + 1 } else { below };
                let current = stratum.entry(source.clone()).or_insert(1);
                if required > *current {
                    *current = required;
                    changed = true;
                }
                if *current > self.nodes.len() {
                    return None;
                }
            }
        }

        Some(stratum)
    }
}

impl<N: Debug + Eq + Hash, L: Debug> Debug for Graph<N, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for node in &self.nodes {
            let outgoing: Vec<_> = self.edges.get(node).into_iter().flatten().collect();
            map.entry(node, &outgoing);
        }

        map.finish()
    }
}

/// [`Graph`] with bag semantics: nodes and edges disappear once deleted as often as added.
#[derive(Clone)]
pub struct BagGraph<N, L> {
    graph: Graph<N, L>,
    node_counts: HashMap<N, usize>,
    edge_counts: HashMap<(N, N, L), usize>,
}

impl<N, L> Default for BagGraph<N, L> {
    fn default() -> Self {
        BagGraph {
            graph: Graph::default(),
            node_counts: HashMap::default(),
            edge_counts: HashMap::default(),
        }
    }
}

impl<N, L> BagGraph<N, L>
where
    N: Clone + Eq + Hash + Ord,
    L: Clone + Eq + Hash,
{
    pub fn add_node(&mut self, node: N) {
        *self.node_counts.entry(node.clone()).or_default() += 1;
        self.graph.add_node(node);
    }
    pub fn delete_node(&mut self, node: &N) {
        let Some(count) = self.node_counts.get_mut(node) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.node_counts.remove(node);
            self.graph.delete_node(node);
        }
    }
    /// Counts as one more reference to each endpoint.
    pub fn add_edge(&mut self, source: N, target: N, label: L) {
        self.add_node(source.clone());
        self.add_node(target.clone());
        *self
            .edge_counts
            .entry((source.clone(), target.clone(), label.clone()))
            .or_default() += 1;
        self.graph.add_edge(source, target, label);
    }
    pub fn delete_edge(&mut self, source: &N, target: &N, label: &L) {
        let key = (source.clone(), target.clone(), label.clone());
        let Some(count) = self.edge_counts.get_mut(&key) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            self.edge_counts.remove(&key);
            self.graph.delete_edge(source, target, label);
        }
        self.delete_node(source);
        self.delete_node(target);
    }
    pub fn node_count(&self, node: &N) -> usize {
        self.node_counts.get(node).copied().unwrap_or(0)
    }
    pub fn edge_count(&self, source: &N, target: &N, label: &L) -> usize {
        self.edge_counts
            .get(&(source.clone(), target.clone(), label.clone()))
            .copied()
            .unwrap_or(0)
    }
    pub fn len(&self) -> usize {
        self.node_counts.values().sum::<usize>() + self.edge_counts.values().sum::<usize>()
    }
    pub fn is_empty(&self) -> bool {
        self.node_counts.is_empty()
    }
}

impl<N, L> Deref for BagGraph<N, L> {
    type Target = Graph<N, L>;

    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

impl<N: Debug + Eq + Hash, L: Debug> Debug for BagGraph<N, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.graph, f)
    }
}

/// Reference-counted tables per modal operator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ModalIndex {
    index: IndexMap<String, IndexMap<String, usize>>,
}

impl ModalIndex {
    pub fn add(&mut self, modal: &str, table: &str) {
        *self
            .index
            .entry(modal.to_string())
            .or_default()
            .entry(table.to_string())
            .or_default() += 1;
    }
    pub fn remove(&mut self, modal: &str, table: &str) {
        self.subtract_count(modal, table, 1);
    }
    fn subtract_count(&mut self, modal: &str, table: &str, amount: usize) {
        let Some(tables) = self.index.get_mut(modal) else {
            return;
        };
        if let Some(count) = tables.get_mut(table) {
            *count = count.saturating_sub(amount);
            if *count == 0 {
                tables.shift_remove(table);
            }
        }
        if tables.is_empty() {
            self.index.shift_remove(modal);
        }
    }
    pub fn merge(&mut self, other: &ModalIndex) {
        for (modal, tables) in &other.index {
            for (table, count) in tables {
                *self
                    .index
                    .entry(modal.clone())
                    .or_default()
                    .entry(table.clone())
                    .or_default() += count;
            }
        }
    }
    pub fn subtract(&mut self, other: &ModalIndex) {
        for (modal, tables) in &other.index {
            for (table, count) in tables {
                self.subtract_count(modal, table, *count);
            }
        }
    }
    pub fn modals(&self) -> impl Iterator<Item = &String> {
        self.index.keys()
    }
    pub fn tables(&self, modal: &str) -> Vec<String> {
        self.index
            .get(modal)
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default()
    }
    pub fn contains(&self, modal: &str) -> bool {
        self.index.contains_key(modal)
    }
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::analysis::graph::{BagGraph, Graph, ModalIndex};

    fn diamond() -> Graph<&'static str, bool> {
        let mut graph = Graph::default();
        graph.add_edge("a", "b", false);
        graph.add_edge("a", "c", false);
        graph.add_edge("b", "d", true);
        graph.add_edge("c", "d", false);
        graph
    }

    #[test]
    fn test_reachability() {
        let graph = diamond();
        let mut reached: Vec<_> = graph.find_reachable_nodes([&"b"]).into_iter().collect();
        reached.sort();
        assert_eq!(vec!["b", "d"], reached);
        assert_eq!(4, graph.dependencies(&"a").unwrap().len());
        assert!(graph.dependencies(&"z").is_none());
        assert_eq!(2, graph.find_dependent_nodes([&"c"]).len());
        assert_eq!(vec!["a"], graph.roots().into_iter().collect::<Vec<_>>());
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_cycles_and_stratification() {
        let mut graph = diamond();
        let strata = graph.stratification(&[true]).unwrap();
        assert_eq!(Some(&2), strata.get(&"b"));
        assert_eq!(Some(&2), strata.get(&"a"));
        assert_eq!(Some(&1), strata.get(&"c"));

        graph.add_edge("d", "a", false);
        assert!(graph.has_cycle());
        assert!(graph.stratification(&[true]).is_none());
        let cycles = graph.cycles();
        assert_eq!(2, cycles.len());
        assert!(cycles.iter().all(|cycle| cycle.first() == cycle.last()));

        graph.delete_edge(&"b", &"d", &true);
        assert!(graph.stratification(&[true]).is_some());
    }

    #[test]
    fn test_bag_semantics() {
        let mut graph: BagGraph<&str, bool> = BagGraph::default();
        graph.add_edge("p", "q", false);
        graph.add_edge("p", "q", false);
        graph.add_edge("p", "r", true);
        assert_eq!(3, graph.node_count(&"p"));
        assert_eq!(2, graph.edge_count(&"p", &"q", &false));

        graph.delete_edge(&"p", &"q", &false);
        assert!(graph.contains_edge(&"p", &"q", &false));
        graph.delete_edge(&"p", &"q", &false);
        assert!(!graph.contains_edge(&"p", &"q", &false));
        assert!(!graph.contains_node(&"q"));
        assert!(graph.contains_node(&"p"));

        graph.delete_edge(&"p", &"r", &true);
        assert!(graph.is_empty());
        assert_eq!(0, graph.len());
    }

    #[test]
    fn test_modal_index_counts() {
        let mut index = ModalIndex::default();
        index.add("execute", "p");
        index.add("execute", "p");
        let mut other = ModalIndex::default();
        other.add("execute", "p");

        index.subtract(&other);
        assert_eq!(vec!["p".to_string()], index.tables("execute"));
        index.remove("execute", "p");
        assert!(!index.contains("execute"));
        index.merge(&other);
        assert_eq!(other, index);
    }
}
