use ahash::HashMap;
use datalog_syntax::TypedValue;
use indexmap::IndexSet;
use std::cell::RefCell;

pub type Row = Vec<TypedValue>;
type Columns = Vec<usize>;
type Index = HashMap<Vec<TypedValue>, IndexSet<Row>>;

/// Ground rows of one table. Lookups by bound columns build a hash index for that column
/// combination the first time it is requested.
#[derive(Debug, Default, Clone)]
pub struct FactSet {
    facts: IndexSet<Row>,
    indexes: RefCell<HashMap<Columns, Index>>,
}

fn project(row: &Row, columns: &Columns) -> Option<Vec<TypedValue>> {
    columns.iter().map(|column| row.get(*column).cloned()).collect()
}

impl FactSet {
    pub fn len(&self) -> usize {
        self.facts.len()
    }
    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
    pub fn contains(&self, row: &Row) -> bool {
        self.facts.contains(row)
    }
    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.facts.iter()
    }
    pub fn add(&mut self, row: Row) -> bool {
        if self.facts.contains(&row) {
            return false;
        }

        for (columns, index) in self.indexes.get_mut().iter_mut() {
            if let Some(key) = project(&row, columns) {
                index.entry(key).or_default().insert(row.clone());
            }
        }
        self.facts.insert(row);

        true
    }
    pub fn remove(&mut self, row: &Row) -> bool {
        if !self.facts.shift_remove(row) {
            return false;
        }

        for (columns, index) in self.indexes.get_mut().iter_mut() {
            if let Some(key) = project(row, columns) {
                if let Some(bucket) = index.get_mut(&key) {
                    bucket.shift_remove(row);
                    if bucket.is_empty() {
                        index.remove(&key);
                    }
                }
            }
        }

        true
    }
    /// Rows agreeing with every `(column, value)` pair.
    pub fn find(&self, bound: &[(usize, TypedValue)]) -> Vec<Row> {
        if bound.is_empty() {
            return self.facts.iter().cloned().collect();
        }

        let mut bound = bound.to_vec();
        bound.sort_by_key(|(column, _)| *column);
        let columns: Columns = bound.iter().map(|(column, _)| *column).collect();
        let key: Vec<TypedValue> = bound.into_iter().map(|(_, value)| value).collect();

        let mut indexes = self.indexes.borrow_mut();
        let index = indexes
            .entry(columns.clone())
            .or_insert_with(|| self.build_index(&columns));

        index
            .get(&key)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }
    pub fn has_index(&self, columns: &[usize]) -> bool {
        self.indexes.borrow().contains_key(columns)
    }
    fn build_index(&self, columns: &Columns) -> Index {
        let mut index = Index::default();
        for row in &self.facts {
            if let Some(key) = project(row, columns) {
                index.entry(key).or_default().insert(row.clone());
            }
        }

        index
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::factset::FactSet;
    use datalog_syntax::TypedValue;

    fn row(values: &[i64]) -> Vec<TypedValue> {
        values.iter().map(|value| TypedValue::from(*value)).collect()
    }

    #[test]
    fn test_lazy_index_tracks_updates() {
        let mut facts = FactSet::default();
        assert!(facts.add(row(&[1, 2, 3])));
        assert!(facts.add(row(&[1, 5, 3])));
        assert!(!facts.add(row(&[1, 2, 3])));

        assert!(!facts.has_index(&[0, 2]));
        let found = facts.find(&[(2, 3.into()), (0, 1.into())]);
        assert_eq!(2, found.len());
        assert!(facts.has_index(&[0, 2]));

        assert!(facts.add(row(&[1, 7, 3])));
        assert!(facts.remove(&row(&[1, 2, 3])));
        assert!(!facts.remove(&row(&[1, 2, 3])));
        let found = facts.find(&[(0, 1.into()), (2, 3.into())]);
        assert_eq!(vec![row(&[1, 5, 3]), row(&[1, 7, 3])], found);

        assert!(facts.find(&[(1, 9.into())]).is_empty());
        assert_eq!(2, facts.find(&[]).len());
    }
}
