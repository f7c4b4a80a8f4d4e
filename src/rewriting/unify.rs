use ahash::HashMap;
use datalog_syntax::{Bindings, Formula, Literal, Term, TypedValue, Variable};
use std::collections::BTreeSet;

/// Index of a unifier inside its [`UnifierArena`].
pub type UnifierId = usize;

/// Joins a variable to the unifier owning it when it escapes its frame. Never part of a
/// variable written in a rule.
pub const SCOPE_SEPARATOR: char = '~';

fn scoped_name(name: &str, owner: UnifierId) -> Variable {
    format!("{}{}{}", name, SCOPE_SEPARATOR, owner)
}

#[derive(Clone, Debug, PartialEq)]
struct Bound {
    value: Term,
    unifier: UnifierId,
}

/// Variable bindings of one search frame. Values may be variables owned by other unifiers, so
/// resolution always goes through the arena.
#[derive(Clone, Debug, Default)]
pub struct BiUnifier {
    contents: HashMap<Variable, Bound>,
}

impl BiUnifier {
    pub fn len(&self) -> usize {
        self.contents.len()
    }
    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }
}

/// Record of a single binding, enough to take it back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Undo {
    pub variable: Variable,
    pub unifier: UnifierId,
}

/// Result variables of a search: unbound variables outside this scope get renamed apart.
pub struct CallerScope<'a> {
    pub variables: &'a BTreeSet<Variable>,
    pub unifier: UnifierId,
}

#[derive(Debug, Default)]
pub struct UnifierArena {
    unifiers: Vec<BiUnifier>,
}

impl UnifierArena {
    pub fn fresh(&mut self) -> UnifierId {
        self.unifiers.push(BiUnifier::default());

        self.unifiers.len() - 1
    }
    pub fn with_bindings(&mut self, bindings: &Bindings) -> UnifierId {
        let unifier = self.fresh();
        for (variable, value) in bindings {
            self.add(unifier, variable.clone(), value.clone(), unifier);
        }

        unifier
    }
    pub fn get(&self, unifier: UnifierId) -> &BiUnifier {
        &self.unifiers[unifier]
    }
    pub fn mark(&self) -> usize {
        self.unifiers.len()
    }
    /// Drops every unifier created after `mark`.
    pub fn release(&mut self, mark: usize) {
        self.unifiers.truncate(mark);
    }
    pub fn add(
        &mut self,
        unifier: UnifierId,
        variable: Variable,
        value: Term,
        value_unifier: UnifierId,
    ) -> Undo {
        self.unifiers[unifier].contents.insert(
            variable.clone(),
            Bound {
                value,
                unifier: value_unifier,
            },
        );

        Undo { variable, unifier }
    }
    pub fn delete(&mut self, unifier: UnifierId, variable: &Variable) {
        if let Some(bindings) = self.unifiers.get_mut(unifier) {
            bindings.contents.remove(variable);
        }
    }
    /// Follows binding chains to the final value and the unifier owning it.
    pub fn apply_full(&self, term: &Term, unifier: UnifierId) -> (Term, UnifierId) {
        let mut term = term;
        let mut unifier = unifier;
        loop {
            let Term::Variable(name) = term else {
                return (term.clone(), unifier);
            };
            match self.unifiers[unifier].contents.get(name) {
                None => return (term.clone(), unifier),
                Some(bound) => {
                    term = &bound.value;
                    unifier = bound.unifier;
                }
            }
        }
    }
    pub fn apply(&self, term: &Term, unifier: UnifierId) -> Term {
        self.apply_full(term, unifier).0
    }
    pub fn apply_scoped(&self, term: &Term, unifier: UnifierId, caller: &CallerScope) -> Term {
        match self.apply_full(term, unifier) {
            (Term::Variable(name), owner)
                if !(owner == caller.unifier && caller.variables.contains(&name)) =>
            {
                Term::Variable(scoped_name(&name, owner))
            }
            (value, _) => value,
        }
    }
    pub fn plug(&self, literal: &Literal, unifier: UnifierId) -> Literal {
        map_terms(literal, |term| self.apply(term, unifier))
    }
    pub fn plug_scoped(&self, literal: &Literal, unifier: UnifierId, caller: &CallerScope) -> Literal {
        map_terms(literal, |term| self.apply_scoped(term, unifier, caller))
    }
    /// Flattens the given variables into a plain substitution.
    pub fn bindings(&self, variables: &BTreeSet<Variable>, unifier: UnifierId) -> Bindings {
        variables
            .iter()
            .map(|variable| {
                let term = Term::Variable(variable.clone());
                (variable.clone(), self.apply(&term, unifier))
            })
            .collect()
    }
    pub fn undo_all(&mut self, changes: Option<&[Undo]>) {
        for change in changes.unwrap_or_default() {
            self.delete(change.unifier, &change.variable);
        }
    }
    pub fn bi_unify_lists(
        &mut self,
        left: &[Term],
        left_unifier: UnifierId,
        right: &[Term],
        right_unifier: UnifierId,
    ) -> Option<Vec<Undo>> {
        if left.len() != right.len() {
            return None;
        }

        let mut changes = vec![];
        for (left_term, right_term) in left.iter().zip(right.iter()) {
            let (left_value, left_owner) = self.apply_full(left_term, left_unifier);
            let (right_value, right_owner) = self.apply_full(right_term, right_unifier);
            match (&left_value, &right_value) {
                (Term::Variable(left_name), Term::Variable(right_name)) => {
                    if left_name == right_name && left_owner == right_owner {
                        continue;
                    }
                    changes.push(self.add(left_owner, left_name.clone(), right_value.clone(), right_owner));
                }
                (Term::Variable(left_name), _) => {
                    changes.push(self.add(left_owner, left_name.clone(), right_value.clone(), right_owner));
                }
                (_, Term::Variable(right_name)) => {
                    changes.push(self.add(right_owner, right_name.clone(), left_value.clone(), left_owner));
                }
                (left_constant, right_constant) => {
                    if left_constant != right_constant {
                        self.undo_all(Some(&changes));
                        return None;
                    }
                }
            }
        }

        Some(changes)
    }
    /// Unifies two atoms living in different variable namespaces. `None` leaves both unifiers
    /// untouched.
    pub fn bi_unify_atoms(
        &mut self,
        left: &Literal,
        left_unifier: UnifierId,
        right: &Literal,
        right_unifier: UnifierId,
        default_theory: Option<&str>,
    ) -> Option<Vec<Undo>> {
        if !left.table.same(&right.table, default_theory) || left.arity() != right.arity() {
            return None;
        }

        self.bi_unify_lists(&left.arguments, left_unifier, &right.arguments, right_unifier)
    }
    /// One-sided unification against a ground atom.
    pub fn match_atoms(&mut self, atom: &Literal, unifier: UnifierId, ground: &Literal) -> Option<Vec<Undo>> {
        if atom.table != ground.table || atom.arity() != ground.arity() {
            return None;
        }
        let values = ground.argument_values()?;

        self.match_tuple(&values, atom, unifier)
    }
    /// Binds the unbound positions of `atom` to a stored row.
    pub fn match_tuple(&mut self, tuple: &[TypedValue], atom: &Literal, unifier: UnifierId) -> Option<Vec<Undo>> {
        if tuple.len() != atom.arity() {
            return None;
        }

        let mut changes = vec![];
        for (term, value) in atom.arguments.iter().zip(tuple.iter()) {
            match self.apply_full(term, unifier) {
                (Term::Variable(name), owner) => {
                    changes.push(self.add(owner, name, Term::Constant(value.clone()), owner));
                }
                (Term::Constant(bound), _) => {
                    if &bound != value {
                        self.undo_all(Some(&changes));
                        return None;
                    }
                }
            }
        }

        Some(changes)
    }
}

fn map_terms(literal: &Literal, mut f: impl FnMut(&Term) -> Term) -> Literal {
    Literal {
        table: literal.table.clone(),
        arguments: literal.arguments.iter().map(&mut f).collect(),
        named_arguments: literal
            .named_arguments
            .iter()
            .map(|(column, term)| (column.clone(), f(term)))
            .collect(),
        negated: literal.negated,
    }
}

fn formula_literals(formula: &Formula) -> Option<Vec<Literal>> {
    match formula {
        Formula::Rule(rule) => Some(rule.heads.iter().chain(rule.body.iter()).cloned().collect()),
        atom => atom.as_literal().map(|literal| vec![literal]),
    }
}

fn same_shape(left: &Formula, right: &Formula) -> Option<(Vec<Literal>, Vec<Literal>)> {
    if left.is_atom() != right.is_atom() {
        return None;
    }
    if let (Formula::Rule(left_rule), Formula::Rule(right_rule)) = (left, right) {
        if left_rule.heads.len() != right_rule.heads.len()
            || left_rule.body.len() != right_rule.body.len()
        {
            return None;
        }
    }
    let left = formula_literals(left)?;
    let right = formula_literals(right)?;
    let aligned = left.iter().zip(right.iter()).all(|(l, r)| {
        l.table == r.table && l.negated == r.negated && l.arity() == r.arity()
    });

    if aligned {
        Some((left, right))
    } else {
        None
    }
}

/// Renaming of `left`'s variables that turns it into `right`, if the two are equal up to
/// variable names.
pub fn same(left: &Formula, right: &Formula) -> Option<Bindings> {
    let (left, right) = same_shape(left, right)?;
    let mut forward: Bindings = Default::default();
    let mut backward: Bindings = Default::default();
    let left_terms = left.iter().flat_map(|literal| literal.arguments.iter());
    let right_terms = right.iter().flat_map(|literal| literal.arguments.iter());
    for (left_term, right_term) in left_terms.zip(right_terms) {
        match (left_term, right_term) {
            (Term::Variable(left_name), Term::Variable(right_name)) => {
                let forward_ok = forward
                    .entry(left_name.clone())
                    .or_insert_with(|| right_term.clone())
                    == right_term;
                let backward_ok = backward
                    .entry(right_name.clone())
                    .or_insert_with(|| left_term.clone())
                    == left_term;
                if !(forward_ok && backward_ok) {
                    return None;
                }
            }
            (Term::Constant(left_value), Term::Constant(right_value)) if left_value == right_value => {}
            _ => return None,
        }
    }

    Some(forward)
}

/// Binding that, applied to `general`, yields `specific`. Variables of `specific` are rigid.
pub fn instance(specific: &Formula, general: &Formula) -> Option<Bindings> {
    let (specific, general) = same_shape(specific, general)?;
    let mut binding: Bindings = Default::default();
    let specific_terms = specific.iter().flat_map(|literal| literal.arguments.iter());
    let general_terms = general.iter().flat_map(|literal| literal.arguments.iter());
    for (specific_term, general_term) in specific_terms.zip(general_terms) {
        match general_term {
            Term::Variable(name) => {
                if binding.entry(name.clone()).or_insert_with(|| specific_term.clone()) != specific_term {
                    return None;
                }
            }
            Term::Constant(_) => {
                if general_term != specific_term {
                    return None;
                }
            }
        }
    }

    Some(binding)
}

#[cfg(test)]
mod tests {
    use crate::rewriting::unify::{instance, same, CallerScope, UnifierArena};
    use datalog_syntax::*;
    use datalog_syntax_macros::{literal, rule};
    use std::collections::BTreeSet;

    #[test]
    fn test_bi_unify_across_namespaces() {
        let mut arena = UnifierArena::default();
        let left_unifier = arena.fresh();
        let right_unifier = arena.fresh();
        let left = literal!(p(?x, ?y, 1));
        let right = literal!(p(?y, "a", ?z));

        let changes = arena
            .bi_unify_atoms(&left, left_unifier, &right, right_unifier, None)
            .unwrap();
        assert_eq!(arena.plug(&left, left_unifier), arena.plug(&right, right_unifier));
        assert_eq!(literal!(p("a", ?y, 1)).arguments[0], arena.plug(&left, left_unifier).arguments[0]);

        arena.undo_all(Some(&changes));
        assert!(arena.get(left_unifier).is_empty());
        assert!(arena.get(right_unifier).is_empty());
    }

    #[test]
    fn test_bi_unify_failure_leaves_no_bindings() {
        let mut arena = UnifierArena::default();
        let left_unifier = arena.fresh();
        let right_unifier = arena.fresh();
        let left = literal!(p(?x, ?x));
        let right = literal!(p(1, 2));

        assert!(arena
            .bi_unify_atoms(&left, left_unifier, &right, right_unifier, None)
            .is_none());
        assert!(arena.get(left_unifier).is_empty());

        let other_table = literal!(q(1, 2));
        assert!(arena
            .bi_unify_atoms(&right, left_unifier, &other_table, right_unifier, None)
            .is_none());
    }

    #[test]
    fn test_default_theory_normalization() {
        let mut arena = UnifierArena::default();
        let left_unifier = arena.fresh();
        let right_unifier = arena.fresh();
        let qualified = literal!(nova:servers(?x));
        let plain = literal!(servers(1));

        assert!(arena
            .bi_unify_atoms(&qualified, left_unifier, &plain, right_unifier, Some("nova"))
            .is_some());
        let another = arena.fresh();
        assert!(arena
            .bi_unify_atoms(&qualified, another, &plain, right_unifier, Some("neutron"))
            .is_none());
    }

    #[test]
    fn test_match_tuple_repeated_variable() {
        let mut arena = UnifierArena::default();
        let unifier = arena.fresh();
        let atom = literal!(e(?x, ?x));

        assert!(arena.match_tuple(&[1.into(), 2.into()], &atom, unifier).is_none());
        assert!(arena.get(unifier).is_empty());
        assert!(arena.match_tuple(&[3.into(), 3.into()], &atom, unifier).is_some());
        assert_eq!(literal!(e(3, 3)), arena.plug(&atom, unifier));
    }

    #[test]
    fn test_scoped_renaming() {
        let mut arena = UnifierArena::default();
        let caller = arena.fresh();
        let inner = arena.fresh();
        let variables: BTreeSet<Variable> = BTreeSet::from(["x".to_string()]);
        let scope = CallerScope {
            variables: &variables,
            unifier: caller,
        };

        assert_eq!(Term::variable("x"), arena.apply_scoped(&Term::variable("x"), caller, &scope));
        assert_eq!(
            Term::Variable(format!("x~{}", inner)),
            arena.apply_scoped(&Term::variable("x"), inner, &scope)
        );
        assert_eq!(
            Term::Variable(format!("y~{}", caller)),
            arena.apply_scoped(&Term::variable("y"), caller, &scope)
        );

        let lookalike = format!("x_{}", inner);
        let variables: BTreeSet<Variable> = BTreeSet::from([lookalike.clone()]);
        let scope = CallerScope {
            variables: &variables,
            unifier: caller,
        };
        assert_ne!(
            Term::Variable(lookalike.clone()),
            arena.apply_scoped(&Term::variable("x"), inner, &scope)
        );
        assert_eq!(Term::Variable(lookalike.clone()), arena.apply_scoped(&Term::Variable(lookalike), caller, &scope));
    }

    #[test]
    fn test_same_and_instance() {
        let left: Formula = rule!(p(?x) <- [q(?x, ?y)]).into();
        let right: Formula = rule!(p(?a) <- [q(?a, ?b)]).into();
        let collapsed: Formula = rule!(p(?a) <- [q(?a, ?a)]).into();
        assert!(same(&left, &right).is_some());
        assert!(same(&left, &collapsed).is_none());

        let specific: Formula = literal!(p(1, ?z)).into();
        let general: Formula = literal!(p(?x, ?y)).into();
        let binding = instance(&specific, &general).unwrap();
        assert_eq!(Some(&Term::from(1)), binding.get("x"));
        assert!(instance(&general, &specific).is_none());
        assert!(same(&left, &general).is_none());
    }
}
