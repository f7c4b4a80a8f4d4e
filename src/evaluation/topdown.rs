use crate::evaluation::builtins::{builtin_for, BuiltinOutput};
use crate::rewriting::unify::{CallerScope, UnifierArena, UnifierId, Undo};
use crate::storage::factset::Row;
use crate::tracer::Tracer;
use datalog_syntax::{Bindings, Literal, Rule, Term, TypedValue, Variable};
use indexmap::{IndexMap, IndexSet};
use std::collections::BTreeSet;
use std::fmt::Arguments;

/// Anything the evaluator can resolve a literal against.
pub trait RuleSource {
    fn name(&self) -> &str;
    /// Stored tuples and rules whose head may unify with `literal`.
    fn head_index(&self, literal: &Literal) -> Vec<Candidate>;
    fn tracer(&self) -> Option<&Tracer> {
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Candidate {
    Tuple(Row),
    Rule(Rule),
}

/// Theories reachable through `service:table` literals.
#[derive(Default)]
pub struct Federation<'a> {
    theories: IndexMap<String, &'a dyn RuleSource>,
}

impl<'a> Federation<'a> {
    pub fn new() -> Self {
        Federation {
            theories: IndexMap::new(),
        }
    }
    pub fn insert(&mut self, theory: &'a dyn RuleSource) {
        self.theories.insert(theory.name().to_string(), theory);
    }
    pub fn get(&self, name: &str) -> Option<&'a dyn RuleSource> {
        self.theories.get(name).copied()
    }
    pub fn contains(&self, name: &str) -> bool {
        self.theories.contains_key(name)
    }
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.theories.keys()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TopDownResult {
    pub binding: Bindings,
    pub support: Vec<Literal>,
}

#[derive(Clone, Copy, Debug)]
struct Goal {
    frame: usize,
    index: usize,
}

impl Goal {
    fn next(self) -> Goal {
        Goal {
            frame: self.frame,
            index: self.index + 1,
        }
    }
}

struct Frame<'a> {
    literals: Vec<Literal>,
    unifier: UnifierId,
    parent: Option<Goal>,
    source: &'a dyn RuleSource,
    depth: usize,
}

struct ChoicePoint<'a> {
    goal: Goal,
    source: &'a dyn RuleSource,
    default_theory: String,
    candidates: Vec<Candidate>,
    next: usize,
    trail: usize,
    arena: usize,
    frames: usize,
    support: usize,
}

enum Step {
    Solve(Goal),
    Backtrack,
    Done,
}

struct Search<'a, 's> {
    federation: Option<&'a Federation<'a>>,
    save: Option<&'s dyn Fn(&Literal) -> bool>,
    find_all: bool,
    variables: &'s BTreeSet<Variable>,
    caller: UnifierId,
    arena: UnifierArena,
    frames: Vec<Frame<'a>>,
    choices: Vec<ChoicePoint<'a>>,
    trail: Vec<Undo>,
    support: Vec<(Literal, UnifierId)>,
    results: IndexSet<TopDownResult>,
}

impl<'a, 's> Search<'a, 's> {
    fn run(&mut self) {
        let mut step = Step::Solve(Goal { frame: 0, index: 0 });
        loop {
            step = match step {
                Step::Solve(goal) => self.solve(goal),
                Step::Backtrack => self.resume(),
                Step::Done => return,
            }
        }
    }

    fn log(&self, source: &dyn RuleSource, depth: usize, literal: &Literal, message: Arguments<'_>) {
        if let Some(tracer) = source.tracer() {
            tracer.log(source.name(), Some(&literal.table.table), depth, message);
        }
    }

    fn solve(&mut self, goal: Goal) -> Step {
        let frame = &self.frames[goal.frame];
        if goal.index >= frame.literals.len() {
            let parent = frame.parent;
            return match parent {
                Some(parent) => {
                    let caller = &self.frames[parent.frame];
                    let literal = self.arena.plug(&caller.literals[parent.index], caller.unifier);
                    self.log(caller.source, caller.depth, &literal, format_args!("Exit: {}", literal));
                    Step::Solve(parent.next())
                }
                None => {
                    self.record();
                    if self.find_all {
                        Step::Backtrack
                    } else {
                        Step::Done
                    }
                }
            };
        }

        let literal = frame.literals[goal.index].clone();
        let unifier = frame.unifier;
        let source = frame.source;
        let depth = frame.depth;

        if let Some(save) = self.save {
            if save(&self.arena.plug(&literal, unifier)) {
                self.support.push((literal, unifier));
                return Step::Solve(goal.next());
            }
        }

        if literal.negated {
            let positive = self.arena.plug(&literal, unifier).complement();
            debug_assert!(positive.is_ground(), "negated literals are evaluated ground: {}", positive);
            let child = TopDown {
                root: source,
                federation: self.federation,
            };
            if child.prove(&positive) {
                self.log(source, depth, &literal, format_args!("Fail: not {}", positive));
                return Step::Backtrack;
            }
            return Step::Solve(goal.next());
        }

        if literal.table.service.is_none() && literal.table.modal.is_none() {
            match literal.table.table.as_str() {
                "true" => return Step::Solve(goal.next()),
                "false" => return Step::Backtrack,
                _ => {}
            }
        }

        if builtin_for(&literal).is_some() {
            return self.call_builtin(goal, &literal, unifier, source, depth);
        }

        if let (Some(service), Some(federation)) = (literal.table.service.as_deref(), self.federation) {
            if literal.table.modal.is_none() && !literal.is_update() && service != source.name() {
                return match federation.get(service) {
                    Some(theory) => self.expand(goal, &literal, unifier, theory, depth),
                    None => {
                        self.log(source, depth, &literal, format_args!("Note: unknown theory {}", service));
                        Step::Backtrack
                    }
                };
            }
        }

        self.expand(goal, &literal, unifier, source, depth)
    }

    fn call_builtin(
        &mut self,
        goal: Goal,
        literal: &Literal,
        unifier: UnifierId,
        source: &'a dyn RuleSource,
        depth: usize,
    ) -> Step {
        let Some(builtin) = builtin_for(literal) else {
            return Step::Backtrack;
        };
        let plugged = self.arena.plug(literal, unifier);
        let inputs: Option<Vec<TypedValue>> = plugged.arguments[..builtin.num_inputs]
            .iter()
            .map(|term| term.as_constant().cloned())
            .collect();
        let Some(inputs) = inputs else {
            if self.save.is_some() {
                self.support.push((literal.clone(), unifier));
                return Step::Solve(goal.next());
            }
            self.log(source, depth, literal, format_args!("Note: unbound inputs in {}", plugged));
            return Step::Backtrack;
        };

        match builtin.call(&inputs) {
            Err(error) => {
                self.log(source, depth, literal, format_args!("Note: {} failed: {}", plugged, error));
                Step::Backtrack
            }
            Ok(BuiltinOutput::Truth(true)) => Step::Solve(goal.next()),
            Ok(BuiltinOutput::Truth(false)) => Step::Backtrack,
            Ok(BuiltinOutput::Values(values)) => {
                let outputs: Vec<Term> = values.into_iter().map(Term::Constant).collect();
                let scratch = self.arena.fresh();
                let unified = self.arena.bi_unify_lists(
                    &literal.arguments[builtin.num_inputs..],
                    unifier,
                    &outputs,
                    scratch,
                );
                match unified {
                    Some(changes) => {
                        self.trail.extend(changes);
                        Step::Solve(goal.next())
                    }
                    None => Step::Backtrack,
                }
            }
        }
    }

    fn expand(
        &mut self,
        goal: Goal,
        literal: &Literal,
        unifier: UnifierId,
        source: &'a dyn RuleSource,
        depth: usize,
    ) -> Step {
        let plugged = self.arena.plug(literal, unifier);
        self.log(source, depth, literal, format_args!("Call: {}", plugged));
        let default_theory = literal
            .table
            .service
            .clone()
            .unwrap_or_else(|| source.name().to_string());

        self.choices.push(ChoicePoint {
            goal,
            source,
            default_theory,
            candidates: source.head_index(&plugged),
            next: 0,
            trail: self.trail.len(),
            arena: self.arena.mark(),
            frames: self.frames.len(),
            support: self.support.len(),
        });

        Step::Backtrack
    }

    fn resume(&mut self) -> Step {
        let Some(choice) = self.choices.last() else {
            return Step::Done;
        };
        let goal = choice.goal;
        let source = choice.source;
        let (trail, arena, frames, support) = (choice.trail, choice.arena, choice.frames, choice.support);
        let retried = choice.next > 0;

        let undone = self.trail.split_off(trail);
        self.arena.undo_all(Some(&undone));
        self.arena.release(arena);
        self.frames.truncate(frames);
        self.support.truncate(support);

        let frame = &self.frames[goal.frame];
        let literal = frame.literals[goal.index].clone();
        let unifier = frame.unifier;
        let depth = frame.depth;
        if retried {
            let plugged = self.arena.plug(&literal, unifier);
            self.log(source, depth, &literal, format_args!("Redo: {}", plugged));
        }

        let top = self.choices.len() - 1;
        loop {
            let choice = &mut self.choices[top];
            let Some(candidate) = choice.candidates.get(choice.next).cloned() else {
                let plugged = self.arena.plug(&literal, unifier);
                self.log(source, depth, &literal, format_args!("Fail: {}", plugged));
                self.choices.pop();
                return Step::Backtrack;
            };
            choice.next += 1;

            match candidate {
                Candidate::Tuple(row) => {
                    if let Some(changes) = self.arena.match_tuple(&row, &literal, unifier) {
                        self.trail.extend(changes);
                        let plugged = self.arena.plug(&literal, unifier);
                        self.log(source, depth, &literal, format_args!("Exit: {}", plugged));
                        return Step::Solve(goal.next());
                    }
                }
                Candidate::Rule(rule) => {
                    let default_theory = self.choices[top].default_theory.clone();
                    let head_unifier = self.arena.fresh();
                    let unified = self.arena.bi_unify_atoms(
                        rule.head(),
                        head_unifier,
                        &literal,
                        unifier,
                        Some(&default_theory),
                    );
                    let Some(changes) = unified else {
                        self.arena.release(arena);
                        continue;
                    };
                    self.trail.extend(changes);
                    if rule.body.is_empty() {
                        let plugged = self.arena.plug(&literal, unifier);
                        self.log(source, depth, &literal, format_args!("Exit: {}", plugged));
                        return Step::Solve(goal.next());
                    }
                    self.frames.push(Frame {
                        literals: rule.body,
                        unifier: head_unifier,
                        parent: Some(goal),
                        source,
                        depth: depth + 1,
                    });
                    return Step::Solve(Goal {
                        frame: self.frames.len() - 1,
                        index: 0,
                    });
                }
            }
        }
    }

    fn record(&mut self) {
        let scope = CallerScope {
            variables: self.variables,
            unifier: self.caller,
        };
        let binding = self
            .variables
            .iter()
            .map(|variable| {
                let term = Term::Variable(variable.clone());
                (variable.clone(), self.arena.apply_scoped(&term, self.caller, &scope))
            })
            .collect();
        let support = self
            .support
            .iter()
            .map(|(literal, unifier)| self.arena.plug_scoped(literal, *unifier, &scope))
            .collect();

        self.results.insert(TopDownResult { binding, support });
    }
}

/// Depth-first proof search over a root theory, optionally federated with others.
#[derive(Clone, Copy)]
pub struct TopDown<'a> {
    root: &'a dyn RuleSource,
    federation: Option<&'a Federation<'a>>,
}

impl<'a> TopDown<'a> {
    pub fn new(root: &'a dyn RuleSource) -> Self {
        TopDown {
            root,
            federation: None,
        }
    }
    pub fn with_federation(mut self, federation: &'a Federation<'a>) -> Self {
        self.federation = Some(federation);
        self
    }
    fn search<'s>(
        &self,
        variables: &'s BTreeSet<Variable>,
        literals: &[Literal],
        seed: &Bindings,
        find_all: bool,
        save: Option<&'s dyn Fn(&Literal) -> bool>,
    ) -> IndexSet<TopDownResult> {
        let mut arena = UnifierArena::default();
        let caller = arena.with_bindings(seed);
        let mut search = Search {
            federation: self.federation,
            save,
            find_all,
            variables,
            caller,
            arena,
            frames: vec![Frame {
                literals: literals.to_vec(),
                unifier: caller,
                parent: None,
                source: self.root,
                depth: 0,
            }],
            choices: vec![],
            trail: vec![],
            support: vec![],
            results: IndexSet::new(),
        };
        search.run();

        search.results
    }
    /// Bindings of `variables` under which every literal holds, seeded with `seed`.
    pub fn evaluate(
        &self,
        variables: &BTreeSet<Variable>,
        literals: &[Literal],
        seed: &Bindings,
        find_all: bool,
    ) -> Vec<Bindings> {
        let bindings: IndexSet<Bindings> = self
            .search(variables, literals, seed, find_all, None)
            .into_iter()
            .map(|result| result.binding)
            .collect();

        bindings.into_iter().collect()
    }
    /// Like [`TopDown::evaluate`], but literals accepted by `save` are assumed and returned as
    /// support.
    pub fn abduce(
        &self,
        variables: &BTreeSet<Variable>,
        literals: &[Literal],
        find_all: bool,
        save: &dyn Fn(&Literal) -> bool,
    ) -> Vec<TopDownResult> {
        self.search(variables, literals, &Bindings::new(), find_all, Some(save))
            .into_iter()
            .collect()
    }
    pub fn prove(&self, literal: &Literal) -> bool {
        let nothing = BTreeSet::new();

        !self
            .evaluate(&nothing, std::slice::from_ref(literal), &Bindings::new(), false)
            .is_empty()
    }
    /// Instances of `query` that hold.
    pub fn select(&self, query: &Literal, find_all: bool) -> Vec<Literal> {
        let variables = query.variables();
        let instances: IndexSet<Literal> = self
            .evaluate(&variables, std::slice::from_ref(query), &Bindings::new(), find_all)
            .iter()
            .map(|binding| query.plug(binding))
            .collect();

        instances.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::evaluation::topdown::{Candidate, Federation, RuleSource, TopDown};
    use crate::storage::ruleset::RuleSet;
    use datalog_syntax::*;
    use datalog_syntax_macros::{literal, program, rule};
    use std::collections::{BTreeSet, HashSet};

    struct Rules {
        name: String,
        rules: RuleSet,
    }

    impl Rules {
        fn new(name: &str, program: Program) -> Self {
            let mut rules = RuleSet::default();
            for rule in program {
                let key = rule.head().table.table.clone();
                rules.add_rule(&key, rule);
            }

            Rules {
                name: name.to_string(),
                rules,
            }
        }
    }

    impl RuleSource for Rules {
        fn name(&self) -> &str {
            &self.name
        }
        fn head_index(&self, literal: &Literal) -> Vec<Candidate> {
            self.rules.get_rules(&literal.table.table, Some(literal))
        }
    }

    fn select(source: &Rules, query: Literal) -> HashSet<Literal> {
        TopDown::new(source).select(&query, true).into_iter().collect()
    }

    #[test]
    fn test_join_with_constant() {
        let source = Rules::new(
            "test",
            program! {
                r(1) <- [],
                r(2) <- [],
                s(5) <- [],
                p(?x) <- [r(?x), s(5)],
            },
        );

        let expected: HashSet<_> = [literal!(p(1)), literal!(p(2))].into_iter().collect();
        assert_eq!(expected, select(&source, literal!(p(?x))));
        assert!(TopDown::new(&source).prove(&literal!(p(2))));
        assert!(!TopDown::new(&source).prove(&literal!(p(5))));
    }

    #[test]
    fn test_right_recursive_closure() {
        let source = Rules::new(
            "test",
            program! {
                e(1, 2) <- [],
                e(2, 3) <- [],
                e(3, 4) <- [],
                tc(?x, ?y) <- [e(?x, ?y)],
                tc(?x, ?z) <- [e(?x, ?y), tc(?y, ?z)],
            },
        );

        let from_one = select(&source, literal!(tc(1, ?y)));
        let expected: HashSet<_> = [literal!(tc(1, 2)), literal!(tc(1, 3)), literal!(tc(1, 4))]
            .into_iter()
            .collect();
        assert_eq!(expected, from_one);
        assert_eq!(6, select(&source, literal!(tc(?x, ?y))).len());
    }

    #[test]
    fn test_negation_as_failure() {
        let source = Rules::new(
            "test",
            program! {
                q(1) <- [],
                q(2) <- [],
                r(2) <- [],
                p(?x) <- [q(?x), !r(?x)],
            },
        );

        let expected: HashSet<_> = [literal!(p(1))].into_iter().collect();
        assert_eq!(expected, select(&source, literal!(p(?x))));
    }

    #[test]
    fn test_builtins_bind_outputs_and_filter() {
        let source = Rules::new(
            "test",
            program! {
                q(1) <- [],
                q(5) <- [],
                next(?x, ?y) <- [q(?x), plus(?x, 1, ?y)],
                small(?x) <- [q(?x), lt(?x, 3)],
                broken(?x) <- [q(?x), div(?x, 0, ?y)],
            },
        );

        let expected: HashSet<_> = [literal!(next(1, 2)), literal!(next(5, 6))].into_iter().collect();
        assert_eq!(expected, select(&source, literal!(next(?x, ?y))));
        assert_eq!(1, select(&source, literal!(small(?x))).len());
        assert!(select(&source, literal!(broken(?x))).is_empty());
        assert!(TopDown::new(&source).prove(&literal!(next(1, 2))));
        assert!(!TopDown::new(&source).prove(&literal!(next(1, 3))));
    }

    #[test]
    fn test_backtracking_restores_bindings() {
        let source = Rules::new(
            "test",
            program! {
                q(1, 2) <- [],
                q(2, 1) <- [],
                q(2, 3) <- [],
                sym(?x, ?y) <- [q(?x, ?y), q(?y, ?x)],
            },
        );

        let expected: HashSet<_> = [literal!(sym(1, 2)), literal!(sym(2, 1))].into_iter().collect();
        assert_eq!(expected, select(&source, literal!(sym(?x, ?y))));
    }

    #[test]
    fn test_first_solution_only() {
        let source = Rules::new("test", program! { q(1) <- [], q(2) <- [], q(3) <- [] });
        let variables = BTreeSet::from(["x".to_string()]);

        let first = TopDown::new(&source).evaluate(&variables, &[literal!(q(?x))], &Bindings::new(), false);
        assert_eq!(1, first.len());
        assert_eq!(Some(&Term::from(1)), first[0].get("x"));
    }

    #[test]
    fn test_seeded_evaluation() {
        let source = Rules::new("test", program! { q(1, "a") <- [], q(2, "b") <- [] });
        let variables = BTreeSet::from(["x".to_string(), "y".to_string()]);
        let seed: Bindings = [("x".to_string(), Term::from(2))].into_iter().collect();

        let results = TopDown::new(&source).evaluate(&variables, &[literal!(q(?x, ?y))], &seed, true);
        assert_eq!(1, results.len());
        assert_eq!(Some(&Term::from("b")), results[0].get("y"));
    }

    #[test]
    fn test_federated_literal() {
        let nova = Rules::new("nova", program! { servers(1) <- [], servers(2) <- [] });
        let policy = Rules::new(
            "classification",
            program! {
                owned(2) <- [],
                orphan(?x) <- [nova:servers(?x), !owned(?x)],
            },
        );
        let mut federation = Federation::new();
        federation.insert(&nova);
        federation.insert(&policy);

        let orphans = TopDown::new(&policy)
            .with_federation(&federation)
            .select(&literal!(orphan(?x)), true);
        assert_eq!(vec![literal!(orphan(1))], orphans);

        let unknown = Rules::new("other", program! { p(?x) <- [neutron:ports(?x)] });
        assert!(TopDown::new(&unknown)
            .with_federation(&federation)
            .select(&literal!(p(?x)), true)
            .is_empty());
    }

    #[test]
    fn test_abduction_collects_support() {
        let source = Rules::new(
            "test",
            program! {
                q(1) <- [],
                q(2) <- [],
                p(?x) <- [q(?x), r(?x)],
            },
        );
        let variables = BTreeSet::from(["x".to_string()]);
        let save = |literal: &Literal| literal.table.table == "r";

        let results = TopDown::new(&source).abduce(&variables, &[literal!(p(?x))], true, &save);
        let supports: HashSet<_> = results.iter().map(|result| result.support.clone()).collect();
        let expected: HashSet<_> = [vec![literal!(r(1))], vec![literal!(r(2))]].into_iter().collect();
        assert_eq!(expected, supports);
    }

    #[test]
    fn test_true_and_false() {
        let source = Rules::new(
            "test",
            vec![
                rule!(yes(1) <- []),
                Rule::new(literal!(always(1)), vec![Literal::new("true", vec![])]),
                Rule::new(literal!(never(1)), vec![Literal::new("false", vec![])]),
            ],
        );

        assert!(TopDown::new(&source).prove(&literal!(always(1))));
        assert!(!TopDown::new(&source).prove(&literal!(never(1))));
    }
}
