use congress_datalog::*;
use std::collections::HashSet;

fn set(literals: Vec<Literal>) -> HashSet<Literal> {
    literals.into_iter().collect()
}

fn inserts(formulas: Vec<Formula>) -> Vec<Event> {
    formulas.into_iter().map(Event::insert).collect()
}

#[test]
fn nonrecursive_join_with_constant() {
    let mut theory = NonrecursiveRuleTheory::new(TheoryConfig::new("alpha", PolicyKind::Nonrecursive));
    theory
        .update(inserts(vec![
            literal!(r(1)).into(),
            literal!(r(2)).into(),
            literal!(s(5)).into(),
            rule!(p(?x) <- [r(?x), s(5)]).into(),
        ]))
        .unwrap();

    assert_eq!(
        set(vec![literal!(p(1)), literal!(p(2))]),
        set(theory.select(&literal!(p(?x))))
    );
}

#[test]
fn materialized_negation_follows_fact_changes() {
    let mut theory = MaterializedViewTheory::new(TheoryConfig::new("beta", PolicyKind::Materialized));
    theory
        .insert(Rule::new(literal!(p(?x)), vec![literal!(q(?x)), literal!(!r(?x))]).into())
        .unwrap();
    theory
        .update(inserts(vec![
            literal!(q(1)).into(),
            literal!(q(2)).into(),
            literal!(r(2)).into(),
        ]))
        .unwrap();
    assert_eq!(set(vec![literal!(p(1))]), set(theory.select(&literal!(p(?x)))));

    theory.insert(literal!(r(1)).into()).unwrap();
    assert!(theory.select(&literal!(p(?x))).is_empty());

    theory.delete(literal!(r(1)).into()).unwrap();
    assert_eq!(set(vec![literal!(p(1))]), set(theory.select(&literal!(p(?x)))));
}

#[test]
fn materialized_self_join() {
    let mut theory = MaterializedViewTheory::new(TheoryConfig::new("gamma", PolicyKind::Materialized));
    theory.insert(rule!(p(?x) <- [q(?x, ?y), q(?y, ?z)]).into()).unwrap();
    theory
        .update(inserts(vec![literal!(q(1, 2)).into(), literal!(q(2, 3)).into()]))
        .unwrap();
    assert_eq!(set(vec![literal!(p(1))]), set(theory.select(&literal!(p(?x)))));

    let changes = theory.delete(literal!(q(2, 3)).into()).unwrap();
    assert!(changes.iter().any(|event| event.to_string() == "-p(1)"));
    assert!(theory.select(&literal!(p(?x))).is_empty());
}

#[test]
fn unsafe_rules_are_rejected_in_every_kind() {
    let unsafe_rule: Formula = Rule::new(literal!(p(?x)), vec![literal!(q(?x)), literal!(!r(?y))]).into();

    let mut nonrecursive = NonrecursiveRuleTheory::new(TheoryConfig::new("a", PolicyKind::Nonrecursive));
    let mut materialized = MaterializedViewTheory::new(TheoryConfig::new("b", PolicyKind::Materialized));
    for theory in [&mut nonrecursive as &mut dyn Theory, &mut materialized as &mut dyn Theory] {
        let errors = theory.insert(unsafe_rule.clone()).unwrap_err();
        assert!(matches!(errors.errors()[..], [PolicyError::UnsafeLiterals { .. }]));
        assert!(theory.policy().is_empty());
    }
}

#[test]
fn stratification_is_required_for_materialized_views() {
    let mut theory = MaterializedViewTheory::new(TheoryConfig::new("delta", PolicyKind::Materialized));
    let errors = theory
        .update(inserts(vec![
            rule!(p(?x) <- [q(?x)]).into(),
            Rule::new(literal!(q(?x)), vec![literal!(s(?x)), literal!(!p(?x))]).into(),
        ]))
        .unwrap_err();

    assert_eq!(vec![PolicyError::Unstratified], errors.errors().to_vec());
    assert!(theory.policy().is_empty());
    assert!(theory.dependency_graph().is_empty());
}

#[test]
fn batches_are_rejected_as_a_whole() {
    let mut theory = NonrecursiveRuleTheory::new(TheoryConfig::new("epsilon", PolicyKind::Nonrecursive));
    let mut schema = Schema::new(true);
    schema.declare("servers", &["id", "status"]);
    theory.set_schema(schema);

    let errors = theory
        .update(inserts(vec![
            literal!(servers(1, "ACTIVE")).into(),
            literal!(ports(1)).into(),
            rule!(p(?x) <- [servers(?x, ?y, ?z)]).into(),
        ]))
        .unwrap_err();

    assert_eq!(2, errors.errors().len());
    assert!(errors
        .errors()
        .iter()
        .any(|error| matches!(error, PolicyError::UnknownTable { table, .. } if table == "ports")));
    assert!(errors
        .errors()
        .iter()
        .any(|error| matches!(error, PolicyError::ArityMismatch { found: 3, expected: 2, .. })));
    assert!(theory.content().is_empty());
    assert!(!theory.schema().unwrap().contains("p"));
}

#[test]
fn federated_select_reaches_other_theories() {
    let mut nova = Database::new("nova");
    nova.update(inserts(vec![
        literal!(servers(1, "ACTIVE")).into(),
        literal!(servers(2, "ERROR")).into(),
    ]))
    .unwrap();

    let mut classification = NonrecursiveRuleTheory::new(TheoryConfig::new("classification", PolicyKind::Nonrecursive));
    classification
        .insert(rule!(error(?x) <- [nova:servers(?x, "ERROR")]).into())
        .unwrap();

    let mut federation = Federation::new();
    federation.insert(&nova);
    federation.insert(&classification);

    assert_eq!(
        vec![literal!(error(2))],
        classification.select_in(&literal!(error(?x)), &federation)
    );
    assert!(classification.select(&literal!(error(?x))).is_empty());
}

#[test]
fn abduction_lists_missing_support() {
    let mut theory = NonrecursiveRuleTheory::new(TheoryConfig::new("zeta", PolicyKind::Nonrecursive));
    theory
        .update(inserts(vec![
            literal!(q(1)).into(),
            literal!(q(2)).into(),
            rule!(p(?x) <- [q(?x), r(?x)]).into(),
        ]))
        .unwrap();

    let abduced: HashSet<Rule> = theory
        .abduce(&literal!(p(?x)).into(), &["r".to_string()])
        .into_iter()
        .collect();
    let expected: HashSet<Rule> = vec![rule!(p(1) <- [r(1)]), rule!(p(2) <- [r(2)])].into_iter().collect();
    assert_eq!(expected, abduced);
}

#[test]
fn explanations_agree_across_engines() {
    let rules = program! {
        p(?x) <- [q(?x), r(?x)],
        s(?x) <- [p(?x)],
    };
    let facts = vec![literal!(q(1)), literal!(r(1))];

    let mut nonrecursive = NonrecursiveRuleTheory::new(TheoryConfig::new("n", PolicyKind::Nonrecursive));
    let mut materialized = MaterializedViewTheory::new(TheoryConfig::new("m", PolicyKind::Materialized));
    for theory in [&mut nonrecursive as &mut dyn Theory, &mut materialized as &mut dyn Theory] {
        theory.update(rules.iter().cloned().map(Event::insert).collect()).unwrap();
        theory.update(facts.iter().cloned().map(Event::insert).collect()).unwrap();
    }

    let on_demand = nonrecursive.explain(&literal!(s(1))).unwrap();
    let stored = materialized.explain(&literal!(s(1))).unwrap();
    assert_eq!(on_demand, stored);
    assert_eq!("s(1)\n  p(1)\n    q(1)\n    r(1)\n", stored.to_string());
}

#[test]
fn materialized_recursion_survives_cycles() {
    let mut theory = MaterializedViewTheory::new(TheoryConfig::new("eta", PolicyKind::Materialized));
    theory
        .update(
            program! {
                tc(?x, ?y) <- [e(?x, ?y)],
                tc(?x, ?z) <- [e(?x, ?y), tc(?y, ?z)],
            }
            .into_iter()
            .map(Event::insert)
            .collect(),
        )
        .unwrap();
    theory
        .update(inserts(vec![literal!(e(1, 2)).into(), literal!(e(2, 1)).into()]))
        .unwrap();
    assert_eq!(
        set(vec![literal!(tc(1, 1)), literal!(tc(1, 2)), literal!(tc(2, 1)), literal!(tc(2, 2))]),
        set(theory.select(&literal!(tc(?x, ?y))))
    );

    theory.delete(literal!(e(1, 2)).into()).unwrap();
    assert_eq!(set(vec![literal!(tc(2, 1))]), set(theory.select(&literal!(tc(?x, ?y)))));
}
