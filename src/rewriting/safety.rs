use crate::error::PolicyError;
use crate::evaluation::builtins::{builtin_for, registry};
use crate::schema::Schema;
use datalog_syntax::{Literal, Rule, Variable};
use std::collections::BTreeSet;

pub const MODALS: [&str; 3] = ["execute", "insert", "delete"];

/// Variables that must be bound before `literal` can run, `None` for ordinary atoms.
fn required_variables(literal: &Literal) -> Option<BTreeSet<Variable>> {
    if literal.negated {
        return Some(literal.variables());
    }
    let builtin = builtin_for(literal)?;

    Some(
        literal.arguments[..builtin.num_inputs]
            .iter()
            .filter_map(|term| term.as_variable().cloned())
            .collect(),
    )
}

/// Stable reordering of the body so negations and builtin inputs are bound by earlier
/// literals. A rule that is already safe comes back unchanged.
pub fn reorder_for_safety(rule: &Rule) -> Result<Rule, PolicyError> {
    let mut bound: BTreeSet<Variable> = BTreeSet::new();
    let mut pending: Vec<(Literal, BTreeSet<Variable>)> = vec![];
    let mut body: Vec<Literal> = Vec::with_capacity(rule.body.len());

    for literal in &rule.body {
        if let Some(required) = required_variables(literal) {
            if !required.is_subset(&bound) {
                pending.push((literal.clone(), required));
                continue;
            }
        }

        bound.extend(literal.variables());
        body.push(literal.clone());
        while let Some(position) = pending.iter().position(|(_, required)| required.is_subset(&bound)) {
            let (ready, _) = pending.remove(position);
            bound.extend(ready.variables());
            body.push(ready);
        }
    }

    if !pending.is_empty() {
        let literals: Vec<String> = pending
            .iter()
            .map(|(literal, required)| {
                let unbound: Vec<&str> = required.difference(&bound).map(String::as_str).collect();
                format!("{} (vars {})", literal, unbound.join(", "))
            })
            .collect();

        return Err(PolicyError::UnsafeLiterals {
            rule: rule.to_string(),
            literals: literals.join("; "),
        });
    }

    Ok(Rule {
        heads: rule.heads.clone(),
        body,
        id: rule.id.clone(),
        name: rule.name.clone(),
    })
}

/// Schema problems of a literal read or written by `theory`. Literals of other theories are
/// not checked here.
pub fn literal_schema_errors(literal: &Literal, schema: Option<&Schema>, theory: &str) -> Vec<PolicyError> {
    let Some(schema) = schema else {
        return vec![];
    };
    if literal.table.service.as_deref().map_or(false, |service| service != theory) {
        return vec![];
    }

    let table = &literal.table.table;
    match schema.arity(table) {
        None if schema.is_complete() => vec![PolicyError::UnknownTable {
            literal: literal.to_string(),
            table: table.clone(),
            policy: theory.to_string(),
        }],
        Some(expected) if expected != literal.arity() => vec![PolicyError::ArityMismatch {
            literal: literal.to_string(),
            found: literal.arity(),
            expected,
        }],
        _ => vec![],
    }
}

fn table_name_errors<'a>(literals: impl IntoIterator<Item = &'a Literal>) -> Vec<PolicyError> {
    literals
        .into_iter()
        .filter(|literal| !literal.table.is_valid())
        .map(|literal| PolicyError::InvalidTableName(literal.to_string()))
        .collect()
}

pub fn fact_errors(atom: &Literal, schema: Option<&Schema>, theory: &str) -> Vec<PolicyError> {
    let mut errors = table_name_errors([atom]);
    if !atom.is_ground() || atom.negated {
        errors.push(PolicyError::NonGroundFact(atom.to_string()));
    }
    errors.extend(literal_schema_errors(atom, schema, theory));
    if let Some(service) = &atom.table.service {
        errors.push(PolicyError::FactNamesPolicy {
            fact: atom.to_string(),
            policy: service.clone(),
        });
    }

    errors
}

pub fn rule_head_safety(rule: &Rule) -> Vec<PolicyError> {
    let body = rule.body_variables();

    rule.head_variables()
        .difference(&body)
        .map(|variable| PolicyError::UnsafeHeadVariable {
            variable: variable.clone(),
            rule: rule.to_string(),
        })
        .collect()
}

pub fn rule_body_safety(rule: &Rule) -> Vec<PolicyError> {
    reorder_for_safety(rule).err().into_iter().collect()
}

/// Heads may only name another theory when they are modal actions.
pub fn rule_head_has_no_theory(rule: &Rule) -> Vec<PolicyError> {
    rule.heads
        .iter()
        .filter(|head| head.table.modal.is_none())
        .filter_map(|head| {
            head.table.service.as_ref().map(|service| PolicyError::HeadNamesPolicy {
                head: head.to_string(),
                policy: service.clone(),
            })
        })
        .collect()
}

pub fn rule_modal_errors(rule: &Rule) -> Vec<PolicyError> {
    let in_body = rule.body.iter().filter_map(|literal| {
        literal.table.modal.as_ref().map(|modal| PolicyError::ModalInBody {
            modal: modal.clone(),
            rule: rule.to_string(),
        })
    });
    let unknown = rule.heads.iter().filter_map(|head| {
        head.table
            .modal
            .as_ref()
            .filter(|modal| !MODALS.contains(&modal.as_str()))
            .map(|modal| PolicyError::UnknownModal {
                modal: modal.clone(),
                literal: head.to_string(),
            })
    });

    in_body.chain(unknown).collect()
}

pub fn rule_reserved_errors(rule: &Rule) -> Vec<PolicyError> {
    rule.heads
        .iter()
        .filter(|head| head.table.service.is_none() && head.table.modal.is_none())
        .filter(|head| {
            let table = head.table.table.as_str();
            table == "true" || table == "false" || registry().is_reserved(table)
        })
        .map(|head| PolicyError::ReservedTable {
            table: head.table.table.clone(),
            formula: rule.to_string(),
        })
        .collect()
}

pub fn rule_schema_errors(rule: &Rule, schema: Option<&Schema>, theory: &str) -> Vec<PolicyError> {
    let heads = rule.heads.iter().filter(|head| head.table.modal.is_none()).flat_map(|head| {
        literal_schema_errors(head, schema, theory)
            .into_iter()
            .filter(|error| !matches!(error, PolicyError::UnknownTable { .. }))
    });
    let body = rule
        .body
        .iter()
        .filter(|literal| builtin_for(literal).is_none())
        .flat_map(|literal| literal_schema_errors(literal, schema, theory));

    heads.chain(body).collect()
}

/// Every structural problem of a rule, none short-circuiting the others.
pub fn rule_errors(rule: &Rule, schema: Option<&Schema>, theory: &str) -> Vec<PolicyError> {
    let mut errors = table_name_errors(rule.heads.iter().chain(rule.body.iter()));
    errors.extend(rule_head_safety(rule));
    errors.extend(rule_body_safety(rule));
    errors.extend(rule_schema_errors(rule, schema, theory));
    errors.extend(rule_head_has_no_theory(rule));
    errors.extend(rule_modal_errors(rule));
    errors.extend(rule_reserved_errors(rule));

    errors
}
