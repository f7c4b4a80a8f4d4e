use thiserror::Error;

/// Semantically invalid but well-formed input. Evaluation failures are never reported this way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("variable {variable} found in head but not in body, rule {rule}")]
    UnsafeHeadVariable { variable: String, rule: String },
    #[error("could not reorder rule {rule}; unsafe literals: {literals}")]
    UnsafeLiterals { rule: String, literals: String },
    #[error("rules are recursive: {cycles}")]
    Recursive { cycles: String },
    #[error("rules are not stratified")]
    Unstratified,
    #[error("literal {literal} contained {found} arguments but only {expected} arguments are permitted")]
    ArityMismatch {
        literal: String,
        found: usize,
        expected: usize,
    },
    #[error("literal {literal} uses unknown table {table} from policy {policy}")]
    UnknownTable {
        literal: String,
        table: String,
        policy: String,
    },
    #[error("literal {literal} uses unknown column name {column}")]
    UnknownColumn { literal: String, column: String },
    #[error("literal {literal} references column {column} both by position and by name")]
    ColumnConflict { literal: String, column: String },
    #[error("literal {literal} uses named arguments but table {table} has no schema")]
    MissingSchema { literal: String, table: String },
    #[error("invalid table name in {0}")]
    InvalidTableName(String),
    #[error("fact not ground: {0}")]
    NonGroundFact(String),
    #[error("fact {fact} should not reference any policy: {policy}")]
    FactNamesPolicy { fact: String, policy: String },
    #[error("rule head {head} should not reference any policy: {policy}")]
    HeadNamesPolicy { head: String, policy: String },
    #[error("modal operator {modal} is not permitted in a rule body: {rule}")]
    ModalInBody { modal: String, rule: String },
    #[error("unknown modal operator {modal} in {literal}")]
    UnknownModal { modal: String, literal: String },
    #[error("table {table} is reserved and cannot be defined: {formula}")]
    ReservedTable { table: String, formula: String },
    #[error("cannot directly modify table {0} computed from other tables")]
    ViewModification(String),
    #[error("{formula} is not permitted in a {kind} policy")]
    UnsupportedFormula { formula: String, kind: String },
}

/// Every error found while validating a rejected batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render(.0))]
pub struct PolicyErrors(pub Vec<PolicyError>);

fn render(errors: &[PolicyError]) -> String {
    errors
        .iter()
        .map(|error| error.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl PolicyErrors {
    pub fn errors(&self) -> &[PolicyError] {
        &self.0
    }
}

impl From<PolicyError> for PolicyErrors {
    fn from(value: PolicyError) -> Self {
        PolicyErrors(vec![value])
    }
}
