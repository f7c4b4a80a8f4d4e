pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod rewriting;
pub mod schema;
pub mod storage;
pub mod tracer;

pub use ::datalog_syntax::*;
pub use ::datalog_syntax_macros::{literal, program, rule};
pub use config::{PolicyKind, TheoryConfig};
pub use engine::delta::DeltaRuleTheory;
pub use engine::event::{Event, Proof, ProofCollection, ProofTree};
pub use engine::materialized::MaterializedViewTheory;
pub use engine::nonrecursive::NonrecursiveRuleTheory;
pub use engine::theory::Theory;
pub use error::{PolicyError, PolicyErrors};
pub use evaluation::topdown::{Federation, RuleSource, TopDown};
pub use schema::Schema;
pub use storage::database::Database;
