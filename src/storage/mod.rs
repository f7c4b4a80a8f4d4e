pub mod database;
pub mod factset;
pub mod ruleset;
