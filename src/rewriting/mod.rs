pub mod safety;
pub mod unify;
