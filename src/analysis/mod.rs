pub mod dependency;
pub mod graph;
