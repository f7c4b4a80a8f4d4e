pub mod delta;
pub mod event;
pub mod materialized;
pub mod nonrecursive;
pub mod theory;
