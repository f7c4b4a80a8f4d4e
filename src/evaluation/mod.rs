pub mod builtins;
pub mod topdown;
