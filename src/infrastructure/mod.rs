pub mod authorization;
pub mod persistence;
