pub mod geo;
pub mod tasks;
