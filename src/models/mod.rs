// src/models/mod.rs
pub mod agent;
pub mod events;
pub mod location;
pub mod offer;
pub mod ride;
pub mod status;

pub use agent::*;
pub use events::*;
pub use location::*;
pub use ride::*;
pub use status::*;
