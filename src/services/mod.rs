// src/services/mod.rs
pub mod channel_service;
pub mod coordinator;
pub mod dispatch_service;
pub mod notification_service;
pub mod outbox_service;
pub mod persistence_service;
pub mod ride_lifecycle;
pub mod route_service;
pub mod state_store;
pub mod tracking_service;
pub mod working_hours_service;
