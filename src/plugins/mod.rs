//! Store subsystems built on the core primitives.

pub mod doctor;
pub mod documents;
pub mod events;
pub mod query;
pub mod registry;
pub mod subjects;
pub mod views;
