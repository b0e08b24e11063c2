//! Core primitives for a burrow store.
//!
//! Locks, the record codec, the durable writer, and the store handle live here.
//! Everything in `plugins` is built from these.

pub mod broker;
pub mod codec;
pub mod config;
pub mod durable;
pub mod error;
pub mod fields;
pub mod lock;
pub mod schemas;
pub mod store;
pub mod time;
