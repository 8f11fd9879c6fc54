//! Shared vocabulary for the parley chat service: identifiers, conversation
//! and message models, the error taxonomy, wire frames and the storage seams
//! the delivery core depends on.

pub mod errors;
pub mod ids;
pub mod models;
pub mod protocol;
pub mod rest;
pub mod store;

pub use errors::ChatError;
