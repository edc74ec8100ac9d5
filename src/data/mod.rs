//! Data layer module
//!
//! Handles all data persistence:
//! - Local and cached remote actors
//! - Objects, follow relationships, reactions
//! - Inbox/outbox collections and the delivery queue

mod database;
mod models;

pub use database::Database;
pub use models::*;
