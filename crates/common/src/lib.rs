//! Shared building blocks for the classroom services.
//!
//! - [`types`] - Strongly typed identifiers for rooms, participants and connections
//! - [`secret`] - Redacting wrappers for credentials and connection strings

#![warn(clippy::pedantic)]

pub mod secret;
pub mod types;
