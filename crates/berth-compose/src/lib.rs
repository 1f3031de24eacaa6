//! # berth-compose
//!
//! Parser for the `.berth` service language.
//!
//! Handles:
//! - **Parser**: Lexing, AST construction, and validation of `.berth` files.
//! - **Service**: Typed service definitions, port mappings and restart specs.
//! - **Compose import**: Conversion of `docker-compose.yml` services.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod compose_import;
pub mod parser;
pub mod service;
