//! Service runtime for berth.
//!
//! Turns an assembled image into a supervised, network-attached service:
//! environment merging, restart policies, the shared listening socket, the
//! worker pool, network attachment, port publishing, persisted state and
//! per-service logs.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod engine;
pub mod envfile;
pub mod listener;
pub mod logs;
pub mod network;
pub mod publish;
pub mod restart;
pub mod state;
pub mod supervisor;
pub mod worker;
