//! # berth-image
//!
//! Build-time half of the berth pipeline.
//!
//! Handles:
//! - **Manifest**: parsing the dependency manifest and deriving its content key.
//! - **Index**: resolving requirements against a local or remote package index.
//! - **Cache**: the content-addressed dependency layer cache.
//! - **Layers**: deterministic packing and extraction of tar layers.
//! - **Sources**: `file://`, `tar://` and checksummed remote base references.
//! - **Entry point**: direct or supervised start command, recorded in the image.
//! - **Loader**: the `berth_worker` module every dependency layer ships.
//! - **Assembler**: base → dependencies → source composition into an image.
//! - **Registry**: local image catalog.
//! - **Rootfs**: run-time materialization of an image's layers.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod assembler;
pub mod cache;
pub mod entrypoint;
pub mod hash;
pub mod index;
pub mod layer;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod rootfs;
pub mod source;
pub mod storage;
