//! Static analysis and validation of the parsed AST.
//!
//! Checks for duplicate names, missing required properties and malformed
//! values before a service is built or started.

use std::collections::HashSet;

use berth_common::error::{BerthError, Result};
use berth_image::entrypoint::FactoryRef;

use super::ast::{BuildDecl, ServiceDecl, ServiceFile};
use crate::service::{PortMapping, RestartSpec};

/// Validates a parsed service file for semantic correctness.
///
/// # Checks performed
///
/// 1. No duplicate service names.
/// 2. Every service has exactly one of `image` or `build`.
/// 3. Build blocks name a base, manifest, source and exactly one of
///    `script` / `factory`, consistent with `entrypoint`.
/// 4. Ports, worker counts, publish mappings and restart policies are valid.
/// 5. Direct mode runs a single worker.
///
/// # Errors
///
/// Returns an error if any semantic check fails.
pub fn validate(file: &ServiceFile) -> Result<()> {
    tracing::debug!(services = file.services.len(), "validating service file");
    check_duplicate_services(file)?;
    for svc in &file.services {
        check_image_source(svc)?;
        check_values(svc)?;
    }
    Ok(())
}

fn config_err(svc: &ServiceDecl, message: impl std::fmt::Display) -> BerthError {
    BerthError::Config {
        message: format!("service \"{}\": {message}", svc.name),
    }
}

fn check_duplicate_services(file: &ServiceFile) -> Result<()> {
    let mut seen = HashSet::new();
    for svc in &file.services {
        if !seen.insert(&svc.name) {
            return Err(BerthError::Config {
                message: format!("duplicate service name: \"{}\"", svc.name),
            });
        }
    }
    Ok(())
}

fn check_image_source(svc: &ServiceDecl) -> Result<()> {
    match (&svc.image, &svc.build) {
        (Some(_), Some(_)) => Err(config_err(svc, "image and build are mutually exclusive")),
        (None, None) => Err(config_err(svc, "needs an image or a build block")),
        (Some(_), None) => Ok(()),
        (None, Some(build)) => check_build(svc, build),
    }
}

fn check_build(svc: &ServiceDecl, build: &BuildDecl) -> Result<()> {
    for (key, value) in [
        ("base", &build.base),
        ("manifest", &build.manifest),
        ("source", &build.source),
    ] {
        if value.as_deref().is_none_or(str::is_empty) {
            return Err(config_err(svc, format_args!("build block is missing `{key}`")));
        }
    }

    let direct = match (&build.script, &build.factory) {
        (Some(_), None) => true,
        (None, Some(factory)) => {
            let _ = factory.parse::<FactoryRef>()?;
            false
        }
        (Some(_), Some(_)) => {
            return Err(config_err(svc, "script and factory are mutually exclusive"));
        }
        (None, None) => {
            return Err(config_err(svc, "build block needs a script or a factory"));
        }
    };

    match (build.entrypoint.as_deref(), direct) {
        (None | Some("direct"), true) | (None | Some("supervised"), false) => {}
        (Some("direct"), false) => {
            return Err(config_err(svc, "direct entrypoint needs a script, not a factory"));
        }
        (Some("supervised"), true) => {
            return Err(config_err(svc, "supervised entrypoint needs a factory, not a script"));
        }
        (Some(other), _) => {
            return Err(config_err(
                svc,
                format_args!("unknown entrypoint mode `{other}` (expected direct or supervised)"),
            ));
        }
    }

    if direct && svc.workers.is_some_and(|w| w != 1) {
        return Err(config_err(svc, "direct entrypoint runs exactly one worker"));
    }
    Ok(())
}

fn check_values(svc: &ServiceDecl) -> Result<()> {
    if let Some(port) = svc.port {
        if !(1..=i64::from(u16::MAX)).contains(&port) {
            return Err(config_err(svc, format_args!("port value out of range: {port}")));
        }
    }
    if let Some(workers) = svc.workers {
        if !(1..=1024).contains(&workers) {
            return Err(config_err(svc, format_args!("workers must be between 1 and 1024, got {workers}")));
        }
    }
    for mapping in &svc.publish {
        let parsed: PortMapping = mapping.parse()?;
        let port = svc.port.unwrap_or(i64::from(berth_common::constants::DEFAULT_CONTAINER_PORT));
        if i64::from(parsed.container_port) != port {
            return Err(config_err(
                svc,
                format_args!("publish `{mapping}` targets port {} but the service listens on {port}", parsed.container_port),
            ));
        }
    }
    if let Some(restart) = &svc.restart {
        let _ = restart.parse::<RestartSpec>()?;
    }
    let mut networks = HashSet::new();
    for network in &svc.networks {
        if network.is_empty() {
            return Err(config_err(svc, "empty network name"));
        }
        if !networks.insert(network) {
            return Err(config_err(svc, format_args!("network \"{network}\" listed twice")));
        }
    }
    Ok(())
}
