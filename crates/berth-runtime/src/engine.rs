//! Runtime engine that orchestrates the service lifecycle.
//!
//! Starting a service runs the start-time pipeline in order: check the
//! declared networks exist, materialize the image rootfs, verify the entry
//! point, merge the environment, bind the service socket, join the networks,
//! publish the host ports and hand the worker pool to the supervisor. Any
//! failure before the supervisor runs leaves no worker behind.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use berth_common::config::BerthConfig;
use berth_common::constants::{DEPS_TARGET, FACTORY_ENV};
use berth_common::error::{BerthError, Result};
use berth_common::types::{ImageId, InstanceId, ServiceState, Sha256Hash};
use berth_compose::service::ServiceDefinition;
use berth_image::assembler::{BuildReport, ImageAssembler};
use berth_image::cache::DependencyCache;
use berth_image::entrypoint::{FactoryRef, resolve_program};
use berth_image::index::open_index;
use berth_image::registry::{Image, ImageCatalog};
use berth_image::storage::StorageBackend;
use nix::sys::signal::Signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::envfile::{Environment, load_env_file};
use crate::listener::SharedListener;
use crate::network::{Attachment, Member, Network, NetworkCatalog};
use crate::publish::{Publication, publish};
use crate::restart::policy_for;
use crate::state::{self, StateEntry};
use crate::supervisor::{ServiceStatus, Supervisor, SupervisorOptions};
use crate::worker::WorkerSpec;

/// The runtime engine that coordinates builds and service instances.
#[derive(Debug)]
pub struct Engine {
    config: BerthConfig,
    storage: StorageBackend,
    catalog: ImageCatalog,
    networks: NetworkCatalog,
}

impl Engine {
    /// Creates an engine over the configured data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage layout or image catalog cannot be
    /// created.
    pub fn new(config: BerthConfig) -> Result<Self> {
        let storage = StorageBackend::open(&config.data_dir)?;
        let catalog = ImageCatalog::open(&config.data_dir)?;
        let networks = NetworkCatalog::open(&config.data_dir);
        Ok(Self {
            config,
            storage,
            catalog,
            networks,
        })
    }

    /// Returns the data directory path.
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &BerthConfig {
        &self.config
    }

    /// Returns the image catalog.
    #[must_use]
    pub const fn catalog(&self) -> &ImageCatalog {
        &self.catalog
    }

    /// Returns the network catalog.
    #[must_use]
    pub const fn networks(&self) -> &NetworkCatalog {
        &self.networks
    }

    /// Returns the dependency layer cache.
    #[must_use]
    pub fn cache(&self) -> DependencyCache {
        DependencyCache::new(&self.storage)
    }

    /// Creates an assembler against the configured package index.
    ///
    /// # Errors
    ///
    /// Returns an error if the package index URI is invalid.
    pub fn assembler(&self) -> Result<ImageAssembler> {
        let index = open_index(&self.config.package_index)?;
        ImageAssembler::new(self.storage.clone(), index)
    }

    /// Builds the image of a service defined with a `build` block.
    ///
    /// Blocks on dependency downloads; call it outside the async runtime.
    ///
    /// # Errors
    ///
    /// Returns a config error for services that run a prebuilt image, or the
    /// build pipeline's error.
    pub fn build(&self, def: &ServiceDefinition) -> Result<BuildReport> {
        let request = def.build_request().ok_or_else(|| BerthError::Config {
            message: format!(
                "service `{}` runs the prebuilt image `{}`; nothing to build",
                def.name,
                def.image_name()
            ),
        })?;
        self.assembler()?.build(&request)
    }

    /// Removes an image and its materialized rootfs.
    ///
    /// # Errors
    ///
    /// Returns an error if the image is unknown, in use, or cannot be removed.
    pub fn remove_image(&self, reference: &str) -> Result<Image> {
        let image = self.catalog.get(reference)?;
        if self.list()?.iter().any(|e| e.image == image.id) {
            return Err(BerthError::Config {
                message: format!("image `{}` is used by a running service", image.name),
            });
        }
        let image = self.catalog.remove(image.id.as_str())?;
        berth_image::rootfs::remove(&self.storage, &image)?;
        tracing::info!(image = %image.id.short(), name = %image.name, "image removed");
        Ok(image)
    }

    /// Drops dependency cache entries no cataloged image refers to.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog or cache cannot be read or pruned.
    pub fn prune_cache(&self) -> Result<Vec<Sha256Hash>> {
        let keep: HashSet<Sha256Hash> = self
            .catalog
            .list()?
            .into_iter()
            .map(|image| image.config.dependency_key)
            .collect();
        self.cache().prune(&keep)
    }

    /// Lists running services, dropping records of dead supervisors.
    ///
    /// # Errors
    ///
    /// Returns an error if the state index cannot be read or updated.
    pub fn list(&self) -> Result<Vec<StateEntry>> {
        let path = berth_common::constants::state_file(self.data_dir());
        for stale in state::prune_stale(&path)? {
            tracing::debug!(service = %stale.service, pid = stale.pid, "dropped stale state entry");
        }
        state::load_state(&path)
    }

    /// Asks the supervising process of a service to shut down.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::NotFound` if no such service runs, or an error if
    /// the signal cannot be sent.
    pub fn stop(&self, service: &str) -> Result<StateEntry> {
        let entry = self
            .list()?
            .into_iter()
            .find(|e| e.service == service || e.instance.as_str().starts_with(service))
            .ok_or_else(|| BerthError::NotFound {
                kind: "service",
                id: service.to_string(),
            })?;
        let pid = i32::try_from(entry.pid).map_err(|_| BerthError::Config {
            message: format!("pid {} out of range", entry.pid),
        })?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), Signal::SIGTERM).map_err(|e| {
            BerthError::io(format!("/proc/{pid}"), std::io::Error::from(e))
        })?;
        tracing::info!(service = %entry.service, pid, "sent SIGTERM to supervisor");
        Ok(entry)
    }

    /// Returns a service's logs.
    ///
    /// # Errors
    ///
    /// Returns an error if the log file cannot be read.
    pub fn logs(&self, service: &str) -> Result<String> {
        crate::logs::read_logs(self.data_dir(), service)
    }

    /// Starts a service and returns once its supervisor is running.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::NetworkAttachment` if a declared network does not
    /// exist or a port cannot be bound or published, `BerthError::EntryPoint`
    /// if the entry point does not resolve in the image, or an error if the
    /// image is unknown or cannot be materialized.
    pub async fn start(&self, def: &ServiceDefinition) -> Result<RunningService> {
        let instance = InstanceId::generate();
        tracing::info!(service = %def.name, instance = %instance.short(), "starting service");

        let image = self.catalog.get(def.image_name())?;
        let networks = def
            .networks
            .iter()
            .map(|name| self.networks.get(name))
            .collect::<Result<Vec<_>>>()?;

        let rootfs = berth_image::rootfs::materialize(&self.storage, &image)?;
        let entry_point = &image.config.entry_point;
        let workdir = rootfs.join(&entry_point.workdir);
        let entry_program = entry_point.verify(&rootfs)?;
        let (program, args) = match &def.command {
            Some(command) => {
                let (first, rest) = command.split_first().ok_or_else(|| BerthError::EntryPoint {
                    message: "empty command override".into(),
                })?;
                (resolve_program(first, &rootfs, &workdir)?, rest.to_vec())
            }
            None => (entry_program, entry_point.command().into_iter().skip(1).collect()),
        };

        let network_label = networks.first().map_or("host", |n| n.name.as_str()).to_string();
        let requested = bind_address(networks.first(), def.port);
        let supervised = entry_point.is_supervised();
        let (listener, bind) = if supervised {
            let listener = SharedListener::bind(requested, &network_label)?;
            let bind = listener.local_addr();
            (Some(listener), bind)
        } else {
            (None, requested)
        };
        let workers = if supervised {
            def.workers.unwrap_or(self.config.supervisor.workers).max(1)
        } else {
            1
        };

        let env_file_vars = match &def.env_file {
            Some(path) => load_env_file(path)?,
            None => Vec::new(),
        };
        let injected = RuntimeVars {
            instance: &instance,
            service: &def.name,
            bind,
            rootfs: &rootfs,
            workdir: &workdir,
            factory: entry_point.factory(),
        }
        .into_map();
        let env = compose_environment(&image, def, env_file_vars, injected);

        let log_path = crate::logs::log_path(self.data_dir(), &def.name);
        crate::logs::append_line(
            &log_path,
            &format!(
                "starting {} ({}) with {workers} worker(s) on {bind}",
                def.name,
                entry_point
            ),
        )?;

        let mut attachments: Vec<Attachment> = Vec::new();
        for network in &networks {
            let member = Member {
                instance: instance.clone(),
                service: def.name.clone(),
                address: bind,
                pid: std::process::id(),
                attached_at: chrono::Utc::now(),
            };
            match self.networks.attach(&network.name, member) {
                Ok(attachment) => attachments.push(attachment),
                Err(e) => {
                    detach_all(attachments);
                    return Err(e);
                }
            }
        }

        let mut publications = Vec::with_capacity(def.publish.len());
        for mapping in &def.publish {
            match publish(mapping, bind, &network_label).await {
                Ok(publication) => publications.push(publication),
                Err(e) => {
                    detach_all(attachments);
                    return Err(e);
                }
            }
        }

        let spec = WorkerSpec {
            program,
            args,
            workdir,
            env,
            log_file: Some(log_path.clone()),
        };
        let supervisor = Supervisor::new(
            def.name.clone(),
            spec,
            listener,
            policy_for(def.restart, &self.config.supervisor),
            SupervisorOptions::from_settings(&self.config.supervisor, workers),
        );
        let status = supervisor.subscribe();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervisor.run(shutdown_rx));

        let state_path = berth_common::constants::state_file(self.data_dir());
        let entry = StateEntry {
            instance: instance.clone(),
            service: def.name.clone(),
            image: image.id.clone(),
            pid: std::process::id(),
            bind,
            published: publications.iter().map(Publication::host_addr).collect(),
            network: networks.first().map(|n| n.name.clone()),
            state: ServiceState::Starting,
            workers,
            started_at: chrono::Utc::now(),
        };
        if let Err(e) = state::upsert(&state_path, entry) {
            tracing::warn!(error = %e, "cannot record service state");
        }
        let state_sync = tokio::spawn(sync_state(status.clone(), state_path.clone(), instance.clone()));

        tracing::info!(
            service = %def.name,
            image = %image.id.short(),
            %bind,
            workers,
            "service started"
        );
        Ok(RunningService {
            instance,
            name: def.name.clone(),
            image: image.id,
            bind,
            publications,
            attachments,
            status,
            shutdown,
            supervisor,
            state_sync,
            state_path,
            log_path,
        })
    }
}

/// The address a service binds: the network's address, or all addresses.
fn bind_address(network: Option<&Network>, port: u16) -> SocketAddr {
    let ip = network.map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |n| n.address);
    SocketAddr::new(ip, port)
}

/// Variables the runtime injects into every worker.
struct RuntimeVars<'a> {
    instance: &'a InstanceId,
    service: &'a str,
    bind: SocketAddr,
    rootfs: &'a Path,
    workdir: &'a Path,
    factory: Option<&'a FactoryRef>,
}

impl RuntimeVars<'_> {
    fn into_map(self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        let _ = vars.insert("HOST".to_string(), self.bind.ip().to_string());
        let _ = vars.insert("PORT".to_string(), self.bind.port().to_string());
        let _ = vars.insert("BERTH_SERVICE".to_string(), self.service.to_string());
        let _ = vars.insert("BERTH_INSTANCE".to_string(), self.instance.to_string());
        let _ = vars.insert("BERTH_ROOTFS".to_string(), self.rootfs.display().to_string());
        let _ = vars.insert(
            "PYTHONPATH".to_string(),
            format!(
                "{}:{}",
                self.workdir.display(),
                self.rootfs.join(DEPS_TARGET).display()
            ),
        );
        if let Some(factory) = self.factory {
            let _ = vars.insert(FACTORY_ENV.to_string(), factory.to_string());
        }
        vars
    }
}

/// Merges worker environment layers: image, then service, then env file,
/// then runtime-injected variables.
fn compose_environment(
    image: &Image,
    def: &ServiceDefinition,
    env_file: Vec<(String, String)>,
    injected: BTreeMap<String, String>,
) -> Environment {
    let mut env = Environment::new();
    let _ = env
        .layer("image", image.config.env.clone())
        .layer("service", def.env.clone())
        .layer("env_file", env_file)
        .layer("runtime", injected);
    env
}

fn detach_all(attachments: Vec<Attachment>) {
    for attachment in attachments {
        if let Err(e) = attachment.detach() {
            tracing::warn!(error = %e, "failed to leave network");
        }
    }
}

async fn sync_state(mut status: watch::Receiver<ServiceStatus>, path: PathBuf, instance: InstanceId) {
    let mut last = None;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().state;
        if last != Some(current) {
            last = Some(current);
            if let Err(e) = state::set_state(&path, &instance, current) {
                tracing::warn!(error = %e, "cannot record service state");
            }
        }
    }
}

/// A started service instance.
#[derive(Debug)]
pub struct RunningService {
    instance: InstanceId,
    name: String,
    image: ImageId,
    bind: SocketAddr,
    publications: Vec<Publication>,
    attachments: Vec<Attachment>,
    status: watch::Receiver<ServiceStatus>,
    shutdown: watch::Sender<bool>,
    supervisor: JoinHandle<Result<()>>,
    state_sync: JoinHandle<()>,
    state_path: PathBuf,
    log_path: PathBuf,
}

impl RunningService {
    /// Returns the instance id.
    #[must_use]
    pub const fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// Returns the service name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the image id.
    #[must_use]
    pub const fn image(&self) -> &ImageId {
        &self.image
    }

    /// Returns the address the service socket is bound on.
    #[must_use]
    pub const fn bind_addr(&self) -> SocketAddr {
        self.bind
    }

    /// Returns the published host addresses.
    #[must_use]
    pub fn published_addrs(&self) -> Vec<SocketAddr> {
        self.publications.iter().map(Publication::host_addr).collect()
    }

    /// Returns the latest status snapshot.
    #[must_use]
    pub fn status(&self) -> ServiceStatus {
        self.status.borrow().clone()
    }

    /// Returns a receiver of status snapshots.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ServiceStatus> {
        self.status.clone()
    }

    /// Waits until the status satisfies `pred`.
    ///
    /// # Errors
    ///
    /// Returns `BerthError::NotFound` if the supervisor ended or the timeout
    /// elapsed first.
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        pred: impl FnMut(&ServiceStatus) -> bool,
    ) -> Result<ServiceStatus> {
        let not_reached = || BerthError::NotFound {
            kind: "service status",
            id: self.name.clone(),
        };
        match tokio::time::timeout(timeout, self.status.wait_for(pred)).await {
            Ok(Ok(status)) => Ok(status.clone()),
            Ok(Err(_)) | Err(_) => Err(not_reached()),
        }
    }

    /// Runs until `signal` resolves, then shuts down; or until the
    /// supervisor ends on its own.
    ///
    /// # Errors
    ///
    /// Returns the supervisor's error if the worker pool failed.
    pub async fn run_until(mut self, signal: impl Future<Output = ()>) -> Result<()> {
        let ended = tokio::select! {
            () = signal => None,
            outcome = &mut self.supervisor => Some(outcome),
        };
        match ended {
            None => self.shutdown().await,
            Some(outcome) => {
                self.teardown();
                join_outcome(outcome, &self.log_path)
            }
        }
    }

    /// Stops every worker, unpublishes the ports and leaves the networks.
    ///
    /// # Errors
    ///
    /// Returns the supervisor's error if the pool had already failed.
    pub async fn shutdown(mut self) -> Result<()> {
        tracing::info!(service = %self.name, "stopping service");
        let _ = self.shutdown.send(true);
        let outcome = (&mut self.supervisor).await;
        self.teardown();
        join_outcome(outcome, &self.log_path)
    }

    fn teardown(&mut self) {
        self.state_sync.abort();
        for publication in self.publications.drain(..) {
            publication.stop();
        }
        detach_all(std::mem::take(&mut self.attachments));
        if let Err(e) = state::remove(&self.state_path, &self.instance) {
            tracing::warn!(error = %e, "cannot clear service state");
        }
        if let Err(e) = crate::logs::append_line(&self.log_path, &format!("{} stopped", self.name)) {
            tracing::warn!(error = %e, "cannot write service log");
        }
        tracing::info!(service = %self.name, "service stopped");
    }
}

fn join_outcome(
    outcome: std::result::Result<Result<()>, tokio::task::JoinError>,
    log_path: &Path,
) -> Result<()> {
    outcome.map_err(|e| BerthError::io(log_path, std::io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use berth_compose::service::{ImageRef, PortMapping, RestartSpec};
    use berth_image::entrypoint::EntryPoint;
    use berth_image::registry::ImageConfig;

    use super::*;

    fn image_with_env(env: &[(&str, &str)]) -> Image {
        Image {
            id: ImageId::new("0".repeat(64)),
            name: "web".into(),
            config: ImageConfig {
                layers: Vec::new(),
                dependency_key: Sha256Hash::from_hex("0".repeat(64)).expect("hash"),
                entry_point: EntryPoint::direct("app.py"),
                env: env
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                exposed_port: 5000,
            },
            created_at: chrono::Utc::now(),
        }
    }

    fn definition(env: &[(&str, &str)]) -> ServiceDefinition {
        ServiceDefinition {
            name: "web".into(),
            image: ImageRef::Named("web".into()),
            command: None,
            port: 5000,
            publish: vec![PortMapping::identity(5000)],
            networks: vec!["net0".into()],
            restart: RestartSpec::Always,
            env_file: None,
            env: env
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            workers: None,
        }
    }

    #[test]
    fn environment_layers_apply_in_order() {
        let image = image_with_env(&[("A", "image"), ("B", "image"), ("C", "image"), ("D", "image")]);
        let def = definition(&[("B", "service"), ("C", "service"), ("D", "service")]);
        let file = vec![("C".to_string(), "file".to_string()), ("D".to_string(), "file".to_string())];
        let mut injected = BTreeMap::new();
        let _ = injected.insert("D".to_string(), "runtime".to_string());

        let env = compose_environment(&image, &def, file, injected);
        assert_eq!(env.get("A"), Some("image"));
        assert_eq!(env.get("B"), Some("service"));
        assert_eq!(env.get("C"), Some("file"));
        assert_eq!(env.get("D"), Some("runtime"));
    }

    #[test]
    fn runtime_vars_announce_address_and_factory() {
        let instance = InstanceId::new("abc");
        let factory: FactoryRef = "app:create_app".parse().expect("factory");
        let vars = RuntimeVars {
            instance: &instance,
            service: "web",
            bind: "127.0.0.1:5000".parse().expect("addr"),
            rootfs: Path::new("/r"),
            workdir: Path::new("/r/app"),
            factory: Some(&factory),
        }
        .into_map();
        assert_eq!(vars["HOST"], "127.0.0.1");
        assert_eq!(vars["PORT"], "5000");
        assert_eq!(vars[FACTORY_ENV], "app:create_app");
        assert_eq!(vars["PYTHONPATH"], format!("/r/app:/r/{DEPS_TARGET}"));
    }

    #[test]
    fn bind_address_follows_network() {
        let net = Network {
            name: "net0".into(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            driver: "bridge".into(),
        };
        assert_eq!(bind_address(Some(&net), 5000), "127.0.0.1:5000".parse().expect("addr"));
        assert_eq!(bind_address(None, 5000), "0.0.0.0:5000".parse().expect("addr"));
    }
}
