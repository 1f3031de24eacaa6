//! Host port publishing.
//!
//! When the service socket already answers on the requested host address the
//! mapping is satisfied as is. A mapping that keeps the port and names no
//! other host address is satisfied by the service socket too, whatever
//! address the network gives it. Otherwise a userspace TCP forwarder listens on
//! the host address and relays every connection to the service socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use berth_common::error::{BerthError, Result};
use berth_compose::service::PortMapping;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// An active host publication. Dropping it stops the forwarder.
#[derive(Debug)]
pub struct Publication {
    host: SocketAddr,
    target: SocketAddr,
    forwarder: Option<JoinHandle<()>>,
}

impl Publication {
    /// Returns the host address clients connect to.
    #[must_use]
    pub const fn host_addr(&self) -> SocketAddr {
        self.host
    }

    /// Returns the service address connections are relayed to.
    #[must_use]
    pub const fn target_addr(&self) -> SocketAddr {
        self.target
    }

    /// Returns whether the service socket itself satisfies the mapping.
    #[must_use]
    pub const fn is_identity(&self) -> bool {
        self.forwarder.is_none()
    }

    /// Stops forwarding.
    pub fn stop(mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
            tracing::debug!(host = %self.host, "port forwarder stopped");
        }
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }
}

/// Publishes `mapping` for a service bound on `bind`, inside `network`.
///
/// # Errors
///
/// Returns `BerthError::NetworkAttachment` if the host address cannot be
/// bound.
pub async fn publish(mapping: &PortMapping, bind: SocketAddr, network: &str) -> Result<Publication> {
    let host_ip = mapping.host_ip.unwrap_or(match bind.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    });
    let requested = SocketAddr::new(host_ip, mapping.host_port);

    let same_port = mapping.host_port == mapping.container_port;
    let covered = requested == bind
        || (same_port && bind.ip().is_unspecified())
        || (same_port && mapping.host_ip.is_none_or(|ip| ip == bind.ip()));
    if covered {
        let host = if bind.ip().is_unspecified() {
            SocketAddr::new(host_ip, bind.port())
        } else {
            bind
        };
        tracing::info!(%host, %bind, network, "published on the service socket");
        return Ok(Publication {
            host,
            target: bind,
            forwarder: None,
        });
    }

    let target = if bind.ip().is_unspecified() {
        let loopback = match bind.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(loopback, bind.port())
    } else {
        bind
    };

    let attach_err = |message: String| BerthError::NetworkAttachment {
        network: network.to_string(),
        message,
    };
    let listener = TcpListener::bind(requested)
        .await
        .map_err(|e| attach_err(format!("cannot publish {mapping} on {requested}: {e}")))?;
    let host = listener
        .local_addr()
        .map_err(|e| attach_err(format!("published socket has no address: {e}")))?;
    tracing::info!(%host, %target, network, "forwarding published port");

    let forwarder = tokio::spawn(forward(listener, target));
    Ok(Publication {
        host,
        target,
        forwarder: Some(forwarder),
    })
}

async fn forward(listener: TcpListener, target: SocketAddr) {
    loop {
        match listener.accept().await {
            Ok((mut inbound, peer)) => {
                let _ = tokio::spawn(async move {
                    let mut outbound = match TcpStream::connect(target).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            tracing::warn!(%peer, %target, error = %e, "service unreachable from forwarder");
                            return;
                        }
                    };
                    if let Err(e) = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
                        tracing::debug!(%peer, error = %e, "forwarded connection ended");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed on published port");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
