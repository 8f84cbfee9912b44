//! Cloud-host collaborator: instance self-termination and metric
//! publication for whatever substrate the process is running on.
use async_trait::async_trait;
use cadence::{Counted, Gauged, StatsdClient};

/// Abstraction over the cloud substrate the process runs on, mirroring
/// the `CloudHost` facade of the original (there: S3/DynamoDB/CloudWatch/
/// autoscale/Route53 configured from one config block). Only the surface
/// the maintainer actually touches is kept here: can this instance be
/// scaled down, and can it report a load metric externally.
#[async_trait]
pub trait CloudHost: Send + Sync {
    /// Best-effort local (non-loopback) IPv4 address of this instance.
    fn local_ip(&self) -> Option<String>;

    /// Whether the instance is currently allowed to self-terminate.
    /// `force` bypasses any grace-period/cooldown the implementation
    /// enforces.
    async fn can_terminate(&self, force: bool) -> bool;

    /// Terminate the instance. Implementations that cannot (bare metal,
    /// local dev) should treat this as a no-op logged at warn level.
    async fn terminate_instance(&self);

    /// Publish a single named gauge/counter to whatever external metrics
    /// sink the substrate provides (CloudWatch in the original).
    fn publish_stat(&self, name: &str, value: i64, is_gauge: bool);
}

/// Default `CloudHost` for bare-metal/local deployments: never
/// terminates itself, publishes stats via the already-configured statsd
/// client instead of a cloud-specific API.
pub struct LocalCloudHost {
    statsd: StatsdClient,
}

impl LocalCloudHost {
    pub fn new(statsd: StatsdClient) -> Self {
        Self { statsd }
    }
}

#[async_trait]
impl CloudHost for LocalCloudHost {
    fn local_ip(&self) -> Option<String> {
        local_ipv4()
    }

    async fn can_terminate(&self, _force: bool) -> bool {
        false
    }

    async fn terminate_instance(&self) {
        warn!("terminate_instance requested but no cloud substrate is configured; ignoring");
    }

    fn publish_stat(&self, name: &str, value: i64, is_gauge: bool) {
        let result = if is_gauge {
            self.statsd.gauge(name, value as u64).map(|_| ())
        } else {
            self.statsd.count(name, value).map(|_| ())
        };
        if let Err(e) = result {
            warn!("Couldn't publish stat {}: {}", name, e);
        }
    }
}

/// Best-effort discovery of a non-loopback IPv4 address by opening a UDP
/// socket toward a well-known address without sending any packets, the
/// usual way to learn which local address routing would pick.
fn local_ipv4() -> Option<String> {
    use std::net::UdpSocket;

    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    socket.local_addr().ok().map(|addr| addr.ip().to_string())
}
