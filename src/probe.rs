use async_trait::async_trait;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use surge_ping::SurgeError;
use tokio::net::{self, TcpStream};
use tokio::time;
use tracing::debug;

/// Port used for the TCP fallback when ICMP sockets are not available (RFC 862 echo).
pub const ECHO_PORT: u16 = 7;

/// Decides whether a target is worth scanning at all.
///
/// Implementations must not fail: any resolution or network problem is reported as
/// `false`. Hosts that drop ICMP but accept TCP on some ports will read as unreachable.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn probe(&self, target: &str, timeout: Duration) -> bool;
}

/// Default prober: resolve the host, then send one ICMP echo request.
///
/// If the process is not permitted to open an ICMP socket, a TCP connect to the echo
/// port is used instead; an accepted or actively refused connection both count as an
/// answer. Resolution, echo and fallback together are bounded by one `timeout`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProbe;

#[async_trait]
impl Reachability for HostProbe {
    async fn probe(&self, target: &str, timeout: Duration) -> bool {
        match time::timeout(timeout, reach(target, timeout)).await {
            Ok(answered) => answered,
            Err(_) => {
                debug!(host = target, "reachability probe timed out");
                false
            }
        }
    }
}

async fn reach(target: &str, timeout: Duration) -> bool {
    let Some(ip) = resolve(target, timeout).await else {
        debug!(host = target, "could not resolve target");
        return false;
    };

    let payload = [0u8; 56];
    match time::timeout(timeout, surge_ping::ping(ip, &payload)).await {
        Ok(Ok((_packet, rtt))) => {
            debug!(%ip, ?rtt, "echo reply");
            true
        }
        Ok(Err(e)) if icmp_not_permitted(&e) => {
            debug!(%ip, "icmp not permitted ({e}), falling back to tcp echo port");
            tcp_echo_answers(ip, timeout).await
        }
        Ok(Err(e)) => {
            debug!(%ip, "icmp probe failed: {e}");
            false
        }
        Err(_) => {
            debug!(%ip, "icmp probe timed out");
            false
        }
    }
}

fn icmp_not_permitted(err: &SurgeError) -> bool {
    matches!(err, SurgeError::IOError(e) if e.kind() == ErrorKind::PermissionDenied)
}

/// Resolve a hostname or IP literal to its first address, bounded by `timeout`.
pub async fn resolve(target: &str, timeout: Duration) -> Option<IpAddr> {
    match time::timeout(timeout, net::lookup_host((target, 0))).await {
        Ok(Ok(mut addrs)) => addrs.next().map(|a| a.ip()),
        _ => None,
    }
}

async fn tcp_echo_answers(ip: IpAddr, timeout: Duration) -> bool {
    let addr = SocketAddr::new(ip, ECHO_PORT);
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => true,
        Ok(Err(e)) => e.kind() == ErrorKind::ConnectionRefused,
        Err(_) => false,
    }
}
