use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;

/// The largest datagram we expect from the remote device is a full Ethernet frame
pub const MIN_RECEIVE_BUFFER_SIZE: usize = 1518;

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// local address the link's UDP socket is bound to
    pub local_addr: SocketAddr,
    /// the single peer that all commands are sent to. This is fixed for the link's lifetime.
    pub remote_addr: SocketAddr,

    /// size of the (reused) receive buffer. Datagrams exceeding this size are truncated by the
    ///  OS, so this should be at least the link MTU
    pub receive_buffer_size: usize,

    /// If `true`, inbound datagrams from any address other than [LinkConfig::remote_addr] are
    ///  dropped. By default, everything arriving at the local port is treated as coming from the
    ///  peer.
    pub filter_by_source: bool,

    /// interval at which the driver polls the input device and emits commands
    pub poll_interval: Duration,
}

impl LinkConfig {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> LinkConfig {
        LinkConfig {
            local_addr,
            remote_addr,
            receive_buffer_size: MIN_RECEIVE_BUFFER_SIZE,
            filter_by_source: false,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// The remote device's well-known address on its own Wifi access point, listening on a fixed
    ///  local port
    pub fn default_ipv4() -> LinkConfig {
        LinkConfig::new(
            SocketAddr::from(([0, 0, 0, 0], 9000)),
            SocketAddr::from(([192, 168, 10, 1], 8889)),
        )
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receive_buffer_size < MIN_RECEIVE_BUFFER_SIZE {
            bail!("receive buffer size must be at least {} bytes, was {}", MIN_RECEIVE_BUFFER_SIZE, self.receive_buffer_size);
        }
        if self.local_addr.is_ipv4() != self.remote_addr.is_ipv4() {
            bail!("local address {:?} and remote address {:?} must use the same IP version", self.local_addr, self.remote_addr);
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be greater than zero");
        }

        Ok(())
    }
}
