use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::trace;

/// This is an abstraction for datagram I/O on a UDP socket, introduced to facilitate mocking
///  the I/O part away for testing.
///
/// Unlike a raw socket, errors are returned rather than logged here: the connection decides
///  what a failure means for its send and receive loops.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkSocket: Send + Sync + 'static {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl LinkSocket for UdpSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), to);
        UdpSocket::send_to(self, buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

#[async_trait]
impl LinkSocket for Arc<UdpSocket> {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        <UdpSocket as LinkSocket>::send_to(self, buf, to).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        <UdpSocket as LinkSocket>::recv_from(self, buf).await
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        <UdpSocket as LinkSocket>::local_addr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_socket_roundtrip() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let a_addr = LinkSocket::local_addr(&a).unwrap();
        let b_addr = LinkSocket::local_addr(&b).unwrap();

        let sent = LinkSocket::send_to(&a, b"takeoff", b_addr).await.unwrap();
        assert_eq!(sent, 7);

        let mut buf = [0u8; 1518];
        let (n, from) = LinkSocket::recv_from(&b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"takeoff");
        assert_eq!(from, a_addr);
    }
}
