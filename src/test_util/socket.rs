use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::link::link_socket::LinkSocket;

type Inbound = std::io::Result<(Bytes, SocketAddr)>;

/// A [LinkSocket] that records what is sent through it and receives whatever the test injects.
///
/// Every send takes `send_delay` (tokio time, so this is instantaneous with a paused clock),
///  which gives concurrently started sends a chance to overlap. Overlaps are tracked in
///  [ScriptedSocket::max_in_flight].
pub struct ScriptedSocket {
    local_addr: SocketAddr,
    send_delay: Duration,
    sent: Mutex<Vec<(Bytes, SocketAddr)>>,
    failing_sends: Mutex<Vec<usize>>,
    num_send_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    inbound_sender: mpsc::UnboundedSender<Inbound>,
    inbound_receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>,
    num_receive_calls: AtomicUsize,
}

impl ScriptedSocket {
    pub fn new(send_delay: Duration) -> ScriptedSocket {
        let (inbound_sender, inbound_receiver) = mpsc::unbounded_channel();
        ScriptedSocket {
            local_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            send_delay,
            sent: Default::default(),
            failing_sends: Default::default(),
            num_send_calls: Default::default(),
            in_flight: Default::default(),
            max_in_flight: Default::default(),
            inbound_sender,
            inbound_receiver: tokio::sync::Mutex::new(inbound_receiver),
            num_receive_calls: Default::default(),
        }
    }

    /// makes the n-th call to `send_to` (counting from 0) fail
    pub fn fail_send(&self, n: usize) {
        self.failing_sends.lock().unwrap().push(n);
    }

    pub fn inject(&self, datagram: &[u8], from: SocketAddr) {
        let _ = self.inbound_sender.send(Ok((Bytes::copy_from_slice(datagram), from)));
    }

    pub fn inject_error(&self, kind: ErrorKind) {
        let _ = self.inbound_sender.send(Err(std::io::Error::from(kind)));
    }

    pub fn sent_payloads(&self) -> Vec<String> {
        self.sent.lock().unwrap()
            .iter()
            .map(|(buf, _)| String::from_utf8_lossy(buf).to_string())
            .collect()
    }

    pub fn sent_to(&self) -> Vec<SocketAddr> {
        self.sent.lock().unwrap()
            .iter()
            .map(|(_, to)| *to)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }

    /// number of receives that were started, including one that may be pending right now
    pub fn num_receive_calls(&self) -> usize {
        self.num_receive_calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl LinkSocket for ScriptedSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> std::io::Result<usize> {
        let n = self.num_send_calls.fetch_add(1, Ordering::AcqRel);
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::AcqRel);

        tokio::time::sleep(self.send_delay).await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);

        if self.failing_sends.lock().unwrap().contains(&n) {
            return Err(std::io::Error::new(ErrorKind::ConnectionRefused, "scripted send failure"));
        }

        self.sent.lock().unwrap()
            .push((Bytes::copy_from_slice(buf), to));
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.num_receive_calls.fetch_add(1, Ordering::AcqRel);

        let mut inbound_receiver = self.inbound_receiver.lock().await;
        match inbound_receiver.recv().await {
            Some(Ok((datagram, from))) => {
                // truncate like the OS does for datagrams exceeding the buffer
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            Some(Err(e)) => Err(e),
            None => Err(std::io::Error::from(ErrorKind::BrokenPipe)),
        }
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        Ok(self.local_addr)
    }
}
