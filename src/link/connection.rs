use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use crate::command::Command;
use crate::config::LinkConfig;
use crate::link::link_error::LinkError;
use crate::link::link_socket::LinkSocket;
use crate::link::observer::LinkObserver;
use crate::link::outbound_queue::OutboundQueue;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReceiveState {
    /// a receive is armed, or will be as soon as the current datagram is dispatched
    Listening,
    /// the receive loop ended because of a socket error. It is not restarted automatically.
    Stopped(String),
    /// the receive loop was stopped locally through [ConnectionActor::stop_receiving]
    Cancelled,
    /// receiving was never started
    Idle,
}

struct ReceiveStatus {
    state: ReceiveState,
    /// incremented on every (re)start, so that a loop that is on its way out does not overwrite
    ///  the state of its successor
    generation: u64,
}

/// A link to a single remote peer over one UDP socket.
///
/// Receiving and sending are two independent loops running as tokio tasks:
///  * the receive loop awaits the next datagram, hands it to the [LinkObserver] and immediately
///    waits for the next one. It ends on the first socket error.
///  * the drain loop exists only while there are payloads in the [OutboundQueue]. It sends them
///    one at a time, awaiting each send's completion before starting the next, so there is never
///    more than one send in flight and payloads go out in the order they were passed to
///    [ConnectionActor::send].
///
/// [ConnectionActor::send] itself never blocks and never fails. Errors are reported to the
///  observer asynchronously.
///
/// Dropping the actor stops the receive loop. A running drain loop finishes sending what is
///  already queued.
pub struct ConnectionActor {
    socket: Arc<dyn LinkSocket>,
    remote_addr: SocketAddr,
    receive_buffer_size: usize,
    filter_by_source: bool,
    send_queue: Arc<OutboundQueue>,
    observer: Arc<dyn LinkObserver>,
    receive_status: Arc<Mutex<ReceiveStatus>>,
    cancel_sender: broadcast::Sender<()>,
    runtime: Handle,
}

impl ConnectionActor {
    /// Binds a UDP socket to the configured local address and starts receiving right away.
    pub async fn bind(config: &LinkConfig, observer: Arc<dyn LinkObserver>) -> anyhow::Result<ConnectionActor> {
        config.validate()?;

        let socket = UdpSocket::bind(config.local_addr).await?;
        info!("bound link socket to {:?}, sending to {:?}", socket.local_addr()?, config.remote_addr);

        let actor = ConnectionActor::new(Arc::new(socket), config, observer);
        actor.start_receiving();
        Ok(actor)
    }

    /// Creates an actor around an already bound socket. Receiving is started separately through
    ///  [ConnectionActor::start_receiving].
    ///
    /// NB: This must be called from inside a tokio runtime; the actor spawns its loops there
    pub fn new(socket: Arc<dyn LinkSocket>, config: &LinkConfig, observer: Arc<dyn LinkObserver>) -> ConnectionActor {
        let (cancel_sender, _) = broadcast::channel(1);

        ConnectionActor {
            socket,
            remote_addr: config.remote_addr,
            receive_buffer_size: config.receive_buffer_size,
            filter_by_source: config.filter_by_source,
            send_queue: Default::default(),
            observer,
            receive_status: Arc::new(Mutex::new(ReceiveStatus {
                state: ReceiveState::Idle,
                generation: 0,
            })),
            cancel_sender,
            runtime: Handle::current(),
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// number of payloads that were passed to [ConnectionActor::send] and did not complete yet,
    ///  including the one currently in flight
    pub fn pending_sends(&self) -> usize {
        self.send_queue.len()
    }

    pub fn receive_state(&self) -> ReceiveState {
        lock(&self.receive_status).state.clone()
    }

    /// Queues a payload for sending. If no drain loop is active, this starts one.
    ///
    /// This can be called from any thread as long as the runtime the actor was created on is
    ///  still running.
    pub fn send(&self, payload: impl Into<Bytes>) {
        let payload = payload.into();
        trace!("queueing {:?} for {:?}", payload, self.remote_addr);

        if self.send_queue.enqueue(payload) {
            debug!("send queue was empty, starting drain loop");
            self.runtime.spawn(drain(
                self.socket.clone(),
                self.remote_addr,
                self.send_queue.clone(),
                self.observer.clone(),
            ));
        }
    }

    pub fn send_command(&self, command: &Command) {
        self.send(command.to_string());
    }

    /// (Re)starts the receive loop. This is a no-op if it is running already.
    pub fn start_receiving(&self) {
        let generation = {
            let mut status = lock(&self.receive_status);
            if status.state == ReceiveState::Listening {
                debug!("receive loop is already running");
                return;
            }
            status.state = ReceiveState::Listening;
            status.generation += 1;
            status.generation
        };

        // subscribe before spawning so that a stop request right after this call is not lost
        let cancel_receiver = self.cancel_sender.subscribe();

        self.runtime.spawn(receive_loop(ReceiveLoop {
            socket: self.socket.clone(),
            remote_addr: self.remote_addr,
            filter_by_source: self.filter_by_source,
            buffer_size: self.receive_buffer_size,
            observer: self.observer.clone(),
            receive_status: self.receive_status.clone(),
            generation,
        }, cancel_receiver));
    }

    pub fn stop_receiving(&self) {
        {
            let mut status = lock(&self.receive_status);
            if status.state != ReceiveState::Listening {
                debug!("receive loop is not running: {:?}", status.state);
                return;
            }
            status.state = ReceiveState::Cancelled;
        }

        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error canceling receive loop");
        }
    }
}

fn lock(status: &Mutex<ReceiveStatus>) -> MutexGuard<'_, ReceiveStatus> {
    status.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The drain loop: runs until the send queue is empty.
///
/// The payload being sent stays at the front of the queue until its send completed. A failed send
///  is reported and its payload dropped, and draining continues with the rest of the queue, so
///  a failure never strands queued payloads.
async fn drain(
    socket: Arc<dyn LinkSocket>,
    remote_addr: SocketAddr,
    send_queue: Arc<OutboundQueue>,
    observer: Arc<dyn LinkObserver>,
) {
    loop {
        let payload = match send_queue.front() {
            Some(payload) => payload,
            None => {
                report(observer.as_ref(), LinkError::EmptyQueueAccess);
                return;
            }
        };

        match socket.send_to(&payload, remote_addr).await {
            Ok(num_sent) => {
                trace!("sent {} bytes to {:?}: {:?}", num_sent, remote_addr, payload);
            }
            Err(e) => {
                report(observer.as_ref(), LinkError::SocketSend(e));
            }
        }

        match send_queue.complete_front() {
            Ok(true) => {}
            Ok(false) => {
                debug!("send queue is drained");
                return;
            }
            Err(e) => {
                report(observer.as_ref(), e);
                return;
            }
        }
    }
}

struct ReceiveLoop {
    socket: Arc<dyn LinkSocket>,
    remote_addr: SocketAddr,
    filter_by_source: bool,
    buffer_size: usize,
    observer: Arc<dyn LinkObserver>,
    receive_status: Arc<Mutex<ReceiveStatus>>,
    generation: u64,
}

async fn receive_loop(ctx: ReceiveLoop, mut cancel_receiver: broadcast::Receiver<()>) {
    debug!("starting receive loop #{}", ctx.generation);

    let mut buf = BytesMut::zeroed(ctx.buffer_size);
    loop {
        let received = select! {
            biased;
            _ = cancel_receiver.recv() => {
                // an explicit stop request, or the actor was dropped
                debug!("receive loop #{} cancelled", ctx.generation);
                return;
            }
            r = ctx.socket.recv_from(buf.as_mut()) => r,
        };

        match received {
            Ok((num_read, from)) => {
                if ctx.filter_by_source && from != ctx.remote_addr {
                    debug!("dropping {} bytes from unexpected source {:?}", num_read, from);
                    continue;
                }
                if from != ctx.remote_addr {
                    debug!("received datagram from {:?}, which is not the configured peer", from);
                }

                let text = String::from_utf8_lossy(&buf[..num_read]);
                trace!("received {} bytes from {:?}: {}", num_read, from, text);
                ctx.observer.on_message(&text);
            }
            Err(e) => {
                let e = LinkError::SocketReceive(e);
                let message = e.to_string();
                report(ctx.observer.as_ref(), e);

                let mut status = lock(&ctx.receive_status);
                if status.generation == ctx.generation {
                    status.state = ReceiveState::Stopped(message);
                }
                return;
            }
        }
    }
}

fn report(observer: &dyn LinkObserver, e: LinkError) {
    error!("{}", e);
    observer.on_error(e.direction(), &e.to_string());
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;
    use std::time::Duration;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use super::*;
    use crate::command::RcAxes;
    use crate::link::link_error::Direction;
    use crate::link::link_socket::MockLinkSocket;
    use crate::link::observer::MockLinkObserver;
    use crate::test_util::eventually;
    use crate::test_util::observer::RecordingObserver;
    use crate::test_util::socket::ScriptedSocket;

    fn peer() -> SocketAddr {
        SocketAddr::from(([192, 168, 10, 1], 8889))
    }

    fn config() -> LinkConfig {
        LinkConfig::new(SocketAddr::from(([0, 0, 0, 0], 9000)), peer())
    }

    fn actor(socket: Arc<ScriptedSocket>, observer: Arc<RecordingObserver>) -> ConnectionActor {
        ConnectionActor::new(socket, &config(), observer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_order() {
        let socket = Arc::new(ScriptedSocket::new(Duration::from_millis(5)));
        let observer = Arc::new(RecordingObserver::default());
        let actor = actor(socket.clone(), observer.clone());

        actor.send("command");
        actor.send("takeoff");
        actor.send("land");
        assert_eq!(actor.pending_sends(), 3);

        eventually(|| socket.sent_payloads().len() == 3).await;

        assert_eq!(socket.sent_payloads(), vec!["command", "takeoff", "land"]);
        assert!(socket.sent_to().iter().all(|a| *a == peer()));
        assert_eq!(socket.max_in_flight(), 1);
        assert_eq!(actor.pending_sends(), 0);
        assert!(observer.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight_with_sends_during_drain() {
        let socket = Arc::new(ScriptedSocket::new(Duration::from_millis(3)));
        let observer = Arc::new(RecordingObserver::default());
        let actor = actor(socket.clone(), observer.clone());

        let mut expected = Vec::new();
        for i in 0..20 {
            let msg = format!("rc {} 0 0 0", i);
            actor.send(msg.clone());
            expected.push(msg);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        eventually(|| socket.sent_payloads().len() == 20).await;
        assert_eq!(socket.sent_payloads(), expected);
        assert_eq!(socket.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_restarts_after_queue_was_empty() {
        let socket = Arc::new(ScriptedSocket::new(Duration::from_millis(1)));
        let observer = Arc::new(RecordingObserver::default());
        let actor = actor(socket.clone(), observer.clone());

        actor.send("command");
        eventually(|| actor.pending_sends() == 0).await;

        actor.send("takeoff");
        actor.send("land");
        eventually(|| actor.pending_sends() == 0).await;

        assert_eq!(socket.sent_payloads(), vec!["command", "takeoff", "land"]);
        assert_eq!(socket.max_in_flight(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_send_from_many_threads() {
        const NUM_THREADS: usize = 8;
        const NUM_PER_THREAD: usize = 200;

        let socket = Arc::new(ScriptedSocket::new(Duration::from_micros(100)));
        let observer = Arc::new(RecordingObserver::default());
        let actor = Arc::new(actor(socket.clone(), observer.clone()));

        let handles = (0..NUM_THREADS)
            .map(|t| {
                let actor = actor.clone();
                std::thread::spawn(move || {
                    for i in 0..NUM_PER_THREAD {
                        actor.send(format!("{}-{}", t, i));
                    }
                })
            })
            .collect::<Vec<_>>();
        tokio::task::spawn_blocking(move || {
            for handle in handles {
                handle.join().unwrap();
            }
        }).await.unwrap();

        tokio::time::timeout(Duration::from_secs(30), async {
            while socket.sent_payloads().len() < NUM_THREADS * NUM_PER_THREAD {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();

        let mut next_per_thread = vec![0usize; NUM_THREADS];
        for payload in socket.sent_payloads() {
            let (t, i) = payload.split_once('-').unwrap();
            let t: usize = t.parse().unwrap();
            assert_eq!(i.parse::<usize>().unwrap(), next_per_thread[t], "out of order: {}", payload);
            next_per_thread[t] += 1;
        }
        assert!(next_per_thread.iter().all(|n| *n == NUM_PER_THREAD));

        assert_eq!(socket.max_in_flight(), 1);
        assert_eq!(actor.pending_sends(), 0);
        assert!(observer.errors().is_empty());
    }

    #[tokio::test]
    async fn test_send_command() {
        let mut socket = MockLinkSocket::new();
        let mut seq = Sequence::new();
        for expected in ["takeoff", "rc 10 -5 0 100"] {
            socket.expect_send_to()
                .withf(move |buf, to| buf == expected.as_bytes() && *to == peer())
                .times(1)
                .in_sequence(&mut seq)
                .returning(|buf, _| Ok(buf.len()));
        }

        let observer = Arc::new(RecordingObserver::default());
        let actor = ConnectionActor::new(Arc::new(socket), &config(), observer.clone());

        actor.send_command(&Command::Takeoff);
        actor.send_command(&Command::Rc(RcAxes::new(10, -5, 0, 100)));

        eventually(|| actor.pending_sends() == 0).await;
        assert!(observer.errors().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_is_contained() {
        let mut socket = MockLinkSocket::new();
        let mut seq = Sequence::new();
        socket.expect_send_to()
            .withf(|buf, _| buf == b"command")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(std::io::Error::new(ErrorKind::ConnectionRefused, "refused")));
        socket.expect_send_to()
            .withf(|buf, _| buf == b"takeoff")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|buf, _| Ok(buf.len()));
        socket.expect_send_to()
            .withf(|buf, _| buf == b"land")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|buf, _| Ok(buf.len()));

        let observer = Arc::new(RecordingObserver::default());
        let actor = ConnectionActor::new(Arc::new(socket), &config(), observer.clone());

        actor.send("command");
        actor.send("takeoff");
        eventually(|| actor.pending_sends() == 0).await;

        assert_eq!(observer.errors(), vec![(Direction::Send, "error sending: refused".to_string())]);

        // a fresh handoff works just as before
        actor.send("land");
        eventually(|| actor.pending_sends() == 0).await;
        assert_eq!(observer.errors().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_mid_burst_keeps_draining() {
        let socket = Arc::new(ScriptedSocket::new(Duration::from_millis(2)));
        socket.fail_send(1);
        let observer = Arc::new(RecordingObserver::default());
        let actor = actor(socket.clone(), observer.clone());

        for msg in ["command", "takeoff", "rc 0 0 50 0", "land"] {
            actor.send(msg);
        }
        eventually(|| actor.pending_sends() == 0).await;

        assert_eq!(socket.sent_payloads(), vec!["command", "rc 0 0 50 0", "land"]);
        assert_eq!(observer.errors(), vec![(Direction::Send, "error sending: scripted send failure".to_string())]);
        assert_eq!(socket.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_rearms_after_every_datagram() {
        let socket = Arc::new(ScriptedSocket::new(Duration::ZERO));
        let observer = Arc::new(RecordingObserver::default());
        let actor = actor(socket.clone(), observer.clone());

        assert_eq!(actor.receive_state(), ReceiveState::Idle);
        actor.start_receiving();

        for n in 1..=5 {
            socket.inject(format!("ok {}", n).as_bytes(), peer());
            eventually(|| observer.messages().len() == n).await;
            eventually(|| socket.num_receive_calls() == n + 1).await;
            assert_eq!(actor.receive_state(), ReceiveState::Listening);
        }

        assert_eq!(observer.messages(), vec!["ok 1", "ok 2", "ok 3", "ok 4", "ok 5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_error_stops_loop() {
        let socket = Arc::new(ScriptedSocket::new(Duration::ZERO));
        let observer = Arc::new(RecordingObserver::default());
        let actor = actor(socket.clone(), observer.clone());
        actor.start_receiving();

        socket.inject(b"ok", peer());
        socket.inject_error(ErrorKind::ConnectionReset);
        socket.inject(b"never seen", peer());

        eventually(|| actor.receive_state() != ReceiveState::Listening).await;
        assert_eq!(actor.receive_state(), ReceiveState::Stopped("error receiving: connection reset".to_string()));
        assert_eq!(observer.messages(), vec!["ok"]);
        assert_eq!(observer.errors(), vec![(Direction::Receive, "error receiving: connection reset".to_string())]);
        assert_eq!(socket.num_receive_calls(), 2);

        // an explicit restart picks up where the old loop stopped
        actor.start_receiving();
        eventually(|| observer.messages().len() == 2).await;
        assert_eq!(observer.messages(), vec!["ok", "never seen"]);
        assert_eq!(actor.receive_state(), ReceiveState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_receiving_twice_is_noop() {
        let socket = Arc::new(ScriptedSocket::new(Duration::ZERO));
        let observer = Arc::new(RecordingObserver::default());
        let actor = actor(socket.clone(), observer.clone());

        actor.start_receiving();
        actor.start_receiving();
        eventually(|| socket.num_receive_calls() == 1).await;

        socket.inject(b"ok", peer());
        eventually(|| observer.messages().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(observer.messages(), vec!["ok"]);
        assert_eq!(socket.num_receive_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_receiving() {
        let socket = Arc::new(ScriptedSocket::new(Duration::ZERO));
        let observer = Arc::new(RecordingObserver::default());
        let actor = actor(socket.clone(), observer.clone());

        actor.start_receiving();
        socket.inject(b"before", peer());
        eventually(|| observer.messages().len() == 1).await;

        actor.stop_receiving();
        assert_eq!(actor.receive_state(), ReceiveState::Cancelled);
        tokio::time::sleep(Duration::from_millis(10)).await;

        socket.inject(b"after", peer());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(observer.messages(), vec!["before"]);

        actor.start_receiving();
        eventually(|| observer.messages().len() == 2).await;
        assert_eq!(observer.messages(), vec!["before", "after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_source_filter() {
        let socket = Arc::new(ScriptedSocket::new(Duration::ZERO));
        let observer = Arc::new(RecordingObserver::default());
        let mut config = config();
        config.filter_by_source = true;
        let actor = ConnectionActor::new(socket.clone(), &config, observer.clone());
        actor.start_receiving();

        socket.inject(b"stranger", SocketAddr::from(([10, 0, 0, 7], 8889)));
        socket.inject(b"peer", peer());

        eventually(|| observer.messages().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(observer.messages(), vec!["peer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_source_filter_by_default() {
        let socket = Arc::new(ScriptedSocket::new(Duration::ZERO));
        let observer = Arc::new(RecordingObserver::default());
        let actor = actor(socket.clone(), observer.clone());
        actor.start_receiving();

        socket.inject(b"stranger", SocketAddr::from(([10, 0, 0, 7], 8889)));
        socket.inject(b"peer", peer());

        eventually(|| observer.messages().len() == 2).await;
        assert_eq!(observer.messages(), vec!["stranger", "peer"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_surfaced_lossy() {
        let mut socket = MockLinkSocket::new();
        let mut seq = Sequence::new();
        socket.expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|buf| {
                buf[..3].copy_from_slice(&[b'o', 0xff, b'k']);
                Ok((3, peer()))
            });
        socket.expect_recv_from()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(std::io::Error::new(ErrorKind::Other, "closed")));

        let mut observer = MockLinkObserver::new();
        observer.expect_on_message()
            .with(eq("o\u{fffd}k"))
            .times(1)
            .return_const(());
        observer.expect_on_error()
            .with(eq(Direction::Receive), eq("error receiving: closed"))
            .times(1)
            .return_const(());

        let actor = ConnectionActor::new(Arc::new(socket), &config(), Arc::new(observer));
        actor.start_receiving();

        eventually(|| matches!(actor.receive_state(), ReceiveState::Stopped(_))).await;
    }
}
