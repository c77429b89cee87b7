use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::connection::backoff::{BackoffEntry, BackoffPolicy};
use crate::connection::transport::{BoxedStream, ConnectionFactory, Endpoint, RawFrame, read_frame, write_frame};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What the background connection task reports, tagged with the generation of the task
#[derive(Debug)]
pub enum ConnectionEvent {
    Connected {
        endpoint: Endpoint,
        outbound: mpsc::UnboundedSender<RawFrame>,
    },
    FrameReceived(RawFrame),
    Disconnected(String),
}

/// A [ConnectionEvent] after the manager applied it to its state
#[derive(Debug, Eq, PartialEq)]
pub enum ConnectionChange {
    Connected(Endpoint),
    FrameReceived(RawFrame),
    Disconnected(String),
}

/// Keeps a connection to one of a list of endpoints, reconnecting with backoff. The actual
///  connecting, reading and writing happen in a spawned task that reports back through
///  [ConnectionEvent]s; everything else is driven by the owner.
pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    backoff_policy: BackoffPolicy,
    stable_after: Duration,
    max_frame_size: usize,
    events: mpsc::UnboundedSender<(u64, ConnectionEvent)>,

    state: ConnectionState,
    /// incremented with every task, events of earlier tasks are stale
    generation: u64,
    current_endpoint: Option<Endpoint>,
    outbound: Option<mpsc::UnboundedSender<RawFrame>>,
    reset_signal: Option<mpsc::UnboundedSender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Events on `events` are tagged with generations above `last_generation`. Managers that
    ///  share an event channel must be created with increasing generations, see [ConnectionManager::generation].
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        backoff_policy: BackoffPolicy,
        stable_after: Duration,
        max_frame_size: usize,
        events: mpsc::UnboundedSender<(u64, ConnectionEvent)>,
        last_generation: u64,
    ) -> ConnectionManager {
        ConnectionManager {
            factory,
            backoff_policy,
            stable_after,
            max_frame_size,
            events,
            state: ConnectionState::Disconnected,
            generation: last_generation,
            current_endpoint: None,
            outbound: None,
            reset_signal: None,
            task: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn current_endpoint(&self) -> Option<&Endpoint> {
        self.current_endpoint.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Starts connecting to the endpoints, in order. Does nothing if a connection is up or in
    ///  progress already.
    pub fn connect(&mut self, endpoints: Vec<Endpoint>) {
        if self.task.is_some() {
            debug!("connection already active or in progress");
            return;
        }
        if endpoints.is_empty() {
            warn!("no endpoints to connect to");
            return;
        }

        self.generation += 1;
        self.state = ConnectionState::Connecting;
        let (reset_send, reset_recv) = mpsc::unbounded_channel();
        self.reset_signal = Some(reset_send);

        info!("connecting to {:?}", endpoints);
        self.task = Some(tokio::spawn(run_connection_loop(
            self.factory.clone(),
            endpoints,
            self.backoff_policy.clone(),
            self.stable_after,
            self.max_frame_size,
            self.generation,
            self.events.clone(),
            reset_recv,
        )));
    }

    /// Drops the current connection; the background task reconnects with backoff. Does nothing
    ///  unless connected.
    pub fn reset_connection(&mut self) {
        if self.state != ConnectionState::Connected {
            debug!("no connection to reset");
            return;
        }
        if let Some(reset) = &self.reset_signal {
            debug!("requesting connection reset");
            let _ = reset.send(());
        }
    }

    /// Returns `false` if there is no connection to send on
    pub fn send_frame(&self, frame: RawFrame) -> bool {
        match (&self.state, &self.outbound) {
            (ConnectionState::Connected, Some(outbound)) => outbound.send(frame).is_ok(),
            _ => false,
        }
    }

    /// Shuts down the connection and stops reconnecting. Calling this repeatedly is harmless.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            info!("closing connection");
            task.abort();
        }
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.current_endpoint = None;
        self.outbound = None;
        self.reset_signal = None;
    }

    pub fn on_event(&mut self, generation: u64, event: ConnectionEvent) -> Option<ConnectionChange> {
        if generation != self.generation {
            debug!("stale connection event from generation {} - ignoring", generation);
            return None;
        }

        match event {
            ConnectionEvent::Connected { endpoint, outbound } => {
                if self.state == ConnectionState::Connected {
                    warn!("connected event while connected - ignoring");
                    return None;
                }
                info!("connected to {}", endpoint);
                self.state = ConnectionState::Connected;
                self.current_endpoint = Some(endpoint.clone());
                self.outbound = Some(outbound);
                Some(ConnectionChange::Connected(endpoint))
            }
            ConnectionEvent::FrameReceived(frame) => {
                if self.state != ConnectionState::Connected {
                    return None;
                }
                Some(ConnectionChange::FrameReceived(frame))
            }
            ConnectionEvent::Disconnected(reason) => {
                if self.state != ConnectionState::Connected {
                    return None;
                }
                info!("disconnected: {}", reason);
                // the background task keeps trying
                self.state = ConnectionState::Connecting;
                self.current_endpoint = None;
                self.outbound = None;
                Some(ConnectionChange::Disconnected(reason))
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}


#[allow(clippy::too_many_arguments)]
async fn run_connection_loop(
    factory: Arc<dyn ConnectionFactory>,
    endpoints: Vec<Endpoint>,
    backoff_policy: BackoffPolicy,
    stable_after: Duration,
    max_frame_size: usize,
    generation: u64,
    events: mpsc::UnboundedSender<(u64, ConnectionEvent)>,
    mut reset_signal: mpsc::UnboundedReceiver<()>,
) {
    let mut backoff = BackoffEntry::new(backoff_policy);

    loop {
        let delay = backoff.time_until_release();
        if !delay.is_zero() {
            debug!("waiting {:?} before connecting (attempt #{})", delay, backoff.failure_count() + 1);
            sleep(delay).await;
        }

        let Some((endpoint, stream)) = connect_to_any(factory.as_ref(), &endpoints).await else {
            backoff.inform_of_request(false);
            continue;
        };
        backoff.inform_of_request(true);

        // resets requested for an earlier session must not hit this one
        while reset_signal.try_recv().is_ok() {}

        let (outbound, outbound_recv) = mpsc::unbounded_channel();
        if events.send((generation, ConnectionEvent::Connected { endpoint: endpoint.clone(), outbound })).is_err() {
            return;
        }

        let connected_at = Instant::now();
        let reason = run_session(stream, outbound_recv, &mut reset_signal, &events, generation, max_frame_size).await;
        if events.send((generation, ConnectionEvent::Disconnected(reason))).is_err() {
            return;
        }

        if connected_at.elapsed() < stable_after {
            backoff.inform_of_request(false);
        }
    }
}

async fn connect_to_any(factory: &dyn ConnectionFactory, endpoints: &[Endpoint]) -> Option<(Endpoint, BoxedStream)> {
    for endpoint in endpoints {
        match factory.connect(endpoint).await {
            Ok(stream) => return Some((endpoint.clone(), stream)),
            Err(e) => warn!("connecting to {} failed: {}", endpoint, e),
        }
    }
    None
}

/// Returns the reason why the session ended
async fn run_session(
    stream: BoxedStream,
    outbound: mpsc::UnboundedReceiver<RawFrame>,
    reset_signal: &mut mpsc::UnboundedReceiver<()>,
    events: &mpsc::UnboundedSender<(u64, ConnectionEvent)>,
    generation: u64,
    max_frame_size: usize,
) -> String {
    let (reader, writer) = tokio::io::split(stream);

    select! {
        reason = read_loop(reader, events, generation, max_frame_size) => reason,
        reason = write_loop(writer, outbound) => reason,
        _ = reset_signal.recv() => "reset requested".to_string(),
    }
}

async fn read_loop(mut reader: ReadHalf<BoxedStream>, events: &mpsc::UnboundedSender<(u64, ConnectionEvent)>, generation: u64, max_frame_size: usize) -> String {
    loop {
        match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => {
                if events.send((generation, ConnectionEvent::FrameReceived(frame))).is_err() {
                    return "event receiver dropped".to_string();
                }
            }
            Ok(None) => return "closed by peer".to_string(),
            Err(e) => return format!("read error: {}", e),
        }
    }
}

async fn write_loop(mut writer: WriteHalf<BoxedStream>, mut outbound: mpsc::UnboundedReceiver<RawFrame>) -> String {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            return format!("write error: {}", e);
        }
    }
    "outbound channel closed".to_string()
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;
    use anyhow::anyhow;
    use bytes::Bytes;
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use crate::connection::transport::MockConnectionFactory;
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            num_errors_to_ignore: 0,
            initial_delay: Duration::from_secs(1),
            multiply_factor: 2.0,
            jitter_factor: 0.0,
            maximum_delay: Duration::from_secs(10),
        }
    }

    fn endpoints() -> Vec<Endpoint> {
        vec![Endpoint::new("main", 1), Endpoint::new("fallback", 2)]
    }

    /// a factory whose connections to `failing_port` fail, and whose other connections hand out
    ///  their server side through the returned channel
    fn factory(failing_port: Option<u16>) -> (MockConnectionFactory, mpsc::UnboundedReceiver<DuplexStream>) {
        let (server_send, server_recv) = mpsc::unbounded_channel();
        let mut factory = MockConnectionFactory::new();
        factory.expect_connect()
            .returning(move |endpoint| {
                if Some(endpoint.port) == failing_port {
                    return Err(anyhow!("connection refused"));
                }
                let (client, server) = tokio::io::duplex(4096);
                let _ = server_send.send(server);
                Ok(Box::new(client) as BoxedStream)
            });
        (factory, server_recv)
    }

    async fn next_change(manager: &mut ConnectionManager, events: &mut mpsc::UnboundedReceiver<(u64, ConnectionEvent)>) -> ConnectionChange {
        loop {
            let (generation, event) = events.recv().await.unwrap();
            if let Some(change) = manager.on_event(generation, event) {
                return change;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_falls_back() {
        let (factory, mut servers) = factory(Some(1));
        let (send, mut events) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(Arc::new(factory), policy(), Duration::from_secs(60), 1024, send, 0);

        manager.connect(endpoints());
        assert_eq!(manager.state(), ConnectionState::Connecting);

        assert_eq!(next_change(&mut manager, &mut events).await, ConnectionChange::Connected(Endpoint::new("fallback", 2)));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.current_endpoint(), Some(&Endpoint::new("fallback", 2)));
        assert!(servers.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_in_both_directions() {
        let (factory, mut servers) = factory(None);
        let (send, mut events) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(Arc::new(factory), policy(), Duration::from_secs(60), 1024, send, 0);
        manager.connect(endpoints());
        next_change(&mut manager, &mut events).await;
        let mut server = servers.recv().await.unwrap();

        assert!(manager.send_frame(RawFrame::new(8, Bytes::from_static(b"up"))));
        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), Some(RawFrame::new(8, Bytes::from_static(b"up"))));

        write_frame(&mut server, &RawFrame::new(3, Bytes::from_static(b"down"))).await.unwrap();
        assert_eq!(next_change(&mut manager, &mut events).await, ConnectionChange::FrameReceived(RawFrame::new(3, Bytes::from_static(b"down"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_disconnect() {
        let (factory, mut servers) = factory(None);
        let (send, mut events) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(Arc::new(factory), policy(), Duration::from_secs(60), 1024, send, 0);
        manager.connect(endpoints());
        next_change(&mut manager, &mut events).await;

        drop(servers.recv().await.unwrap());
        assert_eq!(next_change(&mut manager, &mut events).await, ConnectionChange::Disconnected("closed by peer".to_string()));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(!manager.send_frame(RawFrame::new(0, Bytes::new())));

        let before = Instant::now();
        assert_eq!(next_change(&mut manager, &mut events).await, ConnectionChange::Connected(Endpoint::new("main", 1)));
        // the connection broke down quickly, so reconnecting is subject to backoff
        assert!(before.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_connection() {
        let (factory, mut servers) = factory(None);
        let (send, mut events) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(Arc::new(factory), policy(), Duration::from_secs(60), 1024, send, 0);
        manager.connect(endpoints());
        next_change(&mut manager, &mut events).await;
        let _server = servers.recv().await.unwrap();

        manager.reset_connection();
        assert_eq!(next_change(&mut manager, &mut events).await, ConnectionChange::Disconnected("reset requested".to_string()));
        assert!(matches!(next_change(&mut manager, &mut events).await, ConnectionChange::Connected(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_discards_late_events() {
        let (factory, mut servers) = factory(None);
        let (send, mut events) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(Arc::new(factory), policy(), Duration::from_secs(60), 1024, send, 0);
        manager.connect(endpoints());
        let (generation, event) = events.recv().await.unwrap();

        manager.close();
        manager.close();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.on_event(generation, event), None);
        drop(servers);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_after_disconnect_spares_next_session() {
        let (factory, mut servers) = factory(None);
        let (send, mut events) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(Arc::new(factory), policy(), Duration::from_secs(60), 1024, send, 0);
        manager.connect(endpoints());
        next_change(&mut manager, &mut events).await;

        drop(servers.recv().await.unwrap());
        assert_eq!(next_change(&mut manager, &mut events).await, ConnectionChange::Disconnected("closed by peer".to_string()));
        manager.reset_connection();

        assert!(matches!(next_change(&mut manager, &mut events).await, ConnectionChange::Connected(_)));
        let _server = servers.recv().await.unwrap();
        sleep(Duration::from_secs(5)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_of_previous_manager_are_stale() {
        let (factory, _servers) = factory(None);
        let factory = Arc::new(factory);
        let (send, mut events) = mpsc::unbounded_channel();

        let mut first = ConnectionManager::new(factory.clone(), policy(), Duration::from_secs(60), 1024, send.clone(), 0);
        first.connect(endpoints());
        let (generation, stale) = events.recv().await.unwrap();
        first.close();
        let last_generation = first.generation();
        drop(first);

        let mut second = ConnectionManager::new(factory, policy(), Duration::from_secs(60), 1024, send, last_generation);
        second.connect(endpoints());
        assert_eq!(second.on_event(generation, stale), None);
        assert!(matches!(next_change(&mut second, &mut events).await, ConnectionChange::Connected(_)));
        assert!(generation < second.generation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_endpoints_failing_backs_off() {
        let mut factory = MockConnectionFactory::new();
        factory.expect_connect()
            .times(4)
            .returning(|_| Err(anyhow!("connection refused")));
        let (send, _events) = mpsc::unbounded_channel();
        let mut manager = ConnectionManager::new(Arc::new(factory), policy(), Duration::from_secs(60), 1024, send, 0);

        manager.connect(endpoints());
        // first round immediately, second round after 1s backoff
        sleep(Duration::from_millis(1500)).await;
        manager.close();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
