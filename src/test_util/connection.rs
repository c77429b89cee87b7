use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::connection::transport::{read_frame, write_frame, BoxedStream, ConnectionFactory, Endpoint};
use crate::stream::frames::{Frame, HeartbeatData, LoginRequestData, LoginResponseData};
use crate::test_util::lock;

const BUFFER_SIZE: usize = 64 * 1024;
const MAX_FRAME_SIZE: usize = 64 * 1024;

struct FactoryData {
    failing: Vec<Endpoint>,
    attempts: Vec<Endpoint>,
}

/// Connects through in-memory pipes. The server side of every connection is handed to the
///  paired [FakeServer].
pub struct FakeConnectionFactory {
    inner: Mutex<FactoryData>,
    accepted: mpsc::UnboundedSender<FakeServerConnection>,
}
impl FakeConnectionFactory {
    pub fn new() -> (Arc<FakeConnectionFactory>, FakeServer) {
        let (accepted, connections) = mpsc::unbounded_channel();
        let factory = FakeConnectionFactory {
            inner: Mutex::new(FactoryData {
                failing: Vec::new(),
                attempts: Vec::new(),
            }),
            accepted,
        };
        (Arc::new(factory), FakeServer { connections })
    }

    pub fn fail_endpoint(&self, endpoint: Endpoint) {
        lock(&self.inner).failing.push(endpoint);
    }

    pub fn attempts(&self) -> Vec<Endpoint> {
        lock(&self.inner).attempts.clone()
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn connect(&self, endpoint: &Endpoint) -> anyhow::Result<BoxedStream> {
        {
            let mut inner = lock(&self.inner);
            inner.attempts.push(endpoint.clone());
            if inner.failing.contains(endpoint) {
                bail!("connection to {} refused", endpoint);
            }
        }

        let (client, server) = tokio::io::duplex(BUFFER_SIZE);
        self.accepted.send(FakeServerConnection { endpoint: endpoint.clone(), stream: server })
            .map_err(|_| anyhow!("fake server is gone"))?;
        Ok(Box::new(client) as BoxedStream)
    }
}

pub struct FakeServer {
    connections: mpsc::UnboundedReceiver<FakeServerConnection>,
}
impl FakeServer {
    /// Waits for the client's next connection. Fails if none arrives within a minute.
    pub async fn next_connection(&mut self) -> anyhow::Result<FakeServerConnection> {
        match tokio::time::timeout(Duration::from_secs(60), self.connections.recv()).await {
            Ok(Some(connection)) => Ok(connection),
            Ok(None) => bail!("connection factory was dropped"),
            Err(_) => bail!("no connection within a minute"),
        }
    }
}

/// The server end of a single connection, speaking frames
pub struct FakeServerConnection {
    pub endpoint: Endpoint,
    stream: DuplexStream,
}
impl FakeServerConnection {
    pub async fn recv(&mut self) -> anyhow::Result<Frame> {
        match read_frame(&mut self.stream, MAX_FRAME_SIZE).await? {
            Some(raw) => Frame::deser(&raw),
            None => bail!("client closed the connection"),
        }
    }

    /// Receives the next frame that is not a heartbeat ping; pings are answered on the way
    pub async fn recv_skipping_heartbeats(&mut self) -> anyhow::Result<Frame> {
        loop {
            match self.recv().await? {
                Frame::HeartbeatPing(_) => self.send(&Frame::HeartbeatAck(HeartbeatData { last_stream_id_received: 0 })).await?,
                frame => return Ok(frame),
            }
        }
    }

    pub async fn send(&mut self, frame: &Frame) -> anyhow::Result<()> {
        write_frame(&mut self.stream, &frame.ser()).await
    }

    /// Expects a login request and accepts it
    pub async fn accept_login(&mut self) -> anyhow::Result<LoginRequestData> {
        match self.recv().await? {
            Frame::LoginRequest(login) => {
                self.send(&Frame::LoginResponse(LoginResponseData {
                    error_code: 0,
                    last_stream_id_received: 1,
                    server_timestamp: 0,
                })).await?;
                Ok(login)
            }
            frame => bail!("expected a login request, got {:?}", frame),
        }
    }
}
