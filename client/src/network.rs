//! WebSocket transport for the client.
//!
//! The connection lives on a background task that reconnects after a delay
//! whenever the link drops. The game loop talks to it through channels and
//! never blocks on the network.

use crate::config::ClientConfig;
use crate::error::ClientError;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{decode, encode, ClientPacket, Frame, ServerPacket, WireFormat};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::Message;

/// Weight of each new round-trip sample in the clock offset estimate.
const CLOCK_SMOOTHING: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Connected,
    Packet(ServerPacket),
    Disconnected { reason: String },
}

/// How a live session ended.
enum SessionEnd {
    Lost(String),
    Shutdown,
}

pub struct NetworkClient {
    outbound: mpsc::UnboundedSender<ClientPacket>,
    events: mpsc::Receiver<NetworkEvent>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl NetworkClient {
    /// Starts connecting to `url` in the background.
    pub fn spawn(url: impl Into<String>, config: &ClientConfig, format: WireFormat) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::channel(config.event_queue.max(1));
        let (status_tx, status) = watch::channel(ConnectionStatus::Connecting);

        let link = Link {
            url: url.into(),
            format,
            reconnect_delay: config.reconnect_delay,
            one_way_delay: Duration::from_millis(config.fake_latency_ms / 2),
            outbound: outbound_rx,
            events: events_tx,
            status: status_tx,
        };
        let task = tokio::spawn(link.run());

        Self {
            outbound,
            events,
            status,
            task,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Queues a packet for the current connection.
    pub fn send(&self, packet: ClientPacket) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.outbound
            .send(packet)
            .map_err(|_| ClientError::NotConnected)
    }

    /// Everything received since the last call.
    pub fn poll_events(&mut self) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Waits for the next event. `None` once the transport has stopped.
    pub async fn next_event(&mut self) -> Option<NetworkEvent> {
        self.events.recv().await
    }

    /// Closes the connection and waits for the background task.
    pub async fn shutdown(self) {
        let NetworkClient { outbound, task, .. } = self;
        drop(outbound);
        if let Err(e) = task.await {
            warn!("Network task ended abnormally: {}", e);
        }
    }
}

struct Link {
    url: String,
    format: WireFormat,
    reconnect_delay: Duration,
    one_way_delay: Duration,
    outbound: mpsc::UnboundedReceiver<ClientPacket>,
    events: mpsc::Sender<NetworkEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl Link {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            let status = if attempt == 0 {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting { attempt }
            };
            let _ = self.status.send(status);

            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    info!("Connected to {}", self.url);
                    attempt = 0;
                    // Packets queued while offline belong to the old session.
                    while self.outbound.try_recv().is_ok() {}
                    let _ = self.status.send(ConnectionStatus::Connected);
                    if self.events.send(NetworkEvent::Connected).await.is_err() {
                        break;
                    }

                    match self.session(ws).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            warn!("Connection lost: {}", reason);
                            let event = NetworkEvent::Disconnected { reason };
                            if self.events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => debug!("Connecting to {} failed: {}", self.url, e),
            }

            attempt = attempt.saturating_add(1);
            let _ = self
                .status
                .send(ConnectionStatus::Reconnecting { attempt });
            if !self.wait_before_retry().await {
                break;
            }
        }
        let _ = self.status.send(ConnectionStatus::Closed);
        info!("Network task stopped");
    }

    /// Sleeps out the reconnect delay. Returns false if the client went away.
    async fn wait_before_retry(&mut self) -> bool {
        let wake = sleep(self.reconnect_delay);
        tokio::pin!(wake);
        loop {
            tokio::select! {
                _ = &mut wake => return true,
                packet = self.outbound.recv() => {
                    if packet.is_none() {
                        return false;
                    }
                    // Offline; dropped.
                }
            }
        }
    }

    async fn session(&mut self, ws: WebSocketStream<MaybeTlsStream<TcpStream>>) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let mut uplink = DelayLine::new(self.one_way_delay);
        let mut downlink = DelayLine::new(self.one_way_delay);
        loop {
            let send_due = uplink.next_due();
            let deliver_due = downlink.next_due();
            tokio::select! {
                packet = self.outbound.recv() => {
                    let Some(packet) = packet else {
                        while let Some(message) = uplink.pop() {
                            let _ = write.send(message).await;
                        }
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    };
                    let message = match encode(&packet, self.format) {
                        Ok(Frame::Text(text)) => Message::Text(text),
                        Ok(Frame::Binary(bytes)) => Message::Binary(bytes),
                        Err(e) => {
                            warn!("Dropping unencodable packet: {}", e);
                            continue;
                        }
                    };
                    if uplink.is_immediate() {
                        if let Err(e) = write.send(message).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    } else {
                        uplink.push(message);
                    }
                }
                _ = sleep_until(send_due.unwrap_or_else(Instant::now)), if send_due.is_some() => {
                    while let Some(message) = uplink.pop_due(Instant::now()) {
                        if let Err(e) = write.send(message).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                }
                message = read.next() => {
                    let frame = match message {
                        None => return SessionEnd::Lost("connection closed".to_string()),
                        Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                        Some(Ok(Message::Text(text))) => Frame::Text(text),
                        Some(Ok(Message::Binary(bytes))) => Frame::Binary(bytes),
                        Some(Ok(Message::Close(close))) => {
                            let reason = close
                                .map(|c| c.reason.to_string())
                                .filter(|r| !r.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string());
                            return SessionEnd::Lost(reason);
                        }
                        Some(Ok(_)) => continue,
                    };
                    let packet = match decode::<ServerPacket>(&frame) {
                        Ok(packet) => packet,
                        Err(e) => {
                            warn!("Ignoring malformed server frame: {}", e);
                            continue;
                        }
                    };
                    if downlink.is_immediate() {
                        if !self.deliver(packet).await {
                            return SessionEnd::Shutdown;
                        }
                    } else {
                        downlink.push(packet);
                    }
                }
                _ = sleep_until(deliver_due.unwrap_or_else(Instant::now)), if deliver_due.is_some() => {
                    while let Some(packet) = downlink.pop_due(Instant::now()) {
                        if !self.deliver(packet).await {
                            return SessionEnd::Shutdown;
                        }
                    }
                }
            }
        }
    }

    /// Hands a packet to the game loop. Snapshots are dropped rather than
    /// waited on when the game loop falls behind, since the next one
    /// supersedes them. Returns false once nobody is listening.
    async fn deliver(&self, packet: ServerPacket) -> bool {
        match self.events.try_send(NetworkEvent::Packet(packet)) {
            Ok(()) => true,
            Err(TrySendError::Full(NetworkEvent::Packet(ServerPacket::WorldSnapshot(s)))) => {
                debug!("Event queue full, dropping snapshot for tick {}", s.tick);
                true
            }
            Err(TrySendError::Full(event)) => self.events.send(event).await.is_ok(),
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Simulated one-way latency. Every item is held for the same delay counted
/// from its own arrival, so a burst is released as a burst.
struct DelayLine<T> {
    delay: Duration,
    queue: VecDeque<(Instant, T)>,
}

impl<T> DelayLine<T> {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            queue: VecDeque::new(),
        }
    }

    fn is_immediate(&self) -> bool {
        self.delay.is_zero()
    }

    fn push(&mut self, item: T) {
        self.queue.push_back((Instant::now() + self.delay, item));
    }

    fn next_due(&self) -> Option<Instant> {
        self.queue.front().map(|(due, _)| *due)
    }

    /// The oldest item, if its delay has elapsed by `now`.
    fn pop_due(&mut self, now: Instant) -> Option<T> {
        if self.next_due()? > now {
            return None;
        }
        self.queue.pop_front().map(|(_, item)| item)
    }

    /// The oldest item regardless of its delay.
    fn pop(&mut self) -> Option<T> {
        self.queue.pop_front().map(|(_, item)| item)
    }
}

/// Estimates the offset between the local clock and the server's from
/// ping round trips.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClockSync {
    offset_ms: Option<f64>,
    latency_ms: f64,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pong received at local time `now_ms`.
    pub fn on_pong(&mut self, client_time: f64, server_time: f64, now_ms: f64) {
        let latency = ((now_ms - client_time) / 2.0).max(0.0);
        let offset = server_time - now_ms + latency;
        self.latency_ms = latency;
        self.offset_ms = Some(match self.offset_ms {
            None => offset,
            Some(previous) => previous + (offset - previous) * CLOCK_SMOOTHING,
        });
    }

    pub fn is_synced(&self) -> bool {
        self.offset_ms.is_some()
    }

    /// One-way latency of the last round trip.
    pub fn latency_ms(&self) -> f64 {
        self.latency_ms
    }

    pub fn offset_ms(&self) -> f64 {
        self.offset_ms.unwrap_or(0.0)
    }

    pub fn server_time(&self, now_ms: f64) -> f64 {
        now_ms + self.offset_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            reconnect_delay: Duration::from_millis(20),
            ..ClientConfig::default()
        }
    }

    /// Answers pings until the client closes or `close_after` pings were served.
    async fn pong_server(listener: TcpListener, close_after: Option<usize>) {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(mut ws) = accept_async(stream).await else {
                continue;
            };
            let mut served = 0;
            while let Some(Ok(message)) = ws.next().await {
                let frame = match message {
                    Message::Text(text) => Frame::Text(text),
                    Message::Binary(bytes) => Frame::Binary(bytes),
                    _ => continue,
                };
                if let Ok(ClientPacket::Ping { client_time }) = decode(&frame) {
                    let pong = ServerPacket::Pong {
                        client_time,
                        server_time: 5000.0,
                    };
                    let reply = encode(&pong, frame.format()).unwrap();
                    let reply = match reply {
                        Frame::Text(text) => Message::Text(text),
                        Frame::Binary(bytes) => Message::Binary(bytes),
                    };
                    ws.send(reply).await.unwrap();
                    served += 1;
                    if Some(served) == close_after {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }
        }
    }

    async fn expect_event(client: &mut NetworkClient) -> NetworkEvent {
        timeout(Duration::from_secs(5), client.next_event())
            .await
            .expect("timed out waiting for event")
            .expect("network task stopped")
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        for format in [WireFormat::Json, WireFormat::Binary] {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}", listener.local_addr().unwrap());
            tokio::spawn(pong_server(listener, None));

            let mut client = NetworkClient::spawn(url, &fast_config(), format);
            assert_eq!(expect_event(&mut client).await, NetworkEvent::Connected);
            assert!(client.is_connected());

            client.send(ClientPacket::Ping { client_time: 12.0 }).unwrap();
            assert_eq!(
                expect_event(&mut client).await,
                NetworkEvent::Packet(ServerPacket::Pong {
                    client_time: 12.0,
                    server_time: 5000.0
                })
            );
            client.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_fake_latency_delays_each_message_independently() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(pong_server(listener, None));

        let config = ClientConfig {
            fake_latency_ms: 200,
            ..fast_config()
        };
        let mut client = NetworkClient::spawn(url, &config, WireFormat::Json);
        assert_eq!(expect_event(&mut client).await, NetworkEvent::Connected);

        let started = std::time::Instant::now();
        for i in 0..10 {
            client.send(ClientPacket::Ping { client_time: f64::from(i) }).unwrap();
        }
        for i in 0..10 {
            assert_eq!(
                expect_event(&mut client).await,
                NetworkEvent::Packet(ServerPacket::Pong {
                    client_time: f64::from(i),
                    server_time: 5000.0
                })
            );
        }
        let elapsed = started.elapsed();
        // One 200 ms round trip for the whole burst, not one per message.
        assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1000), "{:?}", elapsed);
        client.shutdown().await;
    }

    #[test]
    fn test_delay_line_releases_in_order_once_due() {
        let mut line = DelayLine::new(Duration::from_millis(50));
        assert!(!line.is_immediate());
        line.push(1);
        line.push(2);
        let due = line.next_due().unwrap();
        assert_eq!(line.pop_due(due - Duration::from_millis(1)), None);
        assert_eq!(line.pop_due(due), Some(1));
        assert_eq!(line.pop(), Some(2));
        assert_eq!(line.next_due(), None);
    }

    #[tokio::test]
    async fn test_reconnects_after_server_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(pong_server(listener, Some(1)));

        let mut client = NetworkClient::spawn(url, &fast_config(), WireFormat::Json);
        assert_eq!(expect_event(&mut client).await, NetworkEvent::Connected);
        client.send(ClientPacket::Ping { client_time: 1.0 }).unwrap();
        assert!(matches!(
            expect_event(&mut client).await,
            NetworkEvent::Packet(ServerPacket::Pong { .. })
        ));
        assert!(matches!(
            expect_event(&mut client).await,
            NetworkEvent::Disconnected { .. }
        ));
        assert_eq!(expect_event(&mut client).await, NetworkEvent::Connected);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        // Nothing listens on this port once the listener is dropped.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let client = NetworkClient::spawn(url, &fast_config(), WireFormat::Json);
        assert!(matches!(
            client.send(ClientPacket::Disconnect),
            Err(ClientError::NotConnected)
        ));
        client.shutdown().await;
    }

    #[test]
    fn test_clock_sync_first_sample_is_exact() {
        let mut clock = ClockSync::new();
        assert!(!clock.is_synced());
        // Sent at 1000, server stamped 10050, back at 1100: 50 ms each way.
        clock.on_pong(1000.0, 10050.0, 1100.0);
        assert_eq!(clock.latency_ms(), 50.0);
        assert_eq!(clock.server_time(1100.0), 10100.0);
    }

    #[test]
    fn test_clock_sync_smooths_later_samples() {
        let mut clock = ClockSync::new();
        clock.on_pong(0.0, 1000.0, 0.0);
        clock.on_pong(0.0, 1100.0, 0.0);
        assert_approx_eq!(clock.offset_ms(), 1020.0, 1e-9);
    }
}
