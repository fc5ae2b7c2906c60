//! Per-connection WebSocket pumps.
//!
//! Each upgraded connection gets a reader task and a writer task. The reader
//! decodes frames and forwards events to the hub; the writer drains the
//! outbound queue, answers for keepalive, and performs the close handshake.
//! Both terminate exactly once, and the first side to die enqueues a
//! synthetic `Disconnected` for the hub.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until, timeout};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, warn};

use crate::id::Id;
use crate::protocol::{self, Incoming, Outgoing};

/// Sliding read deadline, extended only when the peer answers a ping with a
/// pong. Data frames do not count as liveness.
pub const PONG_WAIT: Duration = Duration::from_secs(20);
/// Keepalive ping interval, also the drain budget for slow write queues.
pub const PING_PERIOD: Duration = Duration::from_secs(5);
/// Per-frame write deadline.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Close-channel sentinel: the reader already observed closure, exit
/// silently.
pub const CLOSE_DONE: &str = "Read End";
/// Close reason delivered to remaining members when the owner leaves a room
/// with the close-on-owner-leave policy.
pub const CLOSE_OWNER_LEFT: &str = "Owner Left";

const UNSUPPORTED_DATA: &str = "unsupported binary message type";

/// Immutable connection snapshot shipped with every event so hub handlers
/// never touch the pump directly.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: Id,
    /// Room the client is in, cached by the writer from outbound `room`
    /// messages. Empty until the first create/join round-trips.
    pub room_id: String,
    pub authenticated: bool,
    pub username: String,
    pub addr: IpAddr,
    pub write: mpsc::Sender<Outgoing>,
    pub close: mpsc::Sender<String>,
}

/// An event paired with the snapshot of the client that produced it.
#[derive(Debug)]
pub struct ClientMessage {
    pub info: ClientInfo,
    pub incoming: Incoming,
}

struct Client {
    id: Id,
    addr: IpAddr,
    username: String,
    authenticated: bool,
    room_id: Mutex<String>,
    write: mpsc::Sender<Outgoing>,
    close: mpsc::Sender<String>,
    hub: mpsc::UnboundedSender<ClientMessage>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Client {
    fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            room_id: self.room_id.lock().unwrap().clone(),
            authenticated: self.authenticated,
            username: self.username.clone(),
            addr: self.addr,
            write: self.write.clone(),
            close: self.close.clone(),
        }
    }

    /// Idempotent teardown: wakes the reader and tells the hub the client is
    /// gone. Safe to call from either pump, in any order, any number of
    /// times.
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(client = %self.id, user = %self.username, "websocket closed");
        self.shutdown.notify_waiters();
        let _ = self.hub.send(ClientMessage {
            info: self.info(),
            incoming: Incoming::Disconnected,
        });
    }
}

/// Wraps an upgraded connection and spawns its two pump tasks.
pub fn start(
    ws: WebSocketStream<TcpStream>,
    addr: IpAddr,
    username: String,
    authenticated: bool,
    hub: mpsc::UnboundedSender<ClientMessage>,
) {
    start_with(ws, addr, username, authenticated, hub, PONG_WAIT, PING_PERIOD)
}

fn start_with(
    ws: WebSocketStream<TcpStream>,
    addr: IpAddr,
    username: String,
    authenticated: bool,
    hub: mpsc::UnboundedSender<ClientMessage>,
    pong_wait: Duration,
    ping_period: Duration,
) {
    let (sink, stream) = ws.split();
    let (write_tx, write_rx) = mpsc::channel(1);
    let (close_tx, close_rx) = mpsc::channel(1);
    let client = Arc::new(Client {
        id: Id::new(),
        addr,
        username,
        authenticated,
        room_id: Mutex::new(String::new()),
        write: write_tx,
        close: close_tx,
        hub,
        closed: AtomicBool::new(false),
        shutdown: Notify::new(),
    });
    debug!(client = %client.id, user = %client.username, "client connected");

    tokio::spawn(read_loop(stream, client.clone(), pong_wait));
    tokio::spawn(write_loop(sink, client, write_rx, close_rx, ping_period));
}

async fn read_loop(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    client: Arc<Client>,
    pong_wait: Duration,
) {
    // Only pongs extend the deadline: a connection that keeps sending data
    // but stops answering pings is dead.
    let mut deadline = Instant::now() + pong_wait;
    loop {
        if client.closed.load(Ordering::SeqCst) {
            break;
        }
        let frame = tokio::select! {
            _ = client.shutdown.notified() => break,
            _ = sleep_until(deadline) => {
                debug!(client = %client.id, "read deadline exceeded");
                break;
            }
            frame = stream.next() => frame,
        };
        let frame = match frame {
            None => break,
            Some(Err(err)) => {
                debug!(client = %client.id, %err, "read failed");
                break;
            }
            Some(Ok(frame)) => frame,
        };

        match frame {
            Message::Text(text) => match protocol::decode(text.as_str()) {
                Ok(incoming) => {
                    let _ = client.hub.send(ClientMessage {
                        info: client.info(),
                        incoming,
                    });
                }
                Err(err) => {
                    let _ = client
                        .close
                        .try_send(format!("failed to parse message: {err}"));
                    client.close();
                    return;
                }
            },
            Message::Binary(_) => {
                let _ = client.close.try_send(UNSUPPORTED_DATA.to_string());
                client.close();
                return;
            }
            Message::Close(_) => break,
            Message::Pong(_) => {
                deadline = Instant::now() + pong_wait;
            }
            // tungstenite answers pings on its own.
            Message::Ping(_) | Message::Frame(_) => {}
        }
    }

    // The socket is done; let the writer exit without a close handshake.
    let _ = client.close.try_send(CLOSE_DONE.to_string());
    client.close();
}

async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    client: Arc<Client>,
    mut write_rx: mpsc::Receiver<Outgoing>,
    mut close_rx: mpsc::Receiver<String>,
    ping_period: Duration,
) {
    let mut ping = interval(ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            reason = close_rx.recv() => {
                let reason = reason.unwrap_or_else(|| CLOSE_DONE.to_string());
                if reason != CLOSE_DONE {
                    let code = if reason == UNSUPPORTED_DATA {
                        CloseCode::Unsupported
                    } else {
                        CloseCode::Normal
                    };
                    debug!(client = %client.id, %reason, "closing connection");
                    let frame = CloseFrame { code, reason: reason.into() };
                    let _ = timeout(WRITE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await;
                }
                break;
            }
            message = write_rx.recv() => {
                let Some(message) = message else { break };
                if let Outgoing::Room(room) = &message {
                    *client.room_id.lock().unwrap() = room.id.clone();
                }
                let text = match protocol::encode(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(client = %client.id, %err, "could not encode message");
                        break;
                    }
                };
                match timeout(WRITE_TIMEOUT, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {
                        debug!(client = %client.id, event = message.type_tag(), "message sent");
                    }
                    Ok(Err(err)) => {
                        debug!(client = %client.id, %err, "write failed");
                        break;
                    }
                    Err(_) => {
                        debug!(client = %client.id, "write deadline exceeded");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let ping_frame = Message::Ping(Vec::new().into());
                match timeout(WRITE_TIMEOUT, sink.send(ping_frame)).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!(client = %client.id, "ping failed");
                        break;
                    }
                }
            }
        }
    }

    client.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    /// Long enough that the writer never pings during a test; liveness then
    /// depends entirely on the pongs the test itself sends.
    const NO_PINGS: Duration = Duration::from_secs(60);

    async fn ws_pair() -> (WebSocketStream<TcpStream>, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = async {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (ws, _) = tokio_tungstenite::client_async("ws://localhost/stream", stream)
                .await
                .unwrap();
            ws
        };
        let accept = async {
            let (stream, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(stream).await.unwrap()
        };
        tokio::join!(connect, accept)
    }

    fn pump_with_deadline(
        server: WebSocketStream<TcpStream>,
        pong_wait: Duration,
    ) -> mpsc::UnboundedReceiver<ClientMessage> {
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        start_with(
            server,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "guest".to_string(),
            false,
            hub_tx,
            pong_wait,
            NO_PINGS,
        );
        hub_rx
    }

    async fn wait_for_disconnect(hub_rx: &mut mpsc::UnboundedReceiver<ClientMessage>) {
        loop {
            let message = hub_rx.recv().await.expect("hub channel open");
            if matches!(message.incoming, Incoming::Disconnected) {
                return;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn data_frames_do_not_extend_the_read_deadline() {
        let (mut peer, server) = ws_pair().await;
        let mut hub_rx = pump_with_deadline(server, Duration::from_millis(250));

        // Stay chatty with valid frames well past the deadline, never
        // sending a pong.
        let chatter = tokio::spawn(async move {
            for _ in 0..48 {
                let text = r#"{"type":"share","payload":{}}"#;
                if peer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            peer
        });

        tokio::time::timeout(Duration::from_secs(2), wait_for_disconnect(&mut hub_rx))
            .await
            .expect("data frames alone must not keep the connection alive");
        chatter.abort();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_pongs_extend_the_read_deadline() {
        let (mut peer, server) = ws_pair().await;
        let mut hub_rx = pump_with_deadline(server, Duration::from_millis(500));

        // Several deadline windows pass while pongs keep arriving.
        for _ in 0..12 {
            peer.send(Message::Pong(Vec::new().into())).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(
            hub_rx.try_recv().is_err(),
            "ponging connection must stay alive past the deadline"
        );

        // Going silent lets the deadline fire.
        tokio::time::timeout(Duration::from_secs(3), wait_for_disconnect(&mut hub_rx))
            .await
            .expect("a connection that stops ponging must hit the read deadline");
    }
}

