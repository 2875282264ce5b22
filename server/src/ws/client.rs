//! One physical WebSocket connection.
//!
//! Each connection runs two tasks: a write pump that owns the socket sink and
//! drains a bounded outbound queue, and a read pump that feeds inbound frames
//! to a [`MessageHandler`]. Everything else writes by enqueueing with
//! [`Client::try_send`], which never blocks.

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::protocol::{Frame, MESSAGES_DROPPED};
use crate::repo::UserId;

pub type ClientId = u64;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;
const WRITE_WAIT: Duration = Duration::from_secs(10);
const PONG_WAIT: Duration = Duration::from_secs(60);
/// Must be shorter than `PONG_WAIT` so the peer's read deadline keeps moving.
const PING_PERIOD: Duration = Duration::from_secs(54);

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Handles inbound frames for one kind of socket (chat, game, video...).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, client: &Arc<Client>, raw: &[u8]);
}

/// Handler for sockets that only receive.
pub struct IgnoreInbound;

#[async_trait]
impl MessageHandler for IgnoreInbound {
    async fn on_message(&self, client: &Arc<Client>, _raw: &[u8]) {
        tracing::trace!(user_id = client.user_id(), "Ignoring inbound frame");
    }
}

/// The hub a client is registered with.
pub trait ClientRegistry: Send + Sync {
    fn name(&self) -> &'static str;
    fn unregister_client(&self, client: &Arc<Client>);
}

pub struct Client {
    id: ClientId,
    user_id: UserId,
    hub: &'static str,
    tx: Mutex<Option<mpsc::Sender<Frame>>>,
    dropped: Arc<AtomicBool>,
    done: CancellationToken,
}

/// Receiving half of a client's queue, owned by the write pump. A pending
/// `messages_dropped` notice is handed out before the next queued frame.
pub struct Outbound {
    rx: mpsc::Receiver<Frame>,
    dropped: Arc<AtomicBool>,
}

impl Outbound {
    pub async fn recv(&mut self) -> Option<Frame> {
        if let Some(notice) = self.take_notice() {
            return Some(notice);
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Frame> {
        self.take_notice().or_else(|| self.rx.try_recv().ok())
    }

    fn take_notice(&self) -> Option<Frame> {
        self.dropped
            .swap(false, Ordering::SeqCst)
            .then(|| Frame::from_static(MESSAGES_DROPPED))
    }
}

impl Client {
    pub fn new(user_id: UserId, hub: &'static str, capacity: usize) -> (Arc<Self>, Outbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicBool::new(false));
        let client = Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            hub,
            tx: Mutex::new(Some(tx)),
            dropped: dropped.clone(),
            done: CancellationToken::new(),
        });
        (client, Outbound { rx, dropped })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Enqueue a frame without waiting. On a full queue the frame is dropped
    /// and a single `messages_dropped` notice is owed to the peer.
    pub fn try_send(&self, frame: Frame) -> bool {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    client_id = self.id,
                    user_id = self.user_id,
                    hub = self.hub,
                    "Outbound queue full, dropping message"
                );
                self.dropped.store(true, Ordering::SeqCst);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Close the outbound queue. The write pump flushes what is queued, sends
    /// a close frame and exits.
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    /// Resolves once the write pump has exited.
    pub async fn closed(&self) {
        self.done.cancelled().await
    }

    pub fn has_exited(&self) -> bool {
        self.done.is_cancelled()
    }

    pub async fn write_pump<S>(&self, mut sink: S, mut outbound: Outbound)
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
    {
        let start = tokio::time::Instant::now() + PING_PERIOD;
        let mut ping = tokio::time::interval_at(start, PING_PERIOD);

        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = send_with_deadline(&mut sink, Message::Text(frame)).await {
                            tracing::debug!(client_id = self.id, user_id = self.user_id, error = %e, "Write failed");
                            break;
                        }
                    }
                    None => {
                        let close = Message::Close(Some(CloseFrame {
                            code: close_code::AWAY,
                            reason: "connection closed by server".into(),
                        }));
                        let _ = send_with_deadline(&mut sink, close).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if let Err(e) = send_with_deadline(&mut sink, Message::Ping(Bytes::new())).await {
                        tracing::debug!(client_id = self.id, user_id = self.user_id, error = %e, "Ping failed");
                        break;
                    }
                }
            }
        }

        self.close();
        self.done.cancel();
    }

    pub async fn read_pump<St, E>(self: &Arc<Self>, mut stream: St, handler: &dyn MessageHandler)
    where
        St: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        loop {
            let next = tokio::select! {
                _ = self.done.cancelled() => break,
                next = tokio::time::timeout(PONG_WAIT, stream.next()) => next,
            };

            let msg = match next {
                Err(_) => {
                    tracing::debug!(client_id = self.id, user_id = self.user_id, "Read deadline exceeded");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(client_id = self.id, user_id = self.user_id, error = %e, "Read failed");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            match msg {
                Message::Text(text) => self.dispatch(handler, text.as_bytes()).await,
                Message::Binary(data) => self.dispatch(handler, &data).await,
                Message::Close(frame) => {
                    tracing::debug!(client_id = self.id, user_id = self.user_id, ?frame, "Peer closed");
                    break;
                }
                // Pongs only move the read deadline; pings are answered by the socket.
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, handler: &dyn MessageHandler, raw: &[u8]) {
        if raw.len() > MAX_MESSAGE_SIZE {
            tracing::warn!(
                client_id = self.id,
                user_id = self.user_id,
                size = raw.len(),
                "Ignoring oversized frame"
            );
            return;
        }
        handler.on_message(self, raw).await;
    }
}

async fn send_with_deadline<S>(sink: &mut S, msg: Message) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(WRITE_WAIT, sink.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}

/// Drive one connection to completion: spawn the write pump, run the read
/// pump, then unregister from `registry` and wait for the writer.
pub async fn serve<R>(
    socket: WebSocket,
    client: Arc<Client>,
    outbound: Outbound,
    handler: Arc<dyn MessageHandler>,
    registry: Arc<R>,
) where
    R: ClientRegistry + ?Sized,
{
    let (sink, stream) = socket.split();
    tracing::info!(
        client_id = client.id(),
        user_id = client.user_id(),
        hub = registry.name(),
        "WebSocket connected"
    );

    let writer = {
        let client = client.clone();
        tokio::spawn(async move { client.write_pump(sink, outbound).await })
    };

    client.read_pump(stream, handler.as_ref()).await;

    registry.unregister_client(&client);
    client.close();

    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITE_WAIT, writer).await.is_err() {
        tracing::warn!(client_id = client.id(), "Write pump did not exit in time, aborting");
        abort.abort();
    }

    tracing::info!(
        client_id = client.id(),
        user_id = client.user_id(),
        hub = registry.name(),
        "WebSocket disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::Mutex as StdMutex;
    use tokio_util::sync::PollSender;

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn on_message(&self, _client: &Arc<Client>, raw: &[u8]) {
            self.seen.lock().unwrap().push(raw.to_vec());
        }
    }

    #[test]
    fn full_queue_drops_and_reports() {
        let (client, mut outbound) = Client::new(1, "test", 2);

        assert!(client.try_send(Frame::from("a".to_string())));
        assert!(client.try_send(Frame::from("b".to_string())));
        assert!(!client.try_send(Frame::from("c".to_string())));
        assert!(!client.try_send(Frame::from("d".to_string())));

        assert_eq!(outbound.try_recv().unwrap().as_str(), MESSAGES_DROPPED);
        assert_eq!(outbound.try_recv().unwrap().as_str(), "a");
        assert_eq!(outbound.try_recv().unwrap().as_str(), "b");
        assert!(outbound.try_recv().is_none());
    }

    #[tokio::test]
    async fn write_pump_delivers_the_drop_notice() {
        let (client, outbound) = Client::new(1, "test", 1);
        let (tx, mut rx) = mpsc::channel::<Message>(8);

        assert!(client.try_send(Frame::from("kept".to_string())));
        assert!(!client.try_send(Frame::from("lost".to_string())));
        client.close();
        client.write_pump(PollSender::new(tx), outbound).await;

        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t.as_str() == MESSAGES_DROPPED));
        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t.as_str() == "kept"));
        assert!(matches!(rx.recv().await, Some(Message::Close(Some(_)))));
    }

    #[test]
    fn try_send_fails_after_close() {
        let (client, _outbound) = Client::new(1, "test", 4);
        client.close();
        client.close();
        assert!(client.is_closed());
        assert!(!client.try_send(Frame::from("late".to_string())));
    }

    #[tokio::test]
    async fn write_pump_flushes_then_sends_close() {
        let (client, outbound) = Client::new(1, "test", 8);
        let (tx, mut rx) = mpsc::channel::<Message>(8);

        client.try_send(Frame::from("one".to_string()));
        client.try_send(Frame::from("two".to_string()));
        client.close();
        client.write_pump(PollSender::new(tx), outbound).await;

        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t.as_str() == "one"));
        assert!(matches!(rx.recv().await, Some(Message::Text(t)) if t.as_str() == "two"));
        assert!(matches!(rx.recv().await, Some(Message::Close(Some(_)))));

        tokio::time::timeout(Duration::from_millis(100), client.closed())
            .await
            .expect("closed() should resolve after the write pump exits");
    }

    #[tokio::test]
    async fn read_pump_dispatches_in_order_and_skips_oversized() {
        let (client, _outbound) = Client::new(1, "test", 8);
        let recorder = Recorder::default();
        let frames = vec![
            Ok::<_, std::io::Error>(Message::Text("first".into())),
            Ok(Message::Binary(Bytes::from(vec![b'x'; MAX_MESSAGE_SIZE + 1]))),
            Ok(Message::Text("second".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text("after close".into())),
        ];

        client.read_pump(stream::iter(frames), &recorder).await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[b"first".to_vec(), b"second".to_vec()]);
    }
}
