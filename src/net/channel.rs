use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use bytes::BytesMut;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, instrument, trace};

use crate::config::NetworkConfig;
use crate::error::ChannelError;
use crate::message::envelope::MessageEnvelope;
use crate::net::capability::ProtocolCapability;
use crate::net::channel_handler::ChannelHandler;
use crate::net::events::{NetworkEvent, NetworkEventNotifier};
use crate::net::io_pool::IoServicePool;
use crate::net::socket_id::{SocketId, SocketIdAllocator, SocketKind};

/// Creates the protocol handler for a channel when the channel is started
pub type HandlerFactory = Arc<dyn Fn(&Arc<SocketChannel>) -> Arc<dyn ChannelHandler> + Send + Sync>;

type SendQueue = mpsc::Receiver<Arc<MessageEnvelope>>;

/// One TCP connection.
///
/// A channel is `Active` until `stop()` is called or its I/O fails, and it never becomes
///  active again. Outgoing messages go through a bounded FIFO queue that a single writer task
///  drains, so at most one message is encoded and written at a time and the wire order is the
///  enqueue order.
///
/// While it runs, the channel's I/O task holds a strong reference to it. Failures are not
///  reported to the connection manager directly but published as
///  [`NetworkEvent::TcpChannelError`].
pub struct SocketChannel {
    sid: SocketId,
    io: Handle,
    config: Arc<NetworkConfig>,
    remote_addr: SocketAddr,
    local_addr: SocketAddr,
    stopped: AtomicBool,
    stop_signal: watch::Sender<bool>,
    send_tx: mpsc::Sender<Arc<MessageEnvelope>>,
    send_rx: Mutex<Option<SendQueue>>,
    handler: OnceLock<Arc<dyn ChannelHandler>>,
    handler_factory: HandlerFactory,
    proto_capacity: AtomicU8,
    remote_node_id: OnceLock<String>,
    events: Arc<NetworkEventNotifier>,
}

impl std::fmt::Debug for SocketChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SocketChannel{{sid:{}, remote:{}, stopped:{}}}", self.sid, self.remote_addr, self.is_stopped())
    }
}

impl SocketChannel {
    pub fn new(
        sid: SocketId,
        io: Handle,
        config: Arc<NetworkConfig>,
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        handler_factory: HandlerFactory,
        events: Arc<NetworkEventNotifier>,
    ) -> SocketChannel {
        let (send_tx, send_rx) = mpsc::channel(config.max_send_queue);
        SocketChannel {
            sid,
            io,
            config,
            remote_addr,
            local_addr,
            stopped: AtomicBool::new(false),
            stop_signal: watch::channel(false).0,
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            handler: OnceLock::new(),
            handler_factory,
            proto_capacity: AtomicU8::new(ProtocolCapability::BINARY.bits()),
            remote_node_id: OnceLock::new(),
            events,
        }
    }

    pub fn sid(&self) -> SocketId {
        self.sid
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// stopped channels and channels whose peer has not logged in yet are not ready
    pub fn is_channel_ready(&self) -> bool {
        !self.is_stopped() && self.handler.get().map(|h| h.is_logged_in()).unwrap_or(false)
    }

    pub fn proto_capacity(&self) -> ProtocolCapability {
        ProtocolCapability::from_bits_truncate(self.proto_capacity.load(Ordering::Acquire))
    }

    pub fn set_proto_capacity(&self, capability: ProtocolCapability) {
        self.proto_capacity.store(capability.bits(), Ordering::Release);
    }

    pub fn remote_node_id(&self) -> Option<&str> {
        self.remote_node_id.get().map(String::as_str)
    }

    /// The first id wins, a peer cannot change its identity
    pub fn set_remote_node_id(&self, node_id: &str) {
        if self.remote_node_id.set(node_id.to_string()).is_err() && self.remote_node_id() != Some(node_id) {
            debug!(sid = %self.sid, "ignoring change of remote node id to {}", node_id);
        }
    }

    /// Configures the socket, creates the handler and spawns the I/O task on the channel's
    ///  event loop.
    pub fn start(self: &Arc<Self>, stream: TcpStream) -> Result<(), ChannelError> {
        if self.is_stopped() {
            return Err(ChannelError::Stopped);
        }

        let socket = SockRef::from(&stream);
        socket.set_send_buffer_size(self.config.socket_buf_size)?;
        socket.set_recv_buffer_size(self.config.socket_buf_size)?;
        socket.set_keepalive(true)?;
        stream.set_nodelay(true)?;

        // the queue is only taken once the handler started, a failed start leaves the channel
        //  startable
        let mut queue = self.send_rx.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.is_none() {
            return Err(ChannelError::Handler(format!("channel {} was started twice", self.sid)));
        }

        let handler = (self.handler_factory)(self);
        handler.start()?;
        handler.on_before_msg_receive()?;

        if self.handler.set(handler.clone()).is_err() {
            return Err(ChannelError::Handler(format!("channel {} already has a handler", self.sid)));
        }
        let send_rx = queue.take()
            .ok_or_else(|| ChannelError::Handler(format!("channel {} was started twice", self.sid)))?;
        drop(queue);

        // the stream is registered with the runtime that created it, so it is moved to the
        //  channel's loop in its std form
        let stream = stream.into_std()?;
        let channel = self.clone();
        self.io.spawn(async move {
            match TcpStream::from_std(stream) {
                Ok(stream) => channel.run(stream, send_rx, handler).await,
                Err(e) => {
                    channel.on_error(e.into());
                    channel.stop();
                }
            }
        });
        Ok(())
    }

    #[instrument(skip_all, fields(sid = %self.sid, remote = %self.remote_addr))]
    async fn run(self: Arc<Self>, stream: TcpStream, send_rx: SendQueue, handler: Arc<dyn ChannelHandler>) {
        let (reader, writer) = stream.into_split();
        let mut stop_signal = self.stop_signal.subscribe();

        let result = tokio::select! {
            r = self.read_loop(reader, handler.as_ref()) => r,
            r = self.write_loop(writer, send_rx, handler.as_ref()) => r,
            r = handler.run_timers() => r,
            _ = stop_signal.wait_for(|stopped| *stopped) => Ok(()),
        };
        handler.stop();

        match result {
            Err(e) if !self.is_stopped() => self.on_error(e),
            Err(e) => debug!("error after stop: {}", e),
            Ok(()) => debug!("channel closed"),
        }
        self.stop();
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf, handler: &dyn ChannelHandler) -> Result<(), ChannelError> {
        let mut buf = BytesMut::with_capacity(self.config.recv_buf_len);
        loop {
            // reclaims the space of consumed frames before growing
            buf.reserve(self.config.recv_buf_len);
            match reader.read_buf(&mut buf).await {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(n) => trace!("received {} bytes", n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            handler.on_read(&mut buf).await?;
        }
    }

    async fn write_loop(&self, mut writer: OwnedWriteHalf, mut send_rx: SendQueue, handler: &dyn ChannelHandler) -> Result<(), ChannelError> {
        let mut send_buf = BytesMut::with_capacity(self.config.recv_buf_len);
        while let Some(msg) = send_rx.recv().await {
            send_buf.clear();
            handler.on_write(&msg, &mut send_buf)?;
            trace!(msg_name = %msg.header.msg_name, "sending {} bytes", send_buf.len());
            writer.write_all(&send_buf).await?;
            handler.on_after_msg_sent(&msg)?;
        }
        Ok(())
    }

    /// Queues `msg` for sending. Fails without blocking if the channel is stopped or its send
    ///  queue is full.
    pub fn write(&self, msg: Arc<MessageEnvelope>) -> Result<(), ChannelError> {
        if self.is_stopped() {
            return Err(ChannelError::Stopped);
        }
        self.send_tx.try_send(msg)
            .map_err(|e| match e {
                TrySendError::Full(_) => ChannelError::QueueFull { limit: self.config.max_send_queue },
                TrySendError::Closed(_) => ChannelError::Stopped,
            })
    }

    /// Returns `true` if this call stopped the channel
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(sid = %self.sid, "stopping channel");
        self.stop_signal.send_replace(true);
        true
    }

    pub fn on_error(&self, e: ChannelError) {
        error!(sid = %self.sid, remote = %self.remote_addr, "channel error: {}", e);
        self.events.send_event(NetworkEvent::TcpChannelError { sid: self.sid });
    }

    #[cfg(test)]
    pub(crate) fn take_send_queue(&self) -> Option<SendQueue> {
        self.send_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// What acceptors and connectors need to turn a TCP stream into a channel
pub struct ChannelContext {
    pub config: Arc<NetworkConfig>,
    pub sid_allocator: Arc<SocketIdAllocator>,
    pub worker_pool: Arc<IoServicePool>,
    pub events: Arc<NetworkEventNotifier>,
    pub handler_factory: HandlerFactory,
}

impl ChannelContext {
    pub fn new_channel(&self, kind: SocketKind, stream: &TcpStream) -> Result<Arc<SocketChannel>, ChannelError> {
        let io = self.worker_pool.next_handle()
            .ok_or(ChannelError::Stopped)?;

        Ok(Arc::new(SocketChannel::new(
            self.sid_allocator.alloc(kind),
            io,
            self.config.clone(),
            stream.peer_addr()?,
            stream.local_addr()?,
            self.handler_factory.clone(),
            self.events.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use crate::message::header::BaseHeader;
    use crate::net::channel_handler::{MessageSink, MockChannelHandler};
    use crate::test_util::channel::{loopback_pair, passthrough_factory, read_envelopes, test_coder};
    use crate::test_util::message::{TestMessage, TrackingMessageSink, TEST_MAGIC};

    fn channel_for(stream: &TcpStream, kind: SocketKind, config: NetworkConfig, sink: Arc<dyn MessageSink>, events: Arc<NetworkEventNotifier>) -> Arc<SocketChannel> {
        let config = Arc::new(config);
        Arc::new(SocketChannel::new(
            SocketIdAllocator::new().alloc(kind),
            Handle::current(),
            config.clone(),
            stream.peer_addr().unwrap(),
            stream.local_addr().unwrap(),
            passthrough_factory(test_coder(&config), sink),
            events,
        ))
    }

    #[tokio::test]
    async fn test_fifo_send_order() {
        let (local, mut remote) = loopback_pair().await;
        let events = Arc::new(NetworkEventNotifier::new());
        let channel = channel_for(&local, SocketKind::Outbound, NetworkConfig::new("a"), TrackingMessageSink::new(), events);

        // queued before the channel runs
        channel.write(Arc::new(TestMessage::envelope("m1", 1))).unwrap();
        channel.start(local).unwrap();
        channel.write(Arc::new(TestMessage::envelope("m2", 2))).unwrap();
        channel.write(Arc::new(TestMessage::envelope("m3", 3))).unwrap();

        let received = read_envelopes(&mut remote, &test_coder(&NetworkConfig::new("b")), 3).await;
        let texts = received.iter()
            .map(|m| m.body.app::<TestMessage>().unwrap().text.clone())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_received_messages_are_handed_to_handler() {
        let (local, mut remote) = loopback_pair().await;
        let sink = TrackingMessageSink::new();
        let channel = channel_for(&local, SocketKind::Inbound, NetworkConfig::new("a"), sink.clone(), Arc::new(NetworkEventNotifier::new()));
        channel.start(local).unwrap();
        assert!(channel.is_channel_ready());

        let coder = test_coder(&NetworkConfig::new("b"));
        let mut buf = BytesMut::new();
        for seq in 0..3 {
            coder.encode(&TestMessage::envelope("in", seq), Default::default(), &mut buf).unwrap();
        }
        // split writes exercise partial frame handling
        let (first, second) = buf.split_at(buf.len() / 2);
        remote.write_all(first).await.unwrap();
        remote.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.write_all(second).await.unwrap();

        let delivered = sink.wait_for(3, Duration::from_secs(5)).await;
        assert!(delivered.iter().all(|(_, m)| m.src_sid == Some(channel.sid())));
    }

    #[tokio::test]
    async fn test_peer_close_reports_error_and_stops() {
        let (local, remote) = loopback_pair().await;
        let events = Arc::new(NetworkEventNotifier::new());
        let mut subscription = events.subscribe();
        let channel = channel_for(&local, SocketKind::Inbound, NetworkConfig::new("a"), TrackingMessageSink::new(), events);
        channel.start(local).unwrap();

        drop(remote);

        let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv()).await.unwrap().unwrap();
        assert_eq!(event, NetworkEvent::TcpChannelError { sid: channel.sid() });
        tokio::time::timeout(Duration::from_secs(5), async {
            while !channel.is_stopped() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
        assert!(matches!(channel.write(Arc::new(TestMessage::envelope("late", 0))), Err(ChannelError::Stopped)));
    }

    #[tokio::test]
    async fn test_stop_is_final_and_not_an_error() {
        let (local, mut remote) = loopback_pair().await;
        let events = Arc::new(NetworkEventNotifier::new());
        let mut subscription = events.subscribe();
        let channel = channel_for(&local, SocketKind::Outbound, NetworkConfig::new("a"), TrackingMessageSink::new(), events);
        channel.start(local).unwrap();

        assert!(channel.stop());
        assert!(!channel.stop());
        assert!(channel.is_stopped());
        assert!(!channel.is_channel_ready());

        // the peer sees the connection closing
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), remote.read(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 0);
        assert!(subscription.try_recv().is_err());

        let (other, _other_remote) = loopback_pair().await;
        assert!(matches!(channel.start(other), Err(ChannelError::Stopped)));
    }

    #[tokio::test]
    async fn test_failed_handler_start_keeps_channel_startable() {
        let (local, _remote) = loopback_pair().await;
        let config = Arc::new(NetworkConfig::new("a"));
        let working = passthrough_factory(test_coder(&config), TrackingMessageSink::new());
        let created = AtomicUsize::new(0);
        let factory: HandlerFactory = Arc::new(move |channel| {
            if created.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut refusing = MockChannelHandler::new();
                refusing.expect_start()
                    .times(1)
                    .returning(|| Err(ChannelError::Handler("refused".to_string())));
                refusing.expect_on_before_msg_receive().never();
                Arc::new(refusing)
            }
            else {
                working(channel)
            }
        });
        let channel = Arc::new(SocketChannel::new(
            SocketIdAllocator::new().alloc(SocketKind::Outbound),
            Handle::current(),
            config,
            local.peer_addr().unwrap(),
            local.local_addr().unwrap(),
            factory,
            Arc::new(NetworkEventNotifier::new()),
        ));

        channel.write(Arc::new(TestMessage::envelope("queued", 1))).unwrap();
        assert!(matches!(channel.start(local), Err(ChannelError::Handler(msg)) if msg == "refused"));
        assert!(!channel.is_channel_ready());

        let (retry, mut retry_remote) = loopback_pair().await;
        channel.start(retry).unwrap();
        assert!(channel.is_channel_ready());

        let received = read_envelopes(&mut retry_remote, &test_coder(&NetworkConfig::new("b")), 1).await;
        assert_eq!(received[0].body.app::<TestMessage>().unwrap().text, "queued");
    }

    #[tokio::test]
    async fn test_send_queue_limit() {
        let (local, _remote) = loopback_pair().await;
        let mut config = NetworkConfig::new("a");
        config.max_send_queue = 2;
        let channel = channel_for(&local, SocketKind::Outbound, config, TrackingMessageSink::new(), Arc::new(NetworkEventNotifier::new()));

        let msg = Arc::new(MessageEnvelope::app(BaseHeader::new(TEST_MAGIC, "test_msg"), TestMessage::new("x")));
        channel.write(msg.clone()).unwrap();
        channel.write(msg.clone()).unwrap();
        assert!(matches!(channel.write(msg), Err(ChannelError::QueueFull { limit: 2 })));
    }
}
