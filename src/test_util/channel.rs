use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;

use crate::config::NetworkConfig;
use crate::error::ChannelError;
use crate::message::envelope::MessageEnvelope;
use crate::message::registry::MessageRegistry;
use crate::net::channel::{HandlerFactory, SocketChannel};
use crate::net::channel_handler::{ChannelHandler, MessageSink};
use crate::net::events::NetworkEventNotifier;
use crate::net::packet_coder::{EncodeContext, PacketCoder};
use crate::net::socket_id::{SocketIdAllocator, SocketKind};
use crate::test_util::message::{TestMessage, TEST_MSG};

/// a coder that knows [`TestMessage`]
pub fn test_coder(config: &NetworkConfig) -> PacketCoder {
    let mut registry = MessageRegistry::new();
    registry.register::<TestMessage>(TEST_MSG)
        .expect("fresh registry");
    PacketCoder::new(Arc::new(registry), config)
}

/// Both ends of a connection over the loopback interface
pub async fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await
        .expect("bind loopback listener");
    let addr = listener.local_addr()
        .expect("listener address");
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (
        connected.expect("connect to loopback listener"),
        accepted.expect("accept loopback connection").0,
    )
}

/// A channel that is not connected to anything and never started, for tests that only need
///  its identity and send queue
pub fn detached_channel(kind: SocketKind, config: Arc<NetworkConfig>, handler_factory: HandlerFactory, events: Arc<NetworkEventNotifier>) -> Arc<SocketChannel> {
    static ALLOCATOR: std::sync::OnceLock<SocketIdAllocator> = std::sync::OnceLock::new();
    let sid = ALLOCATOR.get_or_init(SocketIdAllocator::new).alloc(kind);

    let remote_addr: SocketAddr = ([127, 0, 0, 1], 40_000 + (sid.sequence % 10_000) as u16).into();
    let local_addr: SocketAddr = ([127, 0, 0, 1], 7_000).into();
    Arc::new(SocketChannel::new(sid, Handle::current(), config, remote_addr, local_addr, handler_factory, events))
}

/// Reads and decodes frames from `stream` until `count` messages arrived
pub async fn read_envelopes(stream: &mut TcpStream, coder: &PacketCoder, count: usize) -> Vec<MessageEnvelope> {
    let mut buf = BytesMut::new();
    let mut result = Vec::new();
    while result.len() < count {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read_buf(&mut buf)).await
            .expect("timeout waiting for frames")
            .expect("read failed");
        assert!(n > 0, "connection closed after {} of {} messages", result.len(), count);
        result.extend(coder.decode_frames(&mut buf, "").expect("undecodable frame"));
    }
    result
}

/// A handler without login: the channel is ready as soon as it is started, all messages go
///  to the sink and everything is encoded with the binary protocol.
pub struct PassthroughHandler {
    coder: PacketCoder,
    sink: Arc<dyn MessageSink>,
    channel: std::sync::Weak<SocketChannel>,
}

pub fn passthrough_factory(coder: PacketCoder, sink: Arc<dyn MessageSink>) -> HandlerFactory {
    Arc::new(move |channel| Arc::new(PassthroughHandler {
        coder: coder.clone(),
        sink: sink.clone(),
        channel: Arc::downgrade(channel),
    }))
}

#[async_trait]
impl ChannelHandler for PassthroughHandler {
    fn start(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    fn stop(&self) {
    }

    fn on_before_msg_receive(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn on_read(&self, buf: &mut BytesMut) -> Result<(), ChannelError> {
        for msg in self.coder.decode_frames(buf, "")? {
            self.on_after_msg_received(msg).await?;
        }
        Ok(())
    }

    async fn on_after_msg_received(&self, mut msg: MessageEnvelope) -> Result<(), ChannelError> {
        msg.src_sid = self.channel.upgrade().map(|ch| ch.sid());
        let topic = msg.name.clone();
        self.sink.deliver(&topic, msg).await;
        Ok(())
    }

    fn on_write(&self, msg: &MessageEnvelope, out: &mut BytesMut) -> Result<(), ChannelError> {
        self.coder.encode(msg, EncodeContext::default(), out)?;
        Ok(())
    }

    fn on_after_msg_sent(&self, _msg: &MessageEnvelope) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn run_timers(&self) -> Result<(), ChannelError> {
        std::future::pending().await
    }

    fn is_logged_in(&self) -> bool {
        true
    }
}
