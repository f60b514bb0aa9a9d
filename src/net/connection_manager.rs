use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::anyhow;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::ManagerError;
use crate::message::envelope::MessageEnvelope;
use crate::message::registry::MessageRegistry;
use crate::net::acceptor::Acceptor;
use crate::net::capability::ProtocolCapability;
use crate::net::channel::{ChannelContext, HandlerFactory, SocketChannel};
use crate::net::channel_handler::{HandlerContext, MessageSink, NonceFilter};
use crate::net::connector::{Connector, Dialer, TcpDialer};
use crate::net::events::{NetworkEvent, NetworkEventNotifier};
use crate::net::io_pool::IoServicePool;
use crate::net::packet_coder::PacketCoder;
use crate::net::socket_id::{SocketId, SocketIdAllocator, SocketKind};

/// A recycled channel is released once the recycle table holds the only reference to it
pub const MIN_RELEASE_CHANNEL_USE_COUNT: usize = 1;

/// What acceptors and connectors register their channels with
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelRegistry: Send + Sync {
    async fn add_channel(&self, channel: Arc<SocketChannel>) -> Result<(), ManagerError>;
    async fn release_connector(&self, addr: SocketAddr);
}

/// Acceptors and connectors outlive neither the manager nor its pools, so they refer back to
///  it weakly
struct WeakRegistry(Weak<ConnectionManager>);

#[async_trait]
impl ChannelRegistry for WeakRegistry {
    async fn add_channel(&self, channel: Arc<SocketChannel>) -> Result<(), ManagerError> {
        match self.0.upgrade() {
            Some(manager) => manager.add_channel(channel).await,
            None => Err(ManagerError::Stopped),
        }
    }

    async fn release_connector(&self, addr: SocketAddr) {
        if let Some(manager) = self.0.upgrade() {
            manager.release_connector(addr).await;
        }
    }
}

/// The registry of a node's connections: listeners, pending outbound connects, live channels
///  and channels waiting to be released after an error.
///
/// Every table has its own lock. Channels never touch the tables themselves: they report
///  failures as [`NetworkEvent::TcpChannelError`], and a listener task moves the failed
///  channel to the recycle table. A recycle timer releases recycled channels once no I/O task
///  refers to them any more.
pub struct ConnectionManager {
    config: Arc<NetworkConfig>,
    acceptor_pool: Arc<IoServicePool>,
    connector_pool: Arc<IoServicePool>,
    worker_pool: Arc<IoServicePool>,
    channel_ctx: Arc<ChannelContext>,
    registry: Arc<dyn ChannelRegistry>,
    dialer: Arc<dyn Dialer>,
    nonce_filter: Arc<NonceFilter>,
    events: Arc<NetworkEventNotifier>,
    max_inbound: usize,
    stopped: AtomicBool,
    acceptors: RwLock<FxHashMap<SocketAddr, Arc<Acceptor>>>,
    connectors: RwLock<FxHashMap<SocketAddr, Arc<Connector>>>,
    channels: RwLock<FxHashMap<SocketId, Arc<SocketChannel>>>,
    recycled: RwLock<FxHashMap<SocketId, Arc<SocketChannel>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionManager{{node_id:{}, max_inbound:{}}}", self.config.node_id, self.max_inbound)
    }
}

impl ConnectionManager {
    /// A manager whose channels run the login / keepalive session and deliver to `sink`
    pub fn new(config: NetworkConfig, messages: Arc<MessageRegistry>, sink: Arc<dyn MessageSink>) -> anyhow::Result<Arc<ConnectionManager>> {
        config.validate()?;
        let config = Arc::new(config);
        let events = Arc::new(NetworkEventNotifier::new());
        let nonce_filter = Arc::new(NonceFilter::new(config.nonce_ttl, config.max_nonce_count));

        let handler_ctx = Arc::new(HandlerContext {
            config: config.clone(),
            coder: PacketCoder::new(messages, &config),
            sink,
            nonce_filter: nonce_filter.clone(),
            events: events.clone(),
        });
        let handler_factory = handler_ctx.handler_factory();

        ConnectionManager::with_handler_factory(config, events, nonce_filter, handler_factory, Arc::new(TcpDialer))
    }

    /// A manager with custom channel handlers and outbound dialing
    pub fn with_handler_factory(
        config: Arc<NetworkConfig>,
        events: Arc<NetworkEventNotifier>,
        nonce_filter: Arc<NonceFilter>,
        handler_factory: HandlerFactory,
        dialer: Arc<dyn Dialer>,
    ) -> anyhow::Result<Arc<ConnectionManager>> {
        config.validate()?;
        let worker_pool = Arc::new(IoServicePool::new(format!("{}-worker", config.node_id), config.io_threads));
        let channel_ctx = Arc::new(ChannelContext {
            config: config.clone(),
            sid_allocator: Arc::new(SocketIdAllocator::new()),
            worker_pool: worker_pool.clone(),
            events: events.clone(),
            handler_factory,
        });
        let max_inbound = config.max_inbound_connections();
        info!("max inbound connections: {}, outbound reserve: {}", max_inbound, config.outbound_reserve);

        Ok(Arc::new_cyclic(|myself| ConnectionManager {
            acceptor_pool: Arc::new(IoServicePool::new(format!("{}-acceptor", config.node_id), 1)),
            connector_pool: Arc::new(IoServicePool::new(format!("{}-connector", config.node_id), 1)),
            worker_pool,
            channel_ctx,
            registry: Arc::new(WeakRegistry(myself.clone())),
            dialer,
            nonce_filter,
            events,
            max_inbound,
            stopped: AtomicBool::new(false),
            acceptors: Default::default(),
            connectors: Default::default(),
            channels: Default::default(),
            recycled: Default::default(),
            tasks: Default::default(),
            config,
        }))
    }

    pub fn config(&self) -> &Arc<NetworkConfig> {
        &self.config
    }

    pub fn events(&self) -> &Arc<NetworkEventNotifier> {
        &self.events
    }

    pub fn nonce_filter(&self) -> &Arc<NonceFilter> {
        &self.nonce_filter
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Starts the I/O pools, the recycling of failed channels and the recycle timer
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.is_stopped() {
            return Err(anyhow!("connection manager was stopped"));
        }
        self.worker_pool.start()?;
        self.acceptor_pool.start()?;
        self.connector_pool.start()?;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if !tasks.is_empty() {
            return Ok(());
        }
        // subscribing before spawning, so no error event is missed
        let subscription = self.events.subscribe();
        tasks.push(tokio::spawn(Self::on_channel_errors(Arc::downgrade(self), subscription)));
        tasks.push(tokio::spawn(Self::recycle_timer(Arc::downgrade(self), self.config.recycle_interval)));
        Ok(())
    }

    async fn on_channel_errors(myself: Weak<ConnectionManager>, mut events: tokio::sync::broadcast::Receiver<NetworkEvent>) {
        loop {
            let event = events.recv().await;
            let Some(manager) = myself.upgrade() else {
                return;
            };
            match event {
                Ok(NetworkEvent::TcpChannelError { sid }) => {
                    manager.recycle(sid).await;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!("missed {} network events, recycling all stopped channels", n);
                    manager.recycle_stopped().await;
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    async fn recycle_timer(myself: Weak<ConnectionManager>, recycle_interval: std::time::Duration) {
        let mut ticker = interval_at(Instant::now() + recycle_interval, recycle_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(manager) = myself.upgrade() else {
                return;
            };
            manager.sweep_recycled().await;
            manager.nonce_filter.regular_clean();
        }
    }

    /// Registers a new channel, enforcing the inbound connection limit
    pub async fn add_channel(&self, channel: Arc<SocketChannel>) -> Result<(), ManagerError> {
        if self.is_stopped() {
            return Err(ManagerError::Stopped);
        }
        let sid = channel.sid();

        let mut channels = self.channels.write().await;
        if sid.kind == SocketKind::Inbound {
            let num_inbound = channels.keys()
                .filter(|s| s.kind == SocketKind::Inbound)
                .count();
            if num_inbound >= self.max_inbound {
                return Err(ManagerError::InboundLimit { limit: self.max_inbound });
            }
        }
        match channels.entry(sid) {
            Entry::Occupied(_) => Err(ManagerError::DuplicateSocketId(sid)),
            Entry::Vacant(e) => {
                debug!(%sid, remote = %channel.remote_addr(), "registered channel");
                e.insert(channel);
                Ok(())
            }
        }
    }

    pub async fn channel(&self, sid: SocketId) -> Option<Arc<SocketChannel>> {
        self.channels.read().await
            .get(&sid)
            .cloned()
    }

    /// Stops a live channel and moves it to the recycle table
    pub async fn stop_channel(&self, sid: SocketId) -> Result<(), ManagerError> {
        if self.recycle(sid).await {
            Ok(())
        }
        else {
            Err(ManagerError::ChannelNotFound(sid))
        }
    }

    /// Returns `false` if `sid` is not a live channel, e.g. because it was recycled already
    async fn recycle(&self, sid: SocketId) -> bool {
        let Some(channel) = self.channels.write().await.remove(&sid) else {
            trace!(%sid, "channel is not live, nothing to recycle");
            return false;
        };
        channel.stop();
        debug!(%sid, "recycling channel");
        self.recycled.write().await
            .insert(sid, channel);
        true
    }

    async fn recycle_stopped(&self) {
        let stopped = self.channels.read().await
            .iter()
            .filter(|(_, ch)| ch.is_stopped())
            .map(|(sid, _)| *sid)
            .collect::<Vec<_>>();
        for sid in stopped {
            self.recycle(sid).await;
        }
    }

    /// Releases recycled channels that nothing else refers to, stopping any that still run
    async fn sweep_recycled(&self) {
        let mut recycled = self.recycled.write().await;
        recycled.retain(|sid, channel| {
            channel.stop();
            if Arc::strong_count(channel) <= MIN_RELEASE_CHANNEL_USE_COUNT {
                debug!(%sid, "released channel");
                false
            }
            else {
                true
            }
        });
    }

    pub async fn num_recycled(&self) -> usize {
        self.recycled.read().await.len()
    }

    pub async fn send_message(&self, sid: SocketId, msg: Arc<MessageEnvelope>) -> Result<(), ManagerError> {
        let channel = self.channel(sid).await
            .ok_or(ManagerError::ChannelNotFound(sid))?;
        channel.write(msg)?;
        Ok(())
    }

    /// Writes `msg` to every ready channel except `exclude`, returning the number of channels
    ///  it was queued on. Broadcasts are deduplicated by nonce, so a message without one is
    ///  rejected.
    pub async fn broadcast(&self, msg: Arc<MessageEnvelope>, exclude: Option<SocketId>) -> Result<usize, ManagerError> {
        if msg.header.nonce().is_empty() {
            error!(msg_name = %msg.header.msg_name, "refusing to broadcast a message without nonce");
            return Err(ManagerError::MissingNonce(msg.header.msg_name.clone()));
        }

        let mut num_sent = 0;
        for (sid, channel) in self.channels.read().await.iter() {
            if Some(*sid) == exclude || !channel.is_channel_ready() {
                continue;
            }
            match channel.write(msg.clone()) {
                Ok(()) => num_sent += 1,
                Err(e) => warn!(%sid, msg_name = %msg.header.msg_name, "broadcast failed: {}", e),
            }
        }

        if num_sent == 0 {
            return Err(ManagerError::NoActiveChannel);
        }
        trace!(msg_name = %msg.header.msg_name, "broadcast to {} channels", num_sent);
        Ok(num_sent)
    }

    /// Sends a response back along its path, or to `sid` if it has no path
    pub async fn send_resp_message(&self, msg: MessageEnvelope, sid: SocketId) -> Result<(), ManagerError> {
        if msg.header.nonce().is_empty() {
            error!(msg_name = %msg.header.msg_name, "refusing to send a response without nonce");
            return Err(ManagerError::MissingNonce(msg.header.msg_name.clone()));
        }

        if msg.header.path().is_empty() {
            self.send_message(sid, Arc::new(msg)).await
        }
        else {
            self.send_fast_path(msg).await
                .map(|_| ())
        }
    }

    /// Source routing towards `path[0]`: the message goes to the neighbor that appears
    ///  earliest in the path, and the path is cut before that hop. Returns the channel the
    ///  message was queued on.
    pub async fn send_fast_path(&self, mut msg: MessageEnvelope) -> Result<SocketId, ManagerError> {
        if msg.header.path().is_empty() {
            return Err(ManagerError::MissingPath(msg.header.msg_name.clone()));
        }

        let channel = {
            let channels = self.channels.read().await;
            let mut found = None;
            for (i, hop) in msg.header.path().iter().enumerate() {
                let neighbor = channels.values()
                    .find(|ch| ch.is_channel_ready() && ch.remote_node_id() == Some(hop.as_str()));
                if let Some(ch) = neighbor {
                    found = Some((i, ch.clone()));
                    break;
                }
            }
            found
        };

        let Some((hop_index, channel)) = channel else {
            debug!(msg_name = %msg.header.msg_name, path = ?msg.header.path(), "no neighbor on path");
            return Err(ManagerError::NoRoute(msg.header.msg_name.clone()));
        };

        if let Some(path) = msg.header.path.as_mut() {
            path.truncate(hop_index);
        }
        channel.write(Arc::new(msg))?;
        Ok(channel.sid())
    }

    /// Records the capability a peer announced, as `;` separated protocol names
    pub async fn set_proto_capacity(&self, sid: SocketId, capability: &str) -> Result<(), ManagerError> {
        let channel = self.channel(sid).await
            .ok_or(ManagerError::ChannelNotFound(sid))?;
        channel.set_proto_capacity(ProtocolCapability::parse(capability));
        Ok(())
    }

    pub async fn have_active_channel(&self) -> bool {
        self.channels.read().await
            .values()
            .any(|ch| ch.is_channel_ready())
    }

    pub async fn in_connection_count(&self) -> usize {
        self.connection_count(SocketKind::Inbound).await
    }

    pub async fn out_connection_count(&self) -> usize {
        self.connection_count(SocketKind::Outbound).await
    }

    async fn connection_count(&self, kind: SocketKind) -> usize {
        self.channels.read().await
            .iter()
            .filter(|(sid, ch)| sid.kind == kind && !ch.is_stopped())
            .count()
    }

    /// Starts listening on `addr`, returning the bound address
    pub async fn start_listen(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        if self.is_stopped() {
            return Err(ManagerError::Stopped.into());
        }
        let io = self.acceptor_pool.next_handle()
            .ok_or_else(|| anyhow!("connection manager is not started"))?;

        let mut acceptors = self.acceptors.write().await;
        if addr.port() != 0 && acceptors.contains_key(&addr) {
            return Err(ManagerError::Duplicate("listening", addr).into());
        }
        let acceptor = Acceptor::start(addr, self.channel_ctx.clone(), self.registry.clone(), &io)?;
        let local_addr = acceptor.local_addr();
        acceptors.insert(local_addr, acceptor);
        Ok(local_addr)
    }

    pub async fn stop_listen(&self, addr: SocketAddr) -> Result<(), ManagerError> {
        match self.acceptors.write().await.remove(&addr) {
            Some(acceptor) => {
                acceptor.stop();
                Ok(())
            }
            None => Err(ManagerError::NoListener(addr)),
        }
    }

    pub async fn start_connect(&self, addr: SocketAddr) -> Result<(), ManagerError> {
        if self.is_stopped() {
            return Err(ManagerError::Stopped);
        }
        let io = self.connector_pool.next_handle()
            .ok_or(ManagerError::Stopped)?;

        match self.connectors.write().await.entry(addr) {
            Entry::Occupied(_) => Err(ManagerError::Duplicate("connecting", addr)),
            Entry::Vacant(e) => {
                debug!("connecting to {}", addr);
                e.insert(Connector::start(addr, self.channel_ctx.clone(), self.registry.clone(), self.dialer.clone(), &io));
                Ok(())
            }
        }
    }

    pub async fn stop_connect(&self, addr: SocketAddr) -> Result<(), ManagerError> {
        match self.connectors.write().await.remove(&addr) {
            Some(connector) => {
                connector.stop();
                Ok(())
            }
            None => Err(ManagerError::NoConnector(addr)),
        }
    }

    /// Forgets the connector for `addr` once it completed, successfully or not
    pub async fn release_connector(&self, addr: SocketAddr) {
        if self.connectors.write().await.remove(&addr).is_some() {
            trace!("released connector for {}", addr);
        }
    }

    pub async fn num_connectors(&self) -> usize {
        self.connectors.read().await.len()
    }

    /// Stops listening and connecting, stops all channels and shuts down the I/O pools,
    ///  giving pending I/O a grace period to complete.
    pub async fn exit(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down connection manager");

        for (_, acceptor) in self.acceptors.write().await.drain() {
            acceptor.stop();
        }
        for (_, connector) in self.connectors.write().await.drain() {
            connector.stop();
        }
        let channels = self.channels.write().await
            .drain()
            .collect::<Vec<_>>();
        let mut recycled = self.recycled.write().await;
        for (sid, channel) in channels {
            channel.stop();
            recycled.insert(sid, channel);
        }
        drop(recycled);

        for task in self.tasks.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }

        // joining the pool threads blocks
        let pools = [self.acceptor_pool.clone(), self.connector_pool.clone(), self.worker_pool.clone()];
        if let Err(e) = tokio::task::spawn_blocking(move || pools.iter().for_each(|pool| pool.exit())).await {
            error!("error shutting down I/O pools: {}", e);
        }
        self.recycled.write().await.clear();
        info!("connection manager stopped");
    }
}
