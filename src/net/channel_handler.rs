use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::ChannelError;
use crate::message::control::{ControlMessage, NetworkAddress, VerReq, VerResp, CORE_VERSION, PROTOCOL_VERSION, VER_REQ, VER_RESP};
use crate::message::envelope::MessageEnvelope;
use crate::message::header::{BaseHeader, EXTEN_CAPACITY};
use crate::net::capability::ProtocolCapability;
use crate::net::channel::{HandlerFactory, SocketChannel};
use crate::net::events::{NetworkEvent, NetworkEventNotifier};
use crate::net::flow_ctrl::FlowController;
use crate::net::packet_coder::{EncodeContext, PacketCoder};
use crate::net::socket_id::{SocketId, SocketKind};

pub const MAX_REQ_PATH_LEN: usize = 100;
pub const MAX_RESP_PATH_LEN: usize = 20;

/// The application side: receives every message that passed the session checks, under the
///  name it should be dispatched by.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, topic: &str, msg: MessageEnvelope);
}

/// The protocol logic bound to one channel. The channel calls these hooks from its own
///  event loop, and never concurrently for the read or the write path.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    fn start(&self) -> Result<(), ChannelError>;
    fn stop(&self);

    fn on_before_msg_receive(&self) -> Result<(), ChannelError>;
    /// consumes all complete frames from `buf`
    async fn on_read(&self, buf: &mut BytesMut) -> Result<(), ChannelError>;
    async fn on_after_msg_received(&self, msg: MessageEnvelope) -> Result<(), ChannelError>;

    /// appends the encoded frame for `msg` to `out`
    fn on_write(&self, msg: &MessageEnvelope, out: &mut BytesMut) -> Result<(), ChannelError>;
    fn on_after_msg_sent(&self, msg: &MessageEnvelope) -> Result<(), ChannelError>;

    /// Runs the handler's timers. Returns only if a timer detects a failure, a handler
    ///  without timers never returns.
    async fn run_timers(&self) -> Result<(), ChannelError>;

    fn is_logged_in(&self) -> bool;
}

/// Remembers recently seen nonces so that broadcasts arriving over several paths are
///  delivered once.
#[derive(Debug)]
pub struct NonceFilter {
    ttl: Duration,
    max_count: usize,
    nonces: Mutex<FxHashMap<String, Instant>>,
}

impl NonceFilter {
    pub fn new(ttl: Duration, max_count: usize) -> NonceFilter {
        NonceFilter {
            ttl,
            max_count,
            nonces: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.nonces.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `nonce` was seen within the TTL, and records it either way. A full
    ///  table treats every unknown nonce as a duplicate.
    pub fn check_dup(&self, nonce: &str) -> bool {
        if nonce.is_empty() {
            return false;
        }

        let now = Instant::now();
        let mut nonces = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(seen) = nonces.get_mut(nonce) {
            let expired = now.duration_since(*seen) > self.ttl;
            *seen = now;
            return !expired;
        }

        if nonces.len() >= self.max_count {
            warn!("nonce table is full ({} entries), dropping message", nonces.len());
            return true;
        }
        nonces.insert(nonce.to_string(), now);
        false
    }

    pub fn insert_nonce(&self, nonce: &str) {
        if nonce.is_empty() {
            return;
        }
        let mut nonces = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
        if nonces.len() < self.max_count || nonces.contains_key(nonce) {
            nonces.insert(nonce.to_string(), Instant::now());
        }
    }

    pub fn regular_clean(&self) {
        let now = Instant::now();
        let mut nonces = self.nonces.lock().unwrap_or_else(PoisonError::into_inner);
        let before = nonces.len();
        nonces.retain(|_, seen| now.duration_since(*seen) <= self.ttl);
        if nonces.len() != before {
            debug!("removed {} expired nonces", before - nonces.len());
        }
    }
}

/// Everything the session handlers of one node share
pub struct HandlerContext {
    pub config: Arc<NetworkConfig>,
    pub coder: PacketCoder,
    pub sink: Arc<dyn MessageSink>,
    pub nonce_filter: Arc<NonceFilter>,
    pub events: Arc<NetworkEventNotifier>,
}

impl HandlerContext {
    pub fn handler_factory(self: &Arc<Self>) -> HandlerFactory {
        let ctx = self.clone();
        Arc::new(move |channel| Arc::new(SessionHandler::new(ctx.clone(), channel)))
    }
}

/// A request path grows by one hop per relay, so its last entry is the neighbor it came from.
pub fn is_valid_request_path(path: &[String], remote_node_id: &str, local_node_id: &str) -> bool {
    if path.is_empty() || path.len() > MAX_REQ_PATH_LEN {
        return false;
    }
    if path.last().map(String::as_str) != Some(remote_node_id) {
        return false;
    }
    if path.iter().any(|hop| hop == local_node_id) {
        return false;
    }
    has_no_adjacent_duplicates(path)
}

pub fn is_valid_response_path(path: &[String]) -> bool {
    path.len() <= MAX_RESP_PATH_LEN && has_no_adjacent_duplicates(path)
}

fn has_no_adjacent_duplicates(path: &[String]) -> bool {
    path.windows(2).all(|w| w[0] != w[1])
}

/// The login / keepalive session on top of a channel.
///
/// The connecting side sends `ver_req` and is logged in when the `ver_resp` arrives. The
///  accepting side answers `ver_req` with `ver_resp`, and is logged in once that is sent.
///  Both sides give up if the login does not complete within `wait_login_interval`. After
///  login the connecting side sends `shake_hand_req` whenever a keepalive interval passed
///  without traffic, and the accepting side drops a channel that stays silent for
///  `max_idle_shake_hands` intervals.
pub struct SessionHandler {
    ctx: Arc<HandlerContext>,
    channel: Weak<SocketChannel>,
    sid: SocketId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    login: watch::Sender<bool>,
    ver_req_sent: watch::Sender<bool>,
    ver_req_received: AtomicBool,
    has_traffic: AtomicBool,
    idle_intervals: AtomicU32,
    unanswered_shake_hands: AtomicU32,
    flow: Option<FlowController>,
}

impl SessionHandler {
    pub fn new(ctx: Arc<HandlerContext>, channel: &Arc<SocketChannel>) -> SessionHandler {
        let config = &ctx.config;
        let flow = if config.recv_speed > 0 {
            Some(FlowController::new(config.recv_speed, config.flow_cycle, config.flow_slice))
        }
        else {
            None
        };

        SessionHandler {
            sid: channel.sid(),
            local_addr: channel.local_addr(),
            remote_addr: channel.remote_addr(),
            channel: Arc::downgrade(channel),
            login: watch::channel(false).0,
            ver_req_sent: watch::channel(false).0,
            ver_req_received: AtomicBool::new(false),
            has_traffic: AtomicBool::new(false),
            idle_intervals: AtomicU32::new(0),
            unanswered_shake_hands: AtomicU32::new(0),
            flow,
            ctx,
        }
    }

    fn channel(&self) -> Result<Arc<SocketChannel>, ChannelError> {
        self.channel.upgrade()
            .ok_or(ChannelError::Stopped)
    }

    fn is_inbound(&self) -> bool {
        self.sid.kind == SocketKind::Inbound
    }

    fn send_control(&self, msg: ControlMessage) -> Result<(), ChannelError> {
        let mut envelope = MessageEnvelope::control(self.ctx.config.net_flag, msg);
        if matches!(envelope.body.control(), Some(ControlMessage::VerReq(_)) | Some(ControlMessage::VerResp(_))) {
            envelope.header.set_exten(EXTEN_CAPACITY, self.ctx.config.capability.to_string());
        }
        self.channel()?.write(Arc::new(envelope))
    }

    fn ver_req(&self) -> VerReq {
        let time_stamp = SystemTime::now().duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        VerReq {
            node_id: self.ctx.config.node_id.clone(),
            core_version: CORE_VERSION,
            protocol_version: PROTOCOL_VERSION,
            time_stamp,
            addr_me: NetworkAddress {
                ip: self.local_addr.ip().to_string(),
                port: self.local_addr.port() as i32,
            },
            addr_you: NetworkAddress {
                ip: self.remote_addr.ip().to_string(),
                port: self.remote_addr.port() as i32,
            },
            start_height: 0,
        }
    }

    fn set_logged_in(&self) -> Result<(), ChannelError> {
        if self.login.send_replace(true) {
            return Ok(());
        }
        let channel = self.channel()?;
        let remote_node_id = channel.remote_node_id().unwrap_or_default().to_string();
        info!(sid = %self.sid, remote_node_id = %remote_node_id, "logged in");
        self.ctx.events.send_event(NetworkEvent::ChannelLoggedIn { sid: self.sid, remote_node_id });
        Ok(())
    }

    fn accept_peer(&self, header: &BaseHeader, remote_node_id: &str) -> Result<(), ChannelError> {
        let channel = self.channel()?;
        channel.set_remote_node_id(remote_node_id);
        let capability = header.exten(EXTEN_CAPACITY)
            .map(ProtocolCapability::parse)
            .unwrap_or_default();
        debug!(sid = %self.sid, remote_node_id, %capability, "peer capability");
        channel.set_proto_capacity(capability);
        Ok(())
    }

    async fn on_login_message(&self, msg: MessageEnvelope) -> Result<(), ChannelError> {
        match (self.sid.kind, msg.body.control()) {
            (SocketKind::Inbound, Some(ControlMessage::VerReq(req))) => {
                if self.ver_req_received.swap(true, Ordering::AcqRel) {
                    return Err(ChannelError::Handler(format!("duplicate {} from {}", VER_REQ, self.remote_addr)));
                }
                if req.node_id == self.ctx.config.node_id {
                    return Err(ChannelError::Handler(format!("{} from {} carries my own node id", VER_REQ, self.remote_addr)));
                }
                self.accept_peer(&msg.header, &req.node_id)?;
                self.send_control(ControlMessage::VerResp(VerResp {
                    node_id: self.ctx.config.node_id.clone(),
                    core_version: CORE_VERSION,
                    protocol_version: PROTOCOL_VERSION,
                }))?;
            }
            (SocketKind::Outbound, Some(ControlMessage::VerResp(resp))) => {
                self.accept_peer(&msg.header, &resp.node_id)?;
                self.set_logged_in()?;
            }
            _ => {
                return Err(ChannelError::Handler(format!("received {} from {} before login", msg.header.msg_name, self.remote_addr)));
            }
        }
        self.publish(msg).await;
        Ok(())
    }

    fn is_valid_path(&self, header: &BaseHeader) -> bool {
        let config = &self.ctx.config;
        if config.routed_requests.contains(&header.msg_name) {
            let remote_node_id = self.channel.upgrade()
                .and_then(|ch| ch.remote_node_id().map(str::to_string))
                .unwrap_or_default();
            is_valid_request_path(header.path(), &remote_node_id, &config.node_id)
        }
        else if config.routed_responses.contains(&header.msg_name) {
            is_valid_response_path(header.path())
        }
        else {
            true
        }
    }

    async fn publish(&self, mut msg: MessageEnvelope) {
        msg.src_sid = Some(self.sid);
        let topic = msg.name.clone();
        trace!(sid = %self.sid, topic = %topic, "delivering message");
        self.ctx.sink.deliver(&topic, msg).await;
    }

    async fn wait_for_login(&self) -> Result<(), ChannelError> {
        let wait_login_interval = self.ctx.config.wait_login_interval;

        if !self.is_inbound() {
            let mut ver_req_sent = self.ver_req_sent.subscribe();
            let _ = ver_req_sent.wait_for(|sent| *sent).await;
        }

        let mut login = self.login.subscribe();
        let logged_in = timeout(wait_login_interval, login.wait_for(|logged_in| *logged_in)).await.is_ok();
        if logged_in {
            Ok(())
        }
        else {
            Err(ChannelError::Handler(format!("login with {} did not complete within {:?}", self.remote_addr, wait_login_interval)))
        }
    }

    async fn keepalive(&self) -> Result<(), ChannelError> {
        let config = &self.ctx.config;
        let interval = config.shake_hand_interval;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let had_traffic = self.has_traffic.swap(false, Ordering::AcqRel);

            if self.is_inbound() {
                if had_traffic {
                    self.idle_intervals.store(0, Ordering::Release);
                    continue;
                }
                let idle = self.idle_intervals.fetch_add(1, Ordering::AcqRel) + 1;
                debug!(sid = %self.sid, idle, "no traffic during keepalive interval");
                if idle >= config.max_idle_shake_hands {
                    return Err(ChannelError::Handler(format!("no traffic from {} for {} keepalive intervals", self.remote_addr, idle)));
                }
            }
            else {
                if had_traffic {
                    continue;
                }
                let unanswered = self.unanswered_shake_hands.fetch_add(1, Ordering::AcqRel);
                if unanswered >= config.max_idle_shake_hands {
                    return Err(ChannelError::Handler(format!("{} did not answer {} shake hands", self.remote_addr, unanswered)));
                }
                trace!(sid = %self.sid, "sending shake hand");
                self.send_control(ControlMessage::ShakeHandReq)?;
            }
        }
    }
}

#[async_trait]
impl ChannelHandler for SessionHandler {
    fn start(&self) -> Result<(), ChannelError> {
        debug!(sid = %self.sid, remote_addr = %self.remote_addr, "starting session");
        if !self.is_inbound() {
            self.send_control(ControlMessage::VerReq(self.ver_req()))?;
        }
        Ok(())
    }

    fn stop(&self) {
        debug!(sid = %self.sid, "stopping session");
    }

    fn on_before_msg_receive(&self) -> Result<(), ChannelError> {
        trace!(sid = %self.sid, "waiting for messages");
        Ok(())
    }

    async fn on_read(&self, buf: &mut BytesMut) -> Result<(), ChannelError> {
        let messages = self.ctx.coder.decode_frames(buf, &self.ctx.config.node_id)?;
        for msg in messages {
            self.on_after_msg_received(msg).await?;
        }
        Ok(())
    }

    async fn on_after_msg_received(&self, msg: MessageEnvelope) -> Result<(), ChannelError> {
        self.has_traffic.store(true, Ordering::Release);

        if !self.is_logged_in() {
            return self.on_login_message(msg).await;
        }

        match msg.body.control() {
            Some(ControlMessage::ShakeHandReq) => {
                if self.is_inbound() {
                    self.send_control(ControlMessage::ShakeHandResp)?;
                }
                return Ok(());
            }
            Some(ControlMessage::ShakeHandResp) => {
                self.unanswered_shake_hands.store(0, Ordering::Release);
                return Ok(());
            }
            Some(other) => {
                return Err(ChannelError::Handler(format!("unexpected {} from {} after login", other.name(), self.remote_addr)));
            }
            None => {}
        }

        if !self.is_valid_path(&msg.header) {
            debug!(sid = %self.sid, msg_name = %msg.header.msg_name, path = ?msg.header.path(), "dropping message with invalid path");
            return Ok(());
        }
        if self.ctx.nonce_filter.check_dup(msg.header.nonce()) {
            debug!(sid = %self.sid, msg_name = %msg.header.msg_name, nonce = msg.header.nonce(), "dropping duplicate message");
            return Ok(());
        }
        if let Some(flow) = &self.flow {
            if flow.over_speed(1) {
                info!(sid = %self.sid, msg_name = %msg.header.msg_name, "receive speed exceeded, dropping message");
                return Ok(());
            }
        }

        self.publish(msg).await;
        Ok(())
    }

    fn on_write(&self, msg: &MessageEnvelope, out: &mut BytesMut) -> Result<(), ChannelError> {
        let local = self.ctx.config.capability;
        let remote = self.channel()?.proto_capacity();
        let ctx = EncodeContext {
            proto: local.thrift_proto(remote),
            compress: local.compress_enabled(remote),
        };
        self.ctx.coder.encode(msg, ctx, out)?;
        Ok(())
    }

    fn on_after_msg_sent(&self, msg: &MessageEnvelope) -> Result<(), ChannelError> {
        self.has_traffic.store(true, Ordering::Release);
        self.ctx.nonce_filter.insert_nonce(msg.header.nonce());

        match msg.header.msg_name.as_str() {
            VER_REQ if !self.is_inbound() => {
                self.ver_req_sent.send_replace(true);
            }
            VER_RESP if self.is_inbound() => {
                self.set_logged_in()?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn run_timers(&self) -> Result<(), ChannelError> {
        let session = async {
            self.wait_for_login().await?;
            self.keepalive().await
        };

        match &self.flow {
            Some(flow) => tokio::select! {
                result = session => result,
                _ = flow.run() => Ok(()),
            },
            None => session.await,
        }
    }

    fn is_logged_in(&self) -> bool {
        *self.login.borrow()
    }
}
