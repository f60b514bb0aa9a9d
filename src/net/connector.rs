use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::net::channel::ChannelContext;
use crate::net::connection_manager::ChannelRegistry;
use crate::net::events::NetworkEvent;
use crate::net::socket_id::SocketKind;

/// `base * 2^retries`, saturating instead of overflowing
fn backoff_delay(base: Duration, retries: u32) -> Duration {
    base.saturating_mul(1u32.checked_shl(retries).unwrap_or(u32::MAX))
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

#[derive(Debug, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        TcpStream::connect(addr).await
    }
}

/// One outbound connection attempt. Failed attempts are retried after
///  `reconnect_interval * 2^n` for the n-th retry, up to `max_reconnect_times` retries.
///  The connector is released from the registry when it is done, successful or not.
pub struct Connector {
    addr: SocketAddr,
    stop_signal: watch::Sender<bool>,
    ctx: Arc<ChannelContext>,
    registry: Arc<dyn ChannelRegistry>,
    dialer: Arc<dyn Dialer>,
}

impl Connector {
    pub fn start(addr: SocketAddr, ctx: Arc<ChannelContext>, registry: Arc<dyn ChannelRegistry>, dialer: Arc<dyn Dialer>, io: &Handle) -> Arc<Connector> {
        let connector = Arc::new(Connector {
            addr,
            stop_signal: watch::channel(false).0,
            ctx,
            registry,
            dialer,
        });
        io.spawn(connector.clone().run());
        connector
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// cancels a pending attempt or retry
    pub fn stop(&self) {
        self.stop_signal.send_replace(true);
    }

    #[instrument(skip_all, fields(addr = %self.addr))]
    async fn run(self: Arc<Self>) {
        let config = self.ctx.config.clone();
        let mut stop_signal = self.stop_signal.subscribe();
        let mut retries = 0u32;

        loop {
            let dialed = tokio::select! {
                biased;
                _ = stop_signal.wait_for(|stopped| *stopped) => {
                    debug!("connect cancelled");
                    return;
                }
                r = self.dialer.dial(self.addr) => r,
            };

            match dialed {
                Ok(stream) => {
                    self.on_connected(stream).await;
                    return;
                }
                Err(e) => {
                    if retries >= config.max_reconnect_times {
                        warn!(error = ?e, "giving up after {} attempts", retries + 1);
                        self.ctx.events.send_event(NetworkEvent::ClientConnectFail { addr: self.addr, attempts: retries + 1 });
                        self.registry.release_connector(self.addr).await;
                        return;
                    }

                    retries += 1;
                    let delay = backoff_delay(config.reconnect_interval, retries);
                    debug!(error = ?e, "connect failed, retry #{} in {:?}", retries, delay);

                    tokio::select! {
                        biased;
                        _ = stop_signal.wait_for(|stopped| *stopped) => {
                            debug!("connect cancelled");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn on_connected(&self, stream: TcpStream) {
        let channel = match self.ctx.new_channel(SocketKind::Outbound, &stream) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("cannot create channel: {}", e);
                self.ctx.events.send_event(NetworkEvent::ClientConnectFail { addr: self.addr, attempts: 1 });
                self.registry.release_connector(self.addr).await;
                return;
            }
        };
        let sid = channel.sid();

        if let Err(e) = self.registry.add_channel(channel.clone()).await {
            warn!(%sid, "dropping new connection: {}", e);
            channel.stop();
            self.registry.release_connector(self.addr).await;
            return;
        }

        info!(%sid, "connected");
        self.ctx.events.send_event(NetworkEvent::ClientConnectSuccess { sid, addr: self.addr });
        if let Err(e) = channel.start(stream) {
            channel.on_error(e);
        }
        self.registry.release_connector(self.addr).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use rstest::rstest;
    use tokio::net::TcpListener;
    use tokio::time::Instant;
    use crate::config::NetworkConfig;
    use crate::net::connection_manager::MockChannelRegistry;
    use crate::net::events::NetworkEventNotifier;
    use crate::net::io_pool::IoServicePool;
    use crate::net::socket_id::SocketIdAllocator;
    use crate::test_util::channel::{passthrough_factory, test_coder};
    use crate::test_util::message::TrackingMessageSink;

    fn context(config: NetworkConfig, worker_pool: Arc<IoServicePool>) -> Arc<ChannelContext> {
        let config = Arc::new(config);
        Arc::new(ChannelContext {
            handler_factory: passthrough_factory(test_coder(&config), TrackingMessageSink::new()),
            config,
            sid_allocator: Arc::new(SocketIdAllocator::new()),
            worker_pool,
            events: Arc::new(NetworkEventNotifier::new()),
        })
    }

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "refused")
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_gives_up() {
        let mut config = NetworkConfig::new("connector");
        config.reconnect_interval = Duration::from_secs(1);
        config.max_reconnect_times = 2;
        let ctx = context(config, Arc::new(IoServicePool::new("unused", 1)));
        let mut events = ctx.events.subscribe();

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let mut dialer = MockDialer::new();
        let recorded = attempts.clone();
        dialer.expect_dial()
            .times(3)
            .returning(move |_| {
                recorded.lock().unwrap().push(Instant::now());
                Err(refused())
            });

        let (released_tx, released_rx) = tokio::sync::oneshot::channel();
        let mut released_tx = Some(released_tx);
        let mut registry = MockChannelRegistry::new();
        registry.expect_add_channel().never();
        registry.expect_release_connector()
            .times(1)
            .returning(move |_| {
                if let Some(tx) = released_tx.take() {
                    let _ = tx.send(());
                }
            });

        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let started = Instant::now();
        let _connector = Connector::start(addr, ctx.clone(), Arc::new(registry), Arc::new(dialer), &Handle::current());
        released_rx.await.unwrap();

        let offsets = attempts.lock().unwrap().iter()
            .map(|t| t.duration_since(started))
            .collect::<Vec<_>>();
        assert_eq!(offsets, vec![Duration::ZERO, Duration::from_secs(2), Duration::from_secs(6)]);

        assert_eq!(events.try_recv().unwrap(), NetworkEvent::ClientConnectFail { addr, attempts: 3 });
        assert!(events.try_recv().is_err());
    }

    #[rstest]
    #[case::first(1, Duration::from_secs(2))]
    #[case::tenth(10, Duration::from_secs(1024))]
    #[case::shift_overflow(40, Duration::from_secs(u32::MAX as u64))]
    #[case::max_retries(u32::MAX, Duration::from_secs(u32::MAX as u64))]
    fn test_backoff_delay(#[case] retries: u32, #[case] expected: Duration) {
        assert_eq!(backoff_delay(Duration::from_secs(1), retries), expected);
    }

    #[test]
    fn test_backoff_delay_saturates_duration() {
        assert_eq!(backoff_delay(Duration::MAX, 3), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_many_retries_still_give_up_and_release() {
        let mut config = NetworkConfig::new("connector");
        config.reconnect_interval = Duration::from_nanos(1);
        config.max_reconnect_times = 40;
        let ctx = context(config, Arc::new(IoServicePool::new("unused", 1)));
        let mut events = ctx.events.subscribe();

        let mut dialer = MockDialer::new();
        dialer.expect_dial()
            .times(41)
            .returning(|_| Err(refused()));

        let (released_tx, released_rx) = tokio::sync::oneshot::channel();
        let mut released_tx = Some(released_tx);
        let mut registry = MockChannelRegistry::new();
        registry.expect_add_channel().never();
        registry.expect_release_connector()
            .times(1)
            .returning(move |_| {
                if let Some(tx) = released_tx.take() {
                    let _ = tx.send(());
                }
            });

        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let _connector = Connector::start(addr, ctx.clone(), Arc::new(registry), Arc::new(dialer), &Handle::current());
        tokio::time::timeout(Duration::from_secs(3600), released_rx).await.unwrap().unwrap();

        assert_eq!(events.try_recv().unwrap(), NetworkEvent::ClientConnectFail { addr, attempts: 41 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_retry() {
        let mut config = NetworkConfig::new("connector");
        config.reconnect_interval = Duration::from_secs(1);
        let ctx = context(config, Arc::new(IoServicePool::new("unused", 1)));
        let mut events = ctx.events.subscribe();

        let mut dialer = MockDialer::new();
        dialer.expect_dial()
            .times(1)
            .returning(|_| Err(refused()));
        let mut registry = MockChannelRegistry::new();
        registry.expect_release_connector().never();

        let connector = Connector::start("127.0.0.1:1".parse().unwrap(), ctx, Arc::new(registry), Arc::new(dialer), &Handle::current());
        tokio::time::sleep(Duration::from_millis(500)).await;
        connector.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_registers_outbound_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let worker_pool = Arc::new(IoServicePool::new("test-connector", 1));
        worker_pool.start().unwrap();
        let ctx = context(NetworkConfig::new("connector"), worker_pool);
        let mut events = ctx.events.subscribe();

        let (released_tx, released_rx) = tokio::sync::oneshot::channel();
        let mut released_tx = Some(released_tx);
        let mut registry = MockChannelRegistry::new();
        registry.expect_add_channel()
            .times(1)
            .withf(|ch| ch.sid().kind == SocketKind::Outbound)
            .returning(|_| Ok(()));
        registry.expect_release_connector()
            .times(1)
            .returning(move |_| {
                if let Some(tx) = released_tx.take() {
                    let _ = tx.send(());
                }
            });

        let _connector = Connector::start(addr, ctx, Arc::new(registry), Arc::new(TcpDialer), &Handle::current());
        let (_accepted, _) = listener.accept().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), released_rx).await.unwrap().unwrap();

        match events.try_recv().unwrap() {
            NetworkEvent::ClientConnectSuccess { sid, addr: connected } => {
                assert_eq!(sid.kind, SocketKind::Outbound);
                assert_eq!(connected, addr);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
