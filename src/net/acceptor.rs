use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::net::channel::ChannelContext;
use crate::net::connection_manager::ChannelRegistry;
use crate::net::socket_id::SocketKind;

/// Listens on one address and hands every accepted connection as an inbound channel to the
///  registry.
pub struct Acceptor {
    local_addr: SocketAddr,
    stop_signal: watch::Sender<bool>,
    ctx: Arc<ChannelContext>,
    registry: Arc<dyn ChannelRegistry>,
}

impl Acceptor {
    /// Binds `addr` and starts accepting on `io`
    pub fn start(addr: SocketAddr, ctx: Arc<ChannelContext>, registry: Arc<dyn ChannelRegistry>, io: &Handle) -> anyhow::Result<Arc<Acceptor>> {
        let listener = {
            let _guard = io.enter();
            let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            socket.listen(ctx.config.listen_backlog)?
        };
        let local_addr = listener.local_addr()?;

        let acceptor = Arc::new(Acceptor {
            local_addr,
            stop_signal: watch::channel(false).0,
            ctx,
            registry,
        });

        info!("listening on {}", local_addr);
        io.spawn(acceptor.clone().accept_loop(listener));
        Ok(acceptor)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.stop_signal.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_signal.borrow()
    }

    #[instrument(skip_all, fields(addr = %self.local_addr))]
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut stop_signal = self.stop_signal.subscribe();
        loop {
            tokio::select! {
                biased;
                _ = stop_signal.wait_for(|stopped| *stopped) => break,
                r = listener.accept() => match r {
                    Ok((stream, peer)) => {
                        debug!("accepted connection from {}", peer);
                        tokio::spawn(self.clone().on_accept(stream, peer));
                    }
                    Err(e) => {
                        if self.is_stopped() {
                            break;
                        }
                        warn!(error = ?e, "accept failed");
                    }
                }
            }
        }
        info!("stopped listening");
    }

    async fn on_accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let channel = match self.ctx.new_channel(SocketKind::Inbound, &stream) {
            Ok(channel) => channel,
            Err(e) => {
                warn!("cannot create channel for {}: {}", peer, e);
                return;
            }
        };

        if let Err(e) = self.registry.add_channel(channel.clone()).await {
            warn!(sid = %channel.sid(), "rejecting connection from {}: {}", peer, e);
            channel.stop();
            return;
        }

        if let Err(e) = channel.start(stream) {
            channel.on_error(e);
        }
    }
}
