use std::net::SocketAddr;

use tokio::sync::broadcast;
use tracing::trace;

use crate::net::socket_id::SocketId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkEvent {
    /// a channel failed and should be recycled
    TcpChannelError { sid: SocketId },
    ClientConnectSuccess { sid: SocketId, addr: SocketAddr },
    /// the connector gave up after `attempts` connection attempts
    ClientConnectFail { addr: SocketAddr, attempts: u32 },
    ChannelLoggedIn { sid: SocketId, remote_node_id: String },
}

/// Publish / subscribe bus for connection status. Publishers never block, and events are
///  dropped if there are no subscribers.
#[derive(Debug)]
pub struct NetworkEventNotifier {
    sender: broadcast::Sender<NetworkEvent>,
}

impl Default for NetworkEventNotifier {
    fn default() -> Self {
        NetworkEventNotifier::new()
    }
}

impl NetworkEventNotifier {
    pub fn new() -> NetworkEventNotifier {
        let (sender, _) = broadcast::channel(1024);

        NetworkEventNotifier {
            sender
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }

    pub fn send_event(&self, event: NetworkEvent) {
        trace!("event: {:?}", event);
        let _ = self.sender.send(event);
    }
}
