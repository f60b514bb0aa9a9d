use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use clap::Parser;
use clap_derive::Parser;
use tokio::select;
use tracing::{info, warn, Level};

use nodewire::codec::{required, Protocol, TType, ThriftStruct};
use nodewire::config::NetworkConfig;
use nodewire::error::CodecError;
use nodewire::message::create_nonce;
use nodewire::message::envelope::MessageEnvelope;
use nodewire::message::header::BaseHeader;
use nodewire::message::registry::MessageRegistry;
use nodewire::net::channel_handler::MessageSink;
use nodewire::net::connection_manager::ConnectionManager;
use nodewire::net::events::NetworkEvent;

const CHAT_MSG: &str = "chat_msg";

/// `struct chat_msg { 1: required string from, 2: required string text }`
#[derive(Debug, Clone)]
struct ChatMessage {
    from: String,
    text: String,
}

impl ThriftStruct for ChatMessage {
    fn write(&self, proto: &mut dyn Protocol) -> Result<(), CodecError> {
        proto.write_struct_begin(CHAT_MSG)?;
        proto.write_field_begin("from", TType::String, 1)?;
        proto.write_string(&self.from)?;
        proto.write_field_end()?;
        proto.write_field_begin("text", TType::String, 2)?;
        proto.write_string(&self.text)?;
        proto.write_field_end()?;
        proto.write_field_stop()?;
        proto.write_struct_end()
    }

    fn read(proto: &mut dyn Protocol) -> Result<ChatMessage, CodecError> {
        let mut from = None;
        let mut text = None;
        proto.read_struct_begin()?;
        loop {
            let field = proto.read_field_begin()?;
            match (field.id, field.field_type) {
                (_, TType::Stop) => break,
                (1, TType::String) => from = Some(proto.read_string()?),
                (2, TType::String) => text = Some(proto.read_string()?),
                (_, t) => proto.skip(t)?,
            }
            proto.read_field_end()?;
        }
        proto.read_struct_end()?;
        Ok(ChatMessage {
            from: required(from, CHAT_MSG, "from")?,
            text: required(text, CHAT_MSG, "text")?,
        })
    }
}

struct LoggingSink;

#[async_trait]
impl MessageSink for LoggingSink {
    async fn deliver(&self, topic: &str, msg: MessageEnvelope) {
        match msg.body.app::<ChatMessage>() {
            Some(chat) => info!("{} says '{}' (via {:?})", chat.from, chat.text, msg.src_sid),
            None => info!("received {} from {:?}", topic, msg.src_sid),
        }
    }
}

#[derive(Parser)]
struct Args {
    node_id: String,
    listen_address: String,

    #[clap(long)]
    peer: Vec<String>,

    #[clap(long, default_value_t = 5)]
    broadcast_interval_secs: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_ids(true)
        .try_init()
        .ok();

    if args.broadcast_interval_secs == 0 {
        return Err(anyhow!("broadcast interval must be positive"));
    }

    let mut peers = Vec::new();
    for s in &args.peer {
        let peer: SocketAddr = s.parse()?;
        peers.push(peer);
    }

    let mut messages = MessageRegistry::new();
    messages.register::<ChatMessage>(CHAT_MSG)?;

    let config = NetworkConfig::new(args.node_id.clone());
    let manager = ConnectionManager::new(config, Arc::new(messages), Arc::new(LoggingSink))?;
    manager.start().await?;

    let listen_addr = manager.start_listen(args.listen_address.parse()?).await?;
    info!("node {} listening on {}", args.node_id, listen_addr);
    for peer in peers {
        manager.start_connect(peer).await?;
    }

    select! {
        _ = log_events(manager.clone()) => {}
        _ = broadcast_loop(manager.clone(), args.node_id, Duration::from_secs(args.broadcast_interval_secs)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    manager.exit().await;
    Ok(())
}

async fn log_events(manager: Arc<ConnectionManager>) {
    let mut events = manager.events().subscribe();
    while let Ok(event) = events.recv().await {
        match event {
            NetworkEvent::ChannelLoggedIn { sid, remote_node_id } => info!("{} logged in on {}", remote_node_id, sid),
            NetworkEvent::ClientConnectFail { addr, attempts } => warn!("could not connect to {} after {} attempts", addr, attempts),
            other => info!("{:?}", other),
        }
    }
}

async fn broadcast_loop(manager: Arc<ConnectionManager>, node_id: String, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    let mut counter = 0u64;
    loop {
        ticker.tick().await;
        counter += 1;

        let mut header = BaseHeader::new(manager.config().net_flag, CHAT_MSG);
        header.nonce = Some(create_nonce());
        let msg = ChatMessage {
            from: node_id.clone(),
            text: format!("hello #{}", counter),
        };

        match manager.broadcast(Arc::new(MessageEnvelope::app(header, msg)), None).await {
            Ok(n) => info!("broadcast hello #{} to {} peers", counter, n),
            Err(e) => info!("not broadcasting: {}", e),
        }
    }
}
