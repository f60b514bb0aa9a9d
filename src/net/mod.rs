pub mod acceptor;
pub mod capability;
pub mod channel;
pub mod channel_handler;
pub mod connection_manager;
pub mod connector;
pub mod events;
pub mod flow_ctrl;
pub mod io_pool;
pub mod packet_coder;
pub mod socket_id;
