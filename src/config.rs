use std::time::Duration;

use anyhow::bail;
use rustc_hash::FxHashSet;

use crate::codec::ProtocolLimits;
use crate::net::capability::ProtocolCapability;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// The local node's id. Messages whose `dest_id` does not contain it are forwarded opaquely,
    ///  an empty id disables forwarding.
    pub node_id: String,
    /// written to the `magic` field of every locally created header
    pub net_flag: i32,
    pub capability: ProtocolCapability,

    pub string_limit: usize,
    pub container_limit: usize,
    /// maximum length of a frame after the packet header, before and after decompression
    pub max_frame_len: usize,

    pub recv_buf_len: usize,
    /// SO_SNDBUF and SO_RCVBUF
    pub socket_buf_size: usize,
    pub max_send_queue: usize,

    pub max_connections: usize,
    /// stand-in for the process's file descriptor limit
    pub max_open_files: usize,
    /// connections kept free for outbound use
    pub outbound_reserve: usize,
    pub min_core_fd: usize,
    pub max_add_node: usize,
    pub listen_backlog: u32,

    pub reconnect_interval: Duration,
    pub max_reconnect_times: u32,
    pub recycle_interval: Duration,
    pub shake_hand_interval: Duration,
    /// consecutive idle keepalive intervals after which the server side drops a channel
    pub max_idle_shake_hands: u32,
    pub wait_login_interval: Duration,

    /// inbound messages per `flow_cycle`, 0 for no limit
    pub recv_speed: u32,
    pub flow_cycle: Duration,
    pub flow_slice: u32,

    pub io_threads: usize,

    pub nonce_ttl: Duration,
    pub max_nonce_count: usize,

    pub routed_requests: FxHashSet<String>,
    pub routed_responses: FxHashSet<String>,
}

impl NetworkConfig {
    pub fn new(node_id: impl Into<String>) -> NetworkConfig {
        NetworkConfig {
            node_id: node_id.into(),
            net_flag: 0xE1D1_A098_u32 as i32,
            capability: ProtocolCapability::all(),
            string_limit: 16 * 1024 * 1024,
            container_limit: 1_000_000,
            max_frame_len: 4 * 1024 * 1024,
            recv_buf_len: 10 * 1024,
            socket_buf_size: 32 * 1024,
            max_send_queue: 8192,
            max_connections: 1024,
            max_open_files: 1024,
            outbound_reserve: 168,
            min_core_fd: 150,
            max_add_node: 168,
            listen_backlog: 8,
            reconnect_interval: Duration::from_secs(2),
            max_reconnect_times: 2,
            recycle_interval: Duration::from_secs(1),
            shake_hand_interval: Duration::from_secs(5),
            max_idle_shake_hands: 3,
            wait_login_interval: Duration::from_secs(5),
            recv_speed: 0,
            flow_cycle: Duration::from_secs(1),
            flow_slice: 2,
            io_threads: 8,
            nonce_ttl: Duration::from_secs(180),
            max_nonce_count: 1_000_000,
            routed_requests: ["node_list_task_req", "node_task_logs_req", "node_query_node_info_req"]
                .into_iter()
                .map(String::from)
                .collect(),
            routed_responses: ["node_list_task_rsp", "node_task_logs_rsp", "node_query_node_info_rsp"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }

    pub fn limits(&self) -> ProtocolLimits {
        ProtocolLimits {
            string_limit: self.string_limit,
            container_limit: self.container_limit,
        }
    }

    /// The total connection budget: bounded by `max_connections` and by what the file
    ///  descriptor budget leaves after core and reserved use, but never below the outbound reserve
    pub fn max_total_connections(&self) -> usize {
        let fd_budget = self.max_open_files
            .saturating_sub(1)
            .saturating_sub(self.min_core_fd)
            .saturating_sub(self.max_add_node);
        self.max_connections.min(fd_budget).max(self.outbound_reserve)
    }

    pub fn max_inbound_connections(&self) -> usize {
        self.max_total_connections() - self.outbound_reserve
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.capability.contains(ProtocolCapability::BINARY) {
            bail!("binary protocol support is mandatory");
        }
        if self.max_frame_len == 0 || self.max_frame_len > u32::MAX as usize {
            bail!("max_frame_len must be in 1..={}", u32::MAX);
        }
        if self.recv_buf_len == 0 {
            bail!("recv_buf_len must be positive");
        }
        if self.max_send_queue == 0 {
            bail!("max_send_queue must be positive");
        }
        if self.io_threads == 0 {
            bail!("io_threads must be positive");
        }
        if self.max_reconnect_times >= 32 {
            bail!("max_reconnect_times must be below 32");
        }
        for (name, d) in [
            ("reconnect_interval", self.reconnect_interval),
            ("recycle_interval", self.recycle_interval),
            ("shake_hand_interval", self.shake_hand_interval),
            ("wait_login_interval", self.wait_login_interval),
        ] {
            if d.is_zero() {
                bail!("{} must be positive", name);
            }
        }
        if self.recv_speed > 0 && (self.flow_cycle.is_zero() || self.flow_slice == 0) {
            bail!("flow control requires a positive flow_cycle and flow_slice");
        }
        if self.max_idle_shake_hands == 0 {
            bail!("max_idle_shake_hands must be positive");
        }
        Ok(())
    }
}
