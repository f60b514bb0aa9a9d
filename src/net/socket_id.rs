use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SocketKind {
    /// accepted by a local listener
    Inbound,
    /// opened by a local connector
    Outbound,
}

/// Identity of one channel. Sequences are never reused within an allocator's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId {
    pub kind: SocketKind,
    pub sequence: u64,
}

impl Display for SocketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            SocketKind::Inbound => write!(f, "in:{}", self.sequence),
            SocketKind::Outbound => write!(f, "out:{}", self.sequence),
        }
    }
}

#[derive(Debug)]
pub struct SocketIdAllocator {
    next: AtomicU64,
}

impl Default for SocketIdAllocator {
    fn default() -> Self {
        SocketIdAllocator::new()
    }
}

impl SocketIdAllocator {
    pub fn new() -> SocketIdAllocator {
        SocketIdAllocator {
            next: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, kind: SocketKind) -> SocketId {
        SocketId {
            kind,
            sequence: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }
}
