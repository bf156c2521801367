//! Per-connection byte accumulation: the reassembly ring each decoder frames
//! from, and the table mapping connection tuples to rings.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::transform::TransformContext;

/// Initial ring capacity; grows only when a single declared message cannot
/// fit.
const INITIAL_CAPACITY: usize = 16 * 1024;

/// Sweep the table for idle connections every this many processed segments.
const SWEEP_INTERVAL: u64 = 1024;

/// Append-only byte ring with a read and a write cursor.
///
/// Compaction is opaque to callers: cursors may reset after `consume`, and
/// `append` shifts pending bytes down before growing.
#[derive(Debug)]
pub struct ByteRing {
    buf: Vec<u8>,
    r: usize,
    w: usize,
}

impl ByteRing {
    pub fn new() -> Self {
        ByteRing::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ByteRing {
            buf: vec![0; capacity],
            r: 0,
            w: 0,
        }
    }

    /// Bytes buffered and not yet consumed.
    pub fn available(&self) -> usize {
        self.w - self.r
    }

    /// Copy bytes in. Never fails; compacts first and grows the backing
    /// store only when the pending data would still not fit.
    pub fn append(&mut self, data: &[u8]) {
        if self.w + data.len() > self.buf.len() {
            self.compact();
            if self.w + data.len() > self.buf.len() {
                self.buf.resize(self.w + data.len(), 0);
            }
        }
        self.buf[self.w..self.w + data.len()].copy_from_slice(data);
        self.w += data.len();
    }

    /// View the next `n` bytes without consuming. None if fewer are buffered.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if self.available() < n {
            return None;
        }
        Some(&self.buf[self.r..self.r + n])
    }

    /// Advance the read cursor by `n`. False (no side effect) if fewer bytes
    /// are buffered.
    pub fn consume(&mut self, n: usize) -> bool {
        if self.available() < n {
            return false;
        }
        self.r += n;
        if self.r == self.w {
            self.r = 0;
            self.w = 0;
        }
        true
    }

    fn compact(&mut self) {
        if self.r > 0 {
            self.buf.copy_within(self.r..self.w, 0);
            self.w -= self.r;
            self.r = 0;
        }
    }
}

impl Default for ByteRing {
    fn default() -> Self {
        ByteRing::new()
    }
}

/// Directional connection tuple. Each direction of a TCP connection gets its
/// own ring; `conn_key` folds both directions together for state shared
/// across them.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct FlowKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        FlowKey {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
        }
    }

    /// Bidirectional key, normalized so (A->B) == (B->A).
    pub fn conn_key(&self) -> ConnKey {
        let a = (self.src_ip, self.src_port);
        let b = (self.dst_ip, self.dst_port);
        if a <= b {
            ConnKey { a, b }
        } else {
            ConnKey { a: b, b: a }
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Normalized bidirectional connection identifier.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct ConnKey {
    a: (IpAddr, u16),
    b: (IpAddr, u16),
}

struct Flow {
    ring: ByteRing,
    last_active: Instant,
}

/// Maps directional tuples to reassembly rings and connections to transform
/// contexts. Session keys extracted while decoding one direction must be
/// visible to the other, so contexts live under the normalized key.
///
/// Mutated only from the capture thread; not Sync.
pub struct ConnTable {
    flows: HashMap<FlowKey, Flow>,
    contexts: HashMap<ConnKey, TransformContext>,
    idle_timeout: Duration,
    processed: u64,
}

impl ConnTable {
    pub fn new(idle_timeout: Duration) -> Self {
        ConnTable {
            flows: HashMap::new(),
            contexts: HashMap::new(),
            idle_timeout,
            processed: 0,
        }
    }

    /// Ring and connection context for a segment's tuple, creating both on
    /// first payload. Periodically sweeps idle connections.
    pub fn flow_mut(&mut self, key: &FlowKey) -> (&mut ByteRing, &mut TransformContext) {
        self.processed += 1;
        if self.processed % SWEEP_INTERVAL == 0 {
            self.sweep(Instant::now());
        }

        let flow = self.flows.entry(key.clone()).or_insert_with(|| Flow {
            ring: ByteRing::new(),
            last_active: Instant::now(),
        });
        flow.last_active = Instant::now();
        let ctx = self.contexts.entry(key.conn_key()).or_default();
        (&mut flow.ring, ctx)
    }

    /// Drop flows whose last activity precedes `now - idle_timeout`, and the
    /// contexts of connections with no surviving flow.
    pub fn sweep(&mut self, now: Instant) {
        let timeout = self.idle_timeout;
        self.flows
            .retain(|_, flow| now.saturating_duration_since(flow.last_active) < timeout);
        let live: HashSet<ConnKey> = self.flows.keys().map(FlowKey::conn_key).collect();
        self.contexts.retain(|key, _| live.contains(key));
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
