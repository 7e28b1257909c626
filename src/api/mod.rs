// API module - read-only status snapshots served over HTTP

pub mod rest;

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::interface::{Interface, Interfaces};
use crate::kernel::KernEntry;
use crate::rdisc::DiscoveredRouter;
use crate::routes::{Prefix, RouteEntry};

/// One route table entry as shown to operators
#[derive(Debug, Clone, Serialize)]
pub struct RouteView {
    pub prefix: Prefix,
    pub gateway: Ipv4Addr,
    pub router: Ipv4Addr,
    pub metric: u8,
    pub tag: u16,
    pub interface: Option<String>,
    pub state: Vec<String>,
    /// Seconds since the active path was last heard
    pub age: u64,
    pub spares: Vec<SpareView>,
    pub hold_down: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpareView {
    pub gateway: Ipv4Addr,
    pub metric: u8,
    pub age: u64,
}

impl RouteView {
    pub fn new(rt: &RouteEntry, ifs: &Interfaces, now: Duration) -> Self {
        let active = rt.active();
        RouteView {
            prefix: rt.prefix,
            gateway: active.gate,
            router: active.router,
            metric: active.metric,
            tag: active.tag,
            interface: active
                .ifc
                .and_then(|i| ifs.get(i))
                .map(|i| i.name.clone()),
            state: rt.state.names(),
            age: now.saturating_sub(active.time).as_secs(),
            spares: rt.spares[1..]
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| SpareView {
                    gateway: s.gate,
                    metric: s.metric,
                    age: now.saturating_sub(s.time).as_secs(),
                })
                .collect(),
            hold_down: rt.in_hold_down(now),
        }
    }
}

/// Everything the status API can show, taken between event loop wake-ups
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub hostname: String,
    /// RFC 3339 time the snapshot was taken
    pub timestamp: String,
    pub supplier: bool,
    pub update_seqno: u32,
    /// Router discovery's current default router
    pub default_router: Option<Ipv4Addr>,
    /// Alternate paths still usable for failover
    pub live_spares: usize,
    pub routes: Vec<RouteView>,
    pub kernel: Vec<KernEntry>,
    pub routers: Vec<DiscoveredRouter>,
    pub interfaces: Vec<Interface>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        StatusSnapshot {
            hostname: String::new(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            supplier: false,
            update_seqno: 0,
            default_router: None,
            live_spares: 0,
            routes: Vec::new(),
            kernel: Vec::new(),
            routers: Vec::new(),
            interfaces: Vec::new(),
        }
    }
}

impl StatusSnapshot {
    /// Longest prefix match over the snapshot's routes
    pub fn covering_route(&self, addr: Ipv4Addr) -> Option<&RouteView> {
        let host = u32::from(addr);
        self.routes
            .iter()
            .filter(|r| r.prefix.contains(host))
            .max_by_key(|r| r.prefix.mask.count_ones())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
