// Network interfaces the daemon runs RIP and router discovery on
//
// Interfaces come from the configuration file; the kernel watcher only flips
// their up/down state.

use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::routes::addr::{self, on_net, std_mask, HOST_MASK};
use crate::routes::{Prefix, RouteState, RouteStore, Spare};

/// Position of an interface in the interface table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IfIndex(pub usize);

/// Which flavour of RIP an interface sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RipOut {
    /// Listen only
    Off,
    /// Broadcast RIPv1 with classful masks
    V1,
    /// Multicast RIPv2 to 224.0.0.9
    V2,
}

#[derive(Debug, Clone, Serialize)]
pub struct RdiscSettings {
    /// Send router advertisements on this interface
    pub advertise: bool,
    /// Solicit and listen for advertisements on this interface
    pub solicit: bool,
    /// Preference we advertise (signed, RFC 1256)
    pub preference: i32,
    /// Maximum advertisement interval
    pub max_interval: Duration,
}

impl Default for RdiscSettings {
    fn default() -> Self {
        RdiscSettings {
            advertise: false,
            solicit: false,
            preference: 0,
            max_interval: crate::rdisc::DEF_MAX_ADVERTISE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Interface {
    pub name: String,
    pub addr: Ipv4Addr,
    /// Netmask in host order
    pub mask: u32,
    /// Network number in host order
    pub net: u32,
    pub std_mask: u32,
    pub std_net: u32,
    /// Remote end of a point-to-point link
    pub dst: Option<Ipv4Addr>,
    pub broadcast: Ipv4Addr,
    /// Extra hops charged for routes through this interface
    pub metric: u8,
    /// Never send RIP here; the interface route is still installed
    pub passive: bool,
    pub accept_v1: bool,
    pub accept_v2: bool,
    pub rip_out: RipOut,
    #[serde(skip)]
    pub password: Option<String>,
    /// Advertise a default route with this metric
    pub default_metric: Option<u8>,
    pub rdisc: RdiscSettings,
    pub up: bool,
}

impl Interface {
    pub fn new(name: &str, addr: Ipv4Addr, prefix_len: u8) -> Self {
        let host = addr::host(addr);
        let mask = addr::prefix_to_mask(prefix_len);
        let std = std_mask(host);
        Interface {
            name: name.to_string(),
            addr,
            mask,
            net: host & mask,
            std_mask: std,
            std_net: host & std,
            dst: None,
            broadcast: addr::addr((host & mask) | !mask),
            metric: 0,
            passive: false,
            accept_v1: true,
            accept_v2: true,
            rip_out: RipOut::V2,
            password: None,
            default_metric: None,
            rdisc: RdiscSettings::default(),
            up: true,
        }
    }

    /// Cost added to routes received or sent through this interface
    pub fn cost(&self) -> u8 {
        self.metric.saturating_add(1).min(crate::routes::HOPCNT_INFINITY)
    }

    pub fn is_point_to_point(&self) -> bool {
        self.dst.is_some()
    }

    /// Whether RIP advertisements are sent on this interface
    pub fn sends_rip(&self) -> bool {
        self.up && !self.passive && self.rip_out != RipOut::Off
    }

    /// Whether RIP packets are accepted on this interface
    pub fn hears_rip(&self) -> bool {
        self.up && !self.passive && (self.accept_v1 || self.accept_v2)
    }

    /// Route the interface contributes to the table
    pub fn route_prefix(&self) -> Prefix {
        match self.dst {
            Some(dst) => Prefix::host(addr::host(dst)),
            None => Prefix::new(self.net, self.mask),
        }
    }

    /// Whether `addr` is reachable directly through this interface
    pub fn contains(&self, addr: u32) -> bool {
        match self.dst {
            Some(dst) => addr::host(dst) == addr,
            None => on_net(addr, self.net, self.mask),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Interfaces {
    list: Vec<Interface>,
}

impl Interfaces {
    pub fn new(list: Vec<Interface>) -> Self {
        Interfaces { list }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, idx: IfIndex) -> Option<&Interface> {
        self.list.get(idx.0)
    }

    pub fn get_mut(&mut self, idx: IfIndex) -> Option<&mut Interface> {
        self.list.get_mut(idx.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (IfIndex, &Interface)> {
        self.list.iter().enumerate().map(|(i, ifc)| (IfIndex(i), ifc))
    }

    pub fn by_name(&self, name: &str) -> Option<IfIndex> {
        self.list.iter().position(|ifc| ifc.name == name).map(IfIndex)
    }

    /// Interface that owns `addr` as its own address
    pub fn with_addr(&self, addr: Ipv4Addr) -> Option<IfIndex> {
        self.list
            .iter()
            .position(|ifc| ifc.addr == addr)
            .map(IfIndex)
    }

    /// Whether `addr` is one of our addresses
    pub fn is_local(&self, addr: Ipv4Addr) -> bool {
        self.with_addr(addr).is_some()
    }

    /// Up interface through which `addr` is directly reachable, preferring
    /// point-to-point links and then the longest mask
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<IfIndex> {
        let host = addr::host(addr);
        let mut best: Option<(usize, u32)> = None;
        for (i, ifc) in self.list.iter().enumerate() {
            if !ifc.up || !ifc.contains(host) {
                continue;
            }
            let mask = if ifc.is_point_to_point() {
                HOST_MASK
            } else {
                ifc.mask
            };
            match best {
                Some((_, best_mask)) if best_mask >= mask => {}
                _ => best = Some((i, mask)),
            }
        }
        best.map(|(i, _)| IfIndex(i))
    }

    /// Number of interfaces that actually run RIP
    pub fn rip_count(&self) -> usize {
        self.list.iter().filter(|ifc| ifc.sends_rip()).count()
    }

    /// Whether any interface still speaks RIPv1
    pub fn any_ripv1(&self) -> bool {
        self.list
            .iter()
            .any(|ifc| ifc.up && ifc.rip_out == RipOut::V1)
    }

    /// Install the routes of every up interface
    pub fn install_routes(&self, store: &mut RouteStore, now: Duration) {
        for (idx, ifc) in self.iter() {
            if ifc.up {
                self.install_interface(idx, store, now);
            }
        }
    }

    /// Install (or reclaim) the routes contributed by one interface
    pub fn install_interface(&self, idx: IfIndex, store: &mut RouteStore, now: Duration) {
        let Some(ifc) = self.get(idx) else {
            return;
        };
        let new = Spare::new(ifc.addr, ifc.addr, ifc.metric as u32, 0, Some(idx), now);
        upsert(store, ifc.route_prefix(), RouteState::IF, new, now);

        if ifc.is_point_to_point() {
            let local = Spare::new(ifc.addr, ifc.addr, 0, 0, Some(idx), now);
            upsert(
                store,
                Prefix::host(addr::host(ifc.addr)),
                RouteState::IF | RouteState::LOCAL,
                local,
                now,
            );
        } else if ifc.mask > ifc.std_mask && self.any_ripv1() {
            // RIPv1 listeners elsewhere only understand the classful network
            upsert(
                store,
                Prefix::new(ifc.std_net, ifc.std_mask),
                RouteState::NET_SYN,
                new,
                now,
            );
        }
    }

    /// Mark an interface down and fail every path through it
    pub fn bring_down(&mut self, idx: IfIndex, store: &mut RouteStore, now: Duration) {
        let Some(ifc) = self.get_mut(idx) else {
            return;
        };
        if !ifc.up {
            return;
        }
        ifc.up = false;
        tracing::info!("Interface {} is down", ifc.name);
        store.bad_interface(idx, now);
    }

    /// Mark an interface up and restore its routes
    pub fn bring_up(&mut self, idx: IfIndex, store: &mut RouteStore, now: Duration) {
        let Some(ifc) = self.get_mut(idx) else {
            return;
        };
        if ifc.up {
            return;
        }
        ifc.up = true;
        tracing::info!("Interface {} is up", ifc.name);
        self.install_interface(idx, store, now);
    }
}

/// Add a permanent route, or take over an existing entry for it
fn upsert(store: &mut RouteStore, prefix: Prefix, state: RouteState, new: Spare, now: Duration) {
    match store.get(&prefix) {
        Some(rt) => {
            let active = rt.active();
            if rt.state.contains(state) && active.gate == new.gate && active.metric == new.metric
            {
                return;
            }
            let merged = (rt.state - RouteState::NET_SYN) | state;
            if let Err(e) = store.change(prefix, merged, new, "Ifc", now) {
                tracing::warn!("Failed to take over route {} for interface: {}", prefix, e);
            }
        }
        None => {
            if let Err(e) = store.add(prefix, state, new, now) {
                tracing::warn!("Failed to add interface route: {}", e);
            }
        }
    }
}
