// Daemon - owns the routing state and decides what happens at each wake-up

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use crate::aggregate::Aggregator;
use crate::api::{RouteView, StatusSnapshot};
use crate::config::Config;
use crate::interface::Interfaces;
use crate::kernel::{KernelEvent, KernelMirror, KernelTable};
use crate::rdisc::packet::RdiscPacket;
use crate::rdisc::{jitter, IcmpOut, Rdisc};
use crate::rip::input::read_rip;
use crate::rip::output::{broadcast, query_all};
use crate::rip::{Outbound, RipOptions};
use crate::routes::{Prefix, RouteState, RouteStore, Spare};
use crate::timers::Timers;

/// How a configured static route is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaticKind {
    /// The gateway does not speak RIP; the route is permanent and advertised
    Passive,
    /// The gateway speaks RIP; the route ages unless the gateway confirms it
    Active,
    /// Installed by some other means; we neither install nor advertise it
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub prefix: Prefix,
    pub gate: Ipv4Addr,
    pub metric: u8,
    pub kind: StaticKind,
}

/// A network the administrator declares as ours, advertised as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNet {
    pub prefix: Prefix,
    pub metric: u8,
}

/// Datagrams the event loop should send
#[derive(Debug, Default)]
pub struct Output {
    pub rip: Vec<Outbound>,
    pub icmp: Vec<IcmpOut>,
}

pub struct Daemon {
    store: RouteStore,
    ifs: Interfaces,
    mirror: KernelMirror,
    ag: Aggregator,
    rdisc: Rdisc,
    kernel: Box<dyn KernelTable>,
    opts: RipOptions,
    timers: Timers,
    statics: Vec<StaticRoute>,
    internal_nets: Vec<InternalNet>,
    forced_supplier: Option<bool>,
    hostname: String,
    rng: StdRng,
    next_bcast: Duration,
    next_age: Duration,
    /// Something shown in the status snapshot may have changed
    status_dirty: bool,
}

impl Daemon {
    pub fn new(config: &Config, kernel: Box<dyn KernelTable>, mut rng: StdRng, now: Duration) -> Self {
        let rdisc = Rdisc::new(false, &mut rng, now);
        Daemon {
            store: RouteStore::new(config.timers),
            ifs: Interfaces::new(config.interfaces.clone()),
            mirror: KernelMirror::new(),
            ag: Aggregator::new(config.slots),
            rdisc,
            kernel,
            opts: config.options.clone(),
            timers: config.timers,
            statics: config.static_routes.clone(),
            internal_nets: config.internal_nets.clone(),
            forced_supplier: config.supplier,
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            rng,
            next_bcast: now,
            next_age: now + config.timers.supply,
            status_dirty: true,
        }
    }

    pub fn interfaces(&self) -> &Interfaces {
        &self.ifs
    }

    #[cfg(test)]
    pub fn store(&self) -> &RouteStore {
        &self.store
    }

    #[cfg(test)]
    pub fn mirror(&self) -> &KernelMirror {
        &self.mirror
    }

    pub fn is_supplier(&self) -> bool {
        self.opts.supplier
    }

    /// Install the routes we own and ask the neighbours for theirs
    pub fn start(&mut self, now: Duration) -> Output {
        self.ifs.install_routes(&mut self.store, now);
        self.install_internal_nets(now);
        self.install_statics(now);
        self.check_supplier(now);

        let mut out = Output::default();
        if self.opts.rip_on {
            out.rip = query_all(&self.ifs);
        }
        self.next_bcast = now + self.timers.flash_min;
        self.next_age = now + self.timers.supply;
        self.sync_kernel(now);
        out
    }

    /// Supply when routing between interfaces or for static routes
    fn check_supplier(&mut self, now: Duration) {
        let supplier = self
            .forced_supplier
            .unwrap_or_else(|| self.ifs.rip_count() > 1 || !self.statics.is_empty());
        if supplier != self.opts.supplier {
            tracing::info!("{} supplying routes", if supplier { "start" } else { "stop" });
        }
        self.opts.supplier = supplier;
        self.rdisc.set_supplier(supplier, now);
    }

    fn install_internal_nets(&mut self, now: Duration) {
        for net in &self.internal_nets {
            if self.store.get(&net.prefix).is_some() {
                continue;
            }
            let new = Spare::new(
                Ipv4Addr::LOCALHOST,
                Ipv4Addr::LOCALHOST,
                u32::from(net.metric),
                0,
                None,
                now,
            );
            if let Err(e) = self
                .store
                .add(net.prefix, RouteState::NET_SYN | RouteState::NET_INT, new, now)
            {
                tracing::warn!("internal network {}: {}", net.prefix, e);
            }
        }
    }

    /// Install configured static routes whose gateway is reachable
    fn install_statics(&mut self, now: Duration) {
        for s in &self.statics {
            let ifc = self.ifs.lookup(s.gate);
            if ifc.is_none() && s.kind != StaticKind::External {
                tracing::warn!("static route {}: gateway {} not on a connected network", s.prefix, s.gate);
                continue;
            }
            let new = Spare::new(s.gate, s.gate, u32::from(s.metric), 0, ifc, now);
            let result = match (s.kind, self.store.get(&s.prefix)) {
                (StaticKind::Active, _) => {
                    self.store.learn(s.prefix, new, now);
                    Ok(())
                }
                (StaticKind::Passive, None) => self.store.add(s.prefix, RouteState::STATIC, new, now),
                (StaticKind::Passive, Some(rt)) if !rt.state.contains(RouteState::STATIC) => {
                    let state = rt.state | RouteState::STATIC;
                    self.store.change(s.prefix, state, new, "Static", now)
                }
                (StaticKind::External, None) => self.store.add(s.prefix, RouteState::EXTERNAL, new, now),
                _ => Ok(()),
            };
            if let Err(e) = result {
                tracing::warn!("static route {}: {}", s.prefix, e);
            }
        }
    }

    /// When `tick` next has work to do
    pub fn deadline(&self) -> Duration {
        let mut next = self.next_age;
        if self.opts.supplier && self.opts.rip_on {
            next = next.min(self.next_bcast);
            if let Some(flash) = self.store.books.flash.deadline() {
                next = next.min(flash);
            }
        }
        if let Some(kern) = self.store.need_kern() {
            next = next.min(kern);
        }
        if let Some(rdisc) = self.rdisc.deadline() {
            next = next.min(rdisc);
        }
        next
    }

    /// Run the timer work that is due
    pub fn tick(&mut self, now: Duration) -> Output {
        let mut out = Output::default();
        self.status_dirty = true;

        if now >= self.next_age {
            self.next_age = now + self.timers.supply;
            if self.opts.rip_on || self.rdisc.has_route() {
                self.age(now);
            }
        }

        if self.rdisc.routers().iter().any(|r| r.expires() <= now) {
            self.rdisc.select(&mut self.store, &self.ifs, self.opts.rip_on, now);
        }
        out.icmp = self.rdisc.tick(&self.ifs, &mut self.rng, now);

        if self.opts.supplier && self.opts.rip_on {
            if now >= self.next_bcast {
                out.rip = broadcast(&mut self.store, &self.ifs, &mut self.ag, &self.opts, false, now);
                self.next_bcast = now + self.timers.supply;
                self.update_sent(now);
            } else if self.store.books.flash.is_due(now) {
                if self.next_bcast.saturating_sub(now) <= self.timers.flash_min {
                    // the full update is close enough
                    self.store.books_mut().flash.cancel();
                } else {
                    out.rip = broadcast(&mut self.store, &self.ifs, &mut self.ag, &self.opts, true, now);
                    self.update_sent(now);
                }
            }
        } else {
            self.store.books_mut().flash.cancel();
        }

        if self.store.need_kern().is_some_and(|t| t <= now) {
            self.sync_kernel(now);
        }
        out
    }

    fn update_sent(&mut self, now: Duration) {
        let delay = jitter(&mut self.rng, self.timers.flash_min, self.timers.flash_max);
        let books = self.store.books_mut();
        books.update_seqno = books.update_seqno.wrapping_add(1);
        books.flash.sent(now, delay);
    }

    fn age(&mut self, now: Duration) {
        self.store.walk_age(None, self.opts.rip_on, now);
        let old = self.timers.now_stale(now);
        self.mirror
            .del_redirects(None, old, self.opts.supplier, &mut self.store, now);
    }

    fn sync_kernel(&mut self, now: Duration) {
        let ops = self.mirror.sync(
            &mut self.store,
            &self.ifs,
            &mut self.ag,
            self.kernel.as_mut(),
            self.opts.rip_on,
            now,
        );
        if !ops.is_empty() {
            tracing::debug!("kernel sync: {} operations", ops.len());
        }
    }

    /// Handle a datagram from the RIP socket; returns the replies
    pub fn on_rip_packet(&mut self, from: SocketAddrV4, data: &[u8], now: Duration) -> Vec<Outbound> {
        match read_rip(&mut self.store, &self.ifs, &mut self.ag, &self.opts, from, data, now) {
            Ok(report) => {
                if report.learned > 0 {
                    tracing::debug!("{} routes changed by {}", report.learned, from);
                    self.status_dirty = true;
                }
                report.replies
            }
            Err(e) => {
                tracing::warn!("discard packet from {}: {}", from, e);
                Vec::new()
            }
        }
    }

    /// Handle a datagram from the raw ICMP socket
    pub fn on_icmp(&mut self, data: &[u8], now: Duration) {
        match RdiscPacket::from_datagram(data) {
            Ok((from, packet)) => {
                self.rdisc.read(
                    &mut self.store,
                    &self.ifs,
                    self.opts.rip_on,
                    from,
                    &packet,
                    now,
                    &mut self.rng,
                );
                self.status_dirty = true;
            }
            // every other ICMP message arrives here too
            Err(e) => tracing::trace!("ignore ICMP message: {}", e),
        }
    }

    /// Fold in what changed in the kernel
    pub fn on_kernel_events(&mut self, events: Vec<KernelEvent>, now: Duration) {
        if !events.is_empty() {
            self.status_dirty = true;
        }
        for event in events {
            match event {
                KernelEvent::Added(route, origin) => self.mirror.note_added(
                    &route,
                    origin,
                    &mut self.store,
                    &self.ifs,
                    self.opts.supplier,
                    now,
                    now,
                ),
                KernelEvent::Removed(prefix) => self.mirror.note_removed(&prefix, &mut self.store, now),
                KernelEvent::LinkUp(name) => {
                    if let Some(idx) = self.ifs.by_name(&name) {
                        self.ifs.bring_up(idx, &mut self.store, now);
                        self.install_statics(now);
                        self.check_supplier(now);
                    }
                }
                KernelEvent::LinkDown(name) => {
                    if let Some(idx) = self.ifs.by_name(&name) {
                        self.ifs.bring_down(idx, &mut self.store, now);
                        self.check_supplier(now);
                    }
                }
            }
        }
    }

    /// Poison everything, withdraw from router discovery and remove our
    /// kernel routes
    pub fn shutdown(&mut self, now: Duration) -> Output {
        tracing::info!("shutting down");
        self.opts.stopping = true;
        let mut out = Output::default();
        if self.opts.supplier && self.opts.rip_on {
            out.rip = broadcast(&mut self.store, &self.ifs, &mut self.ag, &self.opts, false, now);
        }
        out.icmp = self.rdisc.shutdown(&self.ifs);
        let ops = self.mirror.flush_all(self.kernel.as_mut());
        tracing::info!("removed {} kernel routes", ops.len());
        out
    }

    /// A fresh snapshot if anything it shows may have changed since the
    /// last one was taken
    pub fn take_status(&mut self, now: Duration) -> Option<StatusSnapshot> {
        if !self.status_dirty {
            return None;
        }
        self.status_dirty = false;
        Some(self.snapshot(now))
    }

    pub fn snapshot(&self, now: Duration) -> StatusSnapshot {
        StatusSnapshot {
            hostname: self.hostname.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            supplier: self.is_supplier(),
            update_seqno: self.store.update_seqno(),
            default_router: self.rdisc.installed(),
            live_spares: self.store.live_spares(),
            routes: self
                .store
                .iter()
                .map(|rt| RouteView::new(rt, &self.ifs, now))
                .collect(),
            kernel: self.mirror.iter().cloned().collect(),
            routers: self.rdisc.routers().to_vec(),
            interfaces: self.ifs.iter().map(|(_, i)| i.clone()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{IfIndex, Interface};
    use crate::kernel::tests::RecordingKernel;
    use crate::kernel::{KernelRoute, RouteOrigin};
    use crate::rip::packet::{NetEntry, RipCommand, RipPacket};
    use crate::rip::{RIPV2, RIP_PORT};
    use crate::routes::HOPCNT_INFINITY;
    use rand::SeedableRng;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn two_interfaces() -> Config {
        Config {
            interfaces: vec![
                Interface::new("eth0", ip("192.168.1.1"), 24),
                Interface::new("eth1", ip("192.168.2.1"), 24),
            ],
            ..Config::default()
        }
    }

    fn daemon(config: &Config) -> Daemon {
        Daemon::new(
            config,
            Box::new(RecordingKernel::default()),
            StdRng::seed_from_u64(1),
            secs(1),
        )
    }

    fn response(dst: &str, metric: u32) -> Vec<u8> {
        RipPacket {
            entries: vec![NetEntry::route(
                ip(dst),
                ip("255.255.255.0"),
                Ipv4Addr::UNSPECIFIED,
                metric,
                0,
            )],
            ..RipPacket::new(RipCommand::Response, RIPV2)
        }
        .to_bytes()
    }

    fn from(s: &str) -> SocketAddrV4 {
        SocketAddrV4::new(ip(s), RIP_PORT)
    }

    fn entries(out: &[Outbound]) -> Vec<NetEntry> {
        out.iter()
            .flat_map(|o| RipPacket::from_bytes(&o.payload).unwrap().entries)
            .collect()
    }

    #[test]
    fn test_start_queries_and_detects_supplier() {
        let config = two_interfaces();
        let mut d = daemon(&config);
        let out = d.start(secs(1));
        assert!(d.is_supplier());
        assert_eq!(out.rip.len(), 2);
        assert!(RipPacket::from_bytes(&out.rip[0].payload)
            .unwrap()
            .is_whole_table_request());
        assert_eq!(d.store().len(), 2);

        let config = Config {
            interfaces: vec![Interface::new("eth0", ip("192.168.1.1"), 24)],
            ..Config::default()
        };
        let mut d = daemon(&config);
        d.start(secs(1));
        assert!(!d.is_supplier());
        assert!(d.tick(secs(100)).rip.is_empty());
    }

    #[test]
    fn test_learned_route_reaches_kernel() {
        let config = two_interfaces();
        let mut d = daemon(&config);
        d.start(secs(1));
        d.on_rip_packet(from("192.168.1.2"), &response("10.1.1.0", 1), secs(2));
        assert!(d.deadline() <= secs(2));
        d.tick(secs(2));
        let k = d.mirror().get(&Prefix::new(0x0a01_0100, 0xffff_ff00)).unwrap();
        assert_eq!(k.gate, ip("192.168.1.2"));
        assert_eq!(k.metric, 2);
    }

    #[test]
    fn test_full_update_then_flash() {
        let config = two_interfaces();
        let mut d = daemon(&config);
        d.start(secs(1));

        // first full update shortly after start
        let out = d.tick(secs(3));
        assert_eq!(out.rip.len(), 2);
        assert_eq!(d.store().update_seqno(), 1);

        // a change well before the next full update goes out as a flash
        d.on_rip_packet(from("192.168.1.2"), &response("10.1.1.0", 1), secs(10));
        assert!(d.tick(secs(10)).rip.is_empty());
        let due = d.deadline();
        assert_eq!(due, secs(12));
        let out = d.tick(due);
        let flashed = entries(&out.rip);
        assert!(flashed.iter().all(|e| e.dst == ip("10.1.1.0")));
        assert!(!flashed.is_empty());
        assert_eq!(d.store().update_seqno(), 2);
    }

    #[test]
    fn test_flash_folded_into_imminent_full_update() {
        let config = two_interfaces();
        let mut d = daemon(&config);
        d.start(secs(1));
        d.tick(secs(3));

        // next full update at 33; a flash due at 32 is left to it
        d.on_rip_packet(from("192.168.1.2"), &response("10.1.1.0", 1), secs(30));
        assert!(d.tick(secs(32)).rip.is_empty());
        assert!(!d.store().books.flash.is_needed());

        let out = d.tick(secs(33));
        let sent = entries(&out.rip);
        assert!(sent.iter().any(|e| e.dst == ip("10.1.1.0")));
        assert!(sent.iter().any(|e| e.dst == ip("192.168.1.0")));
    }

    #[test]
    fn test_link_down_and_up() {
        let mut config = two_interfaces();
        config.static_routes.push(StaticRoute {
            prefix: Prefix::new(0xac10_0000, 0xffff_0000),
            gate: ip("192.168.2.254"),
            metric: 2,
            kind: StaticKind::Passive,
        });
        let mut d = daemon(&config);
        d.start(secs(1));
        let static_net = Prefix::new(0xac10_0000, 0xffff_0000);
        assert!(d.store().get(&static_net).unwrap().state.contains(RouteState::STATIC));

        d.on_kernel_events(vec![KernelEvent::LinkDown("eth1".to_string())], secs(5));
        assert_eq!(d.store().get(&static_net).unwrap().metric(), HOPCNT_INFINITY);
        assert!(!d.interfaces().get(IfIndex(1)).unwrap().up);

        d.on_kernel_events(vec![KernelEvent::LinkUp("eth1".to_string())], secs(6));
        let rt = d.store().get(&static_net).unwrap();
        assert_eq!(rt.metric(), 2);
        assert!(rt.state.contains(RouteState::STATIC));
    }

    #[test]
    fn test_foreign_kernel_route_mirrored() {
        let config = two_interfaces();
        let mut d = daemon(&config);
        d.start(secs(1));
        let route = KernelRoute {
            prefix: Prefix::new(0x0a05_0000, 0xffff_0000),
            gate: ip("192.168.1.7"),
            metric: 3,
            gateway: true,
        };
        d.on_kernel_events(vec![KernelEvent::Added(route, RouteOrigin::Foreign)], secs(2));
        let rt = d.store().get(&route.prefix).unwrap();
        assert!(rt.state.contains(RouteState::STATIC));
        assert_eq!(rt.gate(), ip("192.168.1.7"));
    }

    #[test]
    fn test_shutdown_poisons_and_flushes() {
        let config = two_interfaces();
        let mut d = daemon(&config);
        d.start(secs(1));
        d.on_rip_packet(from("192.168.1.2"), &response("10.1.1.0", 1), secs(2));
        d.tick(secs(2));
        assert!(!d.mirror().is_empty());

        let out = d.shutdown(secs(3));
        let sent = entries(&out.rip);
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|e| e.metric == u32::from(HOPCNT_INFINITY)));
        assert!(d.mirror().is_empty());
    }

    #[test]
    fn test_rip_off_ages_nothing_without_rdisc() {
        let mut config = two_interfaces();
        config.options.rip_on = false;
        let mut d = daemon(&config);
        let out = d.start(secs(1));
        assert!(out.rip.is_empty());
        d.on_rip_packet(from("192.168.1.2"), &response("10.1.1.0", 1), secs(2));
        assert!(d.store().lookup(0x0a01_0100, 0xffff_ff00).is_none());
        assert!(d.tick(secs(40)).rip.is_empty());
    }

    #[test]
    fn test_snapshot() {
        let config = two_interfaces();
        let mut d = daemon(&config);
        d.start(secs(1));
        d.on_rip_packet(from("192.168.1.2"), &response("10.1.1.0", 1), secs(2));
        let snap = d.snapshot(secs(12));
        assert_eq!(snap.routes.len(), 3);
        assert_eq!(snap.interfaces.len(), 2);
        assert_eq!(snap.default_router, None);
        assert_eq!(snap.live_spares, 0);
        let rt = snap.covering_route(ip("10.1.1.9")).unwrap();
        assert_eq!(rt.interface.as_deref(), Some("eth0"));
        assert_eq!(rt.age, 10);
        assert!(snap.covering_route(ip("8.8.8.8")).is_none());
    }

    #[test]
    fn test_status_taken_only_after_changes() {
        let config = two_interfaces();
        let mut d = daemon(&config);
        d.start(secs(1));
        assert!(d.take_status(secs(1)).is_some());
        assert!(d.take_status(secs(1)).is_none());

        d.on_rip_packet(from("192.168.1.2"), &response("10.1.1.0", 1), secs(2));
        assert_eq!(d.take_status(secs(2)).unwrap().routes.len(), 3);

        // the same advertisement again changes nothing
        d.on_rip_packet(from("192.168.1.2"), &response("10.1.1.0", 1), secs(3));
        assert!(d.take_status(secs(3)).is_none());

        d.on_rip_packet(from("192.168.2.2"), &response("10.1.1.0", 3), secs(4));
        let snap = d.take_status(secs(4)).unwrap();
        assert_eq!(snap.live_spares, 1);

        d.tick(secs(5));
        assert!(d.take_status(secs(5)).is_some());
    }
}
