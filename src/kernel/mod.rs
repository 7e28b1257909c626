// Kernel module - shadow of the kernel forwarding table and the diff that keeps it in step

pub mod iproute;

use bitflags::bitflags;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::aggregate::{AgInfo, AgState, Aggregator};
use crate::error::KernelError;
use crate::interface::Interfaces;
use crate::routes::{change_entry, Prefix, RouteEntry, RouteState, RouteStore, Spare, HOPCNT_INFINITY};
use crate::timers::K_KEEP_LIM;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct KernState: u16 {
        /// Just created, nothing decided yet
        const NEW = 0x001;
        /// Delete unless revalidated by the next pass
        const DELETE = 0x002;
        const ADD = 0x004;
        const CHANGE = 0x008;
        /// Delete before adding, for changes that cannot be made in place
        const DEL_ADD = 0x010;
        /// Owned by the administrator or another daemon; never touched
        const STATIC = 0x020;
        const GATEWAY = 0x040;
        /// Installed by an ICMP redirect
        const DYNAMIC = 0x080;
        /// Removed by the operator
        const DELETED = 0x100;
    }
}

/// A route as handed to, or read from, the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KernelRoute {
    pub prefix: Prefix,
    pub gate: Ipv4Addr,
    pub metric: u8,
    pub gateway: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOp {
    Add(KernelRoute),
    Change(KernelRoute),
    Delete(KernelRoute),
}

/// Who installed a route found in the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RouteOrigin {
    /// Tagged with our routing protocol number
    Ours,
    /// Administrator, boot scripts or another daemon
    Foreign,
    Redirect,
}

/// Changes noticed in the kernel tables
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    Added(KernelRoute, RouteOrigin),
    Removed(Prefix),
    LinkUp(String),
    LinkDown(String),
}

/// Boundary to the kernel forwarding table
pub trait KernelTable {
    fn add(&mut self, route: &KernelRoute) -> Result<(), KernelError>;
    fn change(&mut self, route: &KernelRoute) -> Result<(), KernelError>;
    fn delete(&mut self, route: &KernelRoute) -> Result<(), KernelError>;
}

/// Backend used with `--no-kernel`: log and pretend
#[derive(Debug, Default)]
pub struct NullKernel;

impl KernelTable for NullKernel {
    fn add(&mut self, route: &KernelRoute) -> Result<(), KernelError> {
        tracing::info!("would add {} via {} metric {}", route.prefix, route.gate, route.metric);
        Ok(())
    }

    fn change(&mut self, route: &KernelRoute) -> Result<(), KernelError> {
        tracing::info!("would change {} via {} metric {}", route.prefix, route.gate, route.metric);
        Ok(())
    }

    fn delete(&mut self, route: &KernelRoute) -> Result<(), KernelError> {
        tracing::info!("would delete {}", route.prefix);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KernEntry {
    pub prefix: Prefix,
    pub gate: Ipv4Addr,
    pub metric: u8,
    #[serde(serialize_with = "serialize_state")]
    pub state: KernState,
    /// Last time a sync pass touched the entry
    #[serde(skip)]
    pub time: Duration,
    /// Leave the entry alone until then
    #[serde(skip)]
    pub keep: Duration,
    #[serde(skip)]
    pub redirect_time: Duration,
}

fn serialize_state<S: serde::Serializer>(state: &KernState, s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(state.iter_names().map(|(name, _)| name))
}

impl KernEntry {
    fn new(prefix: Prefix, now: Duration) -> Self {
        KernEntry {
            prefix,
            gate: Ipv4Addr::UNSPECIFIED,
            metric: HOPCNT_INFINITY,
            state: KernState::NEW,
            time: now,
            keep: Duration::ZERO,
            redirect_time: Duration::ZERO,
        }
    }

    pub fn route(&self) -> KernelRoute {
        KernelRoute {
            prefix: self.prefix,
            gate: self.gate,
            metric: self.metric,
            gateway: self.state.contains(KernState::GATEWAY),
        }
    }
}

/// Our copy of the kernel table, keyed by prefix
#[derive(Debug, Default)]
pub struct KernelMirror {
    table: HashMap<Prefix, KernEntry>,
}

impl KernelMirror {
    pub fn new() -> Self {
        KernelMirror::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    #[cfg(test)]
    pub fn get(&self, prefix: &Prefix) -> Option<&KernEntry> {
        self.table.get(prefix)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernEntry> {
        self.table.values()
    }

    /// Make the kernel match the route table.
    ///
    /// Every route is pushed through the aggregator into `kern_out`, which
    /// marks what has to change. Pending operations are then applied. Entries
    /// nobody revalidated are deleted, and every surviving entry is marked for
    /// deletion on the next pass in case its route disappears meanwhile.
    pub fn sync(
        &mut self,
        store: &mut RouteStore,
        ifs: &Interfaces,
        ag: &mut Aggregator,
        kernel: &mut dyn KernelTable,
        rip_on: bool,
        now: Duration,
    ) -> Vec<KernelOp> {
        {
            let mut out = |info: &AgInfo| self.kern_out(info, now);
            for rt in store.iter() {
                if let Some(info) = kern_candidate(rt, rip_on) {
                    ag.check(info, &mut out);
                }
            }
            ag.flush_all(&mut out);
        }

        let mut ops = Vec::new();
        let mut statics = Vec::new();
        let mut next_keep: Option<Duration> = None;
        let mut failed = false;
        let prefixes: Vec<Prefix> = self.table.keys().copied().collect();

        for prefix in prefixes {
            let Some(k) = self.table.get_mut(&prefix) else {
                continue;
            };

            if k.state.contains(KernState::STATIC) {
                statics.push(k.clone());
                continue;
            }

            // operator deletions are honoured for a while
            if k.keep > now {
                next_keep = Some(next_keep.map_or(k.keep, |t| t.min(k.keep)));
                k.state |= KernState::DELETE;
                continue;
            }

            if k.state.contains(KernState::DELETE) && !k.state.contains(KernState::DYNAMIC) {
                let route = k.route();
                ops.push(KernelOp::Delete(route));
                if apply("delete", kernel.delete(&route)) {
                    self.table.remove(&prefix);
                } else {
                    failed = true;
                }
                continue;
            }

            let route = k.route();
            let mut ok = true;
            if k.state.contains(KernState::DEL_ADD) {
                ops.push(KernelOp::Delete(route));
                ok &= apply("delete", kernel.delete(&route));
            }
            if k.state.contains(KernState::ADD) {
                ops.push(KernelOp::Add(route));
                ok &= apply("add", kernel.add(&route));
            } else if k.state.contains(KernState::CHANGE) {
                ops.push(KernelOp::Change(route));
                ok &= apply("change", kernel.change(&route));
            }
            if ok {
                k.state -= KernState::ADD | KernState::CHANGE | KernState::DEL_ADD | KernState::DELETED;
            } else {
                failed = true;
            }
            k.state |= KernState::DELETE;
        }

        for k in &statics {
            check_static(store, ifs, k, now);
        }

        if failed {
            let retry = now + store.books.timers.supply;
            next_keep = Some(next_keep.map_or(retry, |t| t.min(retry)));
        }
        store.books.need_kern = next_keep;
        ops
    }

    /// Record what the kernel should hold for one aggregated route
    fn kern_out(&mut self, ag: &AgInfo, now: Duration) {
        // connected routes belong to the kernel
        if ag.state.contains(AgState::IF) {
            return;
        }

        let prefix = Prefix::new(ag.dst, ag.mask);
        let k = if ag.metric >= HOPCNT_INFINITY {
            // never install a black hole that is not already there
            match self.table.get_mut(&prefix) {
                Some(k) => k,
                None => return,
            }
        } else {
            self.table
                .entry(prefix)
                .or_insert_with(|| KernEntry::new(prefix, now))
        };
        k.time = now;

        if k.state.contains(KernState::NEW) {
            k.state = KernState::ADD;
            if ag.state.contains(AgState::GATEWAY) {
                k.state |= KernState::GATEWAY;
            }
            k.gate = ag.gate;
            k.metric = ag.metric;
            return;
        }

        if k.state.contains(KernState::STATIC) {
            return;
        }

        if k.gate != ag.gate || k.metric != ag.metric {
            // a dead route cannot be changed in place
            if k.metric >= HOPCNT_INFINITY {
                k.state |= KernState::DEL_ADD;
            }
            k.gate = ag.gate;
            k.metric = ag.metric;
            k.state |= KernState::CHANGE;
        }

        // the daemon overrides redirects and, eventually, the operator
        if k.state.intersects(KernState::DYNAMIC | KernState::DELETED) {
            k.state -= KernState::DYNAMIC;
            k.state |= KernState::ADD | KernState::DEL_ADD;
        }

        let want_gateway = ag.state.contains(AgState::GATEWAY);
        if k.state.contains(KernState::GATEWAY) != want_gateway {
            k.state.set(KernState::GATEWAY, want_gateway);
            k.state |= KernState::ADD | KernState::DEL_ADD;
        }

        // just delete rather than delete and add a bad route
        if k.metric >= HOPCNT_INFINITY && k.state.contains(KernState::DEL_ADD) {
            k.state |= KernState::DELETE;
        } else {
            k.state -= KernState::DELETE;
        }
    }

    /// A route showed up in the kernel. `keep` holds off deleting it.
    pub fn note_added(
        &mut self,
        route: &KernelRoute,
        origin: RouteOrigin,
        store: &mut RouteStore,
        ifs: &Interfaces,
        supplier: bool,
        keep: Duration,
        now: Duration,
    ) {
        let prefix = route.prefix;
        if origin == RouteOrigin::Ours && self.table.contains_key(&prefix) {
            return;
        }
        let k = self
            .table
            .entry(prefix)
            .or_insert_with(|| KernEntry::new(prefix, now));
        if k.state.contains(KernState::NEW) {
            k.keep = keep;
        }
        k.gate = route.gate;
        k.metric = route.metric.min(HOPCNT_INFINITY - 1);
        k.state -= KernState::DELETE
            | KernState::ADD
            | KernState::CHANGE
            | KernState::DEL_ADD
            | KernState::GATEWAY
            | KernState::STATIC
            | KernState::NEW;
        if route.gateway {
            k.state |= KernState::GATEWAY;
        }

        match origin {
            RouteOrigin::Redirect => {
                if supplier {
                    // routers do not take redirects
                    k.state -= KernState::DYNAMIC;
                    k.state |= KernState::DELETE;
                    tracing::info!("mark for deletion redirected {} --> {}", prefix, route.gate);
                } else {
                    k.state |= KernState::DYNAMIC;
                    k.redirect_time = now;
                    tracing::info!("accept redirected {} --> {}", prefix, route.gate);
                }
                store.books.kern_dirty(now);
            }
            RouteOrigin::Ours => {
                k.state |= KernState::DELETE;
                store.books.kern_dirty(k.keep.max(now));
            }
            RouteOrigin::Foreign => {
                k.state |= KernState::STATIC;
                let k = k.clone();
                check_static(store, ifs, &k, now);
            }
        }
    }

    /// A route vanished from the kernel without us removing it
    pub fn note_removed(&mut self, prefix: &Prefix, store: &mut RouteStore, now: Duration) {
        let Some(k) = self.table.get_mut(prefix) else {
            return;
        };
        if k.state.contains(KernState::STATIC) {
            let k = k.clone();
            del_static(store, &k, now);
            self.table.remove(prefix);
            return;
        }
        if k.state.contains(KernState::DYNAMIC) {
            self.table.remove(prefix);
            return;
        }
        if !k.state.contains(KernState::DELETED) {
            k.state |= KernState::DELETED;
            k.keep = now + K_KEEP_LIM;
            tracing::info!("operator deleted {}; leaving it alone for {:?}", prefix, K_KEEP_LIM);
            store.books.kern_dirty(now);
        }
    }

    /// Retire redirect routes through a failed gateway or older than `old`
    pub fn del_redirects(
        &mut self,
        bad_gate: Option<Ipv4Addr>,
        old: Duration,
        supplier: bool,
        store: &mut RouteStore,
        now: Duration,
    ) {
        for k in self.table.values_mut() {
            if !k.state.contains(KernState::DYNAMIC) || k.state.contains(KernState::STATIC) {
                continue;
            }
            if Some(k.gate) != bad_gate && k.redirect_time > old && !supplier {
                continue;
            }
            k.state |= KernState::DELETE;
            k.state -= KernState::DYNAMIC;
            store.books.kern_dirty(now);
            tracing::debug!("mark redirected {} --> {} for deletion", k.prefix, k.gate);
        }
    }

    /// Remove everything we installed, for shutdown
    pub fn flush_all(&mut self, kernel: &mut dyn KernelTable) -> Vec<KernelOp> {
        let mut ops = Vec::new();
        for k in self.table.values() {
            if k.state.intersects(KernState::STATIC | KernState::DYNAMIC | KernState::NEW) {
                continue;
            }
            let route = k.route();
            ops.push(KernelOp::Delete(route));
            apply("delete", kernel.delete(&route));
        }
        self.table.clear();
        ops
    }
}

/// True unless the operation should be tried again on a later pass
fn apply(what: &str, result: Result<(), KernelError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) if e.is_converged() => {
            tracing::debug!("kernel {}: {}", what, e);
            true
        }
        Err(e) if e.is_retryable() => {
            tracing::warn!("kernel {} failed, will retry: {}", what, e);
            false
        }
        Err(e) => {
            tracing::error!("kernel {} failed: {}", what, e);
            true
        }
    }
}

/// How a route table entry is offered to the aggregator for the kernel
fn kern_candidate(rt: &RouteEntry, rip_on: bool) -> Option<AgInfo> {
    if rt.state.intersects(RouteState::NET_SYN | RouteState::EXTERNAL) {
        return None;
    }
    let active = rt.active();
    let mut ags = AgState::empty();
    let mut pref;

    if !rt.state.contains(RouteState::IF) {
        pref = 1;
        ags |= AgState::GATEWAY | AgState::SUPPRESS | AgState::AGGREGATE;
        // host routes straight to the host would clash with ARP
        if rt.prefix.is_host() && rt.prefix.dst == u32::from(active.gate) {
            return None;
        }
    } else {
        // interfaces override received routes
        pref = 0;
        ags |= AgState::IF | AgState::CORS_GATE;
    }

    // with RIP off the discovered default stands for everything under it
    if rt.state.contains(RouteState::RDISC) && !rip_on {
        ags |= AgState::CORS_GATE;
    }

    let metric = active.metric;
    if metric >= HOPCNT_INFINITY {
        pref = HOPCNT_INFINITY;
        ags |= AgState::FINE_GATE | AgState::SUPPRESS;
        ags -= AgState::IF | AgState::CORS_GATE;
    }

    Some(AgInfo {
        dst: rt.prefix.dst,
        mask: rt.prefix.mask,
        gate: active.gate,
        nhop: Ipv4Addr::UNSPECIFIED,
        metric,
        pref,
        seqno: 0,
        tag: 0,
        state: ags,
    })
}

/// Advertise kernel static routes that carry a real metric
fn check_static(store: &mut RouteStore, ifs: &Interfaces, k: &KernEntry, now: Duration) {
    if k.metric == 0 {
        return;
    }
    let ifc = ifs.lookup(k.gate);
    let router = ifc
        .and_then(|i| ifs.get(i))
        .map(|i| i.addr)
        .unwrap_or(Ipv4Addr::LOCALHOST);
    let new = Spare::new(k.gate, router, k.metric as u32, 0, ifc, now);

    let result = match store.get(&k.prefix) {
        Some(rt) if rt.state.contains(RouteState::STATIC) => Ok(()),
        Some(rt) => {
            let state = rt.state | RouteState::STATIC;
            store.change(k.prefix, state, new, "Static", now)
        }
        None => store.add(k.prefix, RouteState::STATIC, new, now),
    };
    if let Err(e) = result {
        tracing::warn!("Failed to mirror kernel static {}: {}", k.prefix, e);
    }
}

/// A kernel static route went away
fn del_static(store: &mut RouteStore, k: &KernEntry, now: Duration) {
    let Some((rt, books)) = store.entry_mut(&k.prefix) else {
        return;
    };
    if !rt.state.contains(RouteState::STATIC) || rt.gate() != k.gate {
        return;
    }
    let new = Spare {
        metric: HOPCNT_INFINITY,
        ..*rt.active()
    };
    let state = rt.state - RouteState::STATIC;
    change_entry(rt, books, state, new, "DelStatic", now);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::interface::{IfIndex, Interface};
    use crate::timers::Timers;

    /// Remembers every request; prefixes in `fail` are rejected
    #[derive(Default)]
    pub(crate) struct RecordingKernel {
        pub ops: Vec<KernelOp>,
        pub fail: Vec<Prefix>,
    }

    impl RecordingKernel {
        fn check(&self, route: &KernelRoute) -> Result<(), KernelError> {
            if self.fail.contains(&route.prefix) {
                return Err(KernelError::Rejected {
                    prefix: route.prefix,
                    reason: "busy".to_string(),
                });
            }
            Ok(())
        }
    }

    impl KernelTable for RecordingKernel {
        fn add(&mut self, route: &KernelRoute) -> Result<(), KernelError> {
            self.ops.push(KernelOp::Add(*route));
            self.check(route)
        }
        fn change(&mut self, route: &KernelRoute) -> Result<(), KernelError> {
            self.ops.push(KernelOp::Change(*route));
            self.check(route)
        }
        fn delete(&mut self, route: &KernelRoute) -> Result<(), KernelError> {
            self.ops.push(KernelOp::Delete(*route));
            self.check(route)
        }
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    struct Fixture {
        store: RouteStore,
        ifs: Interfaces,
        ag: Aggregator,
        mirror: KernelMirror,
        kernel: RecordingKernel,
    }

    impl Fixture {
        fn new() -> Self {
            let ifs = Interfaces::new(vec![Interface::new("eth0", ip("192.168.1.1"), 24)]);
            let mut store = RouteStore::new(Timers::default());
            ifs.install_routes(&mut store, secs(1));
            Fixture {
                store,
                ifs,
                ag: Aggregator::default(),
                mirror: KernelMirror::new(),
                kernel: RecordingKernel::default(),
            }
        }

        fn learn(&mut self, dst: u32, mask: u32, gate: &str, metric: u32, now: Duration) {
            let spare = Spare::new(ip(gate), ip(gate), metric, 0, Some(IfIndex(0)), now);
            self.store.learn(Prefix::new(dst, mask), spare, now);
        }

        fn sync(&mut self, now: Duration) -> Vec<KernelOp> {
            self.mirror.sync(
                &mut self.store,
                &self.ifs,
                &mut self.ag,
                &mut self.kernel,
                true,
                now,
            )
        }
    }

    #[test]
    fn test_sync_adds_learned_route() {
        let mut fx = Fixture::new();
        fx.learn(0x0a00_0000, 0xff00_0000, "192.168.1.2", 3, secs(5));
        let ops = fx.sync(secs(5));
        assert_eq!(
            ops,
            vec![KernelOp::Add(KernelRoute {
                prefix: Prefix::new(0x0a00_0000, 0xff00_0000),
                gate: ip("192.168.1.2"),
                metric: 3,
                gateway: true,
            })]
        );
    }

    #[test]
    fn test_sync_is_idempotent() {
        let mut fx = Fixture::new();
        fx.learn(0x0a00_0000, 0xff00_0000, "192.168.1.2", 3, secs(5));
        fx.learn(0xac10_0000, 0xffff_0000, "192.168.1.3", 2, secs(5));
        assert_eq!(fx.sync(secs(5)).len(), 2);
        assert!(fx.sync(secs(6)).is_empty());
        assert!(fx.sync(secs(7)).is_empty());
    }

    #[test]
    fn test_interface_route_not_installed() {
        let mut fx = Fixture::new();
        assert!(fx.sync(secs(5)).is_empty());
        assert!(fx.mirror.is_empty());
    }

    #[test]
    fn test_metric_change_is_change() {
        let mut fx = Fixture::new();
        fx.learn(0x0a00_0000, 0xff00_0000, "192.168.1.2", 3, secs(5));
        fx.sync(secs(5));
        fx.learn(0x0a00_0000, 0xff00_0000, "192.168.1.2", 5, secs(6));
        let ops = fx.sync(secs(6));
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], KernelOp::Change(r) if r.metric == 5));
    }

    #[test]
    fn test_removed_route_deleted_next_pass() {
        let mut fx = Fixture::new();
        let prefix = Prefix::new(0x0a00_0000, 0xff00_0000);
        fx.learn(prefix.dst, prefix.mask, "192.168.1.2", 3, secs(5));
        fx.sync(secs(5));
        fx.store.delete(prefix, secs(6)).unwrap();
        let ops = fx.sync(secs(6));
        assert!(matches!(ops.as_slice(), [KernelOp::Delete(r)] if r.prefix == prefix));
        assert!(fx.mirror.get(&prefix).is_none());
        assert!(fx.sync(secs(7)).is_empty());
    }

    #[test]
    fn test_unreachable_route_never_installed() {
        let mut fx = Fixture::new();
        let prefix = Prefix::new(0x0a00_0000, 0xff00_0000);
        let dead = Spare::new(ip("192.168.1.2"), ip("192.168.1.2"), 16, 0, Some(IfIndex(0)), secs(5));
        fx.store.add(prefix, RouteState::empty(), dead, secs(5)).unwrap();
        assert!(fx.sync(secs(5)).is_empty());
        assert!(fx.mirror.get(&prefix).is_none());
    }

    #[test]
    fn test_poisoned_route_kept_until_removed() {
        let mut fx = Fixture::new();
        let prefix = Prefix::new(0x0a00_0000, 0xff00_0000);
        fx.learn(prefix.dst, prefix.mask, "192.168.1.2", 3, secs(5));
        fx.sync(secs(5));
        fx.learn(prefix.dst, prefix.mask, "192.168.1.2", 16, secs(6));
        let ops = fx.sync(secs(6));
        assert!(matches!(ops.as_slice(), [KernelOp::Change(r)] if r.metric == HOPCNT_INFINITY));
        assert!(fx.mirror.get(&prefix).is_some());
    }

    #[test]
    fn test_failed_add_is_retried() {
        let mut fx = Fixture::new();
        let prefix = Prefix::new(0x0a00_0000, 0xff00_0000);
        fx.kernel.fail.push(prefix);
        fx.learn(prefix.dst, prefix.mask, "192.168.1.2", 3, secs(5));
        assert_eq!(fx.sync(secs(5)).len(), 1);
        assert!(fx.mirror.get(&prefix).unwrap().state.contains(KernState::ADD));
        assert_eq!(fx.store.need_kern(), Some(secs(5) + fx.store.timers().supply));

        fx.kernel.fail.clear();
        let ops = fx.sync(secs(6));
        assert!(matches!(ops.as_slice(), [KernelOp::Add(r)] if r.prefix == prefix));
        assert!(fx.sync(secs(7)).is_empty());
    }

    #[test]
    fn test_foreign_static_untouched_and_mirrored() {
        let mut fx = Fixture::new();
        let prefix = Prefix::new(0x0a09_0000, 0xffff_0000);
        let route = KernelRoute {
            prefix,
            gate: ip("192.168.1.9"),
            metric: 3,
            gateway: true,
        };
        let now = secs(5);
        fx.mirror.note_added(
            &route,
            RouteOrigin::Foreign,
            &mut fx.store,
            &fx.ifs,
            true,
            now,
            now,
        );
        let rt = fx.store.get(&prefix).unwrap();
        assert!(rt.state.contains(RouteState::STATIC));
        assert_eq!(rt.metric(), 3);

        assert!(fx.sync(secs(6)).is_empty());
        assert!(fx.sync(secs(7)).is_empty());
        assert!(fx.mirror.get(&prefix).unwrap().state.contains(KernState::STATIC));
    }

    #[test]
    fn test_operator_delete_held_then_restored() {
        let mut fx = Fixture::new();
        let prefix = Prefix::new(0x0a00_0000, 0xff00_0000);
        fx.learn(prefix.dst, prefix.mask, "192.168.1.2", 3, secs(5));
        fx.sync(secs(5));

        fx.mirror.note_removed(&prefix, &mut fx.store, secs(10));
        fx.learn(prefix.dst, prefix.mask, "192.168.1.2", 3, secs(11));
        assert!(fx.sync(secs(11)).is_empty());
        assert_eq!(fx.store.need_kern(), Some(secs(10) + K_KEEP_LIM));

        let later = secs(10) + K_KEEP_LIM + secs(1);
        fx.learn(prefix.dst, prefix.mask, "192.168.1.2", 3, later);
        let ops = fx.sync(later);
        assert!(ops.iter().any(|op| matches!(op, KernelOp::Add(r) if r.prefix == prefix)));
    }

    #[test]
    fn test_leftover_route_from_previous_run_deleted() {
        let mut fx = Fixture::new();
        let prefix = Prefix::new(0x0b00_0000, 0xff00_0000);
        let route = KernelRoute {
            prefix,
            gate: ip("192.168.1.7"),
            metric: 2,
            gateway: true,
        };
        fx.mirror.note_added(
            &route,
            RouteOrigin::Ours,
            &mut fx.store,
            &fx.ifs,
            true,
            secs(1),
            secs(1),
        );
        let ops = fx.sync(secs(2));
        assert!(matches!(ops.as_slice(), [KernelOp::Delete(r)] if r.prefix == prefix));
    }

    #[test]
    fn test_flush_all_removes_ours() {
        let mut fx = Fixture::new();
        fx.learn(0x0a00_0000, 0xff00_0000, "192.168.1.2", 3, secs(5));
        fx.sync(secs(5));
        let ops = fx.mirror.flush_all(&mut fx.kernel);
        assert_eq!(ops.len(), 1);
        assert!(fx.mirror.is_empty());
    }
}
