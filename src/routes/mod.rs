// Routes module - the daemon's table of destinations, their active paths and spares

pub mod addr;
pub mod lookup;

use bitflags::bitflags;
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::RouteError;
use crate::interface::IfIndex;
use crate::timers::{FlashTimer, Timers};

/// Metric meaning "unreachable"
pub const HOPCNT_INFINITY: u8 = 16;

/// Paths kept per destination, the active one included
pub const NUM_SPARES: usize = 4;

/// Learned routes beyond this are ignored
pub const MAX_ROUTES: usize = 5000;

pub fn clamp_metric(metric: u32) -> u8 {
    metric.min(HOPCNT_INFINITY as u32) as u8
}

/// Destination network and mask, both in host order.
///
/// Sorts by destination and then from the most to the least specific mask,
/// which is the order the aggregation engine expects its input in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    pub dst: u32,
    pub mask: u32,
}

impl Prefix {
    pub const DEFAULT: Prefix = Prefix { dst: 0, mask: 0 };

    pub fn new(dst: u32, mask: u32) -> Self {
        Prefix {
            dst: dst & mask,
            mask,
        }
    }

    pub fn host(dst: u32) -> Self {
        Prefix {
            dst,
            mask: addr::HOST_MASK,
        }
    }

    pub fn is_host(&self) -> bool {
        self.mask == addr::HOST_MASK
    }

    pub fn is_default(&self) -> bool {
        self.mask == 0
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr::on_net(addr, self.dst, self.mask)
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        addr::addr(self.dst)
    }
}

impl Ord for Prefix {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dst
            .cmp(&other.dst)
            .then_with(|| other.mask.cmp(&self.mask))
    }
}

impl PartialOrd for Prefix {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&addr::addr_name(self.dst, self.mask))
    }
}

impl Serialize for Prefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

bitflags! {
    /// Administrative state of a route entry
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RouteState: u16 {
        /// Route to a directly attached network
        const IF = 0x0001;
        /// Administrator declared internal network
        const NET_INT = 0x0002;
        /// Synthetic classful network for RIPv1 listeners
        const NET_SYN = 0x0004;
        /// Finer than the classful mask
        const SUBNET = 0x0008;
        /// One of our own addresses
        const LOCAL = 0x0010;
        /// Alias address of a multihomed host
        const MHOME = 0x0020;
        /// Configured static route
        const STATIC = 0x0040;
        /// Default route learned by router discovery
        const RDISC = 0x0080;
        /// Managed by something else; neither installed nor advertised
        const EXTERNAL = 0x0100;

        /// Never switched to a spare by the failover logic
        const PERMANENT = Self::IF.bits() | Self::STATIC.bits() | Self::RDISC.bits()
            | Self::NET_SYN.bits() | Self::MHOME.bits() | Self::LOCAL.bits();
        /// Never aged
        const AGELESS = Self::PERMANENT.bits() | Self::NET_INT.bits() | Self::EXTERNAL.bits();
    }
}

impl RouteState {
    /// Short names for logs and the status API
    pub fn names(&self) -> Vec<String> {
        self.iter_names()
            .map(|(name, _)| name.to_string())
            .collect()
    }
}

/// One path to a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Spare {
    pub ifc: Option<IfIndex>,
    pub gate: Ipv4Addr,
    /// Router that advertised the path; differs from the gateway when a
    /// RIPv2 next hop redirected it
    pub router: Ipv4Addr,
    pub metric: u8,
    pub tag: u16,
    /// When the path was last heard
    pub time: Duration,
}

impl Spare {
    pub const EMPTY: Spare = Spare {
        ifc: None,
        gate: Ipv4Addr::UNSPECIFIED,
        router: Ipv4Addr::UNSPECIFIED,
        metric: HOPCNT_INFINITY,
        tag: 0,
        time: Duration::ZERO,
    };

    pub fn new(
        gate: Ipv4Addr,
        router: Ipv4Addr,
        metric: u32,
        tag: u16,
        ifc: Option<IfIndex>,
        time: Duration,
    ) -> Self {
        Spare {
            ifc,
            gate,
            router,
            metric: clamp_metric(metric),
            tag,
            time,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.gate.is_unspecified() && self.router.is_unspecified()
    }

    pub fn is_reachable(&self) -> bool {
        !self.is_empty() && self.metric < HOPCNT_INFINITY
    }
}

/// Refusal to switch to worse-or-equal alternates after a route failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HoldDown {
    pub until: Duration,
    /// Metric the route had before it failed
    pub metric: u8,
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub prefix: Prefix,
    pub state: RouteState,
    /// Slot 0 is the active path
    pub spares: [Spare; NUM_SPARES],
    /// Value of the update sequence number when gateway or metric last changed
    pub seqno: u32,
    /// Last time a better route was advertised, for poison reverse
    pub poison_time: Duration,
    pub poison_metric: u8,
    pub hold: Option<HoldDown>,
}

impl RouteEntry {
    pub fn active(&self) -> &Spare {
        &self.spares[0]
    }

    pub fn metric(&self) -> u8 {
        self.spares[0].metric
    }

    pub fn gate(&self) -> Ipv4Addr {
        self.spares[0].gate
    }

    pub fn ifc(&self) -> Option<IfIndex> {
        self.spares[0].ifc
    }

    pub fn is_ageless(&self) -> bool {
        self.state.intersects(RouteState::AGELESS)
    }

    pub fn in_hold_down(&self, now: Duration) -> bool {
        self.hold.is_some_and(|h| now < h.until)
    }
}

/// What `learn` did with an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LearnOutcome {
    Added,
    /// The active path changed
    Updated,
    /// Stored or replaced a spare
    Spare,
    /// Same path heard again
    Refreshed,
    /// A spare was withdrawn
    Removed,
    Ignored,
    TableFull,
}

/// Global state that route mutations feed
#[derive(Debug, Clone)]
pub struct Bookkeeping {
    /// Bumped after every flash or full update
    pub update_seqno: u32,
    /// Earliest time the kernel table needs to be reconciled
    pub need_kern: Option<Duration>,
    pub flash: FlashTimer,
    pub timers: Timers,
}

impl Bookkeeping {
    pub fn new(timers: Timers) -> Self {
        Bookkeeping {
            update_seqno: 0,
            need_kern: None,
            flash: FlashTimer::new(),
            timers,
        }
    }

    pub fn kern_dirty(&mut self, now: Duration) {
        self.need_kern = Some(self.need_kern.map_or(now, |t| t.min(now)));
    }

    pub fn need_flash(&mut self, now: Duration) {
        self.flash.request(now, self.timers.flash_min);
    }
}

/// The route table.
///
/// Keyed by prefix and iterated in `Prefix` order. Every structural change
/// marks the kernel mirror dirty; gateway and metric changes also bump the
/// entry's sequence number and arm a flash update.
#[derive(Debug, Clone)]
pub struct RouteStore {
    routes: BTreeMap<Prefix, RouteEntry>,
    pub(crate) books: Bookkeeping,
    max_routes: usize,
}

impl RouteStore {
    pub fn new(timers: Timers) -> Self {
        RouteStore::with_capacity(timers, MAX_ROUTES)
    }

    pub fn with_capacity(timers: Timers, max_routes: usize) -> Self {
        RouteStore {
            routes: BTreeMap::new(),
            books: Bookkeeping::new(timers),
            max_routes,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.routes.len() >= self.max_routes
    }

    pub fn timers(&self) -> &Timers {
        &self.books.timers
    }

    pub fn update_seqno(&self) -> u32 {
        self.books.update_seqno
    }

    pub fn books_mut(&mut self) -> &mut Bookkeeping {
        &mut self.books
    }

    pub fn need_kern(&self) -> Option<Duration> {
        self.books.need_kern
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.values()
    }

    pub fn prefixes(&self) -> Vec<Prefix> {
        self.routes.keys().copied().collect()
    }

    pub fn get(&self, prefix: &Prefix) -> Option<&RouteEntry> {
        self.routes.get(prefix)
    }

    /// Exact match
    pub fn lookup(&self, dst: u32, mask: u32) -> Option<&RouteEntry> {
        self.routes.get(&Prefix::new(dst, mask))
    }

    /// Create an entry. Fails if the destination is already present.
    pub fn add(
        &mut self,
        prefix: Prefix,
        state: RouteState,
        new: Spare,
        now: Duration,
    ) -> Result<(), RouteError> {
        if self.routes.contains_key(&prefix) {
            return Err(RouteError::Duplicate(prefix));
        }
        let mut state = state;
        let smask = addr::std_mask(prefix.dst);
        if prefix.mask > smask && !prefix.is_host() && smask != 0 {
            state |= RouteState::SUBNET;
        }
        let mut spares = [Spare::EMPTY; NUM_SPARES];
        spares[0] = new;
        spares[0].metric = spares[0].metric.min(HOPCNT_INFINITY);
        if state.intersects(RouteState::AGELESS) {
            spares[0].time = now;
        }
        tracing::debug!(
            "Add {} gate {} metric {}",
            prefix,
            new.gate,
            spares[0].metric
        );
        self.routes.insert(
            prefix,
            RouteEntry {
                prefix,
                state,
                spares,
                seqno: self.books.update_seqno,
                poison_time: Duration::ZERO,
                poison_metric: HOPCNT_INFINITY,
                hold: None,
            },
        );
        self.books.kern_dirty(now);
        self.books.need_flash(now);
        Ok(())
    }

    /// Replace the active path and state of an entry
    pub fn change(
        &mut self,
        prefix: Prefix,
        state: RouteState,
        new: Spare,
        label: &str,
        now: Duration,
    ) -> Result<(), RouteError> {
        let RouteStore { routes, books, .. } = self;
        let rt = routes
            .get_mut(&prefix)
            .ok_or(RouteError::NotFound(prefix))?;
        change_entry(rt, books, state, new, label, now);
        Ok(())
    }

    pub fn delete(&mut self, prefix: Prefix, now: Duration) -> Result<RouteEntry, RouteError> {
        let rt = self
            .routes
            .remove(&prefix)
            .ok_or(RouteError::NotFound(prefix))?;
        tracing::debug!("Del {} gate {} metric {}", prefix, rt.gate(), rt.metric());
        self.books.kern_dirty(now);
        Ok(rt)
    }

    /// Make a spare the active path. With `None` the best spare is chosen
    /// and nothing happens unless it beats the current path.
    pub fn switch_to_spare(
        &mut self,
        prefix: Prefix,
        spare: Option<usize>,
        now: Duration,
    ) -> Result<bool, RouteError> {
        let RouteStore { routes, books, .. } = self;
        let rt = routes
            .get_mut(&prefix)
            .ok_or(RouteError::NotFound(prefix))?;
        Ok(switch_entry(rt, books, spare, now))
    }

    /// Feed one received path into the table.
    ///
    /// An update from the router owning the active path is always taken, even
    /// when worse. Other routers only displace the worst spare, and the
    /// active path changes only when the failover ordering prefers the spare.
    pub fn learn(&mut self, prefix: Prefix, new: Spare, now: Duration) -> LearnOutcome {
        if !self.routes.contains_key(&prefix) {
            if new.metric >= HOPCNT_INFINITY {
                return LearnOutcome::Ignored;
            }
            if self.is_full() {
                return LearnOutcome::TableFull;
            }
            return match self.add(prefix, RouteState::empty(), new, now) {
                Ok(()) => LearnOutcome::Added,
                Err(_) => LearnOutcome::Ignored,
            };
        }

        let RouteStore { routes, books, .. } = self;
        let Some(rt) = routes.get_mut(&prefix) else {
            return LearnOutcome::Ignored;
        };
        let mut new = new;
        let stale = books.timers.now_stale(now);

        let same = rt.spares.iter().position(|s| !s.is_empty() && s.router == new.router);
        let slot = match same {
            Some(0) => {
                let old = rt.spares[0];
                if old.metric >= HOPCNT_INFINITY && new.metric >= HOPCNT_INFINITY {
                    new.time = old.time;
                }
                if old == new {
                    return LearnOutcome::Refreshed;
                }
                let unchanged = old.gate == new.gate && old.metric == new.metric;
                let state = rt.state;
                change_entry(rt, books, state, new, "Chg", now);
                if new.metric > old.metric {
                    switch_entry(rt, books, None, now);
                }
                return if unchanged {
                    LearnOutcome::Refreshed
                } else {
                    LearnOutcome::Updated
                };
            }
            Some(i) => {
                let old = rt.spares[i];
                if old.metric >= HOPCNT_INFINITY && new.metric >= HOPCNT_INFINITY {
                    new.time = old.time;
                }
                if old.gate == new.gate && old.metric == new.metric && old.tag == new.tag {
                    rt.spares[i] = new;
                    return LearnOutcome::Refreshed;
                }
                if new.metric >= HOPCNT_INFINITY {
                    rt.spares[i] = Spare::EMPTY;
                    return LearnOutcome::Removed;
                }
                i
            }
            None => {
                let mut worst = 1;
                for i in 2..NUM_SPARES {
                    if better_link(&rt.spares[worst], &rt.spares[i], None, stale, now) {
                        worst = i;
                    }
                }
                if new.metric >= rt.spares[worst].metric && !rt.spares[worst].is_empty() {
                    return LearnOutcome::Ignored;
                }
                if new.metric >= HOPCNT_INFINITY {
                    return LearnOutcome::Ignored;
                }
                worst
            }
        };

        tracing::debug!(
            "Spare {} slot {} gate {} metric {}",
            prefix,
            slot,
            new.gate,
            new.metric
        );
        rt.spares[slot] = new;
        if switch_entry(rt, books, Some(slot), now) {
            LearnOutcome::Updated
        } else {
            LearnOutcome::Spare
        }
    }

    /// Fail every path through an interface that went down
    pub fn bad_interface(&mut self, ifc: IfIndex, now: Duration) {
        let RouteStore { routes, books, .. } = self;
        let expired = books.timers.now_expire(now);
        for rt in routes.values_mut() {
            for i in 1..NUM_SPARES {
                if rt.spares[i].ifc == Some(ifc) {
                    rt.spares[i].metric = HOPCNT_INFINITY;
                    rt.spares[i].time = rt.spares[i].time.min(expired);
                }
            }
            if rt.spares[0].ifc == Some(ifc) && rt.spares[0].metric < HOPCNT_INFINITY {
                let new = Spare {
                    metric: HOPCNT_INFINITY,
                    ..rt.spares[0]
                };
                let state = rt.state
                    - (RouteState::IF | RouteState::LOCAL | RouteState::NET_SYN | RouteState::STATIC);
                change_entry(rt, books, state, new, "BadIf", now);
                switch_entry(rt, books, None, now);
            }
        }
    }

    pub(crate) fn entry_mut(&mut self, prefix: &Prefix) -> Option<(&mut RouteEntry, &mut Bookkeeping)> {
        let RouteStore { routes, books, .. } = self;
        routes.get_mut(prefix).map(|rt| (rt, books))
    }
}

/// Change the active path of an entry.
///
/// A change to infinity backdates the path so it is only advertised as
/// unreachable until garbage collection, and starts the hold-down.
pub(crate) fn change_entry(
    rt: &mut RouteEntry,
    books: &mut Bookkeeping,
    state: RouteState,
    new: Spare,
    label: &str,
    now: Duration,
) {
    let old = rt.spares[0];
    let mut new = new;
    new.metric = new.metric.min(HOPCNT_INFINITY);

    if old.metric != new.metric {
        if new.metric >= HOPCNT_INFINITY {
            new.time = new.time.min(books.timers.now_expire(now));
            if old.metric < HOPCNT_INFINITY {
                rt.hold = Some(HoldDown {
                    until: now + books.timers.hold_down,
                    metric: old.metric,
                });
            }
        } else {
            rt.hold = None;
        }
        books.kern_dirty(now);
        rt.seqno = books.update_seqno;
        books.need_flash(now);
    }
    if old.gate != new.gate {
        books.kern_dirty(now);
        rt.seqno = books.update_seqno;
        books.need_flash(now);
    }

    let state = (state - RouteState::SUBNET) | (rt.state & RouteState::SUBNET);
    if state.intersects(RouteState::AGELESS) {
        new.time = now;
    }
    if old.metric != new.metric || old.gate != new.gate || rt.state != state {
        tracing::debug!(
            "{} {} gate {} metric {} -> gate {} metric {}",
            label,
            rt.prefix,
            old.gate,
            old.metric,
            new.gate,
            new.metric
        );
    }
    rt.state = state;
    rt.spares[0] = new;
}

/// Switch to the best spare, or the given one. Returns whether the active
/// path changed. Permanent routes are never switched.
pub(crate) fn switch_entry(
    rt: &mut RouteEntry,
    books: &mut Bookkeeping,
    spare: Option<usize>,
    now: Duration,
) -> bool {
    if rt.state.intersects(RouteState::PERMANENT) {
        return false;
    }
    let stale = books.timers.now_stale(now);
    let mut best = 1;
    for i in 2..NUM_SPARES {
        if better_link(&rt.spares[i], &rt.spares[best], rt.hold, stale, now) {
            best = i;
        }
    }
    let best = match spare {
        Some(i)
            if (1..NUM_SPARES).contains(&i)
                && !better_link(&rt.spares[best], &rt.spares[i], rt.hold, stale, now) =>
        {
            i
        }
        _ => best,
    };
    if !better_link(&rt.spares[best], &rt.spares[0], rt.hold, stale, now) {
        return false;
    }

    let old = rt.spares[0];
    let new = rt.spares[best];
    let state = rt.state - (RouteState::NET_SYN | RouteState::RDISC);
    change_entry(rt, books, state, new, "Switch", now);
    rt.spares[best] = if old.metric >= HOPCNT_INFINITY {
        Spare::EMPTY
    } else {
        old
    };
    true
}

/// Failover ordering between two paths of one destination.
///
/// A candidate must be live and, during hold-down, strictly better than the
/// metric the route had before it failed. It then wins over a dead or stale
/// incumbent, on a lower metric, or on an equal metric when it came straight
/// from the advertising router and the incumbent was redirected.
pub(crate) fn better_link(
    cand: &Spare,
    inc: &Spare,
    hold: Option<HoldDown>,
    stale: Duration,
    now: Duration,
) -> bool {
    if !cand.is_reachable() || cand.time < stale {
        return false;
    }
    if let Some(h) = hold {
        if now < h.until && cand.metric >= h.metric {
            return false;
        }
    }
    if !inc.is_reachable() || inc.time < stale {
        return true;
    }
    match cand.metric.cmp(&inc.metric) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => cand.gate == cand.router && inc.gate != inc.router,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn path(router: &str, metric: u32, now: Duration) -> Spare {
        Spare::new(ip(router), ip(router), metric, 0, Some(IfIndex(0)), now)
    }

    fn net10() -> Prefix {
        Prefix::new(0x0a00_0000, 0xff00_0000)
    }

    #[test]
    fn test_prefix_order_specific_first() {
        let mut prefixes = vec![
            Prefix::new(0x0a00_0000, 0xff00_0000),
            Prefix::new(0x0a00_0000, 0xffff_ff00),
            Prefix::new(0x0900_0000, 0xff00_0000),
        ];
        prefixes.sort();
        assert_eq!(prefixes[0].dst, 0x0900_0000);
        assert_eq!(prefixes[1].mask, 0xffff_ff00);
        assert_eq!(prefixes[2].mask, 0xff00_0000);
    }

    #[test]
    fn test_add_duplicate_is_error() {
        let mut store = RouteStore::new(Timers::default());
        store.add(net10(), RouteState::empty(), path("1.1.1.1", 2, secs(1)), secs(1)).unwrap();
        let err = store
            .add(net10(), RouteState::empty(), path("1.1.1.1", 2, secs(1)), secs(1))
            .unwrap_err();
        assert_eq!(err, RouteError::Duplicate(net10()));
    }

    #[test]
    fn test_metric_always_clamped() {
        let mut store = RouteStore::new(Timers::default());
        let mut spare = path("1.1.1.1", 40, secs(1));
        assert_eq!(spare.metric, HOPCNT_INFINITY);
        spare.metric = 200;
        store.add(net10(), RouteState::empty(), spare, secs(1)).unwrap();
        assert_eq!(store.get(&net10()).unwrap().metric(), HOPCNT_INFINITY);
        store
            .change(net10(), RouteState::empty(), spare, "Chg", secs(2))
            .unwrap();
        assert_eq!(store.get(&net10()).unwrap().metric(), HOPCNT_INFINITY);
    }

    #[test]
    fn test_subnet_flag_on_add() {
        let mut store = RouteStore::new(Timers::default());
        let sub = Prefix::new(0x0a01_0000, 0xffff_0000);
        store.add(sub, RouteState::empty(), path("1.1.1.1", 2, secs(1)), secs(1)).unwrap();
        assert!(store.get(&sub).unwrap().state.contains(RouteState::SUBNET));
    }

    #[test]
    fn test_change_bumps_seqno_and_flash() {
        let mut store = RouteStore::new(Timers::default());
        store.add(net10(), RouteState::empty(), path("1.1.1.1", 2, secs(1)), secs(1)).unwrap();
        store.books.flash.sent(secs(1), secs(2));
        store.books.update_seqno = 7;
        store
            .change(net10(), RouteState::empty(), path("1.1.1.1", 3, secs(10)), "Chg", secs(10))
            .unwrap();
        assert_eq!(store.get(&net10()).unwrap().seqno, 7);
        assert!(store.books.flash.is_needed());
    }

    #[test]
    fn test_same_router_always_accepted() {
        let mut store = RouteStore::new(Timers::default());
        let now = secs(100);
        assert_eq!(store.learn(net10(), path("1.1.1.1", 6, now), now), LearnOutcome::Added);
        assert_eq!(store.learn(net10(), path("1.1.1.1", 4, now), now), LearnOutcome::Updated);
        assert_eq!(store.get(&net10()).unwrap().metric(), 4);
        assert_eq!(store.learn(net10(), path("1.1.1.1", 9, now), now), LearnOutcome::Updated);
        assert_eq!(store.get(&net10()).unwrap().metric(), 9);
    }

    #[test]
    fn test_other_router_must_be_better() {
        let mut store = RouteStore::new(Timers::default());
        let now = secs(100);
        store.learn(net10(), path("1.1.1.1", 4, now), now);
        assert_eq!(store.learn(net10(), path("2.2.2.2", 5, now), now), LearnOutcome::Spare);
        assert_eq!(store.get(&net10()).unwrap().gate(), ip("1.1.1.1"));
        assert_eq!(store.learn(net10(), path("3.3.3.3", 2, now), now), LearnOutcome::Updated);
        let rt = store.get(&net10()).unwrap();
        assert_eq!(rt.gate(), ip("3.3.3.3"));
        assert!(rt.spares.iter().any(|s| s.router == ip("1.1.1.1")));
    }

    #[test]
    fn test_worse_update_switches_to_spare() {
        let mut store = RouteStore::new(Timers::default());
        let now = secs(100);
        store.learn(net10(), path("1.1.1.1", 2, now), now);
        store.learn(net10(), path("2.2.2.2", 4, now), now);
        store.learn(net10(), path("1.1.1.1", 8, now), now);
        let rt = store.get(&net10()).unwrap();
        assert_eq!(rt.gate(), ip("2.2.2.2"));
        assert_eq!(rt.metric(), 4);
    }

    fn with_spares(store: &mut RouteStore, now: Duration) {
        store.add(net10(), RouteState::empty(), path("1.1.1.1", 5, now), now).unwrap();
        let (rt, books) = store.entry_mut(&net10()).unwrap();
        rt.spares[1] = path("2.2.2.2", 3, now);
        rt.spares[2] = path("3.3.3.3", 3, now);
        books.flash.sent(now, secs(2));
        books.update_seqno = 9;
        books.need_kern = None;
    }

    #[test]
    fn test_switch_to_named_spare() {
        let mut store = RouteStore::new(Timers::default());
        let now = secs(100);
        with_spares(&mut store, now);

        let later = now + secs(1);
        assert_eq!(store.switch_to_spare(net10(), Some(2), later), Ok(true));
        let rt = store.get(&net10()).unwrap();
        assert_eq!(rt.gate(), ip("3.3.3.3"));
        assert_eq!(rt.metric(), 3);
        assert_eq!(rt.seqno, 9);
        assert_eq!(rt.spares[2].gate, ip("1.1.1.1"));
        assert_eq!(rt.spares[1].gate, ip("2.2.2.2"));
        assert!(store.books.flash.is_needed());
        assert_eq!(store.need_kern(), Some(later));
    }

    #[test]
    fn test_switch_to_best_spare() {
        let mut store = RouteStore::new(Timers::default());
        let now = secs(100);
        with_spares(&mut store, now);

        let later = now + secs(1);
        assert_eq!(store.switch_to_spare(net10(), None, later), Ok(true));
        let rt = store.get(&net10()).unwrap();
        assert_eq!(rt.gate(), ip("2.2.2.2"));
        assert_eq!(rt.spares[1].gate, ip("1.1.1.1"));
        assert!(store.books.flash.is_needed());

        // the demoted path is worse, so nothing moves again
        assert_eq!(store.switch_to_spare(net10(), None, later), Ok(false));
        assert_eq!(store.get(&net10()).unwrap().gate(), ip("2.2.2.2"));

        let other = Prefix::new(0x0b00_0000, 0xff00_0000);
        assert_eq!(
            store.switch_to_spare(other, None, later),
            Err(RouteError::NotFound(other))
        );
    }

    #[test]
    fn test_unreachable_unknown_route_ignored() {
        let mut store = RouteStore::new(Timers::default());
        let now = secs(100);
        assert_eq!(
            store.learn(net10(), path("1.1.1.1", 16, now), now),
            LearnOutcome::Ignored
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_table_full() {
        let mut store = RouteStore::with_capacity(Timers::default(), 1);
        let now = secs(1);
        store.learn(net10(), path("1.1.1.1", 1, now), now);
        let other = Prefix::new(0x0b00_0000, 0xff00_0000);
        assert_eq!(store.learn(other, path("1.1.1.1", 1, now), now), LearnOutcome::TableFull);
    }

    #[test]
    fn test_hold_down_blocks_equal_alternate() {
        let mut store = RouteStore::new(Timers::default());
        let now = secs(100);
        store.learn(net10(), path("1.1.1.1", 3, now), now);
        store.learn(net10(), path("1.1.1.1", 16, now), now);
        let rt = store.get(&net10()).unwrap();
        assert_eq!(rt.metric(), HOPCNT_INFINITY);
        assert_eq!(rt.hold.unwrap().metric, 3);

        // an alternate no better than the old metric is held off
        store.learn(net10(), path("2.2.2.2", 3, secs(110)), secs(110));
        assert_eq!(store.get(&net10()).unwrap().gate(), ip("1.1.1.1"));

        // a strictly better one is taken at once
        store.learn(net10(), path("3.3.3.3", 2, secs(111)), secs(111));
        let rt = store.get(&net10()).unwrap();
        assert_eq!(rt.gate(), ip("3.3.3.3"));
        assert!(rt.hold.is_none());
    }

    #[test]
    fn test_hold_down_expires() {
        let mut store = RouteStore::new(Timers::default());
        let now = secs(100);
        store.learn(net10(), path("1.1.1.1", 3, now), now);
        store.learn(net10(), path("1.1.1.1", 16, now), now);
        let later = now + HOLD_DOWN + secs(1);
        store.learn(net10(), path("2.2.2.2", 5, later), later);
        assert_eq!(store.get(&net10()).unwrap().gate(), ip("2.2.2.2"));
    }

    const HOLD_DOWN: Duration = crate::timers::HOLD_DOWN_TIME;

    #[test]
    fn test_permanent_route_not_switched() {
        let mut store = RouteStore::new(Timers::default());
        let now = secs(100);
        let mut ifc_path = path("10.0.0.1", 0, now);
        ifc_path.metric = 0;
        store.add(net10(), RouteState::IF, ifc_path, now).unwrap();
        store.learn(net10(), path("10.0.0.2", 0, now), now);
        assert_eq!(store.get(&net10()).unwrap().gate(), ip("10.0.0.1"));
    }

    #[test]
    fn test_better_link_prefers_direct_path() {
        let now = secs(100);
        let direct = path("1.1.1.1", 3, now);
        let redirected = Spare::new(ip("2.2.2.2"), ip("3.3.3.3"), 3, 0, None, now);
        assert!(better_link(&direct, &redirected, None, Duration::ZERO, now));
        assert!(!better_link(&redirected, &direct, None, Duration::ZERO, now));
    }

    #[test]
    fn test_delete_marks_kernel_dirty() {
        let mut store = RouteStore::new(Timers::default());
        store.add(net10(), RouteState::empty(), path("1.1.1.1", 2, secs(1)), secs(1)).unwrap();
        store.books.need_kern = None;
        store.delete(net10(), secs(5)).unwrap();
        assert_eq!(store.need_kern(), Some(secs(5)));
        assert_eq!(store.delete(net10(), secs(5)).unwrap_err(), RouteError::NotFound(net10()));
    }
}
