// Aggregation engine - combines and suppresses routes before they are sent or installed
//
// Candidates arrive in `Prefix` order (destination ascending, finer masks
// first) and wait in a bounded pool of slots kept ordered from the finest mask
// to the coarsest. Twins with compatible attributes are merged into their
// parent, and finer routes covered by a compatible coarser one are dropped
// when the pool is flushed.

use bitflags::bitflags;
use std::net::Ipv4Addr;

use crate::routes::{addr, Prefix};

/// Slots in the pool
pub const NUM_AG_SLOTS: usize = 32;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct AgState: u16 {
        /// May be dropped in favour of a compatible coarser route
        const SUPPRESS = 0x001;
        /// May be merged with its twin into a coarser route
        const AGGREGATE = 0x002;
        /// The even child of this route was sent
        const REDUN0 = 0x004;
        /// The odd child of this route was sent
        const REDUN1 = 0x008;
        /// Kernel route through a gateway
        const GATEWAY = 0x010;
        /// Route to an interface
        const IF = 0x020;
        /// Only meaningful to RIPv2 listeners
        const RIPV2 = 0x040;
        /// Gateway differences do not matter when this is the finer route
        const FINE_GATE = 0x080;
        /// Gateway differences do not matter when this is the coarser route
        const CORS_GATE = 0x100;
        /// Held back by split horizon; still suppresses finer routes
        const SPLIT_HZ = 0x200;

        /// Set on a merged route if set on either twin
        const AGGREGATE_EITHER = Self::RIPV2.bits() | Self::GATEWAY.bits()
            | Self::SUPPRESS.bits() | Self::CORS_GATE.bits();
    }
}

impl AgState {
    /// Both children were sent, so the route itself adds nothing
    pub fn is_redundant(&self) -> bool {
        self.contains(AgState::REDUN0 | AgState::REDUN1)
    }
}

/// A route offered to, or emitted by, the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgInfo {
    /// Destination in host order
    pub dst: u32,
    pub mask: u32,
    pub gate: Ipv4Addr,
    pub nhop: Ipv4Addr,
    pub metric: u8,
    /// Preference used when deciding whether one route may stand for another
    pub pref: u8,
    pub seqno: u32,
    pub tag: u16,
    pub state: AgState,
}

impl AgInfo {
    const EMPTY: AgInfo = AgInfo {
        dst: 0,
        mask: 0,
        gate: Ipv4Addr::UNSPECIFIED,
        nhop: Ipv4Addr::UNSPECIFIED,
        metric: 0,
        pref: 0,
        seqno: 0,
        tag: 0,
        state: AgState::empty(),
    };
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    info: AgInfo,
    /// Neighbour with a finer (or equal) mask
    fine: Option<usize>,
    /// Neighbour with a coarser (or equal) mask
    cors: Option<usize>,
}

/// Slab of aggregation slots plus a free list of their indices
#[derive(Debug, Clone)]
pub struct Aggregator {
    slots: Vec<Slot>,
    free: Vec<usize>,
    finest: Option<usize>,
    corsest: Option<usize>,
    /// Networks no merged route may grow past
    boundaries: Vec<Prefix>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Aggregator::new(NUM_AG_SLOTS)
    }
}

impl Aggregator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Aggregator {
            slots: vec![
                Slot {
                    info: AgInfo::EMPTY,
                    fine: None,
                    cors: None,
                };
                capacity
            ],
            free: (0..capacity).rev().collect(),
            finest: None,
            corsest: None,
            boundaries: Vec::new(),
        }
    }

    /// Replace the networks whose edges twin merging must stop at
    pub fn set_boundaries(&mut self, boundaries: Vec<Prefix>) {
        self.boundaries = boundaries;
    }

    /// Whether the parent of `dst/mask` would strictly contain a boundary
    fn crosses_boundary(&self, dst: u32, mask: u32) -> bool {
        let parent = mask << 1;
        let parent_dst = dst & parent;
        self.boundaries
            .iter()
            .any(|b| b.mask > parent && (b.dst & parent) == parent_dst)
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Routes waiting in the pool
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Offer one route. Routes that can no longer be combined with anything
    /// may be handed to `out` at once; the rest wait for `flush`.
    pub fn check<F: FnMut(&AgInfo)>(&mut self, new: AgInfo, out: &mut F) {
        // supernetting only makes sense for contiguous masks
        if !addr::is_contiguous(new.mask) {
            out(&new);
            return;
        }

        let AgInfo {
            mut dst,
            mut mask,
            mut gate,
            mut nhop,
            mut metric,
            mut pref,
            mut seqno,
            mut tag,
            mut state,
        } = new;

        // Find the slot for the new route. On the way, coarser pending routes
        // swallow older finer ones they cover, since nothing seen from here on
        // can change that outcome.
        let mut cors: Option<usize> = None;
        let mut cur = self.corsest;
        while let Some(i) = cur {
            let ag = self.slots[i].info;
            if ag.mask >= mask {
                break;
            }
            if let Some(c) = cors {
                if ag.dst < dst
                    && ag.state.contains(AgState::SUPPRESS)
                    && self.covers(c, &ag)
                    && self.can_suppress(c, &ag)
                {
                    self.absorb(c, &ag);
                    self.del(i);
                    cur = self.slots[c].fine;
                    continue;
                }
            }
            cors = Some(i);
            cur = self.slots[i].fine;
        }

        // Merge with the even/odd twin as far up the mask chain as possible
        while let Some(i) = cur {
            let ag = self.slots[i].info;
            if ag.mask != mask || ((ag.dst ^ dst) & (mask << 1)) != 0 {
                break;
            }

            if ag.dst == dst {
                // Same destination: keep the preferred one, carrying the
                // sticky bits of both.
                let slot = &mut self.slots[i].info;
                let mut other = state;
                if pref <= slot.pref {
                    slot.gate = gate;
                    slot.nhop = nhop;
                    slot.tag = tag;
                    slot.metric = metric;
                    slot.pref = pref;
                    if slot.seqno < seqno {
                        slot.seqno = seqno;
                    }
                    other = slot.state;
                    slot.state = state;
                }
                if !slot.state.contains(AgState::IF) {
                    slot.state |=
                        other & (AgState::AGGREGATE_EITHER | AgState::REDUN0 | AgState::REDUN1);
                }
                return;
            }

            if self.crosses_boundary(dst, mask) {
                break;
            }

            let combinable = (state & ag.state).contains(AgState::AGGREGATE)
                && ((state.is_redundant() && ag.state.is_redundant())
                    || (ag.gate == gate && ag.pref == pref && ag.tag == tag));

            if combinable {
                // Both twins collapse into their parent
                if seqno > ag.seqno {
                    seqno = ag.seqno;
                }
                if !state.is_redundant() {
                    state -= AgState::REDUN1;
                }
                if ag.state.is_redundant() {
                    state |= AgState::REDUN0;
                } else {
                    state -= AgState::REDUN0;
                }
                state |= ag.state & AgState::AGGREGATE_EITHER;
                if ag.tag != tag {
                    tag = 0;
                }
                if ag.nhop != nhop {
                    nhop = Ipv4Addr::UNSPECIFIED;
                }
                self.del(i);
            } else if ag.pref >= pref && ag.state.contains(AgState::AGGREGATE) {
                // Promote the waiting twin and hand its slot to the new one
                let slot = &mut self.slots[i].info;
                slot.dst = dst;
                std::mem::swap(&mut slot.gate, &mut gate);
                std::mem::swap(&mut slot.nhop, &mut nhop);
                std::mem::swap(&mut slot.tag, &mut tag);
                std::mem::swap(&mut slot.metric, &mut metric);
                std::mem::swap(&mut slot.pref, &mut pref);

                // the promoted route is only even-redundant if the waiting
                // twin was fully redundant
                let mut promoted = slot.state;
                if !promoted.is_redundant() {
                    promoted -= AgState::REDUN0;
                }
                promoted -= AgState::REDUN1;
                slot.state = state;
                state = promoted;

                if seqno <= slot.seqno {
                    seqno = slot.seqno;
                } else {
                    slot.seqno = seqno;
                }
                dst = ag.dst;
            } else {
                if !state.contains(AgState::AGGREGATE) {
                    break;
                }
                // Promote the new twin, leaving the waiting one as it is
                if !state.is_redundant() {
                    state -= AgState::REDUN1;
                }
                state -= AgState::REDUN0;
                let slot = &mut self.slots[i].info;
                if seqno < slot.seqno {
                    seqno = slot.seqno;
                } else {
                    slot.seqno = seqno;
                }
            }

            mask <<= 1;
            dst &= mask;

            match cors {
                None => break,
                Some(c) => {
                    cur = Some(c);
                    cors = self.slots[c].cors;
                }
            }
        }

        // The waiting route in the target slot can no longer gain a twin
        if let Some(i) = cur {
            let ag = self.slots[i].info;
            if ag.mask == mask && ag.dst < dst {
                self.flush(ag.dst, ag.mask, out);
            }
        }

        let info = AgInfo {
            dst,
            mask,
            gate,
            nhop,
            metric,
            pref,
            seqno,
            tag,
            state,
        };
        self.insert(info, out);
    }

    /// Emit every waiting route within `lim_dst/lim_mask`, finest first,
    /// dropping those a compatible coarser route stands for.
    pub fn flush<F: FnMut(&AgInfo)>(&mut self, lim_dst: u32, lim_mask: u32, out: &mut F) {
        let mut cur = self.finest;
        while let Some(i) = cur {
            let ag = self.slots[i].info;
            if ag.mask < lim_mask {
                break;
            }
            let next = self.slots[i].cors;
            if (ag.dst & lim_mask) != lim_dst {
                cur = next;
                continue;
            }

            if ag.state.contains(AgState::SUPPRESS) {
                // only the longest covering route may stand for this one
                let mut c = next;
                while let Some(ci) = c {
                    if self.covers(ci, &ag) {
                        break;
                    }
                    c = self.slots[ci].cors;
                }
                if let Some(ci) = c {
                    if self.can_suppress(ci, &ag) {
                        self.absorb(ci, &ag);
                        self.del(i);
                        cur = next;
                        continue;
                    }
                }
            }

            self.out_slot(i, out);
            self.del(i);
            cur = next;
        }
    }

    /// Emit everything still waiting
    pub fn flush_all<F: FnMut(&AgInfo)>(&mut self, out: &mut F) {
        self.flush(0, 0, out);
    }

    fn covers(&self, c: usize, ag: &AgInfo) -> bool {
        let cors = &self.slots[c].info;
        (ag.dst & cors.mask) == cors.dst
    }

    fn can_suppress(&self, c: usize, ag: &AgInfo) -> bool {
        let cors = &self.slots[c].info;
        cors.pref <= ag.pref
            && (cors.gate == ag.gate
                || ag.state.contains(AgState::FINE_GATE)
                || cors.state.contains(AgState::CORS_GATE))
    }

    /// Fold a suppressed route into the coarser route standing for it
    fn absorb(&mut self, c: usize, ag: &AgInfo) {
        let cors = &mut self.slots[c].info;
        if cors.seqno > ag.seqno {
            cors.seqno = ag.seqno;
        }
        if ag.state.is_redundant() && cors.mask == ag.mask << 1 {
            cors.state |= if cors.dst == ag.dst {
                AgState::REDUN0
            } else {
                AgState::REDUN1
            };
        }
        if ag.tag != cors.tag {
            cors.tag = 0;
        }
        if ag.nhop != cors.nhop {
            cors.nhop = Ipv4Addr::UNSPECIFIED;
        }
    }

    /// Send one slot. The caller deletes it right after.
    fn out_slot<F: FnMut(&AgInfo)>(&mut self, i: usize, out: &mut F) {
        let mut info = self.slots[i].info;
        if info.state.contains(AgState::SPLIT_HZ) {
            return;
        }

        // Once both twins have gone out their parent is redundant
        if let Some(c) = self.slots[i].cors {
            let cors = &mut self.slots[c].info;
            if cors.mask == info.mask << 1 && cors.dst == (info.dst & cors.mask) {
                cors.state |= if cors.dst == info.dst {
                    AgState::REDUN0
                } else {
                    AgState::REDUN1
                };
            }
        }

        let bit = info.mask.wrapping_neg() >> 1;
        if info.state.contains(AgState::REDUN0) {
            if info.state.contains(AgState::REDUN1) {
                return;
            }
            // half redundant: only the odd half is still needed
            info.dst |= bit;
            info.mask |= bit;
        } else if info.state.contains(AgState::REDUN1) {
            info.mask |= bit;
        }
        out(&info);
    }

    /// Put a route into a free slot, evicting the coarsest waiting route when
    /// the pool is full.
    fn insert<F: FnMut(&AgInfo)>(&mut self, info: AgInfo, out: &mut F) {
        if self.free.is_empty() {
            if let Some(c) = self.corsest {
                self.out_slot(c, out);
                self.del(c);
            }
        }
        let Some(n) = self.free.pop() else {
            out(&info);
            return;
        };

        let mut cors: Option<usize> = None;
        let mut fine = self.corsest;
        while let Some(i) = fine {
            if self.slots[i].info.mask >= info.mask {
                break;
            }
            cors = Some(i);
            fine = self.slots[i].fine;
        }

        self.slots[n] = Slot { info, fine, cors };
        match fine {
            Some(f) => self.slots[f].cors = Some(n),
            None => self.finest = Some(n),
        }
        match cors {
            Some(c) => self.slots[c].fine = Some(n),
            None => self.corsest = Some(n),
        }
    }

    fn del(&mut self, i: usize) {
        let Slot { fine, cors, .. } = self.slots[i];
        match cors {
            Some(c) => self.slots[c].fine = fine,
            None => self.corsest = fine,
        }
        match fine {
            Some(f) => self.slots[f].cors = cors,
            None => self.finest = cors,
        }
        self.slots[i].fine = None;
        self.slots[i].cors = None;
        self.free.push(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn route(dst: &str, len: u8, gate: &str) -> AgInfo {
        let mask = addr::prefix_to_mask(len);
        AgInfo {
            dst: addr::host(ip(dst)) & mask,
            mask,
            gate: ip(gate),
            nhop: Ipv4Addr::UNSPECIFIED,
            metric: 2,
            pref: 2,
            seqno: 1,
            tag: 0,
            state: AgState::SUPPRESS | AgState::AGGREGATE,
        }
    }

    fn run(ag: &mut Aggregator, routes: &[AgInfo]) -> Vec<AgInfo> {
        let mut sent = Vec::new();
        for r in routes {
            ag.check(*r, &mut |a: &AgInfo| sent.push(*a));
        }
        ag.flush_all(&mut |a: &AgInfo| sent.push(*a));
        sent
    }

    fn names(sent: &[AgInfo]) -> Vec<String> {
        sent.iter().map(|a| addr::addr_name(a.dst, a.mask)).collect()
    }

    #[test]
    fn test_twins_merge_into_supernet() {
        let mut ag = Aggregator::default();
        let sent = run(
            &mut ag,
            &[route("10.0.0.0", 25, "1.1.1.1"), route("10.0.0.128", 25, "1.1.1.1")],
        );
        assert_eq!(names(&sent), vec!["10.0.0.0/24"]);
        assert_eq!(ag.pending(), 0);
    }

    #[test]
    fn test_four_quarters_merge() {
        let mut ag = Aggregator::default();
        let sent = run(
            &mut ag,
            &[
                route("10.0.0.0", 26, "1.1.1.1"),
                route("10.0.0.64", 26, "1.1.1.1"),
                route("10.0.0.128", 26, "1.1.1.1"),
                route("10.0.0.192", 26, "1.1.1.1"),
            ],
        );
        assert_eq!(names(&sent), vec!["10.0.0.0/24"]);
    }

    #[test]
    fn test_different_gateways_stay_separate() {
        let mut ag = Aggregator::default();
        let mut sent = run(
            &mut ag,
            &[route("10.0.0.0", 25, "1.1.1.1"), route("10.0.0.128", 25, "2.2.2.2")],
        );
        sent.sort_by_key(|a| a.dst);
        assert_eq!(names(&sent), vec!["10.0.0.0/25", "10.0.0.128/25"]);
        assert_eq!(sent[0].gate, ip("1.1.1.1"));
        assert_eq!(sent[1].gate, ip("2.2.2.2"));
    }

    #[test]
    fn test_noncontiguous_mask_passes_through() {
        let mut ag = Aggregator::default();
        let mut odd = route("10.0.0.0", 24, "1.1.1.1");
        odd.mask = 0xff00_ff00;
        let sent = run(&mut ag, &[odd]);
        assert_eq!(sent, vec![odd]);

        // sending the output again changes nothing
        let again = run(&mut ag, &sent);
        assert_eq!(again, sent);
    }

    #[test]
    fn test_covered_route_suppressed() {
        let mut ag = Aggregator::default();
        // finer routes come first for the same destination
        let sent = run(
            &mut ag,
            &[route("10.0.0.0", 24, "1.1.1.1"), route("10.0.0.0", 8, "1.1.1.1")],
        );
        assert_eq!(names(&sent), vec!["10.0.0.0/8"]);
    }

    #[test]
    fn test_covered_route_with_other_gateway_kept() {
        let mut ag = Aggregator::default();
        let mut sent = run(
            &mut ag,
            &[route("10.0.0.0", 24, "2.2.2.2"), route("10.0.0.0", 8, "1.1.1.1")],
        );
        sent.sort_by_key(|a| a.mask);
        assert_eq!(names(&sent), vec!["10.0.0.0/8", "10.0.0.0/24"]);
    }

    #[test]
    fn test_worse_coarse_route_does_not_suppress() {
        let mut ag = Aggregator::default();
        let fine = route("10.0.0.0", 24, "1.1.1.1");
        let mut coarse = route("10.0.0.0", 8, "1.1.1.1");
        coarse.pref = 5;
        let sent = run(&mut ag, &[fine, coarse]);
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_split_horizon_route_not_sent_but_suppresses() {
        let mut ag = Aggregator::default();
        let fine = route("10.0.0.0", 24, "1.1.1.1");
        let mut coarse = route("10.0.0.0", 8, "1.1.1.1");
        coarse.state |= AgState::SPLIT_HZ;
        let sent = run(&mut ag, &[fine, coarse]);
        assert!(sent.is_empty());
    }

    #[test]
    fn test_parent_redundant_when_both_children_sent() {
        let mut ag = Aggregator::default();
        let mut even = route("10.0.0.0", 25, "1.1.1.1");
        let mut odd = route("10.0.0.128", 25, "2.2.2.2");
        even.state = AgState::empty();
        odd.state = AgState::empty();
        let parent = route("10.0.0.0", 24, "3.3.3.3");
        let sent = run(&mut ag, &[even, parent, odd]);
        let mut got = names(&sent);
        got.sort();
        assert_eq!(got, vec!["10.0.0.0/25", "10.0.0.128/25"]);
    }

    #[test]
    fn test_half_redundant_parent_narrowed() {
        let mut ag = Aggregator::default();
        let mut odd = route("10.0.0.128", 25, "2.2.2.2");
        odd.state = AgState::empty();
        let parent = route("10.0.0.0", 24, "3.3.3.3");
        let sent = run(&mut ag, &[parent, odd]);
        let mut got = names(&sent);
        got.sort();
        assert_eq!(got, vec!["10.0.0.0/25", "10.0.0.128/25"]);
        assert!(sent.iter().any(|a| a.gate == ip("3.3.3.3") && a.dst == 0x0a00_0000));
    }

    #[test]
    fn test_pool_exhaustion_flushes_early() {
        let mut ag = Aggregator::new(2);
        let mut early = Vec::new();
        for (len, gate) in [(24, "1.1.1.1"), (16, "2.2.2.2"), (8, "3.3.3.3")] {
            ag.check(route("10.0.0.0", len, gate), &mut |a: &AgInfo| early.push(*a));
        }
        assert_eq!(names(&early), vec!["10.0.0.0/16"]);
        assert_eq!(ag.pending(), 2);

        let mut rest = Vec::new();
        ag.flush_all(&mut |a: &AgInfo| rest.push(*a));
        assert_eq!(early.len() + rest.len(), 3);
        assert_eq!(ag.pending(), 0);
    }

    #[test]
    fn test_unrelated_route_flushes_waiting_slot() {
        let mut ag = Aggregator::default();
        let mut early = Vec::new();
        ag.check(route("10.0.0.0", 24, "1.1.1.1"), &mut |a: &AgInfo| early.push(*a));
        ag.check(route("10.0.2.0", 24, "1.1.1.1"), &mut |a: &AgInfo| early.push(*a));
        assert_eq!(names(&early), vec!["10.0.0.0/24"]);
        assert_eq!(ag.pending(), 1);
    }

    #[test]
    fn test_scoped_flush() {
        let mut ag = Aggregator::default();
        let mut sent = Vec::new();
        ag.check(route("10.0.0.0", 24, "1.1.1.1"), &mut |a: &AgInfo| sent.push(*a));
        ag.check(route("192.168.0.0", 24, "2.2.2.2"), &mut |a: &AgInfo| sent.push(*a));
        ag.flush(0x0a00_0000, 0xff00_0000, &mut |a: &AgInfo| sent.push(*a));
        assert_eq!(names(&sent), vec!["10.0.0.0/24"]);
        assert_eq!(ag.pending(), 1);
    }

    #[test]
    fn test_merge_stops_at_boundary_network() {
        let mut ag = Aggregator::default();
        ag.set_boundaries(vec![
            Prefix::new(0x0a00_0000, 0xff00_0000),
            Prefix::new(0xc0a8_0000, 0xffff_ff00),
        ]);
        let sent = run(
            &mut ag,
            &[route("10.0.0.0", 8, "1.1.1.1"), route("11.0.0.0", 8, "1.1.1.1")],
        );
        assert_eq!(names(&sent), vec!["10.0.0.0/8", "11.0.0.0/8"]);

        // merging up to exactly the boundary is fine
        let sent = run(
            &mut ag,
            &[route("192.168.0.0", 25, "1.1.1.1"), route("192.168.0.128", 25, "1.1.1.1")],
        );
        assert_eq!(names(&sent), vec!["192.168.0.0/24"]);

        ag.set_boundaries(Vec::new());
        let sent = run(
            &mut ag,
            &[route("10.0.0.0", 8, "1.1.1.1"), route("11.0.0.0", 8, "1.1.1.1")],
        );
        assert_eq!(names(&sent), vec!["10.0.0.0/7"]);
    }

    #[test]
    fn test_merge_keeps_oldest_seqno_and_clears_differing_nhop() {
        let mut ag = Aggregator::default();
        let mut a = route("10.0.0.0", 25, "1.1.1.1");
        let mut b = route("10.0.0.128", 25, "1.1.1.1");
        a.seqno = 4;
        b.seqno = 9;
        a.nhop = ip("10.9.9.9");
        let sent = run(&mut ag, &[a, b]);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].seqno, 4);
        assert_eq!(sent[0].nhop, Ipv4Addr::UNSPECIFIED);
    }
}
