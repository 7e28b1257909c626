// Advertising the route table through the aggregator

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use super::packet::{Authentication, NetEntry, RipCommand, RipPacket};
use super::{ripv1_mask_host, Outbound, RipOptions, INADDR_RIP_GROUP, RIPV1, RIPV2, RIP_PORT};
use crate::aggregate::{AgInfo, AgState, Aggregator};
use crate::interface::{IfIndex, Interface, Interfaces, RipOut};
use crate::routes::addr::{self, on_net, std_mask};
use crate::routes::{Prefix, RouteEntry, RouteState, RouteStore, HOPCNT_INFINITY, NUM_SPARES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutKind {
    /// RIPv2 to 224.0.0.9
    Multicast,
    /// RIPv1 to the subnet broadcast address
    Broadcast,
    /// Unicast to a router, with split horizon
    Unicast,
    /// Answer to a diagnostic query: everything we know, no split horizon
    Query,
}

#[derive(Debug, Clone, Copy)]
pub struct SupplyTarget {
    pub to: SocketAddrV4,
    pub ifc: Option<IfIndex>,
    pub kind: OutKind,
    pub version: u8,
    /// Only routes changed since the last update
    pub flash: bool,
    /// The requester knew the password, or nobody asked
    pub passwd_ok: bool,
}

/// Collects route entries into packets of at most 25 entries
pub(crate) struct PacketWriter {
    packet: RipPacket,
    packets: Vec<Vec<u8>>,
}

impl PacketWriter {
    pub(crate) fn new(command: RipCommand, version: u8, auth: Option<Authentication>) -> Self {
        let mut packet = RipPacket::new(command, version);
        packet.auth = auth;
        PacketWriter {
            packet,
            packets: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: NetEntry) {
        self.packet.entries.push(entry);
        if self.packet.entries.len() >= self.packet.capacity() {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.packet.entries.is_empty() {
            return;
        }
        self.packets.push(self.packet.to_bytes());
        self.packet.entries.clear();
    }

    /// Finished packets. An otherwise silent answer still gets one empty packet.
    pub(crate) fn finish(mut self, send_empty: bool) -> Vec<Vec<u8>> {
        self.flush();
        if self.packets.is_empty() && send_empty {
            self.packets.push(self.packet.to_bytes());
        }
        self.packets
    }
}

/// Per-destination facts the walk decides with
struct WalkState<'a> {
    ifs: &'a Interfaces,
    ifc_idx: Option<IfIndex>,
    ifc: Option<&'a Interface>,
    /// Address used for "is this the network we talk onto" tests
    to_h: u32,
    to_net: u32,
    to_mask: u32,
    to_std_net: u32,
    to_std_mask: u32,
    to_on_net: bool,
    query: bool,
    /// No RIPv1 listener can hear this
    rip2_all: bool,
    aggregate: bool,
    super_aggregate: bool,
    cost: u8,
    def_metric: u8,
}

/// Turns aggregated routes into wire entries
struct Emitter<'a> {
    ws: &'a WalkState<'a>,
    writer: PacketWriter,
    version: u8,
    flash: bool,
    update_seqno: u32,
    gen_limit: usize,
    stopping: bool,
}

impl Emitter<'_> {
    fn out(&mut self, ag: &AgInfo) {
        if self.flash && ag.seqno < self.update_seqno {
            return;
        }
        let ws = self.ws;
        let mut dst = ag.dst;
        let mut mask = ag.mask;
        let v1_mask = ripv1_mask_host(dst, ws.ifs, ws.ifc_idx.filter(|_| ws.to_on_net));

        let mut extra = 0usize;
        let mut step = 0u32;
        if ws.rip2_all || (ag.state.contains(AgState::RIPV2) && v1_mask != mask) {
            // RIPv1 listeners cannot be told about this one
            if self.version == RIPV1 {
                return;
            }
        } else if v1_mask > mask && addr::is_contiguous(mask) {
            // a supernet becomes its classful networks
            step = v1_mask & v1_mask.wrapping_neg();
            let count = ((v1_mask & !mask) / step) as usize;
            if count > self.gen_limit {
                tracing::debug!(
                    "sending {} as 1 instead of {} routes",
                    addr::addr_name(dst, mask),
                    count + 1
                );
            } else {
                mask = v1_mask;
                extra = count;
                self.gen_limit -= count;
            }
        }

        // router discovery routes and a dying daemon admit only a bad metric
        let metric = if self.stopping || ag.metric < 1 {
            HOPCNT_INFINITY
        } else {
            ag.metric
        };

        for _ in 0..=extra {
            let mut entry = NetEntry::route(
                addr::addr(dst),
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                metric as u32,
                0,
            );
            if self.version == RIPV2 {
                entry.mask = addr::addr(mask);
                entry.tag = ag.tag;
                let nhop_ok = ws.query
                    || ws.ifc.is_some_and(|i| {
                        ag.nhop != i.addr && on_net(addr::host(ag.nhop), i.net, i.mask)
                    });
                if !ag.nhop.is_unspecified() && ws.rip2_all && nhop_ok {
                    entry.nhop = ag.nhop;
                }
            }
            self.writer.push(entry);
            dst = dst.wrapping_add(step);
        }
    }
}

/// Decide how one route is offered to the aggregator for this destination,
/// updating its poison-reverse bookkeeping on the way.
fn walk_supply(
    rt: &mut RouteEntry,
    ws: &WalkState<'_>,
    opts: &RipOptions,
    expire: Duration,
    garbage: Duration,
    now: Duration,
) -> Option<AgInfo> {
    let state = rt.state;
    let prefix = rt.prefix;

    if state.contains(RouteState::EXTERNAL) {
        return None;
    }
    // passive interfaces are not advertised
    if state.contains(RouteState::IF)
        && !state.contains(RouteState::MHOME)
        && rt.ifc().and_then(|i| ws.ifs.get(i)).is_some_and(|i| i.passive)
    {
        return None;
    }
    // when quiet, speak only of our own aliases unless asked
    if !opts.supplier && !ws.query && !state.contains(RouteState::MHOME) {
        return None;
    }
    // the faked default stands in for any real one
    if prefix.is_default() && ws.def_metric < HOPCNT_INFINITY {
        return None;
    }

    let nhop = if state.contains(RouteState::NET_SYN) {
        if !state.contains(RouteState::NET_INT) && ws.rip2_all {
            return None;
        }
        if on_net(ws.to_h, prefix.dst, prefix.mask) {
            return None;
        }
        Ipv4Addr::UNSPECIFIED
    } else if !state.contains(RouteState::IF)
        && !ws.ifs.is_local(rt.gate())
        && !rt.gate().is_loopback()
    {
        rt.gate()
    } else {
        Ipv4Addr::UNSPECIFIED
    };

    let mut metric = if state.contains(RouteState::RDISC) {
        HOPCNT_INFINITY
    } else {
        rt.metric()
    };

    let mut ags = AgState::empty();
    if state.contains(RouteState::MHOME) {
        // keep host routes of multihomed servers
    } else if prefix.is_host() {
        if state.contains(RouteState::LOCAL)
            || opts.ridhosts
            || on_net(prefix.dst, ws.to_net, ws.to_mask)
        {
            ags |= AgState::SUPPRESS;
        }
        if ws.aggregate && ws.rip2_all {
            ags |= AgState::AGGREGATE;
        }
    } else {
        ags |= AgState::SUPPRESS;
        if ws.aggregate && (state.contains(RouteState::SUBNET) || ws.super_aggregate) {
            ags |= AgState::AGGREGATE;
        }
    }

    // subnets may not leave their network by RIPv1
    if state.contains(RouteState::SUBNET)
        && !ws.rip2_all
        && !on_net(prefix.dst, ws.to_std_net, ws.to_std_mask)
    {
        ags |= AgState::RIPV2 | AgState::AGGREGATE;
    }

    if (state.contains(RouteState::IF) && !state.contains(RouteState::LOCAL))
        || state.contains(RouteState::MHOME)
        || rt.in_hold_down(now)
    {
        ags -= AgState::SUPPRESS;
    }

    // split horizon, including equally good spares through the same interface
    let p2p = ws.ifc.is_some_and(|i| i.is_point_to_point());
    if let Some(out_ifc) = ws.ifc_idx {
        if !ws.query && ws.to_on_net && (!state.contains(RouteState::IF) || p2p) {
            for i in 0..NUM_SPARES {
                let spare = rt.spares[i];
                if spare.is_empty() || spare.metric > metric || spare.ifc != Some(out_ifc) {
                    continue;
                }
                // poison first if a better metric went out recently
                if rt.poison_time < expire
                    || rt.poison_metric >= metric
                    || rt.spares[1].is_empty()
                {
                    ags |= AgState::SPLIT_HZ;
                    ags -= AgState::SUPPRESS;
                }
                metric = HOPCNT_INFINITY;
                break;
            }
        }
    }

    if rt.poison_metric >= metric || rt.poison_time < expire {
        rt.poison_time = now;
        rt.poison_metric = metric;
    }

    let pref = rt.poison_metric.saturating_add(ws.cost).min(HOPCNT_INFINITY);
    let mut metric = metric.saturating_add(ws.cost);
    if metric >= HOPCNT_INFINITY {
        // keep poisoning only what was recently advertised as reachable
        if !ws.query && (pref >= HOPCNT_INFINITY || rt.poison_time < garbage) {
            return None;
        }
        metric = HOPCNT_INFINITY;
    }

    Some(AgInfo {
        dst: prefix.dst,
        mask: prefix.mask,
        gate: Ipv4Addr::UNSPECIFIED,
        nhop,
        metric,
        pref,
        seqno: rt.seqno,
        tag: rt.active().tag,
        state: ags,
    })
}

/// Send the table, or for a flash update the part that changed, to one
/// destination.
pub fn supply(
    store: &mut RouteStore,
    ifs: &Interfaces,
    ag: &mut Aggregator,
    opts: &RipOptions,
    target: &SupplyTarget,
    now: Duration,
) -> Vec<Outbound> {
    let ifc = target.ifc.and_then(|i| ifs.get(i));
    let to = *target.to.ip();
    let group = matches!(target.kind, OutKind::Multicast | OutKind::Broadcast);
    let to_h = match (group, ifc) {
        (true, Some(i)) => addr::host(i.addr),
        _ => addr::host(to),
    };
    let to_on_net = match ifc {
        Some(i) => group || i.contains(to_h),
        None => false,
    };
    let (to_net, to_mask, to_std_net, to_std_mask) = match ifc {
        Some(i) => {
            let p = i.route_prefix();
            (p.dst, p.mask, i.std_net, i.std_mask)
        }
        None => {
            let m = std_mask(to_h);
            (to_h & m, m, to_h & m, m)
        }
    };

    let query = target.kind == OutKind::Query;
    let rip2_all = target.version == RIPV2 && target.kind != OutKind::Broadcast;
    let (aggregate, super_aggregate) = if target.version != RIPV2 || !opts.aggregate {
        (false, false)
    } else if query || !to_on_net {
        (true, true)
    } else {
        (true, target.kind != OutKind::Broadcast && opts.supernets)
    };
    let cost = ifc.map_or(1, |i| i.cost());

    let auth = match ifc.and_then(|i| i.password.as_deref()) {
        Some(pw) if target.version == RIPV2 && target.passwd_ok => Some(Authentication::password(pw)),
        _ => None,
    };

    // fake a default route unless a better real one exists
    let mut def_metric = HOPCNT_INFINITY;
    if let Some(d) = ifc.and_then(|i| i.default_metric).filter(|&d| d != 0) {
        def_metric = d.min(HOPCNT_INFINITY);
        if let Some(rt) = store.get(&Prefix::DEFAULT) {
            def_metric = def_metric.min(rt.metric().saturating_add(cost));
        }
    }

    let ws = WalkState {
        ifs,
        ifc_idx: target.ifc,
        ifc,
        to_h,
        to_net,
        to_mask,
        to_std_net,
        to_std_mask,
        to_on_net,
        query,
        rip2_all,
        aggregate,
        super_aggregate,
        cost,
        def_metric,
    };
    let mut emitter = Emitter {
        ws: &ws,
        writer: PacketWriter::new(RipCommand::Response, target.version, auth),
        version: target.version,
        flash: target.flash,
        update_seqno: store.update_seqno(),
        gen_limit: opts.expansion_limit,
        stopping: opts.stopping,
    };

    // twins never merge past an internal network
    ag.set_boundaries(
        store
            .iter()
            .filter(|rt| rt.state.contains(RouteState::NET_INT))
            .map(|rt| rt.prefix)
            .collect(),
    );

    let timers = *store.timers();
    let expire = timers.now_expire(now);
    let garbage = timers.now_garbage(now);
    {
        let mut out = |info: &AgInfo| emitter.out(info);
        if def_metric < HOPCNT_INFINITY {
            let fake = AgInfo {
                dst: 0,
                mask: 0,
                gate: Ipv4Addr::UNSPECIFIED,
                nhop: Ipv4Addr::UNSPECIFIED,
                metric: def_metric,
                pref: def_metric,
                seqno: 0,
                tag: 0,
                state: AgState::empty(),
            };
            ag.check(fake, &mut out);
        }
        for prefix in store.prefixes() {
            let Some((rt, _)) = store.entry_mut(&prefix) else {
                continue;
            };
            if let Some(info) = walk_supply(rt, &ws, opts, expire, garbage, now) {
                ag.check(info, &mut out);
            }
        }
        ag.flush_all(&mut out);
    }
    ag.set_boundaries(Vec::new());

    let packets = emitter.writer.finish(query);
    tracing::debug!(
        "supply {} packets to {} v{}{}",
        packets.len(),
        target.to,
        target.version,
        if target.flash { " (flash)" } else { "" }
    );
    packets
        .into_iter()
        .map(|payload| Outbound {
            ifc: target.ifc,
            to: target.to,
            payload,
        })
        .collect()
}

/// Where and how an interface advertises
fn interface_target(ifc: &Interface) -> Option<(Ipv4Addr, OutKind, u8)> {
    match (ifc.rip_out, ifc.dst) {
        (RipOut::Off, _) => None,
        (RipOut::V2, Some(dst)) => Some((dst, OutKind::Unicast, RIPV2)),
        (RipOut::V2, None) => Some((INADDR_RIP_GROUP, OutKind::Multicast, RIPV2)),
        (RipOut::V1, Some(dst)) => Some((dst, OutKind::Unicast, RIPV1)),
        (RipOut::V1, None) => Some((ifc.broadcast, OutKind::Broadcast, RIPV1)),
    }
}

/// Advertise on every interface running RIP
pub fn broadcast(
    store: &mut RouteStore,
    ifs: &Interfaces,
    ag: &mut Aggregator,
    opts: &RipOptions,
    flash: bool,
    now: Duration,
) -> Vec<Outbound> {
    let mut sent = Vec::new();
    for (idx, ifc) in ifs.iter() {
        if !ifc.sends_rip() {
            continue;
        }
        let Some((to, kind, version)) = interface_target(ifc) else {
            continue;
        };
        let target = SupplyTarget {
            to: SocketAddrV4::new(to, RIP_PORT),
            ifc: Some(idx),
            kind,
            version,
            flash,
            passwd_ok: true,
        };
        sent.extend(supply(store, ifs, ag, opts, &target, now));
    }
    sent
}

/// Ask every neighbour for its whole table
pub fn query_all(ifs: &Interfaces) -> Vec<Outbound> {
    let mut sent = Vec::new();
    for (idx, ifc) in ifs.iter() {
        if !ifc.sends_rip() {
            continue;
        }
        let Some((to, _, version)) = interface_target(ifc) else {
            continue;
        };
        let mut packet = RipPacket::whole_table_request(version);
        if version == RIPV2 {
            packet.auth = ifc.password.as_deref().map(Authentication::password);
        }
        tracing::debug!("query {} v{} on {}", to, version, ifc.name);
        sent.push(Outbound {
            ifc: Some(idx),
            to: SocketAddrV4::new(to, RIP_PORT),
            payload: packet.to_bytes(),
        });
    }
    sent
}
