// Processing of received RIP packets

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use super::output::{supply, OutKind, PacketWriter, SupplyTarget};
use super::packet::{Authentication, NetEntry, RipCommand, RipPacket, RIP_AF_INET, RIP_AF_UNSPEC};
use super::{ripv1_mask_host, Outbound, RipOptions, RIPV1, RIPV2, RIP_PORT};
use crate::aggregate::Aggregator;
use crate::error::{PacketError, Rejection};
use crate::interface::{IfIndex, Interface, Interfaces, RipOut};
use crate::routes::addr::{self, check_dst, HOST_MASK};
use crate::routes::{clamp_metric, LearnOutcome, Prefix, RouteStore, Spare, HOPCNT_INFINITY};

/// What became of one received packet
#[derive(Debug, Default)]
pub struct InputReport {
    pub replies: Vec<Outbound>,
    /// Entries that added or changed a route
    pub learned: usize,
    pub rejected: Vec<Rejection>,
}

impl InputReport {
    fn reject(&mut self, from: SocketAddrV4, why: Rejection) {
        tracing::warn!("discard packet from {}: {}", from, why);
        self.rejected.push(why);
    }
}

/// Handle one datagram from the RIP socket.
///
/// Malformed packets are an error and nothing in them is used. Policy
/// violations are logged and collected in the report.
pub fn read_rip(
    store: &mut RouteStore,
    ifs: &Interfaces,
    ag: &mut Aggregator,
    opts: &RipOptions,
    from: SocketAddrV4,
    data: &[u8],
    now: Duration,
) -> Result<InputReport, PacketError> {
    let packet = RipPacket::from_bytes(data)?;
    let mut report = InputReport::default();

    // our own broadcasts come back to us
    if ifs.is_local(*from.ip()) {
        report.rejected.push(Rejection::FromSelf(*from.ip()));
        return Ok(report);
    }

    match packet.command {
        RipCommand::Request => {
            read_request(store, ifs, ag, opts, from, &packet, &mut report, now);
        }
        RipCommand::Response => {
            read_response(store, ifs, opts, from, &packet, &mut report, now);
        }
        RipCommand::TraceOn | RipCommand::TraceOff => {
            report.reject(from, Rejection::TraceControl(*from.ip()));
        }
    }
    Ok(report)
}

fn password_ok(ifc: Option<&Interface>, packet: &RipPacket) -> bool {
    match ifc.and_then(|i| i.password.as_deref()) {
        None => true,
        Some(pw) => packet.version == RIPV2 && packet.auth == Some(Authentication::password(pw)),
    }
}

fn check_version(ifc: &Interface, version: u8) -> Result<(), Rejection> {
    let accepted = match version {
        RIPV1 => ifc.accept_v1,
        _ => ifc.accept_v2,
    };
    if accepted {
        Ok(())
    } else {
        Err(Rejection::VersionDisabled {
            version,
            interface: ifc.name.clone(),
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn read_request(
    store: &mut RouteStore,
    ifs: &Interfaces,
    ag: &mut Aggregator,
    opts: &RipOptions,
    from: SocketAddrV4,
    packet: &RipPacket,
    report: &mut InputReport,
    now: Duration,
) {
    let idx = ifs.lookup(*from.ip());
    let ifc = idx.and_then(|i| ifs.get(i));
    let passwd_ok = password_ok(ifc, packet);

    if packet.entries.is_empty() {
        tracing::debug!("empty request from {}", from);
        return;
    }

    if packet.is_whole_table_request() {
        let Some((idx, ifc)) = idx.zip(ifc) else {
            report.reject(from, Rejection::NotNeighbor(*from.ip()));
            return;
        };
        if let Err(why) = check_version(ifc, packet.version) {
            report.reject(from, why);
            return;
        }
        let target = if from.port() != RIP_PORT {
            // a diagnostic tool: tell it everything
            SupplyTarget {
                to: from,
                ifc: Some(idx),
                kind: OutKind::Query,
                version: packet.version,
                flash: false,
                passwd_ok,
            }
        } else {
            // a router priming its table
            if ifc.passive {
                report.reject(from, Rejection::RipOff(ifc.name.clone()));
                return;
            }
            SupplyTarget {
                to: from,
                ifc: Some(idx),
                kind: OutKind::Unicast,
                version: if ifc.rip_out == RipOut::V1 { RIPV1 } else { RIPV2 },
                flash: false,
                passwd_ok,
            }
        };
        report.replies = supply(store, ifs, ag, opts, &target, now);
        return;
    }

    // Answer for specific routes in a fresh packet
    let cost = ifc.map_or(1, |i| i.cost());
    let auth = match ifc.and_then(|i| i.password.as_deref()) {
        Some(pw) if packet.version == RIPV2 && passwd_ok => Some(Authentication::password(pw)),
        _ => None,
    };
    let mut writer = PacketWriter::new(RipCommand::Response, packet.version, auth);
    for asked in &packet.entries {
        let mut answer = *asked;
        if asked.family != RIP_AF_INET {
            tracing::debug!("request from {} for unsupported family {}", from, asked.family);
            answer.metric = HOPCNT_INFINITY as u32;
            writer.push(answer);
            continue;
        }

        let dst = addr::host(asked.dst);
        let mask = addr::host(asked.mask);
        let mask = if packet.version == RIPV1 || mask == 0 || dst & !mask != 0 {
            ripv1_mask_host(dst, ifs, idx)
        } else {
            mask
        };

        let found = store
            .lookup(dst, mask)
            .or_else(|| if dst != 0 { store.find_best_match(asked.dst) } else { None });
        match found {
            None => answer.metric = HOPCNT_INFINITY as u32,
            Some(rt) => {
                answer.metric = u32::from(clamp_metric(u32::from(rt.metric()) + u32::from(cost)));
                if packet.version == RIPV2 {
                    answer.tag = rt.active().tag;
                    answer.mask = addr::addr(mask);
                    answer.nhop = match ifc {
                        Some(i) if i.contains(addr::host(rt.gate())) && rt.gate() != i.addr => {
                            rt.gate()
                        }
                        _ => Ipv4Addr::UNSPECIFIED,
                    };
                }
            }
        }
        writer.push(answer);
    }

    report.replies = writer
        .finish(true)
        .into_iter()
        .map(|payload| Outbound {
            ifc: idx,
            to: from,
            payload,
        })
        .collect();
}

fn read_response(
    store: &mut RouteStore,
    ifs: &Interfaces,
    opts: &RipOptions,
    from: SocketAddrV4,
    packet: &RipPacket,
    report: &mut InputReport,
    now: Duration,
) {
    let router = *from.ip();
    if from.port() != RIP_PORT {
        report.reject(
            from,
            Rejection::BadSourcePort {
                addr: router,
                port: from.port(),
            },
        );
        return;
    }
    let Some(idx) = ifs.lookup(router) else {
        report.reject(from, Rejection::NotNeighbor(router));
        return;
    };
    let Some(ifc) = ifs.get(idx) else {
        return;
    };
    if !opts.rip_on || !ifc.hears_rip() {
        report.reject(from, Rejection::RipOff(ifc.name.clone()));
        return;
    }
    if let Err(why) = check_version(ifc, packet.version) {
        report.reject(from, why);
        return;
    }
    if !password_ok(Some(ifc), packet) {
        report.reject(from, Rejection::AuthFailed(router));
        return;
    }

    for entry in &packet.entries {
        match route_from_entry(store, ifs, idx, ifc, router, packet.version, entry, now) {
            Ok(true) => report.learned += 1,
            Ok(false) => {}
            Err(why) => report.reject(from, why),
        }
    }
}

/// Validate one advertised route and feed it to the table. Returns whether
/// the table changed.
#[allow(clippy::too_many_arguments)]
fn route_from_entry(
    store: &mut RouteStore,
    ifs: &Interfaces,
    idx: IfIndex,
    ifc: &Interface,
    router: Ipv4Addr,
    version: u8,
    entry: &NetEntry,
    now: Duration,
) -> Result<bool, Rejection> {
    let dst = addr::host(entry.dst);
    if entry.family != RIP_AF_INET && !(entry.family == RIP_AF_UNSPEC && dst == 0) {
        return Err(Rejection::BadFamily(entry.family));
    }
    if !check_dst(dst) {
        return Err(Rejection::BadDestination(entry.dst));
    }
    if entry.metric > HOPCNT_INFINITY as u32 {
        return Err(Rejection::BadMetric(entry.metric));
    }

    let raw_mask = addr::host(entry.mask);
    let (mask, tag) = if version == RIPV1 {
        (ripv1_mask_host(dst, ifs, Some(idx)), 0)
    } else if raw_mask == 0 {
        (ripv1_mask_host(dst, ifs, Some(idx)), entry.tag)
    } else if dst & !raw_mask != 0 {
        return Err(Rejection::BadMask {
            dst: entry.dst,
            mask: raw_mask,
        });
    } else {
        (raw_mask, entry.tag)
    };

    if mask == HOST_MASK && ifs.is_local(entry.dst) {
        return Err(Rejection::OwnAddress(entry.dst));
    }

    let mut gate = router;
    if version == RIPV2 && !entry.nhop.is_unspecified() {
        if ifs.is_local(entry.nhop) {
            return Err(Rejection::NextHopIsSelf(entry.nhop));
        }
        if ifc.contains(addr::host(entry.nhop)) && check_dst(addr::host(entry.nhop)) {
            gate = entry.nhop;
        } else {
            tracing::debug!("router {} to {} has bad next hop {}", router, entry.dst, entry.nhop);
        }
    }

    // a faked default bounced back by broken split horizon
    if dst == 0 && mask == 0 {
        if let Some(d) = ifc.default_metric.filter(|&d| d != 0) {
            if entry.metric >= u32::from(d) {
                return Ok(false);
            }
        }
    }

    let metric = entry.metric + u32::from(ifc.cost());
    let new = Spare::new(gate, router, metric, tag, Some(idx), now);
    match store.learn(Prefix::new(dst, mask), new, now) {
        LearnOutcome::Added
        | LearnOutcome::Updated
        | LearnOutcome::Spare
        | LearnOutcome::Removed => Ok(true),
        LearnOutcome::TableFull => Err(Rejection::TableFull),
        _ => Ok(false),
    }
}
