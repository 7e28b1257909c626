// Router discovery - learn default routers from ICMP advertisements and advertise ourselves

pub mod packet;

use rand::Rng;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::Rejection;
use crate::interface::{IfIndex, Interfaces};
use crate::routes::{change_entry, Prefix, RouteState, RouteStore, Spare, HOPCNT_INFINITY};
use packet::{RdiscPacket, RouterAdvert};

pub const INADDR_ALLHOSTS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
pub const INADDR_ALLROUTERS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 2);

pub const MAX_INITIAL_ADVERT_INTERVAL: Duration = Duration::from_secs(16);
pub const MAX_INITIAL_ADVERTS: u32 = 3;
pub const DEF_MAX_ADVERTISE_INTERVAL: Duration = Duration::from_secs(600);
pub const MIN_MAX_ADVERTISE_INTERVAL: Duration = Duration::from_secs(4);
pub const MAX_MAX_ADVERTISE_INTERVAL: Duration = Duration::from_secs(1800);
pub const MAX_RESPONSE_DELAY: Duration = Duration::from_secs(2);

pub const MAX_SOLICITATIONS: u32 = 3;
pub const SOLICITATION_INTERVAL: Duration = Duration::from_secs(3);
pub const MAX_SOLICITATION_DELAY: Duration = Duration::from_secs(1);

/// Records kept; a better router displaces the worst one beyond this
pub const MAX_ADS: usize = 64;

/// Wire preference of a router that must not be used as a default
const MIN_PREFERENCE_LEVEL: u32 = 0x8000_0000;

/// A router heard advertising itself
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredRouter {
    pub addr: Ipv4Addr,
    pub ifc: IfIndex,
    /// Unsigned preference after the interface bias; larger is better
    pub pref: u32,
    pub lifetime: Duration,
    /// When the advertisement was last heard
    pub heard: Duration,
}

impl DiscoveredRouter {
    pub fn expires(&self) -> Duration {
        self.heard + self.lifetime
    }
}

/// An ICMP message to send through one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpOut {
    pub ifc: IfIndex,
    pub to: Ipv4Addr,
    pub payload: Vec<u8>,
}

/// Turn the signed wire preference into an unsigned one and charge the
/// interface metric. Zero means "never use".
pub fn biased_preference(raw: i32, ifc_metric: u8) -> u32 {
    let pref = (raw as u32) ^ MIN_PREFERENCE_LEVEL;
    if pref == 0 {
        return 0;
    }
    pref.saturating_sub(u32::from(ifc_metric)).max(1)
}

/// Lifetime advertised for an interval
fn advert_lifetime(max_interval: Duration) -> u16 {
    (max_interval.as_secs() * 3).min(u64::from(u16::MAX)) as u16
}

/// Router discovery state
#[derive(Debug)]
pub struct Rdisc {
    routers: Vec<DiscoveredRouter>,
    /// Router currently installed as the default route
    installed: Option<Ipv4Addr>,
    /// Advertising instead of soliciting
    supplier: bool,
    adverts_sent: u32,
    next_advert: Duration,
    solicits_left: u32,
    next_solicit: Duration,
}

impl Rdisc {
    pub fn new<R: Rng + ?Sized>(supplier: bool, rng: &mut R, now: Duration) -> Self {
        Rdisc {
            routers: Vec::new(),
            installed: None,
            supplier,
            adverts_sent: 0,
            next_advert: now,
            solicits_left: MAX_SOLICITATIONS,
            next_solicit: now + jitter(rng, Duration::ZERO, MAX_SOLICITATION_DELAY),
        }
    }

    pub fn routers(&self) -> &[DiscoveredRouter] {
        &self.routers
    }

    pub fn installed(&self) -> Option<Ipv4Addr> {
        self.installed
    }

    /// Whether a discovered default route is in the table
    pub fn has_route(&self) -> bool {
        self.installed.is_some()
    }

    /// Switch between advertising and soliciting
    pub fn set_supplier(&mut self, supplier: bool, now: Duration) {
        if self.supplier == supplier {
            return;
        }
        self.supplier = supplier;
        self.adverts_sent = 0;
        self.next_advert = now;
        self.solicits_left = MAX_SOLICITATIONS;
        self.next_solicit = now;
    }

    /// Handle one message from the raw ICMP socket
    pub fn read(
        &mut self,
        store: &mut RouteStore,
        ifs: &Interfaces,
        rip_on: bool,
        from: Ipv4Addr,
        packet: &RdiscPacket,
        now: Duration,
        rng: &mut impl Rng,
    ) {
        if ifs.is_local(from) {
            return;
        }
        match packet {
            RdiscPacket::Advert(advert) => self.read_advert(store, ifs, rip_on, from, advert, now),
            RdiscPacket::Solicit => self.read_solicit(ifs, from, now, rng),
        }
    }

    fn read_advert(
        &mut self,
        store: &mut RouteStore,
        ifs: &Interfaces,
        rip_on: bool,
        from: Ipv4Addr,
        advert: &RouterAdvert,
        now: Duration,
    ) {
        let Some(idx) = ifs.lookup(from) else {
            tracing::warn!("discard router advertisement: {}", Rejection::NotNeighbor(from));
            return;
        };
        let Some(ifc) = ifs.get(idx) else {
            return;
        };
        if !ifc.rdisc.solicit {
            tracing::debug!("ignore router advertisement from {} on {}", from, ifc.name);
            return;
        }

        for &(addr, raw) in &advert.addrs {
            let host = crate::routes::addr::host(addr);
            if addr.is_unspecified() || addr.is_broadcast() || addr == ifc.broadcast {
                tracing::warn!("discard router advertisement: {}", Rejection::BadDestination(addr));
                continue;
            }
            if ifs.is_local(addr) {
                tracing::warn!("discard router advertisement: {}", Rejection::OwnAddress(addr));
                continue;
            }
            if !ifc.contains(host) {
                tracing::warn!("discard router advertisement: {}", Rejection::NotNeighbor(addr));
                continue;
            }

            let pref = biased_preference(raw, ifc.metric);
            let lifetime = Duration::from_secs(u64::from(advert.lifetime));
            self.upsert(addr, idx, pref, lifetime, now);
        }

        self.select(store, ifs, rip_on, now);
    }

    fn upsert(&mut self, addr: Ipv4Addr, ifc: IfIndex, pref: u32, lifetime: Duration, now: Duration) {
        let pos = self.routers.iter().position(|r| r.addr == addr && r.ifc == ifc);
        if pref == 0 || lifetime.is_zero() {
            if let Some(i) = pos {
                tracing::info!("router {} withdrawn", addr);
                self.routers.swap_remove(i);
            }
            return;
        }
        let record = DiscoveredRouter {
            addr,
            ifc,
            pref,
            lifetime,
            heard: now,
        };
        match pos {
            Some(i) => self.routers[i] = record,
            None if self.routers.len() < MAX_ADS => {
                tracing::info!("discovered router {} preference {:#x}", addr, pref);
                self.routers.push(record);
            }
            None => {
                // displace the least attractive record
                let worst = self
                    .routers
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, r)| (r.pref, r.expires()))
                    .map(|(i, r)| (i, r.pref));
                if let Some((i, worst_pref)) = worst {
                    if worst_pref < pref {
                        self.routers[i] = record;
                    }
                }
            }
        }
    }

    fn read_solicit<R: Rng + ?Sized>(&mut self, ifs: &Interfaces, from: Ipv4Addr, now: Duration, rng: &mut R) {
        if !self.supplier {
            return;
        }
        let advertising = ifs
            .lookup(from)
            .and_then(|i| ifs.get(i))
            .is_some_and(|i| i.rdisc.advertise);
        if !advertising {
            return;
        }
        let soon = now + jitter(rng, Duration::ZERO, MAX_RESPONSE_DELAY);
        if soon < self.next_advert {
            tracing::debug!("solicitation from {}; advertising early", from);
            self.next_advert = soon;
        }
    }

    /// Drop expired records and make the best remaining router the default
    /// route. Losing every router gives the default back to RIP.
    pub fn select(&mut self, store: &mut RouteStore, ifs: &Interfaces, rip_on: bool, now: Duration) {
        self.routers.retain(|r| {
            let alive = r.expires() > now;
            if !alive {
                tracing::info!("router {} timed out", r.addr);
            }
            alive
        });

        let installed = self.installed;
        let best = self
            .routers
            .iter()
            .filter(|r| ifs.get(r.ifc).is_some_and(|i| i.up))
            .max_by_key(|r| (r.pref, Some(r.addr) == installed, r.expires()))
            .cloned();

        match best {
            Some(best) => self.install(store, ifs, &best, now),
            None => self.revert(store, rip_on, now),
        }
    }

    fn install(&mut self, store: &mut RouteStore, ifs: &Interfaces, best: &DiscoveredRouter, now: Duration) {
        let cost = ifs.get(best.ifc).map_or(1, |i| i.cost());
        let new = Spare::new(best.addr, best.addr, u32::from(cost), 0, Some(best.ifc), now);

        match store.get(&Prefix::DEFAULT) {
            None => {
                if store.add(Prefix::DEFAULT, RouteState::RDISC, new, now).is_err() {
                    return;
                }
            }
            Some(rt) if !rt.state.contains(RouteState::RDISC) => {
                // a RIP default at least as good wins
                if rt.active().is_reachable() && rt.metric() <= new.metric {
                    if self.installed.take().is_some() {
                        tracing::info!("RIP default route preferred over router {}", best.addr);
                    }
                    return;
                }
                let state = rt.state | RouteState::RDISC;
                if store.change(Prefix::DEFAULT, state, new, "Rdisc", now).is_err() {
                    return;
                }
            }
            Some(rt) => {
                if rt.gate() == best.addr && rt.metric() == new.metric {
                    self.installed = Some(best.addr);
                    return;
                }
                let state = rt.state;
                if store.change(Prefix::DEFAULT, state, new, "Rdisc", now).is_err() {
                    return;
                }
            }
        }
        if self.installed != Some(best.addr) {
            tracing::info!("default route via discovered router {}", best.addr);
        }
        self.installed = Some(best.addr);
    }

    fn revert(&mut self, store: &mut RouteStore, rip_on: bool, now: Duration) {
        if self.installed.take().is_none() {
            return;
        }
        tracing::info!("no discovered routers left; default route returns to RIP");
        let Some((rt, books)) = store.entry_mut(&Prefix::DEFAULT) else {
            return;
        };
        if !rt.state.contains(RouteState::RDISC) {
            return;
        }
        let dead = Spare {
            metric: HOPCNT_INFINITY,
            ..rt.spares[0]
        };
        let state = rt.state - RouteState::RDISC;
        change_entry(rt, books, state, dead, "Rdisc", now);
        // RIP spares never failed; they need not sit out a hold-down
        rt.hold = None;
        let switched = match store.switch_to_spare(Prefix::DEFAULT, None, now) {
            Ok(switched) => switched,
            Err(e) => {
                tracing::warn!("Failed to restore RIP default route: {}", e);
                false
            }
        };
        if !switched && !rip_on {
            if let Err(e) = store.delete(Prefix::DEFAULT, now) {
                tracing::warn!("Failed to drop discovered default route: {}", e);
            }
        }
    }

    /// Advertisements and solicitations due now
    pub fn tick<R: Rng + ?Sized>(&mut self, ifs: &Interfaces, rng: &mut R, now: Duration) -> Vec<IcmpOut> {
        if self.supplier {
            self.advertise(ifs, rng, now)
        } else {
            self.solicit(ifs, now)
        }
    }

    fn advertise<R: Rng + ?Sized>(&mut self, ifs: &Interfaces, rng: &mut R, now: Duration) -> Vec<IcmpOut> {
        if now < self.next_advert {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut max_interval = MAX_MAX_ADVERTISE_INTERVAL;
        for (idx, ifc) in ifs.iter() {
            if !ifc.up || !ifc.rdisc.advertise {
                continue;
            }
            max_interval = max_interval.min(ifc.rdisc.max_interval);
            out.push(advert_for(idx, ifc.addr, ifc.rdisc.preference, advert_lifetime(ifc.rdisc.max_interval)));
        }
        if out.is_empty() {
            self.next_advert = now + DEF_MAX_ADVERTISE_INTERVAL;
            return out;
        }

        self.adverts_sent = self.adverts_sent.saturating_add(1);
        let max = if self.adverts_sent <= MAX_INITIAL_ADVERTS {
            max_interval.min(MAX_INITIAL_ADVERT_INTERVAL)
        } else {
            max_interval
        };
        let min = max.mul_f64(0.75);
        self.next_advert = now + jitter(rng, min, max);
        out
    }

    fn solicit(&mut self, ifs: &Interfaces, now: Duration) -> Vec<IcmpOut> {
        if self.solicits_left == 0 || now < self.next_solicit || !self.routers.is_empty() {
            return Vec::new();
        }
        let payload = RdiscPacket::Solicit.to_bytes();
        let out: Vec<IcmpOut> = ifs
            .iter()
            .filter(|(_, i)| i.up && i.rdisc.solicit)
            .map(|(idx, _)| IcmpOut {
                ifc: idx,
                to: INADDR_ALLROUTERS_GROUP,
                payload: payload.clone(),
            })
            .collect();
        if out.is_empty() {
            self.solicits_left = 0;
        } else {
            self.solicits_left -= 1;
            self.next_solicit = now + SOLICITATION_INTERVAL;
        }
        out
    }

    /// Next time `tick` or `select` has something to do
    pub fn deadline(&self) -> Option<Duration> {
        let send = if self.supplier {
            Some(self.next_advert)
        } else if self.solicits_left > 0 && self.routers.is_empty() {
            Some(self.next_solicit)
        } else {
            None
        };
        let expiry = self.routers.iter().map(DiscoveredRouter::expires).min();
        match (send, expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Withdraw ourselves as a router before exiting
    pub fn shutdown(&self, ifs: &Interfaces) -> Vec<IcmpOut> {
        if !self.supplier {
            return Vec::new();
        }
        ifs.iter()
            .filter(|(_, i)| i.up && i.rdisc.advertise)
            .map(|(idx, i)| advert_for(idx, i.addr, i.rdisc.preference, 0))
            .collect()
    }
}

fn advert_for(ifc: IfIndex, addr: Ipv4Addr, preference: i32, lifetime: u16) -> IcmpOut {
    let packet = RdiscPacket::Advert(RouterAdvert {
        lifetime,
        addrs: vec![(addr, preference)],
    });
    IcmpOut {
        ifc,
        to: INADDR_ALLHOSTS_GROUP,
        payload: packet.to_bytes(),
    }
}

/// Random delay in `[min, max]`
pub(crate) fn jitter<R: Rng + ?Sized>(rng: &mut R, min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(rng.gen_range(0..=span))
}
