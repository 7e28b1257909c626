// Aging sweep - stale routes fail over, expire to infinity and are collected

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::routes::{change_entry, switch_entry, Spare, RouteStore, HOPCNT_INFINITY, NUM_SPARES};

/// What one sweep did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgeReport {
    pub switched: usize,
    pub poisoned: usize,
    pub deleted: usize,
}

impl RouteStore {
    /// Age every route.
    ///
    /// Ageless routes are refreshed. Paths through `bad_gate` lose one supply
    /// interval of freshness, dead spares are dropped after the garbage
    /// interval, and a stale active path is replaced by the best spare, then
    /// poisoned once expired and deleted once it is garbage. With RIP off
    /// nothing learned is kept.
    pub fn walk_age(&mut self, bad_gate: Option<Ipv4Addr>, rip_on: bool, now: Duration) -> AgeReport {
        let mut report = AgeReport::default();
        let timers = *self.timers();
        let stale = timers.now_stale(now);
        let expire = timers.now_expire(now);
        let garbage = timers.now_garbage(now);

        for prefix in self.prefixes() {
            let Some((rt, books)) = self.entry_mut(&prefix) else {
                continue;
            };

            if rt.is_ageless() {
                rt.spares[0].time = now;
                continue;
            }
            if !rip_on {
                if self.delete(prefix, now).is_ok() {
                    report.deleted += 1;
                }
                continue;
            }

            for (i, spare) in rt.spares.iter_mut().enumerate() {
                if spare.is_empty() {
                    continue;
                }
                if Some(spare.gate) == bad_gate && spare.time >= stale {
                    spare.time = spare.time.saturating_sub(timers.supply);
                }
                if i != 0 && spare.metric >= HOPCNT_INFINITY && spare.time < garbage {
                    *spare = Spare::EMPTY;
                }
            }

            if rt.spares[0].time >= stale {
                continue;
            }

            if switch_entry(rt, books, None, now) {
                report.switched += 1;
            }

            let active = rt.spares[0];
            if active.time < garbage {
                tracing::debug!("Garbage {} gate {}", prefix, active.gate);
                if self.delete(prefix, now).is_ok() {
                    report.deleted += 1;
                }
                continue;
            }

            if active.time < expire && active.metric < HOPCNT_INFINITY {
                let new = Spare {
                    metric: HOPCNT_INFINITY,
                    ..active
                };
                let state = rt.state;
                change_entry(rt, books, state, new, "Poison", now);
                report.poisoned += 1;
            }
        }

        debug_assert!(self
            .iter()
            .all(|rt| rt.spares.iter().all(|s| s.metric <= HOPCNT_INFINITY)));
        if report != AgeReport::default() {
            tracing::debug!(
                "Aged table: {} switched, {} poisoned, {} deleted",
                report.switched,
                report.poisoned,
                report.deleted
            );
        }
        report
    }

    /// Spares still holding a live path, for diagnostics
    pub fn live_spares(&self) -> usize {
        self.iter()
            .map(|rt| {
                (1..NUM_SPARES)
                    .filter(|&i| rt.spares[i].is_reachable())
                    .count()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregator;
    use crate::interface::{IfIndex, Interface, Interfaces};
    use crate::kernel::tests::RecordingKernel;
    use crate::kernel::{KernelMirror, KernelOp};
    use crate::routes::{Prefix, RouteState};
    use crate::timers::{Timers, EXPIRE_TIME, GARBAGE_TIME, STALE_TIME};

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn net10() -> Prefix {
        Prefix::new(0x0a00_0000, 0xff00_0000)
    }

    fn path(router: &str, metric: u32, now: Duration) -> Spare {
        Spare::new(ip(router), ip(router), metric, 0, Some(IfIndex(0)), now)
    }

    #[test]
    fn test_fresh_route_untouched() {
        let mut store = RouteStore::new(Timers::default());
        store.learn(net10(), path("192.168.1.2", 3, secs(100)), secs(100));
        let report = store.walk_age(None, true, secs(150));
        assert_eq!(report, AgeReport::default());
        assert_eq!(store.get(&net10()).unwrap().metric(), 3);
    }

    #[test]
    fn test_stale_route_switches_to_spare() {
        let mut store = RouteStore::new(Timers::default());
        let t0 = secs(1000);
        store.learn(net10(), path("192.168.1.2", 2, t0), t0);
        let later = t0 + secs(60);
        store.learn(net10(), path("192.168.1.3", 4, later), later);
        assert_eq!(store.get(&net10()).unwrap().gate(), ip("192.168.1.2"));

        let report = store.walk_age(None, true, t0 + STALE_TIME + secs(1));
        assert_eq!(report.switched, 1);
        assert_eq!(store.get(&net10()).unwrap().gate(), ip("192.168.1.3"));
    }

    #[test]
    fn test_expired_route_poisoned_then_deleted() {
        let mut store = RouteStore::new(Timers::default());
        let t0 = secs(1000);
        store.learn(net10(), path("192.168.1.2", 2, t0), t0);

        let report = store.walk_age(None, true, t0 + EXPIRE_TIME + secs(1));
        assert_eq!(report.poisoned, 1);
        let rt = store.get(&net10()).unwrap();
        assert_eq!(rt.metric(), HOPCNT_INFINITY);
        assert!(rt.hold.is_some());

        let report = store.walk_age(None, true, t0 + GARBAGE_TIME + secs(1));
        assert_eq!(report.deleted, 1);
        assert!(store.get(&net10()).is_none());
    }

    #[test]
    fn test_garbage_route_deleted_from_kernel_next_sync() {
        let ifs = Interfaces::new(vec![Interface::new("eth0", ip("192.168.1.1"), 24)]);
        let mut store = RouteStore::new(Timers::default());
        ifs.install_routes(&mut store, secs(1));
        let mut ag = Aggregator::default();
        let mut mirror = KernelMirror::new();
        let mut kernel = RecordingKernel::default();

        let t0 = secs(1000);
        store.learn(net10(), path("192.168.1.2", 2, t0), t0);
        mirror.sync(&mut store, &ifs, &mut ag, &mut kernel, true, t0);

        let later = t0 + GARBAGE_TIME + secs(1);
        assert_eq!(store.walk_age(None, true, later).deleted, 1);
        assert!(store.get(&net10()).is_none());

        let ops = mirror.sync(&mut store, &ifs, &mut ag, &mut kernel, true, later);
        assert!(matches!(ops.as_slice(), [KernelOp::Delete(r)] if r.prefix == net10()));
        assert!(mirror.get(&net10()).is_none());
    }

    #[test]
    fn test_ageless_routes_kept_and_refreshed() {
        let ifs = Interfaces::new(vec![Interface::new("eth0", ip("192.168.1.1"), 24)]);
        let mut store = RouteStore::new(Timers::default());
        ifs.install_routes(&mut store, secs(1));
        let later = secs(1) + GARBAGE_TIME * 2;
        assert_eq!(store.walk_age(None, true, later), AgeReport::default());
        let rt = store.get(&Prefix::new(0xc0a8_0100, 0xffff_ff00)).unwrap();
        assert!(rt.state.contains(RouteState::IF));
        assert_eq!(rt.active().time, later);
    }

    #[test]
    fn test_rip_off_forgets_learned_routes() {
        let ifs = Interfaces::new(vec![Interface::new("eth0", ip("192.168.1.1"), 24)]);
        let mut store = RouteStore::new(Timers::default());
        ifs.install_routes(&mut store, secs(1));
        store.learn(net10(), path("192.168.1.2", 2, secs(10)), secs(10));
        let report = store.walk_age(None, false, secs(11));
        assert_eq!(report.deleted, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_bad_gate_ages_faster() {
        let mut store = RouteStore::new(Timers::default());
        let t0 = secs(1000);
        store.learn(net10(), path("192.168.1.2", 2, t0), t0);
        store.walk_age(Some(ip("192.168.1.2")), true, t0 + secs(1));
        assert_eq!(store.get(&net10()).unwrap().active().time, t0 - secs(30));
    }

    #[test]
    fn test_dead_spare_collected() {
        let mut store = RouteStore::new(Timers::default());
        let t0 = secs(1000);
        store.learn(net10(), path("192.168.1.2", 2, t0), t0);
        store.learn(net10(), path("192.168.1.3", 5, t0), t0);
        assert_eq!(store.live_spares(), 1);

        // the spare fails with its interface and is collected later
        store.bad_interface(IfIndex(0), t0 + secs(1));
        let later = t0 + GARBAGE_TIME + secs(2);
        store.walk_age(None, true, later);
        assert_eq!(store.live_spares(), 0);
        assert!(store.get(&net10()).is_none());
    }
}
