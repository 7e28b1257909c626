// Route lookup with longest prefix matching

use super::{RouteEntry, RouteStore};
use std::net::Ipv4Addr;

impl RouteStore {
    /// Find the entry owning a destination address using longest prefix matching.
    ///
    /// Answers "which route covers this address" for the daemon itself;
    /// forwarding lookups are the kernel's job.
    pub fn find_best_match(&self, dest: Ipv4Addr) -> Option<&RouteEntry> {
        let mut best_match: Option<(&RouteEntry, u32)> = None;

        for route in self.iter() {
            if !ip_v4_matches(route.prefix.dst_addr(), dest, route.prefix.mask) {
                continue;
            }
            let prefix_len = route.prefix.mask.count_ones();
            match best_match {
                None => best_match = Some((route, prefix_len)),
                Some((_, current_len)) if prefix_len > current_len => {
                    best_match = Some((route, prefix_len));
                }
                _ => {}
            }
        }

        best_match.map(|(route, _)| route)
    }
}

/// Masks need not be contiguous; every set bit must agree.
fn ip_v4_matches(network: Ipv4Addr, addr: Ipv4Addr, mask: u32) -> bool {
    (u32::from(network) & mask) == (u32::from(addr) & mask)
}
