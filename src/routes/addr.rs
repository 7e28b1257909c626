// IPv4 address and netmask helpers
//
// Addresses and masks inside the route table are kept as host-order u32 so
// that mask arithmetic reads naturally.

use std::net::Ipv4Addr;

pub const HOST_MASK: u32 = 0xffff_ffff;

/// Mask for a prefix length. Lengths above 32 are treated as host routes.
pub fn prefix_to_mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        len if len >= 32 => HOST_MASK,
        len => HOST_MASK << (32 - len),
    }
}

/// Prefix length of a contiguous mask, or None for masks with holes
pub fn mask_to_prefix(mask: u32) -> Option<u8> {
    if is_contiguous(mask) {
        Some(mask.count_ones() as u8)
    } else {
        None
    }
}

/// True when the mask is a run of ones followed by a run of zeros.
///
/// `mask & -mask` isolates the lowest set bit; adding it carries through the
/// ones only when there are no holes.
pub fn is_contiguous(mask: u32) -> bool {
    mask.wrapping_add(mask & mask.wrapping_neg()) == 0
}

/// Classful (RIPv1) network mask of an address
pub fn std_mask(addr: u32) -> u32 {
    if addr == 0 {
        return 0;
    }
    match addr >> 24 {
        0..=127 => 0xff00_0000,
        128..=191 => 0xffff_0000,
        _ => 0xffff_ff00,
    }
}

/// Whether `addr` lies within `net/mask`
pub fn on_net(addr: u32, net: u32, mask: u32) -> bool {
    (addr & mask) == (net & mask)
}

/// Reject destinations that are never valid in a route: the zero network
/// (other than the default route), loopback, multicast and class E.
pub fn check_dst(addr: u32) -> bool {
    if addr == 0 {
        return true;
    }
    let first = addr >> 24;
    if first == 0 || first == 127 {
        return false;
    }
    first < 224
}

/// Host order value of an address
pub fn host(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

/// Address from a host order value
pub fn addr(host_order: u32) -> Ipv4Addr {
    Ipv4Addr::from(host_order)
}

/// Human readable "a.b.c.d/len", falling back to the dotted mask when the
/// mask is not contiguous.
pub fn addr_name(dst: u32, mask: u32) -> String {
    match mask_to_prefix(mask) {
        Some(32) => addr(dst).to_string(),
        Some(len) => format!("{}/{}", addr(dst), len),
        None => format!("{}&{}", addr(dst), addr(mask)),
    }
}
