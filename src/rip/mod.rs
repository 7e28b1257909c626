// RIP module - packet codec, input processing and table advertisement

pub mod input;
pub mod output;
pub mod packet;

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::interface::{IfIndex, Interfaces};
use crate::routes::addr::{on_net, std_mask, HOST_MASK};

pub const RIP_PORT: u16 = 520;
pub const INADDR_RIP_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 9);
pub const RIPV1: u8 = 1;
pub const RIPV2: u8 = 2;

/// Default cutoff when turning a supernet into classful networks for RIPv1
pub const DEF_EXPANSION_LIMIT: usize = 1024;

/// Process-wide switches that shape what is heard and said
#[derive(Debug, Clone)]
pub struct RipOptions {
    /// Listening to RIP at all
    pub rip_on: bool,
    /// Advertising routes, rather than only the routes of our own aliases
    pub supplier: bool,
    /// Never advertise host routes
    pub ridhosts: bool,
    /// Merge and suppress routes on output
    pub aggregate: bool,
    /// Also build supernets beyond the natural networks
    pub supernets: bool,
    pub expansion_limit: usize,
    /// Shutting down: everything goes out unreachable
    pub stopping: bool,
}

impl Default for RipOptions {
    fn default() -> Self {
        RipOptions {
            rip_on: true,
            supplier: true,
            ridhosts: false,
            aggregate: true,
            supernets: true,
            expansion_limit: DEF_EXPANSION_LIMIT,
            stopping: false,
        }
    }
}

/// A datagram ready to be sent from the RIP socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Interface to send through; None for ordinary unicast routing
    pub ifc: Option<IfIndex>,
    pub to: SocketAddrV4,
    pub payload: Vec<u8>,
}

/// Mask a RIPv1 speaker would assume for a network number.
///
/// The subnet mask of an interface on the same classful network wins over
/// the classful mask, and the given interface is tried first.
pub fn ripv1_mask_net(dst: u32, ifs: &Interfaces, ifc: Option<IfIndex>) -> u32 {
    if dst == 0 {
        return 0;
    }
    let classful = std_mask(dst);
    if let Some(ifc) = ifc.and_then(|i| ifs.get(i)) {
        if on_net(dst, ifc.std_net, ifc.std_mask) && ifc.mask > classful && !ifc.is_point_to_point() {
            return ifc.mask;
        }
    }
    ifs.iter()
        .map(|(_, i)| i)
        .filter(|i| !i.is_point_to_point() && i.mask > classful && on_net(dst, i.std_net, i.std_mask))
        .map(|i| i.mask)
        .max()
        .unwrap_or(classful)
}

/// Like `ripv1_mask_net`, but addresses with host bits set are hosts
pub fn ripv1_mask_host(dst: u32, ifs: &Interfaces, ifc: Option<IfIndex>) -> u32 {
    let mask = ripv1_mask_net(dst, ifs, ifc);
    if dst & !mask != 0 { HOST_MASK } else { mask }
}
