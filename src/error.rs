// Error types for the routing daemon

use std::net::Ipv4Addr;
use thiserror::Error;

use crate::routes::Prefix;

/// Main error type for the daemon
#[derive(Error, Debug)]
pub enum RipdError {
    #[error("Socket error: {0}")]
    Socket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using RipdError
pub type RipdResult<T> = Result<T, RipdError>;

/// Malformed packets. The whole datagram is discarded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated: {0} bytes")]
    Truncated(usize),

    #[error("packet too large: {0} bytes")]
    TooLarge(usize),

    #[error("unknown command {0}")]
    BadCommand(u8),

    #[error("bad version {0}")]
    BadVersion(u8),

    #[error("bad ICMP checksum")]
    BadChecksum,

    #[error("unexpected ICMP type {0} code {1}")]
    BadIcmpType(u8, u8),

    #[error("bad router advertisement: {0}")]
    BadAdvertisement(String),
}

/// Misuse of the route store by a caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("route {0} already exists")]
    Duplicate(Prefix),

    #[error("no route for {0}")]
    NotFound(Prefix),
}

/// Failures at the kernel forwarding table boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    #[error("route {0} already exists in the kernel")]
    Exists(Prefix),

    #[error("no such route {0} in the kernel")]
    NoSuchRoute(Prefix),

    #[error("kernel rejected {prefix}: {reason}")]
    Rejected { prefix: Prefix, reason: String },

    #[error("failed to run route command: {0}")]
    Command(String),

    #[error("failed to parse kernel table: {0}")]
    Parse(String),
}

impl KernelError {
    /// The operation found the kernel already in the wanted state
    pub fn is_converged(&self) -> bool {
        matches!(self, KernelError::Exists(_) | KernelError::NoSuchRoute(_))
    }

    /// Check if the failed operation should be retried on a later pass
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KernelError::Rejected { .. } | KernelError::Command(_)
        )
    }
}

/// Reasons a received update or request is ignored without touching any
/// state. These are logged, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("packet from our own address {0}")]
    FromSelf(Ipv4Addr),

    #[error("response from {0} not on a directly connected network")]
    NotNeighbor(Ipv4Addr),

    #[error("response from {addr} via non-RIP port {port}")]
    BadSourcePort { addr: Ipv4Addr, port: u16 },

    #[error("RIPv{version} disabled on interface {interface}")]
    VersionDisabled { version: u8, interface: String },

    #[error("RIP disabled on interface {0}")]
    RipOff(String),

    #[error("authentication failed for packet from {0}")]
    AuthFailed(Ipv4Addr),

    #[error("bad address family {0}")]
    BadFamily(u16),

    #[error("bad metric {0}")]
    BadMetric(u32),

    #[error("bad destination {0}")]
    BadDestination(Ipv4Addr),

    #[error("bad netmask {mask:#010x} for {dst}")]
    BadMask { dst: Ipv4Addr, mask: u32 },

    #[error("route for our own interface address {0}")]
    OwnAddress(Ipv4Addr),

    #[error("next hop {0} points at us")]
    NextHopIsSelf(Ipv4Addr),

    #[error("tracing control from {0} not supported")]
    TraceControl(Ipv4Addr),

    #[error("route table full")]
    TableFull,
}
