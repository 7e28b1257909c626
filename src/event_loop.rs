// Event loop - sockets, timers and signals around the daemon core

use anyhow::Context;
use rand::rngs::StdRng;
use rand::SeedableRng;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::unix::AsyncFd;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::api;
use crate::config::Config;
use crate::daemon::{Daemon, Output};
use crate::error::{RipdError, RipdResult};
use crate::interface::Interfaces;
use crate::kernel::iproute::{IpRoute, KernelWatcher};
use crate::kernel::{KernelTable, NullKernel};
use crate::rdisc::{INADDR_ALLHOSTS_GROUP, INADDR_ALLROUTERS_GROUP};
use crate::rip::{INADDR_RIP_GROUP, RIP_PORT};

/// Large enough for any RIP packet and any sane ICMP datagram
const RECV_BUF: usize = 2048;

/// Open the RIP socket and join the RIPv2 group on every interface that
/// listens to RIP
fn rip_socket(ifs: &Interfaces) -> RipdResult<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_multicast_loop_v4(false)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;
    let bind = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, RIP_PORT);
    socket
        .bind(&SockAddr::from(bind))
        .map_err(|e| RipdError::Socket(format!("bind RIP socket to {}: {}", bind, e)))?;

    for (_, ifc) in ifs.iter() {
        if !ifc.hears_rip() || ifc.is_point_to_point() {
            continue;
        }
        if let Err(e) = socket.join_multicast_v4(&INADDR_RIP_GROUP, &ifc.addr) {
            tracing::warn!("Failed to join {} on {}: {}", INADDR_RIP_GROUP, ifc.name, e);
        }
    }

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Open the raw ICMP socket for router discovery. Without it the daemon
/// still runs RIP.
fn icmp_socket(ifs: &Interfaces) -> Option<AsyncFd<Socket>> {
    let opened = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).and_then(|s| {
        s.set_nonblocking(true)?;
        s.set_multicast_loop_v4(false)?;
        s.set_multicast_ttl_v4(1)?;
        Ok(s)
    });
    let socket = match opened {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Router discovery disabled, no raw ICMP socket: {}", e);
            return None;
        }
    };

    for (_, ifc) in ifs.iter() {
        if ifc.is_point_to_point() {
            continue;
        }
        for group in [INADDR_ALLHOSTS_GROUP, INADDR_ALLROUTERS_GROUP] {
            if let Err(e) = socket.join_multicast_v4(&group, &ifc.addr) {
                tracing::debug!("Failed to join {} on {}: {}", group, ifc.name, e);
            }
        }
    }

    match AsyncFd::new(socket) {
        Ok(fd) => Some(fd),
        Err(e) => {
            tracing::warn!("Router discovery disabled: {}", e);
            None
        }
    }
}

async fn recv_icmp(fd: Option<&AsyncFd<Socket>>, buf: &mut [u8]) -> io::Result<usize> {
    let Some(fd) = fd else {
        return std::future::pending().await;
    };
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| {
            let mut socket: &Socket = inner.get_ref();
            socket.read(buf)
        }) {
            Ok(result) => return result,
            Err(_would_block) => continue,
        }
    }
}

async fn send_output(
    output: Output,
    ifs: &Interfaces,
    udp: &UdpSocket,
    icmp: Option<&AsyncFd<Socket>>,
) {
    for packet in output.rip {
        if let Some(ifc) = packet.ifc.and_then(|i| ifs.get(i)) {
            if packet.to.ip().is_multicast() {
                if let Err(e) = SockRef::from(udp).set_multicast_if_v4(&ifc.addr) {
                    tracing::warn!("Failed to select {} for multicast: {}", ifc.name, e);
                    continue;
                }
            }
        }
        if let Err(e) = udp.send_to(&packet.payload, SocketAddr::V4(packet.to)).await {
            tracing::warn!("Failed to send RIP packet to {}: {}", packet.to, e);
        }
    }

    let Some(icmp) = icmp else {
        return;
    };
    for packet in output.icmp {
        let socket = icmp.get_ref();
        if let Some(ifc) = ifs.get(packet.ifc) {
            if packet.to.is_multicast() {
                if let Err(e) = socket.set_multicast_if_v4(&ifc.addr) {
                    tracing::warn!("Failed to select {} for multicast: {}", ifc.name, e);
                    continue;
                }
            }
        }
        let to = SockAddr::from(SocketAddrV4::new(packet.to, 0));
        if let Err(e) = socket.send_to(&packet.payload, &to) {
            tracing::warn!("Failed to send ICMP message to {}: {}", packet.to, e);
        }
    }
}

fn poll_kernel(watcher: &mut KernelWatcher, daemon: &mut Daemon, now: std::time::Duration) {
    match watcher.poll() {
        Ok(events) if events.is_empty() => {}
        Ok(events) => {
            tracing::debug!("{} kernel changes", events.len());
            daemon.on_kernel_events(events, now);
        }
        Err(e) => tracing::warn!("Failed to read kernel tables: {}", e),
    }
}

/// Run the daemon until SIGINT or SIGTERM
pub async fn run(config: Config) -> anyhow::Result<()> {
    let start = Instant::now();

    let kernel: Box<dyn KernelTable> = if config.kernel {
        Box::new(IpRoute::new(config.kernel_priority))
    } else {
        tracing::info!("Kernel table updates disabled");
        Box::new(NullKernel)
    };
    let mut daemon = Daemon::new(&config, kernel, StdRng::from_entropy(), start.elapsed());

    let udp = rip_socket(daemon.interfaces())?;
    let icmp = icmp_socket(daemon.interfaces());

    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

    let output = daemon.start(start.elapsed());
    send_output(output, daemon.interfaces(), &udp, icmp.as_ref()).await;

    let mut watcher = KernelWatcher::new();
    poll_kernel(&mut watcher, &mut daemon, start.elapsed());

    let (status_tx, status_rx) = watch::channel(daemon.snapshot(start.elapsed()));
    if let Some(addr) = config.status {
        tokio::spawn(async move {
            if let Err(e) = api::rest::serve(addr, status_rx).await {
                tracing::error!("Status API stopped: {}", e);
            }
        });
    }

    let mut kernel_poll = time::interval(config.timers.kernel_poll);
    kernel_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes at once and the table was just read
    kernel_poll.tick().await;

    let mut rip_buf = vec![0u8; RECV_BUF];
    let mut icmp_buf = vec![0u8; RECV_BUF];

    tracing::info!("Listening for RIP on port {}", RIP_PORT);
    loop {
        let deadline = start + daemon.deadline();
        tokio::select! {
            biased;

            _ = sigint.recv() => {
                tracing::info!("Received SIGINT");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                break;
            }
            _ = time::sleep_until(deadline) => {
                let output = daemon.tick(start.elapsed());
                send_output(output, daemon.interfaces(), &udp, icmp.as_ref()).await;
            }
            _ = kernel_poll.tick() => {
                poll_kernel(&mut watcher, &mut daemon, start.elapsed());
            }
            received = udp.recv_from(&mut rip_buf) => match received {
                Ok((len, SocketAddr::V4(from))) => {
                    let replies = daemon.on_rip_packet(from, &rip_buf[..len], start.elapsed());
                    let output = Output { rip: replies, icmp: Vec::new() };
                    send_output(output, daemon.interfaces(), &udp, icmp.as_ref()).await;
                }
                Ok((_, from)) => tracing::debug!("Ignoring packet from {}", from),
                Err(e) => tracing::warn!("RIP socket receive failed: {}", e),
            },
            received = recv_icmp(icmp.as_ref(), &mut icmp_buf) => match received {
                Ok(len) => daemon.on_icmp(&icmp_buf[..len], start.elapsed()),
                Err(e) => tracing::warn!("ICMP socket receive failed: {}", e),
            },
        }

        if let Some(snapshot) = daemon.take_status(start.elapsed()) {
            status_tx.send_replace(snapshot);
        }
    }

    let output = daemon.shutdown(start.elapsed());
    send_output(output, daemon.interfaces(), &udp, icmp.as_ref()).await;
    Ok(())
}
