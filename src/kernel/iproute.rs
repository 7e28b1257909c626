// Linux kernel table access through the iproute2 `ip` command

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::Command;

use super::{KernelEvent, KernelRoute, KernelTable, RouteOrigin};
use crate::error::KernelError;
use crate::routes::addr::{self, prefix_to_mask};
use crate::routes::{Prefix, HOPCNT_INFINITY};

/// Routing protocol number the kernel shows as "rip"
pub const RTPROT_RIP: u8 = 189;

/// Installs routes with `ip route`, tagged with our protocol number.
///
/// Hop counts have no meaning to Linux, so every route goes in at one fixed
/// priority and unreachable routes become `unreachable` entries.
#[derive(Debug, Clone)]
pub struct IpRoute {
    protocol: u8,
    priority: u32,
}

impl IpRoute {
    pub fn new(priority: u32) -> Self {
        IpRoute {
            protocol: RTPROT_RIP,
            priority,
        }
    }

    fn route_args(&self, route: &KernelRoute) -> Vec<String> {
        let mut args = Vec::new();
        if route.metric >= HOPCNT_INFINITY {
            args.push("unreachable".to_string());
            args.push(route.prefix.to_string());
        } else {
            args.push(route.prefix.to_string());
            if route.gateway {
                args.push("via".to_string());
                args.push(route.gate.to_string());
            }
        }
        args.extend([
            "proto".to_string(),
            self.protocol.to_string(),
            "metric".to_string(),
            self.priority.to_string(),
        ]);
        args
    }

    fn run(&self, verb: &str, route: &KernelRoute, args: Vec<String>) -> Result<(), KernelError> {
        let output = Command::new("ip")
            .args(["route", verb])
            .args(&args)
            .output()
            .map_err(|e| KernelError::Command(format!("Failed to execute ip command: {}", e)))?;

        if output.status.success() {
            tracing::debug!("ip route {} {}", verb, args.join(" "));
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify(route.prefix, &stderr))
    }
}

impl KernelTable for IpRoute {
    fn add(&mut self, route: &KernelRoute) -> Result<(), KernelError> {
        let args = self.route_args(route);
        self.run("add", route, args)
    }

    fn change(&mut self, route: &KernelRoute) -> Result<(), KernelError> {
        let args = self.route_args(route);
        self.run("replace", route, args)
    }

    fn delete(&mut self, route: &KernelRoute) -> Result<(), KernelError> {
        let args = vec![
            route.prefix.to_string(),
            "proto".to_string(),
            self.protocol.to_string(),
            "metric".to_string(),
            self.priority.to_string(),
        ];
        self.run("del", route, args)
    }
}

/// Map `ip` error output onto the kernel error taxonomy
fn classify(prefix: Prefix, stderr: &str) -> KernelError {
    if stderr.contains("File exists") {
        KernelError::Exists(prefix)
    } else if stderr.contains("No such process") || stderr.contains("No such file") {
        KernelError::NoSuchRoute(prefix)
    } else {
        KernelError::Rejected {
            prefix,
            reason: stderr.trim().to_string(),
        }
    }
}

/// Read the IPv4 main table
pub fn get_routing_table() -> Result<Vec<(KernelRoute, RouteOrigin)>, KernelError> {
    // Try using `ip -json route show` first
    let output = Command::new("ip")
        .args(["-json", "-4", "route", "show", "table", "main"])
        .output()
        .map_err(|e| KernelError::Command(format!("Failed to execute ip command: {}", e)))?;

    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        return parse_ip_json(&stdout);
    }

    // Fallback to parsing `ip route show` (non-JSON)
    let output = Command::new("ip")
        .args(["-4", "route", "show", "table", "main"])
        .output()
        .map_err(|e| KernelError::Command(format!("Failed to execute ip command: {}", e)))?;

    if !output.status.success() {
        return Err(KernelError::Command("Failed to get routing table".to_string()));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(parse_ip_route(&stdout))
}

/// Link names and whether each is up
pub fn get_links() -> Result<Vec<(String, bool)>, KernelError> {
    let output = Command::new("ip")
        .args(["-json", "link", "show"])
        .output()
        .map_err(|e| KernelError::Command(format!("Failed to execute ip command: {}", e)))?;

    if !output.status.success() {
        return Err(KernelError::Command("Failed to get link state".to_string()));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_links_json(&stdout)
}

fn parse_dst(dst: &str) -> Option<Prefix> {
    if dst == "default" {
        return Some(Prefix::DEFAULT);
    }
    let (addr, len) = match dst.split_once('/') {
        Some((a, l)) => (a, l.parse::<u8>().ok()?),
        None => (dst, 32),
    };
    let addr: Ipv4Addr = addr.parse().ok()?;
    Some(Prefix::new(addr::host(addr), prefix_to_mask(len)))
}

fn origin_of(protocol: &str) -> RouteOrigin {
    match protocol {
        "rip" => RouteOrigin::Ours,
        "redirect" => RouteOrigin::Redirect,
        p if p.parse::<u8>().ok() == Some(RTPROT_RIP) => RouteOrigin::Ours,
        _ => RouteOrigin::Foreign,
    }
}

/// Linux priorities double as hop counts only when they look like one
fn metric_of(priority: u64, origin: RouteOrigin, unreachable: bool) -> u8 {
    if unreachable {
        return HOPCNT_INFINITY;
    }
    match origin {
        RouteOrigin::Foreign if (1..HOPCNT_INFINITY as u64).contains(&priority) => priority as u8,
        _ => 0,
    }
}

fn parse_ip_json(json_str: &str) -> Result<Vec<(KernelRoute, RouteOrigin)>, KernelError> {
    // Parse JSON output from `ip -json route show`
    let routes: Vec<serde_json::Value> = serde_json::from_str(json_str)
        .map_err(|e| KernelError::Parse(format!("Failed to parse JSON: {}", e)))?;

    let mut parsed_routes = Vec::new();

    for route in routes {
        let destination = route
            .get("dst")
            .and_then(|v| v.as_str())
            .unwrap_or("default");
        let Some(prefix) = parse_dst(destination) else {
            continue;
        };

        let kind = route.get("type").and_then(|v| v.as_str()).unwrap_or("unicast");
        let unreachable = match kind {
            "unicast" => false,
            "unreachable" | "blackhole" | "prohibit" => true,
            _ => continue,
        };

        let gateway: Option<Ipv4Addr> = route
            .get("gateway")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok());

        let protocol = route
            .get("protocol")
            .and_then(|v| v.as_str())
            .unwrap_or("boot");
        let origin = origin_of(protocol);

        let priority = route.get("metric").and_then(|v| v.as_u64()).unwrap_or(0);

        parsed_routes.push((
            KernelRoute {
                prefix,
                gate: gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
                metric: metric_of(priority, origin, unreachable),
                gateway: gateway.is_some(),
            },
            origin,
        ));
    }

    Ok(parsed_routes)
}

fn parse_ip_route(output: &str) -> Vec<(KernelRoute, RouteOrigin)> {
    // Parse non-JSON output from `ip route show`
    let mut routes = Vec::new();

    for line in output.lines() {
        let mut parts: Vec<&str> = line.split_whitespace().collect();
        let unreachable = match parts.first() {
            Some(&"unreachable") | Some(&"blackhole") | Some(&"prohibit") => {
                parts.remove(0);
                true
            }
            Some(&"local") | Some(&"broadcast") | Some(&"multicast") => continue,
            _ => false,
        };
        let Some(prefix) = parts.first().and_then(|d| parse_dst(d)) else {
            continue;
        };

        let mut gateway: Option<Ipv4Addr> = None;
        let mut protocol = "boot";
        let mut priority = 0;

        let mut i = 1;
        while i < parts.len() {
            match (parts.get(i).copied(), parts.get(i + 1)) {
                (Some("via"), Some(gw)) => {
                    gateway = gw.parse().ok();
                    i += 2;
                }
                (Some("proto"), Some(p)) => {
                    protocol = p;
                    i += 2;
                }
                (Some("metric"), Some(m)) => {
                    priority = m.parse().unwrap_or(0);
                    i += 2;
                }
                _ => {
                    i += 1;
                }
            }
        }

        let origin = origin_of(protocol);
        routes.push((
            KernelRoute {
                prefix,
                gate: gateway.unwrap_or(Ipv4Addr::UNSPECIFIED),
                metric: metric_of(priority, origin, unreachable),
                gateway: gateway.is_some(),
            },
            origin,
        ));
    }

    routes
}

fn parse_links_json(json_str: &str) -> Result<Vec<(String, bool)>, KernelError> {
    let links: Vec<serde_json::Value> = serde_json::from_str(json_str)
        .map_err(|e| KernelError::Parse(format!("Failed to parse JSON: {}", e)))?;

    Ok(links
        .iter()
        .filter_map(|link| {
            let name = link.get("ifname")?.as_str()?.to_string();
            let admin_up = link
                .get("flags")
                .and_then(|v| v.as_array())
                .is_some_and(|flags| flags.iter().any(|f| f.as_str() == Some("UP")));
            let oper_down = link.get("operstate").and_then(|v| v.as_str()) == Some("DOWN");
            Some((name, admin_up && !oper_down))
        })
        .collect())
}

/// Turns periodic snapshots of the kernel tables into change notifications
#[derive(Debug, Default)]
pub struct KernelWatcher {
    routes: HashMap<Prefix, (KernelRoute, RouteOrigin)>,
    links: HashMap<String, bool>,
}

impl KernelWatcher {
    pub fn new() -> Self {
        KernelWatcher::default()
    }

    /// Read the kernel and report what changed since the last call.
    /// The first call reports everything.
    pub fn poll(&mut self) -> Result<Vec<KernelEvent>, KernelError> {
        let routes = get_routing_table()?;
        let links = get_links()?;
        Ok(self.diff(routes, links))
    }

    fn diff(
        &mut self,
        routes: Vec<(KernelRoute, RouteOrigin)>,
        links: Vec<(String, bool)>,
    ) -> Vec<KernelEvent> {
        let mut events = Vec::new();

        let current: HashMap<Prefix, (KernelRoute, RouteOrigin)> =
            routes.into_iter().map(|r| (r.0.prefix, r)).collect();
        for (prefix, (route, origin)) in &current {
            if self.routes.get(prefix) != Some(&(*route, *origin)) {
                events.push(KernelEvent::Added(*route, *origin));
            }
        }
        for prefix in self.routes.keys() {
            if !current.contains_key(prefix) {
                events.push(KernelEvent::Removed(*prefix));
            }
        }
        self.routes = current;

        for (name, up) in links {
            let before = self.links.insert(name.clone(), up);
            match (before, up) {
                (Some(was), now) if was == now => {}
                (_, true) => events.push(KernelEvent::LinkUp(name)),
                (_, false) => events.push(KernelEvent::LinkDown(name)),
            }
        }

        events
    }
}
