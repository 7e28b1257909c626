// Configuration management for ripd
// Supports CLI arguments, config file (TOML), and environment variables

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

use crate::daemon::{InternalNet, StaticKind, StaticRoute};
use crate::interface::{Interface, RipOut};
use crate::rdisc::{DEF_MAX_ADVERTISE_INTERVAL, MAX_MAX_ADVERTISE_INTERVAL, MIN_MAX_ADVERTISE_INTERVAL};
use crate::rip::{RipOptions, DEF_EXPANSION_LIMIT};
use crate::routes::addr::prefix_to_mask;
use crate::routes::{Prefix, HOPCNT_INFINITY};
use crate::timers::Timers;

/// ripd - RIP-II routing daemon with ICMP router discovery
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ripd")]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, env = "RIPD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace)
    #[arg(short, long, env = "RUST_LOG")]
    pub log_level: Option<String>,

    /// Write the log to this file instead of stderr
    #[arg(short = 'T', long, env = "RIPD_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// Advertise routes even with a single interface
    #[arg(short, long, conflicts_with = "quiet")]
    pub supplier: bool,

    /// Never advertise; only listen
    #[arg(short, long)]
    pub quiet: bool,

    /// Compute routes but leave the kernel table alone
    #[arg(long, env = "RIPD_NO_KERNEL")]
    pub no_kernel: bool,

    /// Advertise a default route on every interface
    #[arg(short = 'g', long)]
    pub advertise_default: bool,

    /// Do not advertise host routes
    #[arg(long)]
    pub ridhosts: bool,

    /// Status API port
    #[arg(long, env = "RIPD_STATUS_PORT")]
    pub status_port: Option<u16>,
}

/// Configuration file structure (TOML format)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub timers: TimersConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default, rename = "interface")]
    pub interfaces: Vec<InterfaceConfig>,

    #[serde(default, rename = "static_route")]
    pub static_routes: Vec<StaticRouteConfig>,

    #[serde(default, rename = "internal_net")]
    pub internal_nets: Vec<InternalNetConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Force supplying on or off; detected from the interfaces when unset
    #[serde(default)]
    pub supplier: Option<bool>,

    /// Run RIP at all; with it off only router discovery is used
    #[serde(default = "default_true")]
    pub rip: bool,

    /// Install routes in the kernel
    #[serde(default = "default_true")]
    pub kernel: bool,

    /// Linux route priority our routes are installed with
    #[serde(default = "default_kernel_priority")]
    pub kernel_priority: u32,

    /// Do not advertise host routes
    #[serde(default)]
    pub ridhosts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimersConfig {
    #[serde(default = "default_supply")]
    pub supply_seconds: u64,
    #[serde(default = "default_stale")]
    pub stale_seconds: u64,
    #[serde(default = "default_expire")]
    pub expire_seconds: u64,
    #[serde(default = "default_garbage")]
    pub garbage_seconds: u64,
    #[serde(default = "default_hold_down")]
    pub hold_down_seconds: u64,
    #[serde(default = "default_flash_min")]
    pub flash_min_seconds: u64,
    #[serde(default = "default_flash_max")]
    pub flash_max_seconds: u64,
    #[serde(default = "default_kernel_poll")]
    pub kernel_poll_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Also merge beyond the classful networks
    #[serde(default = "default_true")]
    pub supernets: bool,

    #[serde(default = "default_slots")]
    pub slots: usize,

    /// Largest number of classful networks one supernet is expanded into for
    /// RIPv1 listeners
    #[serde(default = "default_expansion_limit")]
    pub expansion_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,

    /// Address and prefix length, e.g. "192.168.1.1/24"
    pub address: String,

    /// Far end of a point-to-point link
    #[serde(default)]
    pub peer: Option<Ipv4Addr>,

    #[serde(default)]
    pub metric: u8,

    #[serde(default)]
    pub passive: bool,

    #[serde(default = "default_true")]
    pub accept_v1: bool,

    #[serde(default = "default_true")]
    pub accept_v2: bool,

    #[serde(default = "default_rip_out")]
    pub rip_out: RipOut,

    #[serde(default)]
    pub password: Option<String>,

    /// Advertise a default route with this metric
    #[serde(default)]
    pub default_metric: Option<u8>,

    #[serde(default = "default_true")]
    pub rdisc_advertise: bool,

    #[serde(default = "default_true")]
    pub rdisc_solicit: bool,

    #[serde(default)]
    pub rdisc_preference: i32,

    #[serde(default = "default_rdisc_interval")]
    pub rdisc_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticRouteConfig {
    /// Destination with prefix length, e.g. "10.0.0.0/8"
    pub destination: String,
    pub gateway: Ipv4Addr,
    #[serde(default = "default_static_metric")]
    pub metric: u8,
    #[serde(default = "default_static_kind")]
    pub kind: StaticKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalNetConfig {
    pub destination: String,
    #[serde(default = "default_static_metric")]
    pub metric: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log to file
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_status_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_kernel_priority() -> u32 {
    20
}
fn default_supply() -> u64 {
    30
}
fn default_stale() -> u64 {
    90
}
fn default_expire() -> u64 {
    180
}
fn default_garbage() -> u64 {
    240
}
fn default_hold_down() -> u64 {
    60
}
fn default_flash_min() -> u64 {
    2
}
fn default_flash_max() -> u64 {
    5
}
fn default_kernel_poll() -> u64 {
    10
}
fn default_slots() -> usize {
    32
}
fn default_expansion_limit() -> usize {
    DEF_EXPANSION_LIMIT
}
fn default_rip_out() -> RipOut {
    RipOut::V2
}
fn default_rdisc_interval() -> u64 {
    DEF_MAX_ADVERTISE_INTERVAL.as_secs()
}
fn default_static_metric() -> u8 {
    1
}
fn default_static_kind() -> StaticKind {
    StaticKind::Passive
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}
fn default_status_port() -> u16 {
    8520
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            supplier: None,
            rip: default_true(),
            kernel: default_true(),
            kernel_priority: default_kernel_priority(),
            ridhosts: false,
        }
    }
}

impl Default for TimersConfig {
    fn default() -> Self {
        TimersConfig {
            supply_seconds: default_supply(),
            stale_seconds: default_stale(),
            expire_seconds: default_expire(),
            garbage_seconds: default_garbage(),
            hold_down_seconds: default_hold_down(),
            flash_min_seconds: default_flash_min(),
            flash_max_seconds: default_flash_max(),
            kernel_poll_seconds: default_kernel_poll(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        AggregationConfig {
            enabled: default_true(),
            supernets: default_true(),
            slots: default_slots(),
            expansion_limit: default_expansion_limit(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        StatusConfig {
            enabled: default_true(),
            bind_address: default_bind_address(),
            port: default_status_port(),
        }
    }
}

impl TimersConfig {
    fn to_timers(&self) -> anyhow::Result<Timers> {
        let secs = Duration::from_secs;
        let timers = Timers {
            supply: secs(self.supply_seconds),
            stale: secs(self.stale_seconds),
            expire: secs(self.expire_seconds),
            garbage: secs(self.garbage_seconds),
            hold_down: secs(self.hold_down_seconds),
            flash_min: secs(self.flash_min_seconds),
            flash_max: secs(self.flash_max_seconds),
            kernel_poll: secs(self.kernel_poll_seconds),
        };
        if timers.supply.is_zero() || timers.kernel_poll.is_zero() {
            bail!("supply and kernel poll intervals must be positive");
        }
        if !(timers.stale < timers.expire && timers.expire < timers.garbage) {
            bail!("timers must satisfy stale < expire < garbage");
        }
        if timers.flash_min > timers.flash_max {
            bail!("flash_min_seconds exceeds flash_max_seconds");
        }
        Ok(timers)
    }
}

impl InterfaceConfig {
    fn to_interface(&self, advertise_default: bool) -> anyhow::Result<Interface> {
        let (addr, len) =
            parse_prefix(&self.address).with_context(|| format!("interface {}", self.name))?;
        if self.metric >= HOPCNT_INFINITY {
            bail!("interface {}: metric {} is unreachable", self.name, self.metric);
        }
        let mut ifc = Interface::new(&self.name, addr, len);
        ifc.dst = self.peer;
        ifc.metric = self.metric;
        ifc.passive = self.passive;
        ifc.accept_v1 = self.accept_v1;
        ifc.accept_v2 = self.accept_v2;
        ifc.rip_out = if self.passive { RipOut::Off } else { self.rip_out };
        ifc.password = self.password.clone();
        ifc.default_metric = self
            .default_metric
            .or(advertise_default.then_some(1))
            .map(|m| m.min(HOPCNT_INFINITY - 1));

        let interval = Duration::from_secs(self.rdisc_interval_seconds);
        if interval < MIN_MAX_ADVERTISE_INTERVAL || interval > MAX_MAX_ADVERTISE_INTERVAL {
            bail!(
                "interface {}: rdisc interval {}s out of range",
                self.name,
                self.rdisc_interval_seconds
            );
        }
        ifc.rdisc.advertise = self.rdisc_advertise;
        ifc.rdisc.solicit = self.rdisc_solicit;
        ifc.rdisc.preference = self.rdisc_preference;
        ifc.rdisc.max_interval = interval;
        Ok(ifc)
    }
}

/// Merged configuration from all sources
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: Level,
    pub log_file: Option<PathBuf>,
    /// None lets the daemon decide from its interfaces
    pub supplier: Option<bool>,
    pub kernel: bool,
    pub kernel_priority: u32,
    pub options: RipOptions,
    pub timers: Timers,
    pub slots: usize,
    pub interfaces: Vec<Interface>,
    pub static_routes: Vec<StaticRoute>,
    pub internal_nets: Vec<InternalNet>,
    pub status: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: Level::INFO,
            log_file: None,
            supplier: None,
            kernel: true,
            kernel_priority: default_kernel_priority(),
            options: RipOptions::default(),
            timers: Timers::default(),
            slots: default_slots(),
            interfaces: Vec::new(),
            static_routes: Vec::new(),
            internal_nets: Vec::new(),
            status: None,
        }
    }
}

impl Config {
    /// Load configuration from all sources (CLI args, config file, defaults)
    /// Priority: CLI args > Config file > Environment variables > Defaults
    pub fn load() -> anyhow::Result<Self> {
        let cli_args = CliArgs::parse();

        // Load config file if specified
        let config_file = if let Some(config_path) = &cli_args.config {
            read_config_file(config_path)?
        } else {
            // Try loading from default locations
            let default_paths = vec![PathBuf::from("config.toml"), PathBuf::from("ripd.toml")];

            let mut loaded_config = None;
            for path in default_paths {
                if path.exists() {
                    loaded_config = Some(read_config_file(&path)?);
                    break;
                }
            }

            loaded_config.unwrap_or_default()
        };

        Config::merge(cli_args, config_file)
    }

    /// Combine parsed CLI arguments with a config file
    pub fn merge(cli_args: CliArgs, config_file: ConfigFile) -> anyhow::Result<Self> {
        let level = cli_args
            .log_level
            .as_deref()
            .unwrap_or(&config_file.logging.level);
        let log_level = parse_log_level(level)?;
        let log_file = cli_args.log_file.or(config_file.logging.file);

        let supplier = if cli_args.supplier {
            Some(true)
        } else if cli_args.quiet {
            Some(false)
        } else {
            config_file.daemon.supplier
        };

        let agg = &config_file.aggregation;
        if agg.slots == 0 {
            bail!("aggregation needs at least one slot");
        }
        let options = RipOptions {
            rip_on: config_file.daemon.rip,
            supplier: supplier.unwrap_or(false),
            ridhosts: cli_args.ridhosts || config_file.daemon.ridhosts,
            aggregate: agg.enabled,
            supernets: agg.enabled && agg.supernets,
            expansion_limit: agg.expansion_limit,
            stopping: false,
        };

        let mut interfaces = Vec::with_capacity(config_file.interfaces.len());
        for section in &config_file.interfaces {
            if interfaces.iter().any(|i: &Interface| i.name == section.name) {
                bail!("interface {} configured twice", section.name);
            }
            interfaces.push(section.to_interface(cli_args.advertise_default)?);
        }

        let mut static_routes = Vec::with_capacity(config_file.static_routes.len());
        for section in &config_file.static_routes {
            if section.metric >= HOPCNT_INFINITY {
                bail!("static route {}: metric {} is unreachable", section.destination, section.metric);
            }
            static_routes.push(StaticRoute {
                prefix: parse_network(&section.destination)?,
                gate: section.gateway,
                metric: section.metric,
                kind: section.kind,
            });
        }

        let internal_nets = config_file
            .internal_nets
            .iter()
            .map(|section| {
                Ok(InternalNet {
                    prefix: parse_network(&section.destination)?,
                    metric: section.metric.min(HOPCNT_INFINITY - 1),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let status = if config_file.status.enabled || cli_args.status_port.is_some() {
            let port = cli_args.status_port.unwrap_or(config_file.status.port);
            let ip: std::net::IpAddr = config_file
                .status
                .bind_address
                .parse()
                .with_context(|| format!("bad status bind address {}", config_file.status.bind_address))?;
            Some(SocketAddr::new(ip, port))
        } else {
            None
        };

        Ok(Config {
            log_level,
            log_file,
            supplier,
            kernel: !cli_args.no_kernel && config_file.daemon.kernel,
            kernel_priority: config_file.daemon.kernel_priority,
            options,
            timers: config_file.timers.to_timers()?,
            slots: agg.slots,
            interfaces,
            static_routes,
            internal_nets,
            status,
        })
    }
}

fn read_config_file(path: &Path) -> anyhow::Result<ConfigFile> {
    tracing::info!("Loading configuration from: {}", path.display());
    let config_content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = toml::from_str::<ConfigFile>(&config_content)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(config)
}

/// Split "a.b.c.d/len"; a bare address is a host
fn parse_prefix(s: &str) -> anyhow::Result<(Ipv4Addr, u8)> {
    let (addr, len) = match s.split_once('/') {
        Some((addr, len)) => (addr, len.parse::<u8>().map_err(|_| anyhow!("bad prefix length in {}", s))?),
        None => (s, 32),
    };
    if len > 32 {
        bail!("bad prefix length in {}", s);
    }
    let addr = addr.parse().map_err(|_| anyhow!("bad address in {}", s))?;
    Ok((addr, len))
}

/// A destination network; host bits must be clear
fn parse_network(s: &str) -> anyhow::Result<Prefix> {
    let (addr, len) = parse_prefix(s)?;
    let mask = prefix_to_mask(len);
    let dst = u32::from(addr);
    if dst & !mask != 0 {
        bail!("{} has host bits set", s);
    }
    Ok(Prefix::new(dst, mask))
}

fn parse_log_level(level_str: &str) -> anyhow::Result<Level> {
    match level_str.to_lowercase().as_str() {
        "error" => Ok(Level::ERROR),
        "warn" => Ok(Level::WARN),
        "info" => Ok(Level::INFO),
        "debug" => Ok(Level::DEBUG),
        "trace" => Ok(Level::TRACE),
        _ => Err(anyhow::anyhow!("Invalid log level: {}", level_str)),
    }
}
