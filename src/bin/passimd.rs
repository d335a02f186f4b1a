//! The passim daemon: binds the HTTPS server, registers with the local
//! mDNS responder, and exports the D-Bus control-plane object.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use passim::config::DaemonConfig;
use passim::configdir;
use passim::discovery::MdnsBackend;
use passim::server::{self, ServerOptions};

#[derive(Parser)]
#[clap(name = "passimd", about = "Share cacheable files between machines on the same LAN")]
struct Args {
    /// Path to passim.conf, overriding the compiled-in default.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Quit automatically after this many seconds. Test use only.
    #[clap(long)]
    timed_exit: Option<u64>,
}

/// Enumerate non-loopback local interface addresses. IPv6 addresses are
/// included only when `passim.conf`'s `IPv6` key is set (spec.md §6): by
/// default passim advertises over IPv4 only.
fn local_addrs(ipv6: bool) -> Vec<std::net::IpAddr> {
    // A daemon with no route to the LAN still has to start; fall back to
    // an empty address list and let mdns-sd's own interface enumeration
    // supply the rest.
    if_addrs::get_if_addrs()
        .map(|ifaces| {
            ifaces
                .into_iter()
                .filter(|iface| !iface.is_loopback())
                .map(|iface| iface.ip())
                .filter(|addr| ipv6 || addr.is_ipv4())
                .collect()
        })
        .unwrap_or_default()
}

/// Log to syslog under `LOG_DAEMON`, the natural home for a system service;
/// fall back to `env_logger` on stderr when no syslog socket is reachable
/// (e.g. under a test sandbox with no `/dev/log`).
fn init_logging() {
    use syslog::{BasicLogger, Facility, Formatter3164};

    let formatter = Formatter3164 {
        facility: Facility::LOG_DAEMON,
        hostname: None,
        process: "passimd".into(),
        pid: std::process::id(),
    };

    match syslog::unix(formatter) {
        Ok(logger) => {
            let _ = log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
                .map(|()| log::set_max_level(log::LevelFilter::Info));
        }
        Err(_) => env_logger::init(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let args = Args::parse();

    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(configdir!("/passim.conf")));
    let config = DaemonConfig::load(&config_path)?;

    let discovery: Arc<dyn passim::discovery::DiscoveryBackend> =
        Arc::new(MdnsBackend::new(local_addrs(config.ipv6))?);

    let options = ServerOptions {
        config,
        key_path: passim::tools::cert::default_key_path(),
        cert_path: passim::tools::cert::default_cert_path(),
        contrib_dir: passim::config::default_contrib_dir(),
        timed_exit: args.timed_exit.map(Duration::from_secs),
    };

    server::run(discovery, options).await
}
