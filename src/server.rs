//! Wires the Content Store, Discovery Client, HTTPS acceptor, and periodic
//! timers into the single cooperative event loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use tokio::net::TcpListener;
use tokio_openssl::SslStream;

use crate::config::DaemonConfig;
use crate::daemon::{Daemon, Status};
use crate::discovery::DiscoveryBackend;
use crate::store::ContentStore;

/// Sweep runs at roughly this cadence (spec.md §5).
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Debounce window for contributed-directory change events.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

pub struct ServerOptions {
    pub config: DaemonConfig,
    pub key_path: std::path::PathBuf,
    pub cert_path: std::path::PathBuf,
    pub contrib_dir: std::path::PathBuf,
    /// If set, the event loop exits after this long. Test use only.
    pub timed_exit: Option<Duration>,
}

fn build_acceptor(key_path: &std::path::Path, cert_path: &std::path::Path) -> anyhow::Result<SslAcceptor> {
    crate::tools::cert::ensure_self_signed(key_path, cert_path)?;

    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
    builder.set_private_key_file(key_path, SslFiletype::PEM)?;
    builder.set_certificate_chain_file(cert_path)?;
    builder.check_private_key()?;
    Ok(builder.build())
}

/// Run the daemon's event loop to completion. Returns once the interrupt
/// signal fires, `--timed-exit` elapses, or the HTTPS listener fails.
pub async fn run(discovery: Arc<dyn DiscoveryBackend>, options: ServerOptions) -> anyhow::Result<()> {
    let mut store = ContentStore::new(options.config.data_dir.clone());
    store.scan_owned()?;
    let contributed = crate::config::scan_contributed_dir(&options.contrib_dir);
    store.scan_contributed(&contributed)?;

    let daemon = Arc::new(Daemon::new(store, discovery, options.config.clone()));
    daemon.set_status(Status::Loading).await;

    let acceptor = build_acceptor(&options.key_path, &options.cert_path)?;
    let bind_addr: SocketAddr = ([0, 0, 0, 0], daemon.config.port).into();
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|err| anyhow::format_err!("failed to bind HTTPS port {}: {}", daemon.config.port, err))?;

    log::info!("passim listening on {} as {}", bind_addr, daemon.instance_name);

    daemon.reregister().await;

    let control_daemon = daemon.clone();
    let mut control_task = tokio::spawn(async move {
        if let Err(err) = run_control_plane(control_daemon).await {
            log::error!("control plane terminated: {}", err);
        }
    });

    let sweep_daemon = daemon.clone();
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let evicted = {
                let mut store = sweep_daemon.store.lock().await;
                store.sweep()
            };
            if !evicted.is_empty() {
                log::info!("sweep evicted {} expired item(s)", evicted.len());
                sweep_daemon.reregister().await;
            }
        }
    });

    let watch_daemon = daemon.clone();
    let contrib_dir = options.contrib_dir.clone();
    let watch_task = tokio::spawn(async move {
        if let Err(err) = watch_contributed_dir(watch_daemon, contrib_dir).await {
            log::warn!("contributed-directory watcher stopped: {}", err);
        }
    });

    let metered_daemon = daemon.clone();
    let metered_task = tokio::spawn(crate::control::watch_metered_changes(metered_daemon));

    let accept_daemon = daemon.clone();
    let accept_task = tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    continue;
                }
            };

            let ssl = match openssl::ssl::Ssl::new(&acceptor) {
                Ok(ssl) => ssl,
                Err(err) => {
                    log::warn!("TLS setup failed for {}: {}", peer, err);
                    continue;
                }
            };

            let daemon = accept_daemon.clone();
            tokio::spawn(async move {
                let mut tls = match SslStream::new(ssl, stream) {
                    Ok(tls) => tls,
                    Err(err) => {
                        log::warn!("TLS wrap failed for {}: {}", peer, err);
                        return;
                    }
                };
                if let Err(err) = std::pin::Pin::new(&mut tls).accept().await {
                    log::debug!("TLS handshake failed for {}: {}", peer, err);
                    return;
                }

                let service = hyper::service::service_fn(move |req| {
                    let daemon = daemon.clone();
                    async move { Ok::<_, std::convert::Infallible>(crate::request::handle(daemon, req, peer.ip()).await) }
                });

                let conn = hyper::server::conn::Http::new()
                    .serve_connection(tls, service);
                if let Err(err) = conn.await {
                    log::debug!("connection with {} ended: {}", peer, err);
                }
            });
        }
    });

    let shutdown = async {
        match options.timed_exit {
            Some(duration) => tokio::time::sleep(duration).await,
            None => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    };

    // Losing the control-plane well-known name to another owner is fatal
    // (spec.md §7): if `control_task` finishes on its own, that is always
    // this case, since otherwise it runs forever.
    tokio::select! {
        _ = shutdown => log::info!("shutting down"),
        _ = &mut control_task => log::error!("control plane lost its well-known name, shutting down"),
    }

    accept_task.abort();
    sweep_task.abort();
    watch_task.abort();
    metered_task.abort();
    control_task.abort();

    daemon.discovery.unregister(&daemon.instance_name).await;

    Ok(())
}

async fn run_control_plane(daemon: Arc<Daemon>) -> anyhow::Result<()> {
    use futures::StreamExt;

    let control = crate::control::ControlPlane::new(daemon.clone());
    let connection = zbus::ConnectionBuilder::system()?
        .name(crate::control::WELL_KNOWN_NAME)?
        .serve_at(crate::control::OBJECT_PATH, control)?
        .build()
        .await?;

    let iface_ref = connection
        .object_server()
        .interface::<_, crate::control::ControlPlane>(crate::control::OBJECT_PATH)
        .await?;
    daemon.set_control_iface(iface_ref);

    // Losing the well-known name to another owner is fatal per spec.md §7.
    let dbus_proxy = zbus::fdo::DBusProxy::new(&connection).await?;
    let mut name_lost = dbus_proxy.receive_name_lost().await?;

    while let Some(signal) = name_lost.next().await {
        let args = signal.args()?;
        if args.name.as_str() == crate::control::WELL_KNOWN_NAME {
            anyhow::bail!("lost the {} well-known name to another owner", crate::control::WELL_KNOWN_NAME);
        }
    }

    Ok(())
}

async fn watch_contributed_dir(daemon: Arc<Daemon>, dir: std::path::PathBuf) -> anyhow::Result<()> {
    use notify::{RecursiveMode, Watcher};

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    loop {
        // Block on the first event, then drain anything else that arrives
        // within the debounce window before acting on a single rescan.
        let first = rx.recv().await;
        if first.is_none() {
            return Ok(());
        }
        tokio::time::sleep(WATCH_DEBOUNCE).await;
        while rx.try_recv().is_ok() {}

        let contributed = crate::config::scan_contributed_dir(&dir);
        {
            let mut store = daemon.store.lock().await;
            if let Err(err) = store.scan_contributed(&contributed) {
                log::warn!("rescan of {:?} failed: {}", dir, err);
                continue;
            }
        }
        daemon.reregister().await;
    }
}
