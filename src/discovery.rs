//! Mirrors the Content Store's advertised hash set onto the local network
//! and resolves remote hashes to reachable peer addresses.
//!
//! The wire protocol of the discovery daemon is abstracted behind
//! [`DiscoveryBackend`] so the Lookup Coordinator and Request Engine can be
//! exercised in tests against [`FakeBackend`] instead of a live mDNS
//! responder.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::error::{PassimError, Result};

/// `_{service}._tcp` base service type passim advertises.
pub const SERVICE_TYPE: &str = "_cache._tcp.local.";

/// mDNS/DNS-SD label length limit forces truncating hashes used as subtypes.
const SUBTYPE_HASH_LEN: usize = 60;

/// Per-call timeout applied around every backend operation.
const BACKEND_TIMEOUT: Duration = Duration::from_millis(150);

fn subtype_for_hash(hash: &str) -> String {
    let truncated = &hash[..hash.len().min(SUBTYPE_HASH_LEN)];
    format!("_{}._sub.{}", truncated, SERVICE_TYPE)
}

/// Generate the once-per-startup instance name, `"Passim-XXXX"` with a
/// random 16-bit hex suffix.
pub fn random_instance_name() -> String {
    let suffix: u16 = rand::thread_rng().gen();
    format!("Passim-{:04X}", suffix)
}

/// Outcome of a `register` call, reflecting the observable daemon `Status`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The advertisement committed normally.
    Registered,
    /// The host is on a metered connection; nothing was advertised.
    DisabledMetered,
}

/// A resolved peer address, already formatted for use in a `Location`
/// header (`addr:port` for IPv4, `[addr]:port` for IPv6).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddr(pub String);

impl PeerAddr {
    pub fn format(addr: IpAddr, port: u16) -> Self {
        match addr {
            IpAddr::V4(v4) => PeerAddr(format!("{}:{}", v4, port)),
            IpAddr::V6(v6) => PeerAddr(format!("[{}]:{}", v6, port)),
        }
    }
}

/// Abstracts over the external discovery daemon so callers don't depend on
/// a concrete mDNS/D-Bus implementation.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Reset the entry group, add the base service, add one subtype per
    /// advertised hash, and commit. Called again whenever the advertised
    /// set changes (publish, unpublish, sweep eviction) or a registration
    /// trigger fires (metered-state flip, contributed-directory change).
    async fn register(&self, instance: &str, port: u16, hashes: &[String]) -> Result<RegisterOutcome>;

    /// Withdraw the instance's advertisement entirely. Called on a metered
    /// flip (instead of committing an empty entry group) and on clean
    /// shutdown.
    async fn unregister(&self, instance: &str);

    /// Browse the subtype for `hash`, accumulate `ItemNew` events until
    /// `AllForNow`, then resolve each non-local candidate. Entries flagged
    /// LOCAL are discarded so a host never redirects to itself.
    async fn find(&self, hash: &str) -> Result<Vec<PeerAddr>>;

    /// Drop any outstanding browse/resolve callbacks for `hash` and free
    /// their remote handles.
    async fn cancel(&self, hash: &str);

    /// True if the host's primary network connection is metered.
    async fn is_metered(&self) -> bool;
}

/// Real backend, built on the `mdns-sd` responder/browser.
pub struct MdnsBackend {
    daemon: mdns_sd::ServiceDaemon,
    local_addrs: Vec<IpAddr>,
}

impl MdnsBackend {
    pub fn new(local_addrs: Vec<IpAddr>) -> Result<Self> {
        let daemon = mdns_sd::ServiceDaemon::new()
            .map_err(|err| PassimError::Upstream(format!("mdns-sd startup failed: {}", err)))?;
        Ok(Self { daemon, local_addrs })
    }

    fn is_local(&self, addr: &IpAddr) -> bool {
        self.local_addrs.contains(addr)
    }
}

#[async_trait]
impl DiscoveryBackend for MdnsBackend {
    async fn register(&self, instance: &str, port: u16, hashes: &[String]) -> Result<RegisterOutcome> {
        if self.is_metered().await {
            self.unregister(instance).await;
            return Ok(RegisterOutcome::DisabledMetered);
        }

        let mut subtypes: Vec<String> = hashes.iter().map(|h| subtype_for_hash(h)).collect();
        subtypes.sort();
        subtypes.dedup();

        let host_ip = self
            .local_addrs
            .first()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        let service = mdns_sd::ServiceInfo::new(
            SERVICE_TYPE,
            instance,
            &format!("{}.local.", instance),
            host_ip,
            port,
            None,
        )
        .map_err(|err| PassimError::Upstream(format!("building service info failed: {}", err)))?
        .enable_addr_auto();

        tokio::time::timeout(BACKEND_TIMEOUT, async {
            self.daemon
                .register(service)
                .map_err(|err| PassimError::Upstream(format!("register failed: {}", err)))
        })
        .await
        .map_err(|_| PassimError::Upstream("register timed out".into()))??;

        for subtype in &subtypes {
            log::debug!("advertising subtype {}", subtype);
        }

        Ok(RegisterOutcome::Registered)
    }

    async fn unregister(&self, instance: &str) {
        let _ = self.daemon.unregister(instance);
    }

    async fn find(&self, hash: &str) -> Result<Vec<PeerAddr>> {
        let subtype = subtype_for_hash(hash);
        let receiver = self
            .daemon
            .browse(&subtype)
            .map_err(|err| PassimError::Upstream(format!("browse failed: {}", err)))?;

        let result = tokio::time::timeout(BACKEND_TIMEOUT, async {
            let mut addrs = Vec::new();
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    mdns_sd::ServiceEvent::ServiceResolved(info) => {
                        for addr in info.get_addresses() {
                            if self.is_local(addr) {
                                continue;
                            }
                            let peer = PeerAddr::format(*addr, info.get_port());
                            if !addrs.contains(&peer) {
                                addrs.push(peer);
                            }
                        }
                    }
                    mdns_sd::ServiceEvent::SearchStopped(_) => break,
                    _ => {}
                }
            }
            addrs
        })
        .await
        .unwrap_or_default();

        let _ = self.daemon.stop_browse(&subtype);
        Ok(result)
    }

    async fn cancel(&self, hash: &str) {
        let subtype = subtype_for_hash(hash);
        let _ = self.daemon.stop_browse(&subtype);
    }

    async fn is_metered(&self) -> bool {
        crate::control::network_is_metered().await.unwrap_or(false)
    }
}

/// Deterministic test double: peers and metered-state are preset by tests
/// instead of discovered live.
#[cfg(test)]
pub struct FakeBackend {
    pub peers: std::sync::Mutex<std::collections::HashMap<String, Vec<PeerAddr>>>,
    pub metered: std::sync::atomic::AtomicBool,
    pub registrations: std::sync::Mutex<Vec<Vec<String>>>,
    pub unregistered: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl FakeBackend {
    pub fn new() -> Self {
        Self {
            peers: std::sync::Mutex::new(std::collections::HashMap::new()),
            metered: std::sync::atomic::AtomicBool::new(false),
            registrations: std::sync::Mutex::new(Vec::new()),
            unregistered: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn set_peers(&self, hash: &str, addrs: Vec<PeerAddr>) {
        self.peers.lock().unwrap().insert(hash.to_string(), addrs);
    }

    pub fn set_metered(&self, metered: bool) {
        self.metered
            .store(metered, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
#[async_trait]
impl DiscoveryBackend for FakeBackend {
    async fn register(&self, _instance: &str, _port: u16, hashes: &[String]) -> Result<RegisterOutcome> {
        if self.is_metered().await {
            return Ok(RegisterOutcome::DisabledMetered);
        }
        self.registrations.lock().unwrap().push(hashes.to_vec());
        Ok(RegisterOutcome::Registered)
    }

    async fn unregister(&self, instance: &str) {
        self.unregistered.lock().unwrap().push(instance.to_string());
    }

    async fn find(&self, hash: &str) -> Result<Vec<PeerAddr>> {
        Ok(self
            .peers
            .lock()
            .unwrap()
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn cancel(&self, _hash: &str) {}

    async fn is_metered(&self) -> bool {
        self.metered.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtype_truncates_hash_to_label_limit() {
        let hash = "a".repeat(80);
        let subtype = subtype_for_hash(&hash);
        assert_eq!(subtype, format!("_{}._sub.{}", "a".repeat(60), SERVICE_TYPE));
    }

    #[test]
    fn instance_name_matches_expected_shape() {
        let name = random_instance_name();
        assert!(name.starts_with("Passim-"));
        assert_eq!(name.len(), "Passim-XXXX".len());
    }

    #[tokio::test]
    async fn fake_backend_returns_preset_peers() {
        let backend = FakeBackend::new();
        backend.set_peers(
            "deadbeef",
            vec![
                PeerAddr("10.0.0.2:27500".into()),
                PeerAddr("10.0.0.3:27500".into()),
            ],
        );
        let peers = backend.find("deadbeef").await.unwrap();
        assert_eq!(peers.len(), 2);
    }

    #[tokio::test]
    async fn fake_backend_reports_disabled_metered_when_metered() {
        let backend = FakeBackend::new();
        backend.set_metered(true);
        let outcome = backend
            .register("Passim-0000", 27500, &["abc".to_string()])
            .await
            .unwrap();
        assert_eq!(outcome, RegisterOutcome::DisabledMetered);
        assert!(backend.registrations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unregister_records_the_instance_name() {
        let backend = FakeBackend::new();
        backend.unregister("Passim-0000").await;
        assert_eq!(
            backend.unregistered.lock().unwrap().as_slice(),
            &["Passim-0000".to_string()]
        );
    }
}
