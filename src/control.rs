//! The D-Bus control-plane surface: `GetItems`, `Publish`, `Unpublish`, and
//! the observable properties/signals a local client can subscribe to.

use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use zbus::dbus_interface;
use zbus::zvariant::Fd;

use crate::buildcfg::{FALLBACK_MAX_AGE, FALLBACK_SHARE_LIMIT};
use crate::daemon::{Daemon, Status};
use crate::error::PassimError;
use crate::store::ItemFlags;

pub const WELL_KNOWN_NAME: &str = "org.freedesktop.passim";
pub const OBJECT_PATH: &str = "/org/freedesktop/passim";

/// Wire record returned by `GetItems`, matching spec.md §4.5's named-field
/// dictionary.
#[derive(Clone, Debug, Serialize, Deserialize, zbus::zvariant::Type)]
pub struct ItemRecord {
    pub filename: String,
    pub cmdline: String,
    pub hash: String,
    #[zvariant(rename = "max-age")]
    pub max_age: u32,
    pub flags: String,
    #[zvariant(rename = "share-limit")]
    pub share_limit: u32,
    #[zvariant(rename = "share-count")]
    pub share_count: u32,
    pub size: u64,
}

/// Publish attributes, the same dictionary shape accepted by `Publish`.
#[derive(Clone, Debug, Serialize, Deserialize, zbus::zvariant::Type)]
pub struct PublishAttrs {
    pub filename: String,
    #[zvariant(rename = "max-age")]
    pub max_age: Option<u32>,
    #[zvariant(rename = "share-limit")]
    pub share_limit: Option<u32>,
    #[zvariant(rename = "next-reboot")]
    pub next_reboot: Option<bool>,
}

pub struct ControlPlane {
    daemon: Arc<Daemon>,
}

impl ControlPlane {
    pub fn new(daemon: Arc<Daemon>) -> Self {
        Self { daemon }
    }
}

fn map_error(err: PassimError) -> zbus::fdo::Error {
    match err {
        PassimError::PermissionDenied(msg) => zbus::fdo::Error::AccessDenied(msg),
        PassimError::NotFound(msg) => zbus::fdo::Error::FileNotFound(msg),
        PassimError::AlreadyExists(msg) => zbus::fdo::Error::FileExists(msg),
        PassimError::QuotaExceeded(msg) => zbus::fdo::Error::LimitsExceeded(msg),
        PassimError::Validation(msg) => zbus::fdo::Error::InvalidArgs(msg),
        PassimError::Upstream(msg) => zbus::fdo::Error::Failed(msg),
        PassimError::Io(err) => zbus::fdo::Error::IOError(err.to_string()),
    }
}

#[dbus_interface(name = "org.freedesktop.passim")]
impl ControlPlane {
    async fn get_items(&self) -> Vec<ItemRecord> {
        let store = self.daemon.store.lock().await;
        store
            .live_items()
            .map(|item| ItemRecord {
                filename: item.basename.clone(),
                cmdline: item.cmdline.clone(),
                hash: item.hash.clone(),
                max_age: item.max_age,
                flags: item.flags.to_wire_string(),
                share_limit: item.share_limit,
                share_count: item.share_count,
                size: item.size,
            })
            .collect()
    }

    async fn publish(
        &self,
        #[zbus(header)] header: zbus::MessageHeader<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
        fd: Fd<'_>,
        attrs: PublishAttrs,
    ) -> zbus::fdo::Result<()> {
        verify_caller_is_root(&header, connection)
            .await
            .map_err(map_error)?;

        let pid = caller_pid(&header, connection).await.map_err(map_error)?;
        let cmdline = crate::tools::cmdline_for_pid(pid).unwrap_or_default();

        let raw_fd: RawFd = fd.as_raw_fd();
        let file = unsafe { std::fs::File::from_raw_fd(raw_fd) };
        let mut file = tokio::fs::File::from_std(file);

        let max_item_size = self.daemon.config.max_item_size;
        let mut bytes = Vec::new();
        let mut limited = (&mut file).take(max_item_size + 1);
        limited
            .read_to_end(&mut bytes)
            .await
            .map_err(|err| map_error(PassimError::Io(err)))?;

        if bytes.len() as u64 > max_item_size {
            return Err(map_error(PassimError::QuotaExceeded(format!(
                "item exceeds the configured {} byte limit",
                max_item_size
            ))));
        }

        let max_age = attrs.max_age.unwrap_or(FALLBACK_MAX_AGE);
        let share_limit = attrs.share_limit.unwrap_or(FALLBACK_SHARE_LIMIT);
        let mut flags = ItemFlags::empty();
        if attrs.next_reboot.unwrap_or(false) {
            flags.insert(ItemFlags::NEXT_REBOOT | ItemFlags::DISABLED);
        }

        {
            let mut store = self.daemon.store.lock().await;
            store
                .add(&bytes, &attrs.filename, max_age, share_limit, 0, flags, &cmdline)
                .map_err(map_error)?;
        }

        self.daemon.reregister().await;
        self.changed().await;

        Ok(())
    }

    async fn unpublish(
        &self,
        #[zbus(header)] header: zbus::MessageHeader<'_>,
        #[zbus(connection)] connection: &zbus::Connection,
        hash: String,
    ) -> zbus::fdo::Result<()> {
        verify_caller_is_root(&header, connection)
            .await
            .map_err(map_error)?;

        {
            let mut store = self.daemon.store.lock().await;
            store.remove(&hash).map_err(map_error)?;
        }

        self.daemon.reregister().await;
        self.changed().await;

        Ok(())
    }

    #[dbus_interface(signal)]
    async fn changed(&self) -> zbus::Result<()>;

    #[dbus_interface(property)]
    async fn daemon_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    #[dbus_interface(property)]
    async fn name(&self) -> String {
        self.daemon.instance_name.clone()
    }

    #[dbus_interface(property)]
    async fn uri(&self) -> String {
        format!("https://localhost:{}", self.daemon.config.port)
    }

    #[dbus_interface(property)]
    async fn status(&self) -> String {
        match *self.daemon.status.lock().await {
            Status::Starting => "STARTING".to_string(),
            Status::Loading => "LOADING".to_string(),
            Status::Running => "RUNNING".to_string(),
            Status::DisabledMetered => "DISABLED_METERED".to_string(),
        }
    }

    #[dbus_interface(property)]
    async fn download_saving(&self) -> u64 {
        self.daemon
            .download_saving
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    #[dbus_interface(property)]
    async fn carbon_saving(&self) -> f64 {
        self.daemon.carbon_saving()
    }
}

async fn caller_pid(
    header: &zbus::MessageHeader<'_>,
    connection: &zbus::Connection,
) -> crate::error::Result<u32> {
    let sender = header
        .sender()
        .ok()
        .flatten()
        .ok_or_else(|| PassimError::PermissionDenied("anonymous caller".into()))?;

    let proxy = zbus::fdo::DBusProxy::new(connection)
        .await
        .map_err(|err| PassimError::Upstream(err.to_string()))?;
    proxy
        .get_connection_unix_process_id(sender)
        .await
        .map_err(|err| PassimError::Upstream(err.to_string()))
}

async fn verify_caller_is_root(
    header: &zbus::MessageHeader<'_>,
    connection: &zbus::Connection,
) -> crate::error::Result<()> {
    let pid = caller_pid(header, connection).await?;
    let uid = crate::tools::uid_for_pid(pid)
        .map_err(|err| PassimError::Upstream(format!("could not resolve caller uid: {}", err)))?;
    if uid != 0 {
        return Err(PassimError::PermissionDenied(format!(
            "caller uid {} is not root",
            uid
        )));
    }
    Ok(())
}

const NM_SERVICE: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";

/// Queried by the Discovery Client before every `register` call. Reads
/// NetworkManager's `Metered` property over the system bus; defaults to
/// "not metered" if NetworkManager is absent.
pub async fn network_is_metered() -> Option<bool> {
    let connection = zbus::Connection::system().await.ok()?;
    let nm = zbus::Proxy::new(&connection, NM_SERVICE, NM_PATH, NM_SERVICE)
        .await
        .ok()?;
    let metered: u32 = nm.get_property("Metered").await.ok()?;
    Some(metered_value_is_metered(metered))
}

/// NMMetered: 0=unknown, 1=yes, 2=no, 3=guess-yes, 4=guess-no.
fn metered_value_is_metered(value: u32) -> bool {
    matches!(value, 1 | 3)
}

/// Runs for the life of the daemon: subscribes to NetworkManager's
/// `PropertiesChanged` signal and re-runs registration whenever the
/// `Metered` property flips (spec.md §5's "listener on network-condition
/// changes"). Exits quietly if NetworkManager isn't present on the bus —
/// registration still re-checks the property lazily on every other trigger.
pub async fn watch_metered_changes(daemon: Arc<Daemon>) {
    if let Err(err) = watch_metered_changes_inner(daemon).await {
        log::debug!("metered-network watch stopped: {}", err);
    }
}

async fn watch_metered_changes_inner(daemon: Arc<Daemon>) -> zbus::Result<()> {
    use futures::StreamExt;

    let connection = zbus::Connection::system().await?;
    let props = zbus::fdo::PropertiesProxy::builder(&connection)
        .destination(NM_SERVICE)?
        .path(NM_PATH)?
        .build()
        .await?;

    let mut changes = props.receive_properties_changed().await?;

    while let Some(signal) = changes.next().await {
        let args = match signal.args() {
            Ok(args) => args,
            Err(_) => continue,
        };
        if args.interface_name() != NM_SERVICE {
            continue;
        }
        if args.changed_properties().contains_key("Metered") {
            log::info!("network metered property changed, re-running registration");
            daemon.reregister().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_validation_error_to_invalid_args() {
        let err = map_error(PassimError::Validation("bad".into()));
        assert!(matches!(err, zbus::fdo::Error::InvalidArgs(_)));
    }

    #[test]
    fn maps_permission_denied_to_access_denied() {
        let err = map_error(PassimError::PermissionDenied("no".into()));
        assert!(matches!(err, zbus::fdo::Error::AccessDenied(_)));
    }

    #[test]
    fn nm_metered_values_match_yes_and_guess_yes() {
        assert!(!metered_value_is_metered(0));
        assert!(metered_value_is_metered(1));
        assert!(!metered_value_is_metered(2));
        assert!(metered_value_is_metered(3));
        assert!(!metered_value_is_metered(4));
    }
}
