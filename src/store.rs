//! The content store: owns the on-disk set of cached items, enforces the
//! per-item invariants, and projects the set of currently-serveable hashes.
//!
//! # Invariants
//!
//! 1. `hash` uniquely identifies an item within the store.
//! 2. The on-disk filename encodes `"{hash}-{basename}"`; `basename` never
//!    contains `/`.
//! 3. `share_count <= share_limit` while an item is visible for serving;
//!    crossing the bound evicts it immediately.
//! 4. `(now - ctime) <= max_age` for every item in the advertised set;
//!    violation evicts it.
//! 5. A `DISABLED` item is present in the store but absent from the
//!    advertised hash set.
//! 6. A `NEXT_REBOOT` item stays `DISABLED` until the recorded boot token
//!    differs from the current one (see the open question in DESIGN.md:
//!    the sense of this check is inverted from what the feature name
//!    suggests, and this implementation uses the corrected, intended sense).
//! 7. Package-contributed items carry the unlimited sentinel for both
//!    `max_age` and `share_limit`, and no `cmdline`.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::buildcfg::{FALLBACK_MAX_AGE, FALLBACK_SHARE_LIMIT, UNLIMITED};
use crate::error::{PassimError, Result};

bitflags! {
    /// Flags over `{DISABLED, NEXT_REBOOT}`.
    #[derive(Serialize, Deserialize, Default)]
    pub struct ItemFlags: u8 {
        const DISABLED = 0b0000_0001;
        const NEXT_REBOOT = 0b0000_0010;
    }
}

impl ItemFlags {
    /// Render as the comma-separated token list the control-plane wire
    /// record uses (e.g. `"disabled,next-reboot"`).
    pub fn to_wire_string(self) -> String {
        let mut parts = Vec::new();
        if self.contains(ItemFlags::DISABLED) {
            parts.push("disabled");
        }
        if self.contains(ItemFlags::NEXT_REBOOT) {
            parts.push("next-reboot");
        }
        parts.join(",")
    }
}

/// A single cached item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Item {
    /// Lowercase hex SHA-256 over the stored bytes. Primary key.
    pub hash: String,
    /// The name the publisher asked the file to be served under. Never
    /// contains `/`.
    pub basename: String,
    /// Byte length of the stored content.
    pub size: u64,
    /// Wall-clock creation time (UTC unix seconds), assigned at publication.
    pub ctime: u64,
    /// Upper bound on `(now - ctime)` in seconds. `UNLIMITED` never expires.
    pub max_age: u32,
    /// Upper bound on `share_count`. `UNLIMITED` means no limit.
    pub share_limit: u32,
    /// Number of successful outbound serves to non-loopback clients.
    pub share_count: u32,
    /// Basename of the publishing process's executable, for provenance.
    pub cmdline: String,
    /// Flags over `{DISABLED, NEXT_REBOOT}`.
    #[serde(skip)]
    pub flags: ItemFlags,
    /// Opaque boot-epoch token recorded at publish time, for NEXT_REBOOT.
    pub boot_token: Option<String>,
    /// Path to the backing bytes on disk.
    #[serde(skip)]
    pub storage_ref: PathBuf,
}

impl Item {
    fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.ctime)
    }

    /// True if this item may still be served: not disabled, within its age
    /// bound, and under its share limit.
    pub fn is_live(&self, now: u64) -> bool {
        if self.flags.contains(ItemFlags::DISABLED) {
            return false;
        }
        if self.max_age != UNLIMITED && self.age(now) > self.max_age as u64 {
            return false;
        }
        if self.share_limit != UNLIMITED && self.share_count >= self.share_limit {
            return false;
        }
        true
    }

    /// Resolve a NEXT_REBOOT item's DISABLED flag against the current boot
    /// token: activate (clear DISABLED) once the token has changed, i.e.
    /// once we really are on a later boot than the one at publish time.
    fn reconcile_next_reboot(&mut self, current_boot_token: &str) {
        if !self.flags.contains(ItemFlags::NEXT_REBOOT) {
            return;
        }
        if self.boot_token.as_deref() != Some(current_boot_token) {
            self.flags.remove(ItemFlags::DISABLED);
        }
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// A single contributed-directory reference: `Path=` lines collected from
/// `*.conf` files under `/etc/passim.d`.
pub struct ContributedPath {
    pub path: PathBuf,
}

pub struct ContentStore {
    data_dir: PathBuf,
    items: HashMap<String, Item>,
}

impl ContentStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            items: HashMap::new(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Validate a basename contains no path separator or control
    /// character (the latter would otherwise poison the `Content-Disposition`
    /// header built from it at serve time). A validation failure, not an
    /// I/O failure.
    fn validate_basename(basename: &str) -> Result<()> {
        if basename.contains('/') {
            return Err(PassimError::Validation(format!(
                "basename {:?} must not contain '/'",
                basename
            )));
        }
        if basename.chars().any(|c| c.is_control()) {
            return Err(PassimError::Validation(format!(
                "basename {:?} must not contain control characters",
                basename
            )));
        }
        Ok(())
    }

    fn file_name(hash: &str, basename: &str) -> String {
        format!("{}-{}", hash, basename)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        bytes: &[u8],
        basename: &str,
        max_age: u32,
        share_limit: u32,
        share_count: u32,
        flags: ItemFlags,
        cmdline: &str,
    ) -> Result<Item> {
        Self::validate_basename(basename)?;

        if share_limit != UNLIMITED && share_count >= share_limit {
            return Err(PassimError::Validation(format!(
                "share_count {} already at or above share_limit {}",
                share_count, share_limit
            )));
        }

        let hash = sha256_hex(bytes);
        if self.items.contains_key(&hash) {
            return Err(PassimError::AlreadyExists(hash));
        }

        let file_name = Self::file_name(&hash, basename);
        let path = self.data_dir.join(&file_name);

        let mode = Mode::from_bits_truncate(0o644);
        crate::tools::atomic_write(&path, bytes, mode)
            .map_err(|err| PassimError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())))?;

        let boot_token = if flags.contains(ItemFlags::NEXT_REBOOT) {
            crate::tools::boot_token().ok()
        } else {
            None
        };

        if let Err(err) = write_item_xattrs(&path, max_age, share_limit, cmdline, boot_token.as_deref())
        {
            log::warn!("failed to write extended attributes on {:?}: {}", path, err);
        }

        let item = Item {
            hash: hash.clone(),
            basename: basename.to_string(),
            size: bytes.len() as u64,
            ctime: now_unix(),
            max_age,
            share_limit,
            share_count,
            cmdline: cmdline.to_string(),
            flags,
            boot_token,
            storage_ref: path,
        };

        self.items.insert(hash, item.clone());
        self.sweep();
        Ok(item)
    }

    pub fn remove(&mut self, hash: &str) -> Result<()> {
        self.remove_raw(hash)?;
        self.sweep();
        Ok(())
    }

    fn remove_raw(&mut self, hash: &str) -> Result<()> {
        let item = self
            .items
            .remove(hash)
            .ok_or_else(|| PassimError::NotFound(hash.to_string()))?;
        if let Err(err) = std::fs::remove_file(&item.storage_ref) {
            if err.kind() != std::io::ErrorKind::NotFound {
                return Err(PassimError::Io(err));
            }
        }
        Ok(())
    }

    pub fn get(&self, hash: &str) -> Option<&Item> {
        self.items.get(hash)
    }

    /// Record a successful non-loopback serve, evicting the item if it has
    /// now reached its share limit.
    pub fn record_share(&mut self, hash: &str) -> Result<bool> {
        let evict = {
            let item = self
                .items
                .get_mut(hash)
                .ok_or_else(|| PassimError::NotFound(hash.to_string()))?;
            item.share_count += 1;
            item.share_limit != UNLIMITED && item.share_count >= item.share_limit
        };
        if evict {
            self.remove(hash)?;
        }
        Ok(evict)
    }

    /// List all items, including disabled/expired/over-share ones. Order
    /// is unspecified.
    pub fn list(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    /// List only items currently eligible to be served (see `Item::is_live`).
    /// Used wherever the visible item set must satisfy `ctime + max_age >
    /// now` regardless of how recently `sweep` last ran on a timer.
    pub fn live_items(&self) -> impl Iterator<Item = &Item> {
        let now = now_unix();
        self.items.values().filter(move |item| item.is_live(now))
    }

    /// The set of hashes currently eligible to be advertised: not disabled,
    /// within age and share bounds.
    pub fn advertised_hashes(&self) -> Vec<String> {
        let now = now_unix();
        self.items
            .values()
            .filter(|item| item.is_live(now))
            .map(|item| item.hash.clone())
            .collect()
    }

    /// Scan the owned data directory on startup. Filenames are split once
    /// on `-` into `{hash_component, basename}`; the hash is always
    /// recomputed from the bytes, never trusted from the filename.
    /// Symbolic links are refused.
    pub fn scan_owned(&mut self) -> Result<()> {
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(PassimError::Io(err)),
        };

        let current_boot = crate::tools::boot_token().ok();

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let path = entry.path();
            let file_name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            let (_hash_component, basename) = match file_name.split_once('-') {
                Some(parts) => parts,
                None => continue,
            };

            let file = match open_no_follow(&path) {
                Ok(f) => f,
                Err(err) => {
                    log::warn!("skipping {:?}: {}", path, err);
                    continue;
                }
            };

            let mut bytes = Vec::new();
            let mut file = file;
            if file.read_to_end(&mut bytes).is_err() {
                continue;
            }

            let hash = sha256_hex(&bytes);
            let (max_age, share_limit, cmdline, boot_token) = read_item_xattrs(&path);

            let mut flags = ItemFlags::empty();
            if boot_token.is_some() {
                flags.insert(ItemFlags::NEXT_REBOOT | ItemFlags::DISABLED);
            }

            let mut item = Item {
                hash: hash.clone(),
                basename: basename.to_string(),
                size: bytes.len() as u64,
                ctime: entry
                    .metadata()
                    .and_then(|m| m.created().or_else(|_| m.modified()))
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or_else(now_unix),
                max_age: max_age.unwrap_or(FALLBACK_MAX_AGE),
                share_limit: share_limit.unwrap_or(FALLBACK_SHARE_LIMIT),
                share_count: 0,
                cmdline: cmdline.unwrap_or_default(),
                flags,
                boot_token,
                storage_ref: path,
            };

            if let Some(ref token) = current_boot {
                item.reconcile_next_reboot(token);
            }

            self.items.insert(hash, item);
        }

        Ok(())
    }

    /// Enumerate paths named under `Path=` in `*.conf` files in the
    /// contributed directory and add every regular file found beneath them
    /// with the unlimited sentinels. Each named path may itself be a plain
    /// file or a directory tree; directories are walked recursively.
    pub fn scan_contributed(&mut self, paths: &[ContributedPath]) -> Result<()> {
        for contributed in paths {
            for entry in walkdir::WalkDir::new(&contributed.path)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                self.add_contributed_file(entry.path());
            }
        }
        Ok(())
    }

    fn add_contributed_file(&mut self, path: &Path) {
        let file = match open_no_follow(path) {
            Ok(f) => f,
            Err(err) => {
                log::warn!("skipping contributed path {:?}: {}", path, err);
                return;
            }
        };

        let mut bytes = Vec::new();
        let mut file = file;
        if file.read_to_end(&mut bytes).is_err() {
            return;
        }

        let hash = match xattr::get(path, "user.checksum.sha256") {
            Ok(Some(value)) => String::from_utf8(value).unwrap_or_else(|_| sha256_hex(&bytes)),
            _ => {
                let computed = sha256_hex(&bytes);
                let _ = xattr::set(path, "user.checksum.sha256", computed.as_bytes());
                computed
            }
        };

        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let item = Item {
            hash: hash.clone(),
            basename,
            size: bytes.len() as u64,
            ctime: now_unix(),
            max_age: UNLIMITED,
            share_limit: UNLIMITED,
            share_count: 0,
            cmdline: String::new(),
            flags: ItemFlags::empty(),
            boot_token: None,
            storage_ref: path.to_path_buf(),
        };

        self.items.insert(hash, item);
    }

    /// Remove any item whose age exceeds `max_age` (honoring the unlimited
    /// sentinel). Returns the evicted hashes.
    pub fn sweep(&mut self) -> Vec<String> {
        let now = now_unix();
        let expired: Vec<String> = self
            .items
            .values()
            .filter(|item| item.max_age != UNLIMITED && item.age(now) > item.max_age as u64)
            .map(|item| item.hash.clone())
            .collect();

        for hash in &expired {
            let _ = self.remove_raw(hash);
        }
        expired
    }
}

fn open_no_follow(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(OFlag::O_NOFOLLOW.bits())
        .open(path)
}

fn write_item_xattrs(
    path: &Path,
    max_age: u32,
    share_limit: u32,
    cmdline: &str,
    boot_token: Option<&str>,
) -> std::io::Result<()> {
    xattr::set(path, "user.max_age", max_age.to_string().as_bytes())?;
    xattr::set(path, "user.share_limit", share_limit.to_string().as_bytes())?;
    xattr::set(path, "user.cmdline", cmdline.as_bytes())?;
    if let Some(token) = boot_token {
        xattr::set(path, "user.boot_time", token.as_bytes())?;
    }
    Ok(())
}

fn read_item_xattrs(path: &Path) -> (Option<u32>, Option<u32>, Option<String>, Option<String>) {
    let max_age = xattr::get(path, "user.max_age")
        .ok()
        .flatten()
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| s.parse().ok());
    let share_limit = xattr::get(path, "user.share_limit")
        .ok()
        .flatten()
        .and_then(|v| String::from_utf8(v).ok())
        .and_then(|s| s.parse().ok());
    let cmdline = xattr::get(path, "user.cmdline")
        .ok()
        .flatten()
        .and_then(|v| String::from_utf8(v).ok());
    let boot_token = xattr::get(path, "user.boot_time")
        .ok()
        .flatten()
        .and_then(|v| String::from_utf8(v).ok());
    (max_age, share_limit, cmdline, boot_token)
}

impl std::fmt::Debug for ItemFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_wire_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ContentStore) {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn publish_hash_matches_sha256_of_bytes() {
        let (_dir, mut store) = store();
        let bytes = b"hello world\n";
        let item = store
            .add(bytes, "HELLO.md", 86400, 5, 0, ItemFlags::empty(), "publisher")
            .unwrap();
        assert_eq!(
            item.hash,
            "a948904f2f0f479b8f8197694b30184b0d2ed1c1cd2a1ec0fb85d299a192a44"
        );
    }

    #[test]
    fn duplicate_publish_is_rejected() {
        let (_dir, mut store) = store();
        let bytes = b"same bytes";
        store
            .add(bytes, "a.txt", 86400, 5, 0, ItemFlags::empty(), "p")
            .unwrap();
        let err = store
            .add(bytes, "b.txt", 86400, 5, 0, ItemFlags::empty(), "p")
            .unwrap_err();
        assert!(matches!(err, PassimError::AlreadyExists(_)));
    }

    #[test]
    fn basename_with_slash_is_rejected() {
        let (_dir, mut store) = store();
        let err = store
            .add(b"x", "a/b", 86400, 5, 0, ItemFlags::empty(), "p")
            .unwrap_err();
        assert!(matches!(err, PassimError::Validation(_)));
    }

    #[test]
    fn basename_with_control_character_is_rejected() {
        let (_dir, mut store) = store();
        let err = store
            .add(b"x", "evil\nX: 1", 86400, 5, 0, ItemFlags::empty(), "p")
            .unwrap_err();
        assert!(matches!(err, PassimError::Validation(_)));
    }

    #[test]
    fn share_count_at_or_above_limit_is_rejected_on_publish() {
        let (_dir, mut store) = store();
        let err = store
            .add(b"x", "a.txt", 86400, 2, 2, ItemFlags::empty(), "p")
            .unwrap_err();
        assert!(matches!(err, PassimError::Validation(_)));
    }

    #[test]
    fn share_limit_eviction_removes_file_and_entry() {
        let (_dir, mut store) = store();
        let item = store
            .add(b"x", "a.txt", 86400, 2, 0, ItemFlags::empty(), "p")
            .unwrap();
        let path = item.storage_ref.clone();

        assert!(!store.record_share(&item.hash).unwrap());
        assert!(store.record_share(&item.hash).unwrap());

        assert!(store.get(&item.hash).is_none());
        assert!(!path.exists());
    }

    #[test]
    fn disabled_item_is_excluded_from_advertised_set() {
        let (_dir, mut store) = store();
        let item = store
            .add(b"x", "a.txt", 86400, 5, 0, ItemFlags::DISABLED, "p")
            .unwrap();
        assert!(!store.advertised_hashes().contains(&item.hash));
    }

    #[test]
    fn sweep_evicts_items_past_max_age() {
        let (_dir, mut store) = store();
        let mut item = store
            .add(b"x", "a.txt", 10, 5, 0, ItemFlags::empty(), "p")
            .unwrap();
        item.ctime = 0; // force expiry
        store.items.insert(item.hash.clone(), item.clone());

        let evicted = store.sweep();
        assert_eq!(evicted, vec![item.hash]);
        assert!(store.get(&item.hash).is_none());
    }

    #[test]
    fn live_items_excludes_items_past_max_age_without_a_sweep() {
        let (_dir, mut store) = store();
        let mut item = store
            .add(b"x", "a.txt", 10, 5, 0, ItemFlags::empty(), "p")
            .unwrap();
        item.ctime = 0;
        store.items.insert(item.hash.clone(), item.clone());

        assert_eq!(store.live_items().count(), 0);
        assert_eq!(store.list().count(), 1);
    }

    #[test]
    fn add_opportunistically_sweeps_other_expired_items() {
        let (_dir, mut store) = store();
        let mut stale = store
            .add(b"x", "a.txt", 10, 5, 0, ItemFlags::empty(), "p")
            .unwrap();
        stale.ctime = 0;
        store.items.insert(stale.hash.clone(), stale.clone());

        store
            .add(b"y", "b.txt", 86400, 5, 0, ItemFlags::empty(), "p")
            .unwrap();

        assert!(store.get(&stale.hash).is_none());
        assert!(!stale.storage_ref.exists());
    }

    #[test]
    fn next_reboot_item_activates_only_after_token_changes() {
        let mut item = Item {
            hash: "h".into(),
            basename: "a.txt".into(),
            size: 1,
            ctime: now_unix(),
            max_age: UNLIMITED,
            share_limit: UNLIMITED,
            share_count: 0,
            cmdline: String::new(),
            flags: ItemFlags::NEXT_REBOOT | ItemFlags::DISABLED,
            boot_token: Some("111".into()),
            storage_ref: PathBuf::new(),
        };

        item.reconcile_next_reboot("111");
        assert!(item.flags.contains(ItemFlags::DISABLED));

        item.reconcile_next_reboot("222");
        assert!(!item.flags.contains(ItemFlags::DISABLED));
    }

    #[test]
    fn scan_contributed_walks_nested_directories() {
        let (_dir, mut store) = store();
        let contrib = tempdir().unwrap();
        std::fs::create_dir(contrib.path().join("nested")).unwrap();
        std::fs::write(contrib.path().join("top.txt"), b"top").unwrap();
        std::fs::write(contrib.path().join("nested/deep.txt"), b"deep").unwrap();

        store
            .scan_contributed(&[ContributedPath {
                path: contrib.path().to_path_buf(),
            }])
            .unwrap();

        let basenames: std::collections::HashSet<_> =
            store.list().map(|item| item.basename.clone()).collect();
        assert!(basenames.contains("top.txt"));
        assert!(basenames.contains("deep.txt"));
        assert_eq!(
            store.list().find(|i| i.basename == "top.txt").unwrap().max_age,
            UNLIMITED
        );
    }
}
