//! Daemon configuration: the `[daemon]` group of `/etc/passim/passim.conf`,
//! and the package-contributed path directory `/etc/passim.d/*.conf`.
//!
//! The teacher's own section-config machinery depends on a schema crate
//! that isn't part of this crate's dependency tree, so this module parses
//! the same key-file shape directly with the `ini` crate.

use std::path::{Path, PathBuf};

use ini::Ini;

use crate::buildcfg::{
    CONTRIB_CONF_DIR, DEFAULT_CARBON_COST, DEFAULT_DATA_DIR, DEFAULT_MAX_ITEM_SIZE, DEFAULT_PORT,
};
use crate::error::{PassimError, Result};
use crate::store::ContributedPath;

/// Parsed `[daemon]` group of `passim.conf`.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_item_size: u64,
    pub carbon_cost: f64,
    pub ipv6: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
            carbon_cost: DEFAULT_CARBON_COST,
            ipv6: false,
        }
    }
}

impl DaemonConfig {
    /// Load `{path}`, falling back to all defaults if it doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::default();

        let ini = match Ini::load_from_file(path) {
            Ok(ini) => ini,
            Err(ini::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(config);
            }
            Err(err) => return Err(PassimError::Validation(format!("{}: {}", path.display(), err))),
        };

        let section = match ini.section(Some("daemon")) {
            Some(section) => section,
            None => return Ok(config),
        };

        if let Some(value) = section.get("Port") {
            config.port = value
                .parse()
                .map_err(|_| PassimError::Validation(format!("invalid Port {:?}", value)))?;
        }
        if let Some(value) = section.get("Path") {
            config.data_dir = PathBuf::from(value);
        }
        if let Some(value) = section.get("MaxItemSize") {
            config.max_item_size = value
                .parse()
                .map_err(|_| PassimError::Validation(format!("invalid MaxItemSize {:?}", value)))?;
        }
        if let Some(value) = section.get("CarbonCost") {
            config.carbon_cost = value
                .parse()
                .map_err(|_| PassimError::Validation(format!("invalid CarbonCost {:?}", value)))?;
        }
        if let Some(value) = section.get("IPv6") {
            config.ipv6 = matches!(value, "true" | "1" | "yes");
        }

        Ok(config)
    }
}

/// Scan `{sysconfdir}/passim.d/*.conf` for `[passim] Path=...` entries.
pub fn scan_contributed_dir(dir: &Path) -> Vec<ContributedPath> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut paths = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("conf") {
            continue;
        }
        let ini = match Ini::load_from_file(&path) {
            Ok(ini) => ini,
            Err(err) => {
                log::warn!("skipping contributed config {:?}: {}", path, err);
                continue;
            }
        };
        if let Some(section) = ini.section(Some("passim")) {
            if let Some(value) = section.get("Path") {
                paths.push(ContributedPath {
                    path: PathBuf::from(value),
                });
            }
        }
    }
    paths
}

/// Default location scanned for contributed-path configs.
pub fn default_contrib_dir() -> PathBuf {
    PathBuf::from(CONTRIB_CONF_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = DaemonConfig::load(Path::new("/nonexistent/passim.conf")).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn parses_daemon_group() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passim.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[daemon]").unwrap();
        writeln!(file, "Port=27501").unwrap();
        writeln!(file, "MaxItemSize=1000").unwrap();
        writeln!(file, "IPv6=true").unwrap();
        drop(file);

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.port, 27501);
        assert_eq!(config.max_item_size, 1000);
        assert!(config.ipv6);
    }

    #[test]
    fn scans_contributed_conf_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo.conf");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[passim]").unwrap();
        writeln!(file, "Path=/usr/share/foo/data").unwrap();
        drop(file);

        let contributed = scan_contributed_dir(dir.path());
        assert_eq!(contributed.len(), 1);
        assert_eq!(contributed[0].path, PathBuf::from("/usr/share/foo/data"));
    }
}
