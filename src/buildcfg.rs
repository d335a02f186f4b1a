//! Exports configuration data that would normally come from the build system.

/// The configured configuration directory
pub const CONFIGDIR: &str = "/etc/passim";

#[macro_export]
macro_rules! PASSIM_RUN_DIR_M { () => ("/run/passim") }

#[macro_export]
macro_rules! PASSIM_STATE_DIR_M { () => ("/var/lib/passim") }

/// namespaced directory for in-memory (tmpfs) run state
pub const PASSIM_RUN_DIR: &str = PASSIM_RUN_DIR_M!();

/// namespaced directory for persistent daemon state (TLS material)
pub const PASSIM_STATE_DIR: &str = PASSIM_STATE_DIR_M!();

/// Prepend the configuration directory to a file name.
///
/// #### Example:
/// ```
/// # #[macro_use] extern crate passim;
/// let conf_path = configdir!("/passim.conf");
/// ```
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => {
        concat!("/etc/passim", $subdir)
    };
}

/// Prepend the state directory to a file name.
#[macro_export]
macro_rules! statedir {
    ($subdir:expr) => {
        concat!(PASSIM_STATE_DIR_M!(), $subdir)
    };
}

/// Default owned data directory, when not overridden by `Path=` in `passim.conf`.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/passim/data";

/// Directory scanned for `*.conf` files naming package-contributed paths.
pub const CONTRIB_CONF_DIR: &str = "/etc/passim.d";

/// Default HTTPS listen port.
pub const DEFAULT_PORT: u16 = 27500;

/// Default per-publish byte cap (100 MiB).
pub const DEFAULT_MAX_ITEM_SIZE: u64 = 104_857_600;

/// Default carbon cost, in kg CO2e per GB, used to derive `CarbonSaving`.
pub const DEFAULT_CARBON_COST: f64 = 0.026367;

/// Sentinel "never expire" / "unlimited" value for `max_age` and `share_limit`.
pub const UNLIMITED: u32 = u32::MAX;

/// Fallback attributes used by `ContentStore::scan_owned` when extended
/// attributes are missing from a file found in the owned data directory.
pub const FALLBACK_MAX_AGE: u32 = 86400;
pub const FALLBACK_SHARE_LIMIT: u32 = 5;
