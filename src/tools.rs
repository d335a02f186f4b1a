//! Small filesystem and process helpers shared across the daemon.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use anyhow::{bail, Error};
use nix::sys::stat;
use nix::unistd;

pub mod cert;

/// Atomically create `path` with `data` and permission bits `mode`.
///
/// Uses `mkstemp` in the target directory followed by `rename`, which is
/// atomic on the same filesystem and safe across concurrent writers — the
/// same discipline the teacher uses for its config file replacement helper.
pub fn atomic_write<P: AsRef<Path>>(path: P, data: &[u8], mode: stat::Mode) -> Result<(), Error> {
    let path = path.as_ref();

    let mut template = path.to_owned();
    let mut file_name = template
        .file_name()
        .map(|n| n.to_owned())
        .unwrap_or_default();
    file_name.push(".tmp_XXXXXX");
    template.set_file_name(file_name);

    let (fd, tmp_path) = match unistd::mkstemp(&template) {
        Ok(res) => res,
        Err(err) => bail!("mkstemp {:?} failed: {}", template, err),
    };

    if let Err(err) = stat::fchmod(fd, mode) {
        let _ = unistd::unlink(&tmp_path);
        bail!("fchmod {:?} failed: {}", tmp_path, err);
    }

    let mut file = unsafe { <File as std::os::unix::io::FromRawFd>::from_raw_fd(fd) };

    if let Err(err) = file.write_all(data) {
        let _ = unistd::unlink(&tmp_path);
        bail!("write to {:?} failed: {}", tmp_path, err);
    }
    if let Err(err) = file.sync_all() {
        let _ = unistd::unlink(&tmp_path);
        bail!("fsync {:?} failed: {}", tmp_path, err);
    }

    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = unistd::unlink(&tmp_path);
        bail!("atomic rename to {:?} failed: {}", path, err);
    }

    Ok(())
}

/// Read the basename of `/proc/{pid}/exe`, used to record publisher provenance.
pub fn cmdline_for_pid(pid: u32) -> Result<String, Error> {
    let link = format!("/proc/{}/exe", pid);
    let target = std::fs::read_link(&link)?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(name)
}

/// Resolve the real (not effective) UID of a process from `/proc/{pid}/status`.
pub fn uid_for_pid(pid: u32) -> Result<u32, Error> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid))?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            let uid = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| anyhow::format_err!("malformed Uid line in /proc/{}/status", pid))?;
            return Ok(uid.parse()?);
        }
    }
    bail!("no Uid line in /proc/{}/status", pid)
}

/// Read the current boot epoch token from `/proc/stat`'s `btime` line.
///
/// This is the value NEXT_REBOOT-tagged items compare their stored
/// `boot_token` against (see `store::Item`).
pub fn boot_token() -> Result<String, Error> {
    let stat = std::fs::read_to_string("/proc/stat")?;
    for line in stat.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return Ok(rest.trim().to_string());
        }
    }
    bail!("no btime line in /proc/stat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_file_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mode = stat::Mode::from_bits_truncate(0o640);
        atomic_write(&path, b"hello", mode).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        // no leftover temp files
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn boot_token_reads_btime() {
        // /proc/stat is always present on Linux test runners.
        let token = boot_token();
        assert!(token.is_ok());
    }
}
