//! Cross-process mount registry.
//!
//! One `slot_<N>.info` file per mounted volume in the per-user state
//! directory, containing UTF-8 `key=value` lines. Readers trust a record
//! only while its owning PID is alive; stale records are deleted silently,
//! which is also how slots freed by crashed processes are reclaimed.

use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::EncryptionAlgorithm;
use crate::error::{Error, Result};
use crate::volume::VolumeInfo;

/// Directory override for tests and non-standard setups; otherwise the
/// platform's per-user state directory.
const STATE_DIR_ENV: &str = "BASALT_STATE_DIR";

fn registry_dir() -> Result<PathBuf> {
    let base = match std::env::var_os(STATE_DIR_ENV) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .ok_or(Error::ParameterIncorrect("no per-user state directory"))?
            .join("basalt"),
    };
    let dir = base.join("mounts");
    fs::create_dir_all(&dir).map_err(|e| Error::system_path(e, &dir))?;
    Ok(dir)
}

fn slot_file(slot: u32) -> Result<PathBuf> {
    Ok(registry_dir()?.join(format!("slot_{slot}.info")))
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // A pid that does not fit pid_t would turn into a process-group probe.
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 probes existence; EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

fn key_bits(algorithm_name: &str) -> u32 {
    EncryptionAlgorithm::from_name(algorithm_name)
        .map(|a| (a.depth() * 256) as u32)
        .unwrap_or(256)
}

/// Serialise a record in the `key=value` schema shared with the control
/// file of the loop-file transport.
pub fn serialize_info(info: &VolumeInfo) -> String {
    let mut out = String::new();
    out.push_str(&format!("pid={}\n", std::process::id()));
    out.push_str(&format!("slot={}\n", info.slot));
    out.push_str(&format!("path={}\n", info.path.display()));
    out.push_str(&format!(
        "mountpoint={}\n",
        info.mount_point
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    ));
    out.push_str(&format!("size={}\n", info.size));
    out.push_str(&format!(
        "type={}\n",
        if info.hidden { "hidden" } else { "normal" }
    ));
    out.push_str(&format!(
        "protection={}\n",
        if info.protection {
            "hidden-volume"
        } else if info.read_only {
            "read-only"
        } else {
            "none"
        }
    ));
    out.push_str(&format!("encryption={}\n", info.encryption_algorithm));
    out.push_str("encmode=XTS\n");
    out.push_str(&format!("pkcs5={}\n", info.kdf_name));
    out.push_str(&format!("pkcs5iterations={}\n", info.iteration_count));
    out.push_str(&format!("keysize={}\n", key_bits(&info.encryption_algorithm)));
    out
}

fn parse_field<'a>(lines: &'a [(String, String)], key: &str) -> Option<&'a str> {
    lines
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// Parse a record. Returns the owning PID and the reconstructed info.
pub fn parse_info(text: &str) -> Option<(u32, VolumeInfo)> {
    let lines: Vec<(String, String)> = text
        .lines()
        .filter_map(|l| {
            l.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect();

    let pid: u32 = parse_field(&lines, "pid")?.parse().ok()?;
    let slot: u32 = parse_field(&lines, "slot")?.parse().ok()?;
    let path = PathBuf::from(parse_field(&lines, "path")?);
    let mountpoint = parse_field(&lines, "mountpoint")
        .filter(|s| !s.is_empty())
        .map(PathBuf::from);
    let size: u64 = parse_field(&lines, "size")?.parse().ok()?;
    let hidden = parse_field(&lines, "type")? == "hidden";
    let protection_field = parse_field(&lines, "protection")?;

    Some((
        pid,
        VolumeInfo {
            slot,
            path,
            mount_point: mountpoint,
            encryption_algorithm: parse_field(&lines, "encryption")?.to_string(),
            kdf_name: parse_field(&lines, "pkcs5")?.to_string(),
            iteration_count: parse_field(&lines, "pkcs5iterations")?.parse().ok()?,
            size,
            sector_size: 512,
            hidden,
            read_only: protection_field == "read-only",
            protection: protection_field == "hidden-volume",
            bytes_read: 0,
            bytes_written: 0,
        },
    ))
}

/// Record a mount under its slot.
pub fn write(info: &VolumeInfo) -> Result<()> {
    let path = slot_file(info.slot)?;
    fs::write(&path, serialize_info(info)).map_err(|e| Error::system_path(e, &path))?;
    Ok(())
}

/// Remove a slot record. Missing records are fine; the owner may have
/// crashed and a reader may have reclaimed the file already.
pub fn remove(slot: u32) -> Result<()> {
    let path = slot_file(slot)?;
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::system_path(e, &path)),
    }
}

/// All live records, lowest slot first. Stale records (dead PID,
/// unparseable content) are deleted along the way.
pub fn list() -> Result<Vec<VolumeInfo>> {
    let dir = registry_dir()?;
    let mut out = Vec::new();
    let entries = fs::read_dir(&dir).map_err(|e| Error::system_path(e, &dir))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with("slot_") || !name.ends_with(".info") {
            continue;
        }
        let path = entry.path();
        let Ok(text) = fs::read_to_string(&path) else {
            let _ = fs::remove_file(&path);
            continue;
        };
        match parse_info(&text) {
            Some((pid, info)) if pid_alive(pid) => out.push(info),
            _ => {
                log::debug!("reclaiming stale registry record {}", path.display());
                let _ = fs::remove_file(&path);
            }
        }
    }
    out.sort_by_key(|info| info.slot);
    Ok(out)
}

/// Find a live record by volume path.
pub fn find_by_path(path: &Path) -> Result<Option<VolumeInfo>> {
    Ok(list()?.into_iter().find(|info| info.path == path))
}

/// Find a live record by slot.
pub fn find_by_slot(slot: u32) -> Result<Option<VolumeInfo>> {
    Ok(list()?.into_iter().find(|info| info.slot == slot))
}

/// PID of the process serving a slot, if its record is live.
pub fn owner_pid(slot: u32) -> Result<Option<u32>> {
    let path = slot_file(slot)?;
    let Ok(text) = fs::read_to_string(&path) else {
        return Ok(None);
    };
    Ok(parse_info(&text)
        .filter(|(pid, _)| pid_alive(*pid))
        .map(|(pid, _)| pid))
}

/// Lowest slot number not taken by a live record, starting at 1.
pub fn next_free_slot() -> Result<u32> {
    let taken: Vec<u32> = list()?.iter().map(|info| info.slot).collect();
    let mut slot = 1u32;
    while taken.contains(&slot) {
        slot += 1;
    }
    Ok(slot)
}

/// Control-file twin of the slot record, used by the loop-file transport.
pub fn write_control_file(info: &VolumeInfo) -> Result<PathBuf> {
    let path = registry_dir()?.join(format!("slot_{}.control", info.slot));
    fs::write(&path, serialize_info(info)).map_err(|e| Error::system_path(e, &path))?;
    Ok(path)
}
