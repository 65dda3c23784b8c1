use std::{
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};
use validator::Validate;

use super::common::{parse_config, Pattern};
use crate::{
    core::{
        metrics::{Metric, MetricDesc, Registry},
        plugins::{Collect, Construct, Plugin, PluginError, PluginResult, NAMESPACE},
    },
    register_plugin,
};

const SUBSYSTEM: &str = "filesystem";

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FilesystemConfig {
    /// Mountpoints matching this pattern (anchored at the start) are skipped.
    #[serde(default)]
    pub exclude: String,

    #[serde(default = "default_mounts_path")]
    pub mounts_path: PathBuf,
}

fn default_mounts_path() -> PathBuf {
    PathBuf::from("/proc/mounts")
}

/// Space and inode figures of one mountpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    pub size: u64,
    pub free: u64,
    pub avail: u64,
    pub files: u64,
    pub files_free: u64,
}

#[cfg(unix)]
fn statvfs(mountpoint: &str) -> PluginResult<FsUsage> {
    let c_path = std::ffi::CString::new(mountpoint.as_bytes()).map_err(|e| {
        PluginError::SystemCall {
            syscall: "statvfs".into(),
            reason: e.to_string(),
        }
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if result != 0 {
        return Err(PluginError::SystemCall {
            syscall: "statvfs".into(),
            reason: std::io::Error::last_os_error().to_string(),
        });
    }

    let block_size = stat.f_frsize as u64;
    Ok(FsUsage {
        size: (stat.f_blocks as u64).wrapping_mul(block_size),
        free: (stat.f_bfree as u64).wrapping_mul(block_size),
        avail: (stat.f_bavail as u64).wrapping_mul(block_size),
        files: stat.f_files as u64,
        files_free: stat.f_ffree as u64,
    })
}

#[cfg(not(unix))]
fn statvfs(_mountpoint: &str) -> PluginResult<FsUsage> {
    Err(PluginError::SystemCall {
        syscall: "statvfs".into(),
        reason: "unsupported platform".into(),
    })
}

/// Decodes the `\NNN` octal escapes the kernel writes for spaces, tabs,
/// newlines and backslashes in mount paths.
pub fn unescape_mountpoint(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let code = bytes
            .get(i + 1..i + 4)
            .filter(|digits| bytes[i] == b'\\' && digits.iter().all(|d| (b'0'..=b'7').contains(d)))
            .and_then(|digits| std::str::from_utf8(digits).ok())
            .and_then(|digits| u8::from_str_radix(digits, 8).ok());
        match code {
            Some(byte) => {
                out.push(byte);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mountpoints listed in a mounts table, in file order, minus excluded ones.
pub fn parse_mountpoints(content: &str, exclude: &Pattern) -> Vec<String> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mountpoint)
        .filter(|mountpoint| {
            let skip = exclude.matches(mountpoint);
            if skip {
                trace!("Excluding mountpoint {}", mountpoint);
            }
            !skip
        })
        .collect()
}

/// Filesystem size and inode usage per mountpoint.
///
/// The mountpoint list is read once at construction. A mountpoint whose
/// `statvfs` fails is dropped for the rest of the process lifetime.
pub struct Filesystem {
    mountpoints: Mutex<Vec<String>>,
    size: Metric,
    free: Metric,
    avail: Metric,
    files: Metric,
    files_free: Metric,
}

impl Filesystem {
    pub fn mountpoints(&self) -> Vec<String> {
        self.mountpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Plugin for Filesystem {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn as_collect(&self) -> Option<&dyn Collect> {
        Some(self)
    }
}

impl Construct for Filesystem {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        let config: FilesystemConfig = parse_config("filesystem", config)?;
        let exclude = Pattern::new("filesystem", &config.exclude)?;

        let content = std::fs::read_to_string(&config.mounts_path)
            .map_err(|source| PluginError::file_read(config.mounts_path.display(), source))?;
        let mountpoints = parse_mountpoints(&content, &exclude);
        debug!("Watching {} mountpoints", mountpoints.len());

        let gauge = |name: &str, help: &str| {
            registry.declare(
                MetricDesc::gauge(name, help)
                    .namespace(NAMESPACE)
                    .subsystem(SUBSYSTEM)
                    .labels(&["mountpoint"]),
            )
        };

        Ok(Filesystem {
            mountpoints: Mutex::new(mountpoints),
            size: gauge("size", "Filesystem size in bytes.")?,
            free: gauge("free", "Filesystem free space in bytes.")?,
            avail: gauge(
                "avail",
                "Filesystem space available to non-root users in bytes.",
            )?,
            files: gauge("files", "Filesystem total file nodes.")?,
            files_free: gauge("files_free", "Filesystem total free file nodes.")?,
        })
    }
}

#[async_trait::async_trait]
impl Collect for Filesystem {
    async fn collect(&self) -> PluginResult<()> {
        let mut mountpoints = self.mountpoints.lock().unwrap_or_else(PoisonError::into_inner);
        let mut result = Ok(());

        mountpoints.retain(|mountpoint| match statvfs(mountpoint) {
            Ok(usage) => {
                let labels = [mountpoint.as_str()];
                let written = self
                    .size
                    .set(&labels, usage.size as f64)
                    .and_then(|_| self.free.set(&labels, usage.free as f64))
                    .and_then(|_| self.avail.set(&labels, usage.avail as f64))
                    .and_then(|_| self.files.set(&labels, usage.files as f64))
                    .and_then(|_| self.files_free.set(&labels, usage.files_free as f64));
                if let Err(e) = written {
                    result = Err(e.into());
                }
                true
            }
            Err(e) => {
                debug!("Dropping mountpoint {}: {}", mountpoint, e);
                false
            }
        });

        result
    }
}

register_plugin!(Filesystem, "filesystem");
