/// Config parsing, file reading and exclusion patterns shared by the plugins.
pub mod common;

/// Mountpoint size and inode usage via `statvfs`.
pub mod filesystem;

/// 1, 5 and 15-minute load averages plus scheduler entity counts.
pub mod loadavg;

/// Power-management microcontroller polled over a serial line.
/// Runs as a background task.
pub mod mcu;

/// Every `/proc/meminfo` field as a gauge.
pub mod meminfo;

/// Interface traffic counters, carrier state and interface presence.
pub mod netdev;

/// Round-trip time to configured hosts.
/// Runs one background task per target.
pub mod ping;

/// hwmon chips and i.MX28 on-board sensors.
pub mod sensors;

/// CPU time, interrupts, context switches and process counts from `/proc/stat`.
pub mod system;
