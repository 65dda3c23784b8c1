//! Power-management microcontroller polled over a serial line.
//!
//! The controller speaks a line protocol: the host writes a command followed by
//! `\n`, the controller answers with whitespace separated tokens terminated by
//! `OK` on success.

use std::{
    io::{self, Read, Write},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use serde::Deserialize;
use serde_json::Value;
use validator::Validate;

use super::common::parse_config;
use crate::{
    core::{
        metrics::{Metric, MetricDesc, Registry},
        plugins::{
            updater::{spawn_updater, UpdaterSpec},
            Construct, Plugin, PluginError, PluginResult, Update, NAMESPACE,
        },
    },
    register_plugin,
};

const SUBSYSTEM: &str = "mcu";

/// Final token of an acknowledged reply.
pub const ACK: &str = "OK";

/// Upper bound on the size of one reply, in bytes.
pub const REPLY_LIMIT: usize = 50;

/// Inputs queried with `status <input>`.
pub const STATUS_INPUTS: [&str; 4] = ["poe", "usb", "off", "batbad"];

/// Byte stream to the controller.
pub trait Link: Read + Write + Send {}

impl<T: Read + Write + Send> Link for T {}

fn read_reply<L: Read + ?Sized>(link: &mut L) -> io::Result<String> {
    let mut buf = [0u8; REPLY_LIMIT];
    let mut filled = 0;
    while filled < REPLY_LIMIT {
        match link.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&buf[..filled]).into_owned())
}

/// Sends `command` and collects the reply tokens.
///
/// Returns `(success, data)`. `success` is true only when the last token is
/// [`ACK`]. That last token is never part of `data`. With `echo` set, leading
/// tokens repeating the command are dropped as well.
pub fn exchange<L: Link + ?Sized>(
    link: &mut L,
    command: &str,
    echo: bool,
) -> io::Result<(bool, Vec<String>)> {
    link.write_all(command.as_bytes())?;
    link.write_all(b"\n")?;
    link.flush()?;

    let reply = read_reply(link)?;
    let mut tokens: Vec<String> = reply.split_whitespace().map(str::to_string).collect();

    if echo {
        let echoed: Vec<&str> = command.split_whitespace().collect();
        let repeated = tokens.len() >= echoed.len()
            && tokens.iter().zip(&echoed).all(|(token, word)| token == word);
        if repeated {
            tokens.drain(..echoed.len());
        }
    }

    let success = tokens.pop().is_some_and(|last| last == ACK);
    Ok((success, tokens))
}

fn ask<L: Link + ?Sized>(link: &mut L, command: &str, echo: bool) -> PluginResult<Vec<String>> {
    let (success, data) = exchange(link, command, echo)?;
    if !success {
        return Err(PluginError::Protocol(format!(
            "'{}' was not acknowledged (reply: {:?})",
            command, data
        )));
    }
    Ok(data)
}

/// Values read during one polling round.
#[derive(Debug, Clone, PartialEq)]
pub struct McuReadings {
    pub status: Vec<(&'static str, f64)>,
    pub bq_errors: usize,
}

/// Runs one polling round: every `status` input, then `bq status`.
pub fn poll_device<L: Link + ?Sized>(link: &mut L, echo: bool) -> PluginResult<McuReadings> {
    let mut status = Vec::with_capacity(STATUS_INPUTS.len());
    for input in STATUS_INPUTS {
        let command = format!("status {}", input);
        let data = ask(link, &command, echo)?;
        let raw = data.first().ok_or_else(|| PluginError::InvalidFormat {
            location: command.clone(),
            reason: "empty reply".to_string(),
        })?;
        let value = u64::from_str_radix(raw.trim_start_matches("0x"), 16).map_err(|_| {
            PluginError::ParseError {
                metric: "status".to_string(),
                location: command.clone(),
                reason: format!("invalid hex value: {}", raw),
            }
        })?;
        status.push((input, value as f64));
    }

    let bq_errors = ask(link, "bq status", echo)?.len();
    Ok(McuReadings { status, bq_errors })
}

fn default_interval() -> u64 {
    30
}

fn default_baudrate() -> u32 {
    115_200
}

fn default_port_timeout() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SerialConfig {
    #[validate(length(min = 1, message = "Serial port path must not be empty"))]
    pub port: String,

    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Read timeout in seconds.
    #[serde(default = "default_port_timeout")]
    #[validate(range(min = 0.001, max = 3_600.0, message = "Serial timeout must be between 1 ms and one hour"))]
    pub timeout: f64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct McuConfig {
    /// Seconds between polling rounds.
    #[serde(default = "default_interval")]
    #[validate(range(min = 1, message = "MCU interval must be at least 1 second"))]
    pub interval: u64,

    #[validate(nested)]
    pub serial: SerialConfig,

    /// Whether the controller echoes commands back.
    #[serde(default)]
    pub echo: bool,
}

/// Microcontroller status registers, refreshed by one background task.
pub struct Mcu {
    config: McuConfig,
    link: Arc<Mutex<Box<dyn Link>>>,
    status: Metric,
    bq_status: Metric,
}

impl Mcu {
    /// Builds the plugin around an already opened link.
    pub fn with_link(config: &Value, registry: &Arc<Registry>, link: Box<dyn Link>) -> PluginResult<Self> {
        let config: McuConfig = parse_config("mcu", config)?;
        Self::from_parts(config, registry, link)
    }

    fn from_parts(config: McuConfig, registry: &Arc<Registry>, link: Box<dyn Link>) -> PluginResult<Self> {
        let status = registry.declare(
            MetricDesc::gauge("status", "MCU status")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM)
                .labels(&["input"]),
        )?;
        let bq_status = registry.declare(
            MetricDesc::gauge("bq_status", "MCU BQ error count")
                .namespace(NAMESPACE)
                .subsystem(SUBSYSTEM),
        )?;
        Ok(Mcu {
            config,
            link: Arc::new(Mutex::new(link)),
            status,
            bq_status,
        })
    }
}

impl Plugin for Mcu {
    fn name(&self) -> &'static str {
        "mcu"
    }

    fn as_update(&self) -> Option<&dyn Update> {
        Some(self)
    }
}

impl Construct for Mcu {
    fn construct(config: &Value, registry: &Arc<Registry>) -> PluginResult<Self> {
        let config: McuConfig = parse_config("mcu", config)?;
        let port = serialport::new(&config.serial.port, config.serial.baudrate)
            .timeout(Duration::from_secs_f64(config.serial.timeout))
            .open()
            .map_err(|e| PluginError::Io(e.into()))?;
        Self::from_parts(config, registry, Box::new(port))
    }
}

impl Update for Mcu {
    fn start_update(&self) -> PluginResult<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PluginError::Other("no async runtime to spawn the MCU task".into()));
        }

        let link = self.link.clone();
        let status = self.status.clone();
        let bq_status = self.bq_status.clone();
        let echo = self.config.echo;
        let spec = UpdaterSpec {
            plugin: "mcu",
            target: self.config.serial.port.clone(),
            interval: Duration::from_secs(self.config.interval),
        };

        spawn_updater(spec, move || {
            let link = link.clone();
            let status = status.clone();
            let bq_status = bq_status.clone();
            async move {
                let readings = tokio::task::spawn_blocking(move || {
                    let mut link = link.lock().unwrap_or_else(PoisonError::into_inner);
                    poll_device(link.as_mut(), echo)
                })
                .await
                .map_err(|e| PluginError::Other(format!("MCU polling task failed: {}", e)))??;

                for (input, value) in readings.status {
                    status.set(&[input], value)?;
                }
                bq_status.set(&[], readings.bq_errors as f64)?;
                Ok(())
            }
        });
        Ok(())
    }
}

register_plugin!(Mcu, "mcu");

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use serde_json::json;

    use super::*;

    /// Scripted controller: every completed command line releases the next reply.
    #[derive(Default)]
    struct FakeLink {
        replies: VecDeque<String>,
        pending: io::Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl FakeLink {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_string()).collect(),
                ..Default::default()
            }
        }

        fn commands(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.written)
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.pending.read(buf)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            if buf.contains(&b'\n') {
                let reply = self.replies.pop_front().unwrap_or_default();
                self.pending = io::Cursor::new(reply.into_bytes());
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn exchange_succeeds_on_ack() {
        let mut link = FakeLink::new(&["1f\r\nOK\r\n"]);
        let (success, data) = exchange(&mut link, "status poe", false).unwrap();
        assert!(success);
        assert_eq!(data, vec!["1f"]);
        assert_eq!(link.commands(), vec!["status poe"]);
    }

    #[test]
    fn exchange_without_ack_fails_and_drops_terminal_token() {
        let mut link = FakeLink::new(&["1f 2e ERR\r\n"]);
        let (success, data) = exchange(&mut link, "status usb", false).unwrap();
        assert!(!success);
        assert_eq!(data, vec!["1f", "2e"]);
    }

    #[test]
    fn exchange_with_empty_reply_fails() {
        let mut link = FakeLink::new(&[]);
        let (success, data) = exchange(&mut link, "bq status", false).unwrap();
        assert!(!success);
        assert!(data.is_empty());
    }

    #[test]
    fn exchange_strips_echo() {
        let mut link = FakeLink::new(&["status off\r\n0\r\nOK\r\n"]);
        let (success, data) = exchange(&mut link, "status off", true).unwrap();
        assert!(success);
        assert_eq!(data, vec!["0"]);

        let mut link = FakeLink::new(&["0\r\nOK\r\n"]);
        let (_, data) = exchange(&mut link, "status off", true).unwrap();
        assert_eq!(data, vec!["0"]);
    }

    #[test]
    fn reply_is_bounded() {
        let mut link = FakeLink::new(&["a ".repeat(100).as_str()]);
        let (_, data) = exchange(&mut link, "noise", false).unwrap();
        assert_eq!(data.len(), REPLY_LIMIT / 2 - 1);
    }

    #[test]
    fn poll_device_reads_every_register() {
        let mut link = FakeLink::new(&[
            "1 OK", "0x10 OK", "0 OK", "ff OK", "E1 E2 E3 OK",
        ]);
        let readings = poll_device(&mut link, false).unwrap();
        assert_eq!(
            readings.status,
            vec![("poe", 1.0), ("usb", 16.0), ("off", 0.0), ("batbad", 255.0)]
        );
        assert_eq!(readings.bq_errors, 3);
        assert_eq!(
            link.commands(),
            vec!["status poe", "status usb", "status off", "status batbad", "bq status"]
        );
    }

    #[test]
    fn poll_device_stops_on_unacknowledged_command() {
        let mut link = FakeLink::new(&["1 OK", "BUSY"]);
        let err = poll_device(&mut link, false).unwrap_err();
        assert!(matches!(err, PluginError::Protocol(_)));
    }

    #[tokio::test]
    async fn background_task_writes_metrics() {
        let registry = Arc::new(Registry::new());
        let link = FakeLink::new(&["1 OK", "2 OK", "3 OK", "4 OK", "OK"]);
        let plugin = Mcu::with_link(
            &json!({ "serial": { "port": "/dev/fake" }, "interval": 3600 }),
            &registry,
            Box::new(link),
        )
        .unwrap();

        plugin.as_update().unwrap().start_update().unwrap();

        for _ in 0..100 {
            if plugin.bq_status.get(&[]).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(plugin.status.get(&["usb"]), Some(2.0));
        assert_eq!(plugin.status.get(&["batbad"]), Some(4.0));
        assert_eq!(plugin.bq_status.get(&[]), Some(0.0));
    }

    #[test]
    fn missing_serial_port_fails_construction() {
        let registry = Arc::new(Registry::new());
        let result = Mcu::construct(
            &json!({ "serial": { "port": "/nonexistent/ttyS9" } }),
            &registry,
        );
        assert!(result.is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn oversized_serial_timeout_is_rejected() {
        let registry = Arc::new(Registry::new());
        let result = Mcu::construct(
            &json!({ "serial": { "port": "/nonexistent/ttyS9", "timeout": 1e20 } }),
            &registry,
        );
        assert!(matches!(result, Err(PluginError::InvalidConfig { .. })));
    }
}
