//! nodewatch: node metrics agent with a pull-style HTTP exposition endpoint
//!
//! Plugins read host and hardware state (`/proc`, `/sys`, ICMP probes, a serial
//! microcontroller) into a shared metric registry. A scrape of `GET /metrics`
//! refreshes every pull-style plugin, renders the registry in the Prometheus
//! text format and returns it gzip-compressed.
//!
//! ## Modules
//!
//! * `config`: JSON configuration: the ordered plugin map plus logger and
//!   server sections, validated with the `validator` crate.
//!
//! * `core`: Runtime components:
//!   - Metric registry, series storage and text rendering
//!   - Plugin contract, registration table, manager and background updater
//!   - Built-in data sources
//!   - HTTP exposition server
//!
//! * `logger`: Centralized logging initialization using `tracing`.
//!   Supports console output in multiple formats (compact, pretty, JSON)
//!   and optional systemd journald integration.
//!
//! ## Features
//!
//! * `journald`: Enables the systemd journald log output (default: enabled).

pub mod config;
pub mod core;
pub mod logger;
