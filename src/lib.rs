//! # rcollector - SSH Collection Core for Network Devices
//!
//! `rcollector` runs ordered command lists against routers, switches and
//! servers over SSH. It resolves per-vendor command defaults, retries failed
//! connections with linear backoff and fans batches out over a bounded
//! worker pool, returning one structured result per task.
//!
//! ## Features
//!
//! - **Device Profiles**: Compiled-in Cisco IOS, Huawei VRP, H3C Comware and Linux profiles, overridable from JSON
//! - **Command Resolution**: Per-command `expect_string`/`delay_factor`/`max_loops` defaults that never override caller values
//! - **Retry Control**: Fresh session per attempt, linear backoff, task timeouts and cancellation
//! - **Bounded Concurrency**: Semaphore-bounded tokio tasks with pool timeouts and panic isolation
//! - **Maximum Compatibility**: Legacy SSH algorithms enabled by default for old device images
//! - **Lifecycle Reporting**: Pluggable sinks for task state transitions and results
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rcollector::collector::Collector;
//! use rcollector::config::CollectorSettings;
//! use rcollector::task::{CommandSpec, Credentials};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let collector = Collector::new(CollectorSettings::default())?;
//!
//!     let switches = vec![
//!         Credentials::with_password("192.168.1.1", "admin", "password")?.for_device_type("huawei"),
//!         Credentials::with_password("192.168.1.2", "admin", "password")?.for_device_type("huawei"),
//!     ];
//!     let batch = collector
//!         .collect_multi_host(
//!             switches,
//!             vec![CommandSpec::new("display current-configuration")],
//!             None,
//!             None,
//!             None,
//!         )
//!         .await?;
//!
//!     for task in &batch.task_results {
//!         println!("{}: success={}", task.host, task.success);
//!     }
//!     collector.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`collector::Collector`] - Validates requests and runs tasks and batches
//! - [`pool::WorkerPool`] - Bounded parallel execution with timeouts and cancellation
//! - [`retry::RetryController`] - Per-task connection retries
//! - [`session::SessionExecutor`] - One SSH session, commands in order
//! - [`profile::ProfileRegistry`] - Device profiles keyed by device type
//! - [`resolver::CommandResolver`] - Effective command parameters per device type
//! - [`lifecycle`] - Outbound state and result reporting

pub mod collector;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod profile;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod task;
