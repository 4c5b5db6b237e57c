//! Argos - connector-driven hardware telemetry
//!
//! This crate runs declarative connectors against monitored hosts. A
//! connector describes how to recognize a device family, which components
//! it has and how to read their metrics, over SNMP, WBEM/WMI, HTTP, OS
//! commands or IPMI.
//!
//! # Architecture
//!
//! - **Connector Model**: typed sources, computes, criteria and monitor jobs, loaded into a [`ConnectorStore`]
//! - **Source Resolver**: orders sources by their references
//! - **Source Processor / Compute Pipeline**: protocol calls turned into [`SourceTable`]s
//! - **Strategy Executor**: the per-host Detect → Discover → Collect cycle
//! - **Engine**: scheduling and the worker pool
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use argos::{AppConfig, ConnectorStore, Engine, LogExporter, ProtocolClients};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AppConfig::load("configs/config.yaml")?;
//!     let store = Arc::new(ConnectorStore::load_from_dir(&config.connector_path)?);
//!     let engine = Engine::from_config(&config, store, ProtocolClients::with_defaults()?, Arc::new(LogExporter)).await?;
//!     let reports = engine.run_once().await;
//!     Ok(())
//! }
//! ```

pub mod compute;
pub mod config;
pub mod connector;
pub mod criterion;
pub mod diagnostic;
pub mod engine;
pub mod export;
pub mod lines;
pub mod processor;
pub mod protocol;
pub mod resolver;
pub mod strategy;
pub mod table;
pub mod telemetry;

#[cfg(test)]
mod testing;

pub use config::{AppConfig, ConfigError, HostConfig};
pub use connector::{Connector, ConnectorError, ConnectorStore};
pub use diagnostic::{Diagnostic, DiagnosticKind, Severity};
pub use engine::{Engine, EngineError, Schedule};
pub use export::{ChannelExporter, LogExporter, MetricExporter, MetricSnapshot};
pub use protocol::{ProtocolClient, ProtocolClients, ProtocolError, ProtocolKind};
pub use strategy::{CycleReport, HostContext, StrategyExecutor};
pub use table::SourceTable;
pub use telemetry::{Monitor, TelemetryState};
