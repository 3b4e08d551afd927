//! # vpn-merger
//!
//! Aggregates VPN subscription sources into deduplicated, ranked output
//! bundles, featuring:
//!
//! - **Resilience**: per-host circuit breakers, rate limiting, retry with backoff
//! - **Quality ranking**: heuristic scoring plus optional reachability testing
//! - **Observability**: structured logging, an in-process event bus, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PipelineOrchestrator                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Discovery → Fetcher → ProtocolParser → Deduplicator        │
//! │            → ConnectionTester → QualityScorer               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SourceStateStore (persisted health/reputation)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  OutputFormatter (raw, base64, csv, singbox, clash, ...)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vpn_merger::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     // build the pipeline components and call PipelineOrchestrator::run
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod discovery;
pub mod error;
pub mod event_bus;
pub mod fetcher;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod output;
pub mod protocol;
pub mod scorer;
pub mod source_store;
pub mod source_validator;
pub mod tester;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use orchestrator::{OrchestratorConfig, PipelineOrchestrator};
