//! VolStream Deterministic Simulation Harness
//!
//! Runs the real control loop against a seeded stage so clustering and
//! quality decisions can be replayed exactly.
//!
//! All sources of non-determinism are intercepted:
//! - **Time**: virtual clock advanced by the runner, one tick at a time
//! - **Tracking**: the Oracle moves entities and viewers and emits noisy updates
//! - **Randomness**: every stream derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │  ┌──────────┐  updates  ┌─────────────┐  envelopes ┌──────┐ │
//! │  │  Oracle  │──────────►│ ControlLoop │───────────►│ Sink │ │
//! │  │ (truth)  │  SimFeed  │ (engine)    │ Recording  └──────┘ │
//! │  └──────────┘           └──────┬──────┘                     │
//! │                                │ snapshots                  │
//! │                        ┌───────▼────────┐                   │
//! │                        │ InvariantCheck │                   │
//! │                        └────────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use volstream_sim::{ScenarioRunner, ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_duration(10.0).run(ScenarioId::Convoy).await;
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod feed;
mod oracle;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{ClusterFrame, EntityFrame, SimEvent, SimExport, SimFrame, ViewerFrame};
pub use feed::{RecordingSink, SimFeed};
pub use oracle::{Motion, Oracle, SimEntity, SimViewer};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use scenarios::{ScenarioId, ScriptedEvent, StageEvent};
