//! Flow correlation and latency aggregation core.
//!
//! Stage hits are joined per [`key::FlowKey`] in a [`table::StageTable`],
//! finalized into [`correlator::FinalizedRecord`]s when the terminal stage
//! fires, filtered by duration and quantized into log2 histograms. Reclaim
//! scopes are tracked per execution context by [`interval::IntervalAccumulator`].
//! Nothing here returns errors; anomalies degrade to sentinels and counters.

pub mod aggregator;
pub mod correlator;
pub mod engine;
pub mod filter;
pub mod histogram;
pub mod interval;
pub mod key;
pub mod stage;
pub mod table;

pub use engine::{Engine, EngineCounts, EngineSettings, Row, WindowReport};
