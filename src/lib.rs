//! flowscope correlates kernel probe events that belong to one logical
//! flow, reports per-stage latencies and aggregates them into log2
//! histograms.

pub mod agent;
pub mod clock;
pub mod config;
pub mod correlate;
pub mod export;
pub mod sink;
pub mod tracer;
