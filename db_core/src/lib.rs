//! Core analysis for detecting differentially bound regions from windowed
//! fragment counts.
//!
//! The stages run in order: [`counter`] tiles the genome and counts
//! fragments, [`normalize`] and [`abundance`] derive scaling and filter
//! statistics, [`dispersion`] and [`tester`] fit negative binomial GLMs per
//! window, and [`merge`] and [`combine`] turn window results into region
//! results.  [`pipeline::run`] strings them together.

#[macro_use]
extern crate log;

pub mod abundance;
pub mod combine;
pub mod config;
pub mod counter;
pub mod dispersion;
pub mod error;
pub mod glm;
pub mod interval;
pub mod linalg;
pub mod matrix;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod pool;
pub mod smooth;
pub mod tester;

pub use error::{CoreError, Result};
