// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free indicator maths for the chart trend line and the
// cycle gauges. Insufficient data yields `None` / empty output, never a panic.

pub mod cycle;
pub mod rsi;
pub mod sma;
