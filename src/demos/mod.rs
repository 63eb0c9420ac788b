//! Demo modules for the Lagrange relay
//! Each predictor strategy gets its own in-process walkthrough

pub mod interpolation;
pub mod telemetry;
