//! NetWarden - device health monitoring engine.
//!
//! Probes network devices over ICMP or TCP, classifies their health against
//! per-device thresholds, records status transitions and notifies
//! subscribers when a device changes state.

pub mod config;
pub mod db;
pub mod monitor;
pub mod probe;
pub mod scheduler;
pub mod web;
