//! Loadguard - single-node resource-pressure governor.
//!
//! Probes host CPU/memory headroom, classifies it into a discrete pressure
//! level, and feeds that signal into resizable bounded-parallelism limiters
//! so concurrent work uses available capacity without tipping the host into
//! thrashing.

pub mod capacity;
pub mod config;
pub mod controller;
pub mod gpu;
pub mod monitor;
pub mod platform;
pub mod poller;
pub mod probe;
pub mod registry;
pub mod stream;
