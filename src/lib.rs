#![cfg_attr(docsrs, feature(doc_cfg))]
//! # chainbms_lib
//!
//! This crate coordinates a daisy-chained string of battery-monitoring
//! boards over a shared half-duplex serial bus: it discovers and assigns
//! bus addresses to unconfigured boards, retrieves calibrated
//! voltage/temperature telemetry, drives per-cell passive balancing and
//! aggregates per-module data into pack-level status.
//!
//! The core is transport-agnostic: everything talks to the bus through the
//! [`transport::Bus`] trait. Collaborators such as the console printer or
//! a CAN encoder consume the values exposed by [`pack::Pack`] and
//! [`report`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for
//!   compiling the `chainbms` command-line tool.
//! - `serialport`: Enables the synchronous serial implementation of the
//!   bus transport.
//! - `serde`: Enables `serde` support for telemetry and summary types.

/// Contains error types for the library.
mod error;
/// Per-module telemetry state and balancing.
pub mod module;
/// Pack-level enumeration and aggregation.
pub mod pack;
/// Wire format: framing, CRC, register map and reply decoding.
pub mod protocol;
/// Outward summary record encoding.
pub mod report;
/// Bus abstraction and the retrying framed transport.
pub mod transport;

pub use error::Error;

/// Serial port implementation of the bus transport.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serial;
