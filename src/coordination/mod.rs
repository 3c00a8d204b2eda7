//! In-process per-fingerprint coordination.
//!
//! Provides shared/exclusive leases over individual mirrors and a
//! singleflight group that coalesces concurrent upstream synchronizations
//! for the same fingerprint. All state lives in process memory and is
//! reconstructed empty on start; the filesystem tree is partitioned by
//! fingerprint so operations on disjoint mirrors never conflict.

pub mod flight;
pub mod leases;
