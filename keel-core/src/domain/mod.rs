//! Core domain types
//!
//! This module contains the core domain structures used across Keel.
//! They are shared between the coordinator client (for transport) and the
//! runner (for execution).

pub mod container;
pub mod job;
pub mod log;
pub mod pipeline;
pub mod stage;
