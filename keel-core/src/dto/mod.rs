//! Data Transfer Objects for runner/coordinator communication
//!
//! This module contains the request and response bodies exchanged between the
//! runner and the coordinator. They wrap domain types with the identifiers the
//! coordinator needs to route them.

pub mod container;
pub mod environment;
pub mod job;
pub mod log;
pub mod stage;
