//! Keel Core
//!
//! Core types and abstractions for the Keel CI/CD runner.
//!
//! This crate contains:
//! - Domain types: Jobs, pipeline specs, containers and their states
//! - DTOs: Request bodies exchanged between the runner and the coordinator

pub mod domain;
pub mod dto;
