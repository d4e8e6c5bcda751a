//! Build-farm controller: the central coordination service that admits
//! remote workers to claim mobile-app build jobs, tracks them through a
//! lifecycle, and hands back the produced artifact.
//!
//! Module boundaries mirror the component breakdown: Store, Artifact
//! Storage, Auth Gate, Queue Manager, Assignment Service, Heartbeat
//! Monitor, HTTP Surface.

pub mod artifact;
pub mod assignment;
pub mod auth;
pub mod config;
pub mod domain;
pub mod error;
pub mod heartbeat;
pub mod http;
pub mod queue;
pub mod state;
pub mod store;
