//! GPU Cleanup Kubernetes Integration
//!
//! Provides the Kubernetes-backed cluster client used by the cleanup run.

pub mod client;

pub use client::{K8sClient, DEFAULT_PAGE_SIZE};
