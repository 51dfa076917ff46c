//! # InterHub Library
//!
//! Multi-tenant knowledge hub: company onboarding through Azure AD B2C,
//! per-tenant document storage and retrieval-augmented chat, and Slack and
//! Teams front ends over the same answer pipeline.

pub mod auth;
pub mod clients;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod scheduler;
pub mod server;
pub mod services;
pub mod telemetry;
pub mod webhook_verification;

#[cfg(test)]
mod test_support;

pub use migration;
