//! # Services
//!
//! Business logic shared by the HTTP handlers and the collector. Services take
//! their collaborators explicitly and return [`crate::error::ApiError`].

pub mod chat;
pub mod chunking;
pub mod company;
pub mod health;
pub mod meeting;
pub mod rag;
pub mod slack;
pub mod teams;
