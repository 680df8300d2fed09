//! # Repository Module
//!
//! ## Available Repositories
//!
//! - [`BufferRepository`](buffer::BufferRepository) - Durable telemetry buffer
//!   (append, mark in flight, ack, requeue, eviction)
//! - [`CredentialRepository`](credentials::CredentialRepository) - Credential
//!   store with version-guarded merges and tombstones

pub mod buffer;
pub mod credentials;
