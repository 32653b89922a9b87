//! Storage backends for imghost.
//!
//! This crate provides a trait-based interface over the remote stores a user
//! can register (S3, Azure Blob, Google Cloud Storage, SFTP) and the factory
//! that builds a backend from a persisted provider record.
//!
//! # Design Principles
//! - Closed set of provider types, dispatched with an exhaustive match
//! - Backends are request-scoped and share no state with each other
//! - Client library errors are mapped to the common error taxonomy
//! - Required keys are validated before any client is constructed

pub mod azure;
pub mod backend;
pub mod factory;
pub mod gcs;
pub mod memory;
pub mod object_store;
pub mod requirements;
pub mod s3;
pub mod sftp;

pub use azure::AzureBackend;
pub use backend::{ByteStream, StorageBackend};
pub use factory::{BackendBuilder, BackendFactory};
pub use gcs::GcsBackend;
pub use memory::MemoryBackend;
pub use requirements::{check_config, check_keys, KeyRequirements};
pub use s3::S3Backend;
pub use sftp::{MemorySftp, RusshConnector, SftpBackend, SftpConnector};
