//! Configuration layer for faultline.
//!
//! Loads layered configuration (files, then `FAULTLINE__*` environment
//! variables), resolves each command's [`ExecutionMetadata`] from its
//! programmatic defaults, and forwards live property changes to the
//! engine's registry.
//!
//! # Example
//!
//! ```no_run
//! use faultline_config::{ConfigSource, MetadataResolver};
//! use faultline_core::{CommandId, ExecutionMetadata, RetryConfig};
//!
//! # fn example() -> Result<(), faultline_core::ConfigError> {
//! let source = ConfigSource::load(&["config/faultline.toml"], Some("FAULTLINE"))?;
//! let defaults = ExecutionMetadata::new(CommandId::new("users", "lookup"))
//!     .with_retry(RetryConfig::default());
//! let metadata = MetadataResolver::new(&source).resolve(&defaults)?;
//! # Ok(())
//! # }
//! ```
//!
//! [`ExecutionMetadata`]: faultline_core::ExecutionMetadata

pub mod key;
pub mod resolver;
pub mod source;
pub mod watch;

pub use key::{PropertyKey, Scope, ROOT};
pub use resolver::MetadataResolver;
pub use source::ConfigSource;
pub use watch::{apply_update, PropertyUpdate, WatchSettings};
