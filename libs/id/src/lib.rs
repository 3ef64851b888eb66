//! # tf-id
//!
//! Typed identifiers used by the scheduler.
//!
//! ## ID Format
//!
//! Invocation ids use a prefixed format: `{prefix}_{ulid}`, for example
//! `inv_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix keeps ids of different kinds
//! from being mixed up in logs and APIs; the ULID makes them sortable by
//! creation time.
//!
//! Command ids are small sequential integers handed out by the scheduler, so
//! operators can refer to them from a console (`Command 3: ...`).

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
