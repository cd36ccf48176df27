//! JSON-RPC 2.0 wire layer shared by the machine dispatch engine.
//!
//! Nothing in here touches a socket: this crate classifies and builds
//! messages, carries the fixed error codes, and frames complete JSON values
//! out of an arbitrarily chunked byte stream.

#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(trivial_casts)]
#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(unused_qualifications)]

pub mod error;
pub mod framing;
pub mod message;

pub use error::{ErrorCode, ErrorObject};
pub use framing::JsonReader;
pub use message::{Message, Request, Response};

/// Value of the `jsonrpc` member carried by every message.
pub const VERSION: &str = "2.0";
