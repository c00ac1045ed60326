//! Common types for the Matrixon Client SDK
//!
//! This crate holds the error taxonomy shared by every part of the client
//! SDK. Keeping it in its own crate mirrors how the rest of the Matrixon
//! ecosystem separates its common types from service code.

pub mod error;

pub use error::{ClientError, RequestContext, Result};
