#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod error;
pub mod signal;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Environment variable holding the bearer token used by the demos.
pub const TOKEN_VAR: &str = "SHOPFLOOR_TOKEN";

/// Environment variable holding the page origin (e.g. `https://floor.example.com`) the demos
/// derive the socket endpoint from.
pub const ORIGIN_VAR: &str = "SHOPFLOOR_ORIGIN";

/// Timestamp in seconds since [`std::time::UNIX_EPOCH`]
pub(crate) type Timestamp = i64;
