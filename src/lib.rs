#![forbid(unsafe_code)]

//! Local web front-end that hands media URLs to `yt-dlp` and gives the
//! resulting file back to the browser exactly once.
//!
//! The binary in `src/bin/lumina.rs` wires these modules together; they are
//! exposed from the library so the integration tests can drive a real server.

pub mod bootstrap;
pub mod config;
pub mod downloads;
pub mod error;
pub mod logging;
pub mod server;
pub mod ytdlp;
