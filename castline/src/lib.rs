//! # castline: live-video publisher
//!
//! Feeds a synthetic colour-bar source through the castline streaming
//! core and publishes it to an ingest server, or to an in-process relay
//! for local testing.
//!
//! Status changes are printed to stdout as one JSON object per line;
//! logs go to stderr.

pub mod config;
pub mod pattern;
pub mod service;
