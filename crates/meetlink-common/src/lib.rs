//! Shared types for meetlink publishers and subscribers.
//!
//! This crate contains:
//! - **Decoder configs**: per-channel video/audio bootstrap parameters
//! - **Control messages**: JSON documents carried in `Config` and `Event` packets

pub mod protocol;
