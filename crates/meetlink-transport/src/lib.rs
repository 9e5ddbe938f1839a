//! # meetlink-transport
//!
//! Protocol core of the meetlink media engine. No I/O lives here: the
//! engine crate owns sockets and tasks and drives these state machines.
//!
//! ## Crate structure
//!
//! - [`wire`]: Packet headers, frame types, channel names, stream framing
//! - [`fec`]: Reed-Solomon block coder, protection policy, receive assembler
//! - [`channel`]: Sequence counters, outbound backpressure queue, gap tracking
//! - [`reconnect`]: Connection state machine, backoff, failure classification
//! - [`clock`]: Per-publisher media timeline
//! - [`jitter`]: Config gating and A/V playout buffer
//! - [`stats`]: Channel, receiver and publisher counters

pub mod channel;
pub mod clock;
pub mod fec;
pub mod jitter;
pub mod reconnect;
pub mod stats;
pub mod wire;
