//! # place-server — binaries for the shared pixel canvas
//!
//! - `placed` serves viewers over WebSocket on top of a RocksDB log
//! - `place-rebuild` replays the log offline and can export a snapshot
//!   that `placed --warm-from` loads at startup
//!
//! ## Modules
//!
//! - [`cli`] — flags, environment fallbacks and their mapping onto the
//!   library configuration types

pub mod cli;
