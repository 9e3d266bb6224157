//! Realtime session sync for party games: a relay server, a client that keeps
//! a game's state in sync across devices, and the letter and picture rule
//! engines built on top of it.

pub mod backend;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod games;
pub mod protocol;
pub mod relay;
pub mod retry;
pub mod session;
pub mod storage;
pub mod types;
pub mod word_cache;
pub mod ws;

pub use error::{Error, Result};
