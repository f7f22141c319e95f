//! Library crate for cue-timer-sync: keeps a local countdown in step with an
//! authoritative timer pushed over a reconnecting event channel.

pub mod config;
pub mod dao;
pub mod dto;
pub mod error;
pub mod services;
pub mod state;
