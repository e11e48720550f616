//! Delay Cascade - broker-native delayed delivery
//!
//! Delays messages on a plain topic-routing broker using a binary cascade of
//! TTL queues: one queue per bit of the delay, each holding messages for
//! `2^level` seconds before dead-lettering them one level down. No scheduler
//! process and no timer table; the broker's own durable queues hold the wait.

pub mod broker;
pub mod config;
pub mod delay;
pub mod gate;
pub mod migration;
pub mod startup;
pub mod topology;
pub mod utils;
