pub mod causal;
pub mod cli;
pub mod codec;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod entry;
pub mod error;
pub mod roster;
pub mod transport;
