//! Standalone host for a single netplay room

pub mod server;
