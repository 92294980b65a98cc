//! CLI Commands

pub mod appliance;
pub mod config;
