// ABOUTME: Library module for seren-table-migrator
// ABOUTME: Exports all core functionality for use in binary and tests

pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod error;
pub mod interactive;
pub mod orchestrator;
pub mod postgres;
pub mod progress;
pub mod providers;
pub mod resolver;
pub mod schema;
pub mod strategy;
pub mod utils;
pub mod watchdog;
