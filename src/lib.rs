// ABOUTME: Library module for table-mover
// ABOUTME: Exports all core functionality for use in binary and tests

pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod migration;
pub mod staging;
pub mod table;
pub mod utils;
