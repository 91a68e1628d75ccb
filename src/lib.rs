// Public API - only expose the runner module
pub mod runner;

// Internal modules - organized by subsystem
mod catalog;
mod config;
mod coordination;
mod db;
mod formats;
mod telemetry;

#[cfg(test)]
mod integ_tests;
