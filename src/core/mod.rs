pub mod browser;
pub mod config;
pub mod jobs;
pub mod lifecycle;
pub mod runner;
pub mod schedule;
pub mod terminal;
pub mod vision;
