pub mod api;
pub mod app;
pub mod calendar;
pub mod cli;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod global;
pub mod notify;
pub mod queue;
pub mod scheduler;
pub mod session;

#[cfg(test)]
mod testing;
