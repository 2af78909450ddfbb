pub mod config;
pub mod content;
pub mod error;
pub mod logging;
pub mod models;
pub mod planner;
pub mod provider;
pub mod repository;
pub mod service;
pub mod supervisor;

pub use config::Config;
pub use error::{Error, Result};
