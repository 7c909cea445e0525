pub mod backup;
pub mod config;
pub mod db;
pub mod docker;
pub mod error;
pub mod instance;
pub mod state;
