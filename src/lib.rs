pub mod bluetooth;
pub mod command;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod services;
