pub mod audit;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod error;
pub mod policy;
pub mod server;
pub mod sqlguard;
