pub mod config;
pub mod connectors;
pub mod coordination;
pub mod extract;
pub mod image;
pub mod indexing;
pub mod permissions;
pub mod scheduler;
pub mod utils;
pub mod worker;
