pub mod capabilities;
pub mod clock;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod history;
pub mod identifier;
pub mod models;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod worker;
