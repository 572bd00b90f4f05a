pub mod config;
pub mod cron;
pub mod error;
pub mod logstore;
pub mod master;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
