pub mod categorize;
pub mod connection;
pub mod consent;
pub mod dashboard;
pub mod database;
pub mod linker;
pub mod metrics;
pub mod store;
pub mod sync;
pub mod xs2a;
