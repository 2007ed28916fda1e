// ABOUTME: PostgreSQL connection helpers shared by the PostgreSQL source and target
// ABOUTME: Exports TLS-enabled connect and retrying connect

pub mod connection;

pub use connection::{connect, connect_with_retry};
