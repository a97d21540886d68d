// Integration test crate: everything except `connection_test` runs against
// the in-memory broker.

mod client_flow;
mod config_test;
mod connection_test;
