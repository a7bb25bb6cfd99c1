//! Integration tests for the delivery engine

#[path = "integration/helpers.rs"]
mod helpers;

#[path = "integration/batching.rs"]
mod batching;

#[path = "integration/downstream_client.rs"]
mod downstream_client;

#[path = "integration/lifecycle.rs"]
mod lifecycle;
