//! Oracle Coordinator Library
//!
//! Bridges on-chain data requests and off-chain fetchers: requests are
//! recorded in a ledger, fetched by independent node agents, aggregated
//! into one consensus value and delivered back exactly once.

pub mod aggregator;
pub mod app_state;
pub mod callback;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetcher;
pub mod gateway;
pub mod handlers;
pub mod ledger;
pub mod models;
pub mod node;
pub mod retry;
pub mod routes;
pub mod time;
pub mod treasury;
