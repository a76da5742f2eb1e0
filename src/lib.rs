pub mod address;
pub mod agent;
pub mod balance;
pub mod chain;
pub mod config;
pub mod dao;
pub mod error;
pub mod exchange;
pub mod model;
pub mod nonce;
pub mod output;
pub mod store;
pub mod token_cache;
