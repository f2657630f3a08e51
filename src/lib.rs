pub mod cli;
pub mod daemon;
pub mod errors;
pub mod fetcher;
pub mod installer;
pub mod models;
pub mod notify;
pub mod orchestrator;
pub mod remote;
pub mod server;
pub mod storage;
