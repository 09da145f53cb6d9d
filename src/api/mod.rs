//! HTTP control surface (§4.11): health, campaign listing, manual trigger,
//! status, and webhook ingestion.

mod server;
mod webhook;

pub use server::{serve, AppState, StatusObserver};
