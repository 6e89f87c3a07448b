pub mod calculator;
pub mod constants;
pub mod db;
pub mod framing;
pub mod handlers;
pub mod hardening;
pub mod health;
pub mod history;
pub mod ingress;
pub mod logging;
pub mod main_helper;
pub mod models;
pub mod persist;
pub mod redaction_layer;
pub mod search;
pub mod store;
pub mod str_utils;
pub mod streaming;
pub mod trace_layer;
pub mod types;
pub mod upstream;

pub use types::*;

pub use main_helper::{AppState, Args};
