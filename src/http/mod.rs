//! HTTP surface: the axum router and smart-HTTP request handlers.

pub mod handler;
