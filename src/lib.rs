//! Newsdesk API - backend for a single news site
//!
//! Serves an aggregated RSS feed and a handful of JSON-file-backed
//! collections (articles, feed sources, services, special offers and
//! feature toggles), plus a single-administrator login.

pub mod aggregator;
pub mod auth;
pub mod config;
pub mod crud;
pub mod error;
pub mod routes;
pub mod store;
