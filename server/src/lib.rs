//! Realtime connection and broadcast hub library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod chat;
pub mod config;
pub mod game;
pub mod notify;
pub mod repo;
pub mod routes;
pub mod state;
pub mod store;
pub mod voice;
pub mod ws;
