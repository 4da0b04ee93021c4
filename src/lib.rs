//! Warmgate - keeps a cold-started agent gateway looking warm
//!
//! This library provides the proxy that fronts a single gateway process
//! inside an ephemeral container:
//! - Probes the container's process table to tell whether the gateway is up
//! - Starts the gateway at most once under concurrent triggers
//! - Serves a loading page to browsers while the gateway boots
//! - Relays HTTP and WebSocket traffic, rewriting known gateway errors
//! - Restores and pushes the gateway's state against a durable backup

pub mod access;
pub mod admin;
pub mod backup;
pub mod config;
pub mod env;
pub mod error;
pub mod forward;
pub mod gate;
pub mod gateway_config;
pub mod pages;
pub mod probe;
pub mod proxy;
pub mod relay;
pub mod sandbox;
pub mod scheduler;
pub mod storage;
pub mod supervisor;
