//! Domain types - core business entities
//!
//! Documents and configuration shared by every component. These types are
//! independent of how components persist state or talk to the network.

pub mod config;
pub mod document;
