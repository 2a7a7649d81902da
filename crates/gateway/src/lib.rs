//! HTTP surface and process bootstrap for the RunLoom engine.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod state;
