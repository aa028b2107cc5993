//! # Device Orchestration Server
//!
//! This library provides the authoritative server for the light-reaction
//! game. One device registers as the controller ("master"), the rest as
//! displays ("clients"). The server tracks every connection, runs the game
//! session and decides which display lights up, in what color, and when.
//!
//! ## Core Responsibilities
//!
//! ### Role Arbitration
//! A fresh connection must choose a role within ten seconds. Only one
//! controller may be registered at a time; a second attempt receives an
//! `error` frame and is disconnected while the first stays untouched.
//!
//! ### Game Session
//! The controller starts, pauses and stops the game. Starting carries the
//! pattern settings: an interval, a pattern kind and a color palette.
//!
//! ### Pattern Scheduling
//! Random, sequential and simultaneous patterns advance on a fixed-period
//! timer. The hit pattern is event driven: the next target lights up a
//! cooldown after the current one reports a hit.
//!
//! ## Architecture Design
//!
//! ### Single-Owner Event Loop
//! All mutable state lives in one [`hub::Hub`]. Connection tasks and timers
//! only post [`hub::HubEvent`]s into a channel; the main loop applies them
//! one at a time. No locks guard the registry or session because nothing
//! else can reach them.
//!
//! ### Explicit Timer Handles
//! The session holds at most one scheduled activation. Arming a new one
//! always cancels the previous one, and every tick carries a generation so
//! ticks that were already queued when their timer was cancelled are ignored.
//!
//! ## Module Organization
//!
//! - `config`: listen address and timing defaults
//! - `error`: per-connection error taxonomy
//! - `registry`: registered devices and controller exclusivity
//! - `arbiter`: pending connections and role-selection timeouts
//! - `broadcast`: outbound queues, broadcast and targeted sends
//! - `session`: idle/running/paused state machine and the timer handle
//! - `scheduler`: pattern selection algorithms and tick timers
//! - `hub`: event dispatch, command handling and hit relaying
//! - `network`: WebSocket listener and per-connection reader/writer tasks
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let server = Server::new(ServerConfig::default()).await?;
//!
//!     // Accepts connections until SIGINT or SIGTERM, then closes them all
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod arbiter;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod hub;
pub mod network;
pub mod registry;
pub mod scheduler;
pub mod session;
