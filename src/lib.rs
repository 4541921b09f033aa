//! # Marketplace Broker
//!
//! This crate implements a distributed electronic marketplace broker: a
//! single authoritative TCP server through which registered **sellers**
//! offer time-limited sales of a fixed catalog of goods and registered
//! **buyers** purchase from them. All inventory state lives in the broker;
//! clients only ever see immutable snapshots of it.
//!
//! ## Features
//!
//! - Per-seller stock ledgers seeded at registration and conserved across
//!   sale start, purchase, and reclaim.
//! - Time-limited sales (60 seconds) with a background expiry sweeper that
//!   returns unsold quantity to the seller.
//! - Atomic check-and-decrement purchases; two buyers racing for the last
//!   unit see exactly one success.
//! - Role-based message dispatch over persistent connections (BUYER vs
//!   SELLER), with role violations answered and survived.
//! - Asynchronous broadcast fan-out of stock updates, sale lifecycle
//!   events, and purchase notifications; a slow recipient never stalls the
//!   others.
//! - Keep-alive monitoring and graceful shutdown.
//!
//! ## Architecture Overview
//!
//! The crate is organized into several modules:
//!
//! - [`catalog`] — The fixed set of tradable goods.
//! - [`sale`] — A single time-limited offer and its wire snapshot.
//! - [`ledger`] — Per-seller stock bookkeeping.
//! - [`market`] — Authoritative state: sales, ledgers, the expiry sweeper.
//! - [`message`] — The wire envelope and length-prefixed JSON framing.
//! - [`registry`] — Connected sessions and their per-session writers.
//! - [`broadcast`] — Market events and the broadcast dispatcher.
//! - [`session`] — The per-connection handshake and dispatch loop.
//! - [`server`] — The TCP accept loop and lifecycle wiring.
//! - [`defs`] — Shared constants and timing parameters.
//! - [`errors`] — Error types used across modules.
//!
//! ## Wire Protocol
//!
//! Each frame is a 4-byte big-endian length followed by one JSON message
//! envelope: `{"type", "data", "senderId", "timestamp"}`. A client's first
//! frame must be `REGISTER` with a `clientType` of `BUYER` or `SELLER`; the
//! broker answers `ACK` with the assigned `clientId`. After that, sellers
//! drive `SALE_START`/`SALE_END`, buyers drive `BUY_REQUEST`, and both may
//! send `LIST_ITEMS` and `HEARTBEAT`. The broker pushes `STOCK_UPDATE` to
//! buyers, `SALE_START`/`SALE_END` announcements to everyone, and
//! `PURCHASE_NOTIFICATION` to the seller whose sale was purchased from.
//!
//! ## Example: Running the Broker
//!
//! ```no_run
//! use std::sync::Arc;
//! use market_broker::market::Market;
//! use market_broker::server::MarketServer;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let market = Arc::new(Market::new());
//!
//!     // Binds the listener and starts the sweeper and dispatcher.
//!     let server = MarketServer::new("127.0.0.1:5000", market)?;
//!
//!     // Blocks accepting connections until `shutdown` is called.
//!     server.start()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unreachable_pub)]

pub mod broadcast;
pub mod catalog;
pub mod defs;
pub mod errors;
pub mod ledger;
pub mod market;
pub mod message;
pub mod registry;
pub mod sale;
pub mod server;
pub mod session;
