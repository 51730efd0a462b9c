//! WebSocket chat room with an exchange-rate lookup command.
//!
//! Clients connect to `/ws`, and every line they send is relayed to everyone
//! in the room as `<name>: <text>`. `exchange [days]` fetches currency rates
//! and broadcasts them instead. Modules, leaf-first:
//!
//! - [`command`] classifies inbound lines.
//! - [`rates`] holds the rate data model and the HTTP provider.
//! - [`audit`] appends executed exchange commands to a file.
//! - [`exchange`] range-checks queries and shapes provider data.
//! - [`registry`] tracks live connections.
//! - [`broadcast`] fans messages out over a registry snapshot.
//! - [`session`] runs the per-connection loop.
//! - [`server`] binds the listener and upgrades HTTP requests to sessions.
//! - [`cli`] and [`client`] provide the command-line front end.

pub mod audit;
pub mod broadcast;
pub mod cli;
pub mod client;
pub mod command;
pub mod exchange;
pub mod rates;
pub mod registry;
pub mod server;
pub mod session;
