//! `diagramd` — real-time collaborative diagram editing core for the
//! threat-modeling service.
//!
//! Module layout mirrors `clawd`'s daemon crate: a pure domain layer
//! (`diagram`, `processor`, `history`, `authz`) underneath the
//! concurrency/IO layer (`session`, `hub`, `janitor`, `server`), with
//! `config` and `error` shared across both.

pub mod authz;
pub mod config;
pub mod diagram;
pub mod error;
pub mod history;
pub mod hub;
pub mod janitor;
pub mod processor;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;
