//! Core orchestration logic for the protocol gateway: everything in
//! spec.md §4 except the wire codec (which lives in the sibling `protocol`
//! crate) and the transport (axum, in `gateway-server`).
//!
//! Module layout mirrors spec.md §2's "leaves first" component table:
//! wire codec -> connection -> context log -> generator adapter -> action
//! decider -> scheduler -> game state -> registry.

pub mod connection;
pub mod context;
pub mod decider;
pub mod error;
pub mod game;
pub mod generator;
pub mod registry;
pub mod scheduler;
pub mod timer;

pub use error::{GatewayError, Result};
pub use game::{ActionInstance, Game, GameHandle, GameState};
pub use registry::{ConflictPolicy, GameSummary, GeneratorFactory, Registry, RegistryConfig};
