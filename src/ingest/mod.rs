//! Ingest client (§4.3): the server-side per-session coordinator. Owns the
//! control connection, spawns one subclient per probe, operates the
//! readiness barrier, merges subclient results, and drives the optional
//! file-upload phase.

pub mod client;
pub mod merge;

pub use client::{run_control_session, ControlSessionOutcome};
pub use merge::{merge, MergedOutput};
