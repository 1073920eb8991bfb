//! almsgate: session lifecycle and role-based authorization for the
//! donation-booking platform. The identity module owns sessions and the
//! per-client auth state machine, guard enforces the route table at the
//! HTTP edge and at render time, and server ties both to the web surface.

pub mod config;
pub mod error;
pub mod guard;
pub mod identity;
pub mod policy;
pub mod profile;
pub mod recovery;
pub mod roles;
pub mod server;
