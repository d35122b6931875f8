//! meek_server — HTTP lifecycle surface and background-service wiring for
//! the meek control plane.

pub mod error;
pub mod handlers;
pub mod market;
pub mod probe;
pub mod router;
pub mod runtime;
pub mod state;
