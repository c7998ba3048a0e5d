//! Domain layer: value types, session lifecycle and the ports the session
//! talks to.

pub mod credentials;
pub mod event;
pub mod flow;
pub mod ports;
pub mod product;
pub mod state;
