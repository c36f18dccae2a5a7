//! bci-hub - Control center for networked BCI lab rigs
//!
//! This library provides the hub that authenticates rig components,
//! estimates each one's clock offset, and routes timestamped letters
//! between them, plus the client used by those components.

pub mod hub;

pub use hub::{ClientConfig, HubClient, HubConfig, HubServer, Letter};
