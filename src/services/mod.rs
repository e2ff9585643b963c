//! Provisioning workflow services
//!
//! Each step of a session lives in its own service so it can be tested against
//! mocked collaborators.

pub mod credentials;
pub mod network;
pub mod provisioning;
pub mod transfer;
