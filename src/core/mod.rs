//! Domain core: identity, rules, persistence.

pub mod error;
pub mod fingerprint;
pub mod groups;
pub mod hash;
pub mod rules;
pub mod store;
pub mod time;
pub mod types;
