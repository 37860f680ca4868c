//! Embedded templates.

/// Default `leasehold.toml`, written by `leasehold init`.
pub(crate) const LEASEHOLD_TOML: &str = include_str!("leasehold.toml");
