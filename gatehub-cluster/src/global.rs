//! Process-wide accessor for legacy call sites.
//!
//! Compatibility shim only: components receive a `ClusterContext` explicitly.
//! The binary installs one at startup.

use std::sync::OnceLock;

use crate::context::ClusterContext;

static CONTEXT: OnceLock<ClusterContext> = OnceLock::new();

/// Install the process context. Fails with the rejected value if one is
/// already installed.
pub fn install(context: ClusterContext) -> Result<(), ClusterContext> {
    CONTEXT.set(context)
}

#[must_use]
pub fn get() -> Option<&'static ClusterContext> {
    CONTEXT.get()
}

#[must_use]
pub fn is_installed() -> bool {
    CONTEXT.get().is_some()
}
