//! Ingest pipeline stages, executed strictly in order:
//! ingest → reconcile → rule evaluation → status resolution → metrics.

pub mod ingest;
pub mod metrics;
pub mod reconciler;
pub mod reporter;
pub mod resolver;
