//! Event distribution: broadcast bus plus filtered waiters.

pub mod router;

pub use router::EventRouter;
