//! Observer-facing types.
//!
//! Everything here derives `serde::Serialize` + `serde::Deserialize` so a
//! host can forward it as JSON (the `hark` binary prints it, a UI would emit
//! it over its own event bus).

pub mod events;
