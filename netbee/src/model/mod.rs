//! Data model shared by the analyzers.
//!
//! - [`RawEvent`]: one kernel-probe event as delivered by the event source.
//! - [`DataGroup`]: one output record handed to downstream consumers.

pub mod event;
pub mod record;

pub use event::{Category, EventContext, FdInfo, L4Proto, NotSocketEvent, RawEvent, ThreadInfo};
pub use record::{AttrValue, AttributeMap, DataGroup};
