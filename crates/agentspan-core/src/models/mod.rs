//! Data models for AgentSpan

mod attributes;
mod event;
mod span;

pub use attributes::*;
pub use event::*;
pub use span::*;
