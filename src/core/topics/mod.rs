//! Topic filters, wildcard matching and the retained message store.

pub mod matcher;
pub mod retained;

pub use matcher::{filtered, matches, TopicError, TopicMatcher, WildcardPolicy};
pub use retained::RetainedStore;
