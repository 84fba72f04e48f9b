//! Database entities.

#![allow(missing_docs)]

pub mod asset;
pub mod content_item;

pub use asset::Entity as Asset;
pub use content_item::Entity as ContentItem;
