//! Repositories.

mod asset;
mod content_item;

pub use asset::AssetRepository;
pub use content_item::ContentItemRepository;
