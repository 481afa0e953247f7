//! Taskview Entity - ids, fields and normalization
//!
//! Provides the entity vocabulary shared by every view cache:
//! - [`EntityId`]: server id or client placeholder ([`TempId`])
//! - [`Field`] / [`FieldValue`]: primary and denormalized task fields
//! - [`RawEntity`]: the backend shape, with optional embedded relations
//! - [`ViewEntity`]: the flattened projection stored in view caches
//! - [`Normalizer`]: raw shape → view entity, pure and deterministic
//!
//! # Example
//!
//! ```rust,ignore
//! use taskview_entity::{Field, FieldMap, FieldValue, Normalizer, RawEntity};
//!
//! let raw = RawEntity::new(42, FieldMap::from([(Field::Title, FieldValue::text("Ship"))]));
//! let entity = Normalizer::default().normalize(&raw, None)?;
//! assert!(!entity.id.is_temp());
//! ```

#![warn(missing_docs)]
#![warn(unreachable_pub)]

mod directory;
mod error;
mod field;
mod id;
mod normalize;
mod raw;
mod view_entity;

pub use directory::RelationDirectory;
pub use error::NormalizeError;
pub use field::{Field, FieldMap, FieldValue};
pub use id::{EntityId, TempId, UserId};
pub use normalize::Normalizer;
pub use raw::{RawEntity, RawProject, RawStatus, RawUser};
pub use view_entity::ViewEntity;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
