pub mod entity;
pub mod guid;
pub mod policy;
pub mod types;

pub use entity::StateEntity;
pub use guid::{GuidMap, GuidNamespace, GuidValue};
pub use types::MediaKind;
