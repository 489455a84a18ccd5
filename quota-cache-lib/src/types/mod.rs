#![allow(unreachable_pub)]

mod entity;
mod error;
mod identity;
mod upstream;

pub use entity::{
    BasicEntity, Detail, DetailLevel, Entity, Member, Profile, Relation, RelationRef,
    RelationSummary, sort_by_recency,
};
pub use error::ErrorKind;
pub use identity::{Identity, IdentityKey, RelationKey};
pub(crate) use upstream::Verdict;
pub use upstream::{QuotaHeaders, UpstreamRequest, UpstreamResponse};

/// The `quota_cache_lib` `Result` type
pub type Result<T> = std::result::Result<T, crate::ErrorKind>;
