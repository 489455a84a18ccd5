//! Models of the upstream subject at the different detail levels cached by
//! the tiers of [`crate::TieredLookupService`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{IdentityKey, RelationKey};

/// Complete state of an upstream subject, as returned by the entity endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Canonical key of the subject
    pub key: IdentityKey,
    /// Current display name
    pub name: String,
    /// Unix timestamp (milliseconds) of the last activity
    #[serde(default)]
    pub last_active: Option<i64>,
    /// Lightweight, non-authoritative references to the subject's relations.
    /// `None` if the upstream did not send a list, which is not the same as
    /// an empty list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<RelationRef>>,
    /// Everything else the upstream reports about the subject
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

/// A small denormalized summary of an [`Entity`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicEntity {
    /// Canonical key of the subject
    pub key: IdentityKey,
    /// Current display name
    pub name: String,
    /// Unix timestamp (milliseconds) of the last activity
    pub last_active: Option<i64>,
    /// Lightweight copy of the subject's relations, if the upstream sent any
    pub relations: Option<Vec<RelationRef>>,
}

impl From<&Entity> for BasicEntity {
    fn from(entity: &Entity) -> Self {
        Self {
            key: entity.key.clone(),
            name: entity.name.clone(),
            last_active: entity.last_active,
            relations: entity.relations.clone(),
        }
    }
}

/// A reference to a relation embedded in an entity payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRef {
    /// Key of the relation
    pub key: RelationKey,
    /// Display name of the relation, if the upstream sent one
    #[serde(default)]
    pub name: Option<String>,
}

/// A member of a [`Relation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Key of the member subject
    pub key: IdentityKey,
    /// Unix timestamp (milliseconds) of the member's last activity in the relation
    #[serde(default)]
    pub last_active: Option<i64>,
}

/// Authoritative state of a sub-entity shared by one or more subjects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Key of the relation
    pub key: RelationKey,
    /// Display name of the relation
    #[serde(default)]
    pub name: Option<String>,
    /// Subjects taking part in the relation
    #[serde(default)]
    pub members: Vec<Member>,
    /// Everything else the upstream reports about the relation
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Relation {
    /// Summarize the relation from the point of view of `owner`.
    ///
    /// The recency of the summary is the owner's own last activity in the
    /// relation. If the owner is not listed as a member, the most recent
    /// activity of any member is used.
    #[must_use]
    pub fn summary_for(&self, owner: &IdentityKey) -> RelationSummary {
        let last_active = self
            .members
            .iter()
            .find(|member| &member.key == owner)
            .and_then(|member| member.last_active)
            .or_else(|| self.members.iter().filter_map(|m| m.last_active).max());

        RelationSummary {
            key: self.key.clone(),
            name: self.name.clone(),
            last_active,
            members: Some(self.members.len()),
        }
    }
}

/// An entry of a relation index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSummary {
    /// Key of the relation
    pub key: RelationKey,
    /// Display name of the relation
    pub name: Option<String>,
    /// Recency used to order the index, most recent first
    pub last_active: Option<i64>,
    /// Number of members, `None` for lightweight copies
    pub members: Option<usize>,
}

impl From<&RelationRef> for RelationSummary {
    fn from(reference: &RelationRef) -> Self {
        Self {
            key: reference.key.clone(),
            name: reference.name.clone(),
            last_active: None,
            members: None,
        }
    }
}

/// Sort relation summaries by recency, most recently active first.
/// Entries without any recency go last and keep their relative order.
pub fn sort_by_recency(summaries: &mut [RelationSummary]) {
    summaries.sort_by_key(|summary| std::cmp::Reverse(summary.last_active));
}

/// Which detail level of a subject to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum DetailLevel {
    /// The cheap, long-lived projection
    Basic,
    /// The complete, short-lived state
    Full,
}

/// A subject at the detail level the caller asked for
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "level", content = "entity", rename_all = "lowercase")]
pub enum Detail {
    /// Projection served from the basic tier
    Basic(BasicEntity),
    /// Complete state served from the full tier
    Full(Entity),
}

impl Detail {
    /// Canonical key of the subject
    #[must_use]
    pub const fn key(&self) -> &IdentityKey {
        match self {
            Self::Basic(basic) => &basic.key,
            Self::Full(entity) => &entity.key,
        }
    }

    /// Display name of the subject
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Basic(basic) => &basic.name,
            Self::Full(entity) => &entity.name,
        }
    }

    /// The lightweight relation references carried by the subject
    #[must_use]
    pub fn relations(&self) -> Option<&[RelationRef]> {
        match self {
            Self::Basic(basic) => basic.relations.as_deref(),
            Self::Full(entity) => entity.relations.as_deref(),
        }
    }

    /// Detail level of this value
    #[must_use]
    pub const fn level(&self) -> DetailLevel {
        match self {
            Self::Basic(_) => DetailLevel::Basic,
            Self::Full(_) => DetailLevel::Full,
        }
    }
}

/// Result of [`crate::TieredLookupService::lookup`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    /// The subject at the requested detail level
    pub detail: Detail,
    /// Relation summaries, if they were requested
    pub relations: Option<Vec<RelationSummary>>,
}
