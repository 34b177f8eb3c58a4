// SPDX-FileCopyrightText: 2023 Changgyoo Park <wvwwvwwv@me.com>
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{self, Debug, Display};

/// [`EntityId`] identifies a lockable logical resource, e.g., a namespace, a table, or a
/// partition.
///
/// An identifier is a path of segments from the coarsest container down to the resource itself,
/// and its textual form joins the segments with `.`.
///
/// # Examples
///
/// ```
/// use polylock::EntityId;
///
/// let partition = EntityId::from("public.orders.p1");
/// assert_eq!(partition.parent(), Some(EntityId::from("public.orders")));
/// assert_eq!(partition.to_string(), "public.orders.p1");
/// assert!(EntityId::from("public").is_ancestor_of(&partition));
/// ```
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct EntityId {
    segments: Vec<String>,
}

/// [`Granularity`] decides which containers have to be locked before an entity is locked.
///
/// Every returned container is locked in [`LockMode::Shared`](super::LockMode::Shared) before
/// the entity itself, so an exclusive lock on a container conflicts with any lock on entities
/// inside it.
pub trait Granularity: Debug + Send + Sync {
    /// Returns the containers of the entity, outermost first.
    fn ancestors(&self, entity: &EntityId) -> Vec<EntityId>;
}

/// [`Hierarchical`] treats every proper prefix of an [`EntityId`] as its container.
#[derive(Clone, Copy, Debug, Default)]
pub struct Hierarchical;

/// [`Flat`] locks entities independently of each other.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flat;

impl EntityId {
    /// Creates an [`EntityId`] from its path segments.
    ///
    /// # Examples
    ///
    /// ```
    /// use polylock::EntityId;
    ///
    /// let table = EntityId::new(["public", "orders"]);
    /// assert_eq!(table, EntityId::from("public.orders"));
    /// ```
    #[inline]
    pub fn new<I: IntoIterator<Item = S>, S: Into<String>>(segments: I) -> EntityId {
        EntityId {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the path segments.
    #[inline]
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the immediate container.
    #[inline]
    #[must_use]
    pub fn parent(&self) -> Option<EntityId> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(EntityId {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Returns every container, outermost first.
    #[inline]
    #[must_use]
    pub fn ancestors(&self) -> Vec<EntityId> {
        (1..self.segments.len())
            .map(|len| EntityId {
                segments: self.segments[..len].to_vec(),
            })
            .collect()
    }

    /// Returns `true` if `self` strictly contains `other`.
    #[inline]
    #[must_use]
    pub fn is_ancestor_of(&self, other: &EntityId) -> bool {
        self.segments.len() < other.segments.len() && other.segments.starts_with(&self.segments)
    }
}

impl Display for EntityId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl From<&str> for EntityId {
    #[inline]
    fn from(path: &str) -> Self {
        EntityId::new(path.split('.').filter(|s| !s.is_empty()))
    }
}

impl From<String> for EntityId {
    #[inline]
    fn from(path: String) -> Self {
        EntityId::from(path.as_str())
    }
}

impl Granularity for Hierarchical {
    #[inline]
    fn ancestors(&self, entity: &EntityId) -> Vec<EntityId> {
        entity.ancestors()
    }
}

impl Granularity for Flat {
    #[inline]
    fn ancestors(&self, _entity: &EntityId) -> Vec<EntityId> {
        Vec::new()
    }
}
