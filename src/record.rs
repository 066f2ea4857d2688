use std::fmt;
use std::sync::Arc;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Stable identity of a record. Caches and in-flight downloads are keyed
/// by it, never by the row position.
pub type RecordId = u64;

/// Decoded avatar image, cheap to clone.
#[derive(Clone)]
pub struct Avatar(Arc<DynamicImage>);

impl Avatar {
    pub fn new(image: DynamicImage) -> Self {
        Self(Arc::new(image))
    }

    pub fn image(&self) -> &DynamicImage {
        &self.0
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    /// Whether both handles point to the same decoded image.
    pub fn same_as(&self, other: &Avatar) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Avatar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Avatar({}x{})", self.width(), self.height())
    }
}

/// One row of the listing.
///
/// Only `id`, `avatar_url` and `login` are read from the wire, any other
/// field of the listing payload is ignored. The `image` is attached later
/// by the controller.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(rename = "avatar_url")]
    pub avatar_ref: String,
    #[serde(rename = "login")]
    pub display_name: String,
    #[serde(skip)]
    pub image: Option<Avatar>,
}

impl Record {
    pub fn new<S: Into<String>>(
        id: RecordId,
        avatar_ref: S,
        display_name: S,
    ) -> Self {
        Self {
            id,
            avatar_ref: avatar_ref.into(),
            display_name: display_name.into(),
            image: None,
        }
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Record {}

/// Pagination cursor: the `since` value of the next page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor {
    pub since: u64,
}

impl Cursor {
    /// The page following `count` already loaded records.
    pub fn after(count: usize) -> Self {
        Self {
            since: count as u64 + 1,
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "since={}", self.since)
    }
}
