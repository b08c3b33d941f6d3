use crate::error::QueueError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Photos a single line may carry
pub const MAX_PHOTOS_PER_LINE: usize = 4;

/// Slots per category
pub const SLOTS_PER_CATEGORY: usize = 4;

/// Expense categories in their fixed display order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Train,
    Taxi,
    Fuel,
    Charge,
    Bus,
    CarWash,
    Toll,
    Other,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Train,
        Category::Taxi,
        Category::Fuel,
        Category::Charge,
        Category::Bus,
        Category::CarWash,
        Category::Toll,
        Category::Other,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Category::Train => "train",
            Category::Taxi => "taxi",
            Category::Fuel => "fuel",
            Category::Charge => "charge",
            Category::Bus => "bus",
            Category::CarWash => "carWash",
            Category::Toll => "toll",
            Category::Other => "other",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Category::Train => "Train",
            Category::Taxi => "Taxi",
            Category::Fuel => "Fuel",
            Category::Charge => "Charge",
            Category::Bus => "Bus",
            Category::CarWash => "Car Wash",
            Category::Toll => "Toll",
            Category::Other => "Other",
        }
    }
}

/// Reference to one photo of a line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PhotoRef {
    /// Stable remote retrieval reference
    Uploaded { url: String },
    /// Captured locally, payload lives in the blob cache
    Pending,
    /// Fresh capture still held in memory by a view; never serialized,
    /// the store moves the bytes into the blob cache on save
    #[serde(skip)]
    Captured(Vec<u8>),
}

impl PhotoRef {
    pub fn uploaded(url: impl Into<String>) -> Self {
        PhotoRef::Uploaded { url: url.into() }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            PhotoRef::Uploaded { url } => Some(url.as_str()),
            _ => None,
        }
    }

    pub fn is_unsynced(&self) -> bool {
        !matches!(self, PhotoRef::Uploaded { .. })
    }
}

/// One fixed line: category x slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub category: Category,
    /// 1-based slot within the category
    pub slot: u8,
    pub amount: f64,
    #[serde(default)]
    pub photos: Vec<PhotoRef>,
}

impl LineItem {
    fn empty(category: Category, slot: u8) -> Self {
        Self {
            category,
            slot,
            amount: 0.0,
            photos: Vec::new(),
        }
    }

    /// Stable key such as `carWash3`
    pub fn key(&self) -> String {
        format!("{}{}", self.category.key(), self.slot)
    }

    /// Display label such as `Car Wash 3`
    pub fn label(&self) -> String {
        format!("{} {}", self.category.label(), self.slot)
    }

    /// A line is in use when it has a positive amount or any photo
    pub fn has_content(&self) -> bool {
        let amount = if self.amount.is_finite() { self.amount } else { 0.0 };
        amount > 0.0 || !self.photos.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    Submitted,
}

/// Draft or submitted expense batch, the parent record photos attach to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseBatch {
    /// Client-generated id, stable for the whole offline lifetime
    pub local_id: String,
    /// Remote batch id, assigned once synced
    pub batch_id: Option<String>,
    pub driver_id: Option<String>,
    pub registration: Option<String>,
    pub status: BatchStatus,
    #[serde(default)]
    pub notes: String,
    pub lines: Vec<LineItem>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_saved: DateTime<Utc>,
}

impl ExpenseBatch {
    /// Creates an empty draft with all 32 lines in fixed order
    pub fn new() -> Self {
        Self {
            local_id: new_local_id(),
            batch_id: None,
            driver_id: None,
            registration: None,
            status: BatchStatus::Draft,
            notes: String::new(),
            lines: empty_lines(),
            last_saved: Utc::now(),
        }
    }

    /// Sum of all finite line amounts (NaN skipped), rounded to cents
    pub fn total(&self) -> f64 {
        let total: f64 = self
            .lines
            .iter()
            .map(|l| l.amount)
            .filter(|a| a.is_finite())
            .sum();
        (total * 100.0).round() / 100.0
    }

    /// Index of the first unused line of a category, scanning slots 1..=4 in
    /// order. `None` when every slot of the category is in use.
    pub fn first_empty_line(&self, category: Category) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| l.category == category && !l.has_content())
    }

    /// Index of the first unused line across all categories in fixed order
    pub fn first_empty_line_any(&self) -> Option<usize> {
        self.lines.iter().position(|l| !l.has_content())
    }

    pub fn used_lines(&self) -> Vec<&LineItem> {
        self.lines.iter().filter(|l| l.has_content()).collect()
    }

    pub fn used_line_count(&self) -> usize {
        self.lines.iter().filter(|l| l.has_content()).count()
    }

    /// Appends a photo to a line, enforcing the per-line maximum.
    /// Returns the photo index within the line.
    pub fn add_photo(&mut self, line: usize, photo: PhotoRef) -> Result<usize, QueueError> {
        let item = self
            .lines
            .get_mut(line)
            .ok_or_else(|| QueueError::Validation(format!("line {} out of range", line)))?;
        if item.photos.len() >= MAX_PHOTOS_PER_LINE {
            return Err(QueueError::Validation(format!(
                "{} already has {} photos",
                item.label(),
                MAX_PHOTOS_PER_LINE
            )));
        }
        item.photos.push(photo);
        Ok(item.photos.len() - 1)
    }

    /// Places a remote reference at (line, photo), padding with pending
    /// placeholders if the list is shorter. Writes beyond the per-line
    /// maximum are ignored.
    pub fn set_photo_url(&mut self, line: usize, photo: usize, url: &str) {
        if photo >= MAX_PHOTOS_PER_LINE {
            return;
        }
        if let Some(item) = self.lines.get_mut(line) {
            while item.photos.len() <= photo {
                item.photos.push(PhotoRef::Pending);
            }
            item.photos[photo] = PhotoRef::uploaded(url);
        }
    }

    /// Repairs a record coming from an older client: missing lines are
    /// added, non-finite amounts become 0, photo lists are truncated.
    pub fn normalize(&mut self) {
        let mut lines = empty_lines();
        for line in lines.iter_mut() {
            if let Some(src) = self
                .lines
                .iter()
                .find(|l| l.category == line.category && l.slot == line.slot)
            {
                line.amount = if src.amount.is_finite() { src.amount } else { 0.0 };
                line.photos = src.photos.clone();
                line.photos.truncate(MAX_PHOTOS_PER_LINE);
            }
        }
        self.lines = lines;
    }

    /// Moves in-memory captures out of the record, leaving `Pending`
    /// placeholders. Returns `(line, photo, bytes)` for each capture.
    pub fn detach_captures(&mut self) -> Vec<(usize, usize, Vec<u8>)> {
        let mut out = Vec::new();
        for (line_idx, line) in self.lines.iter_mut().enumerate() {
            for (photo_idx, photo) in line.photos.iter_mut().enumerate() {
                if let PhotoRef::Captured(_) = photo {
                    if let PhotoRef::Captured(bytes) = std::mem::replace(photo, PhotoRef::Pending) {
                        out.push((line_idx, photo_idx, bytes));
                    }
                }
            }
        }
        out
    }
}

impl Default for ExpenseBatch {
    fn default() -> Self {
        Self::new()
    }
}

/// All 32 lines, categories in fixed order, slots 1..=4
pub fn empty_lines() -> Vec<LineItem> {
    Category::ALL
        .iter()
        .flat_map(|c| (1..=SLOTS_PER_CATEGORY as u8).map(move |slot| LineItem::empty(*c, slot)))
        .collect()
}

pub fn new_local_id() -> String {
    format!("local_{}", ulid::Ulid::new())
}
