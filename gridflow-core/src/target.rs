//! Targets: what part of a resource an operation reads or writes.
//!
//! The orchestrator never interprets cell contents. It only needs to know
//! whether two targets touch the same data (for cache invalidation and write
//! ordering) and, for rectangular ranges, how to cover several of them with a
//! single fetch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Column bound used by [`GridRange::rows`] to mean "every column".
pub const ALL_COLUMNS: u32 = u32::MAX;

/// A rectangular, half-open range of cells on one sheet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridRange {
    pub sheet: String,
    pub start_row: u32,
    pub end_row: u32,
    pub start_col: u32,
    pub end_col: u32,
}

impl GridRange {
    /// Create a range from explicit row and column bounds.
    pub fn new(
        sheet: impl Into<String>,
        rows: std::ops::Range<u32>,
        cols: std::ops::Range<u32>,
    ) -> Self {
        Self {
            sheet: sheet.into(),
            start_row: rows.start,
            end_row: rows.end.max(rows.start),
            start_col: cols.start,
            end_col: cols.end.max(cols.start),
        }
    }

    /// Rows `[start, end)` across all columns.
    pub fn rows(sheet: impl Into<String>, start: u32, end: u32) -> Self {
        Self::new(sheet, start..end, 0..ALL_COLUMNS)
    }

    pub fn height(&self) -> u32 {
        self.end_row - self.start_row
    }

    pub fn width(&self) -> u32 {
        self.end_col - self.start_col
    }

    pub fn is_empty(&self) -> bool {
        self.height() == 0 || self.width() == 0
    }

    /// Number of cells covered (u64 so full-width ranges don't overflow).
    pub fn area(&self) -> u64 {
        self.height() as u64 * self.width() as u64
    }

    pub fn overlaps(&self, other: &GridRange) -> bool {
        self.sheet == other.sheet
            && !self.is_empty()
            && !other.is_empty()
            && self.start_row < other.end_row
            && other.start_row < self.end_row
            && self.start_col < other.end_col
            && other.start_col < self.end_col
    }

    pub fn contains(&self, other: &GridRange) -> bool {
        self.sheet == other.sheet
            && self.start_row <= other.start_row
            && other.end_row <= self.end_row
            && self.start_col <= other.start_col
            && other.end_col <= self.end_col
    }

    /// Smallest range covering both. Callers must check the sheets match.
    pub fn cover(&self, other: &GridRange) -> GridRange {
        GridRange {
            sheet: self.sheet.clone(),
            start_row: self.start_row.min(other.start_row),
            end_row: self.end_row.max(other.end_row),
            start_col: self.start_col.min(other.start_col),
            end_col: self.end_col.max(other.end_col),
        }
    }

    /// Distance between two ranges, measured as the larger of the row gap and
    /// the column gap. Overlapping or touching ranges have gap 0; ranges on
    /// different sheets have no gap at all.
    pub fn gap(&self, other: &GridRange) -> Option<u32> {
        if self.sheet != other.sheet {
            return None;
        }
        let row_gap = axis_gap(self.start_row, self.end_row, other.start_row, other.end_row);
        let col_gap = axis_gap(self.start_col, self.end_col, other.start_col, other.end_col);
        Some(row_gap.max(col_gap))
    }

    /// Shift the range by a signed offset, or `None` if it would leave the sheet.
    pub fn shifted(&self, rows: i64, cols: i64) -> Option<GridRange> {
        let shift = |v: u32, by: i64| -> Option<u32> { u32::try_from(v as i64 + by).ok() };
        let (start_col, end_col) = if self.end_col == ALL_COLUMNS {
            (self.start_col, ALL_COLUMNS)
        } else {
            (shift(self.start_col, cols)?, shift(self.end_col, cols)?)
        };
        Some(GridRange {
            sheet: self.sheet.clone(),
            start_row: shift(self.start_row, rows)?,
            end_row: shift(self.end_row, rows)?,
            start_col,
            end_col,
        })
    }
}

fn axis_gap(a_start: u32, a_end: u32, b_start: u32, b_end: u32) -> u32 {
    if b_start >= a_end {
        b_start - a_end
    } else if a_start >= b_end {
        a_start - b_end
    } else {
        0
    }
}

impl fmt::Display for GridRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.end_col == ALL_COLUMNS && self.start_col == 0 {
            write!(f, "{}!R[{}..{})", self.sheet, self.start_row, self.end_row)
        } else {
            write!(
                f,
                "{}!R[{}..{})C[{}..{})",
                self.sheet, self.start_row, self.end_row, self.start_col, self.end_col
            )
        }
    }
}

/// What an operation addresses inside a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// A rectangular cell range; the only target kind that can be merged.
    Range(GridRange),
    /// An opaque facet of the resource (properties, named ranges, ...).
    Selector(String),
    /// The whole resource.
    Whole,
}

impl Target {
    /// Whether a write to `self` may change what a read of `other` returns.
    ///
    /// Selectors are opaque, so they are assumed to touch every range of the
    /// same resource.
    pub fn overlaps(&self, other: &Target) -> bool {
        match (self, other) {
            (Target::Whole, _) | (_, Target::Whole) => true,
            (Target::Range(a), Target::Range(b)) => a.overlaps(b),
            (Target::Selector(a), Target::Selector(b)) => a == b,
            (Target::Selector(_), Target::Range(_)) | (Target::Range(_), Target::Selector(_)) => {
                true
            }
        }
    }

    pub fn as_range(&self) -> Option<&GridRange> {
        match self {
            Target::Range(range) => Some(range),
            _ => None,
        }
    }

    /// Canonical text used when fingerprinting.
    pub fn canonical(&self) -> String {
        match self {
            Target::Range(r) => format!(
                "range:{}:{}:{}:{}:{}",
                r.sheet, r.start_row, r.end_row, r.start_col, r.end_col
            ),
            Target::Selector(s) => format!("selector:{}", s),
            Target::Whole => "whole".to_string(),
        }
    }
}

impl From<GridRange> for Target {
    fn from(range: GridRange) -> Self {
        Target::Range(range)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Range(r) => write!(f, "{}", r),
            Target::Selector(s) => write!(f, "selector:{}", s),
            Target::Whole => write!(f, "*"),
        }
    }
}
