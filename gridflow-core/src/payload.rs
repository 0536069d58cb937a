//! Opaque operation payloads and range slicing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::target::GridRange;

/// Data carried by a write or returned by a read.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "data")]
pub enum Payload {
    #[default]
    Empty,
    /// Row-major cell values. Rows may be shorter than the range width and
    /// the grid may hold fewer rows than the range height (trailing empties
    /// trimmed by the upstream).
    Values(Vec<Vec<Value>>),
    /// Anything that is not a cell grid.
    Json(Value),
}

impl Payload {
    pub fn values(rows: Vec<Vec<Value>>) -> Self {
        Payload::Values(rows)
    }

    pub fn as_values(&self) -> Option<&[Vec<Value>]> {
        match self {
            Payload::Values(rows) => Some(rows),
            _ => None,
        }
    }

    /// Extract the part of a result fetched for `cover` that belongs to `part`.
    ///
    /// Returns `None` when `part` is not inside `cover` or the payload is not a
    /// cell grid.
    pub fn slice(&self, cover: &GridRange, part: &GridRange) -> Option<Payload> {
        if !cover.contains(part) {
            return None;
        }
        if cover == part {
            return Some(self.clone());
        }
        let rows = self.as_values()?;

        let row_offset = (part.start_row - cover.start_row) as usize;
        let col_offset = (part.start_col - cover.start_col) as usize;
        let height = part.height() as usize;
        let width = part.width() as usize;

        let sliced = rows
            .iter()
            .skip(row_offset)
            .take(height)
            .map(|row| row.iter().skip(col_offset).take(width).cloned().collect())
            .collect();

        Some(Payload::Values(sliced))
    }

    /// Stable serialized form used in fingerprints.
    pub fn canonical(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grid(rows: std::ops::Range<u32>, cols: u32) -> Payload {
        Payload::Values(
            rows.map(|r| (0..cols).map(|c| json!(format!("{}:{}", r, c))).collect())
                .collect(),
        )
    }

    #[test]
    fn test_slice_rows() {
        let cover = GridRange::rows("S", 0, 15);
        let data = grid(0..15, 2);

        let part = data.slice(&cover, &GridRange::rows("S", 5, 15)).unwrap();
        let rows = part.as_values().unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0][0], json!("5:0"));
        assert_eq!(rows[9][1], json!("14:1"));
    }

    #[test]
    fn test_slice_columns() {
        let cover = GridRange::new("S", 0..4, 0..4);
        let data = grid(0..4, 4);

        let part = data.slice(&cover, &GridRange::new("S", 1..3, 2..4)).unwrap();
        assert_eq!(
            part,
            Payload::Values(vec![
                vec![json!("1:2"), json!("1:3")],
                vec![json!("2:2"), json!("2:3")],
            ])
        );
    }

    #[test]
    fn test_slice_tolerates_trimmed_rows() {
        let cover = GridRange::rows("S", 0, 10);
        let data = grid(0..3, 1);

        let part = data.slice(&cover, &GridRange::rows("S", 2, 6)).unwrap();
        assert_eq!(part.as_values().unwrap().len(), 1);
    }

    #[test]
    fn test_slice_outside_cover() {
        let cover = GridRange::rows("S", 0, 10);
        assert!(grid(0..10, 1).slice(&cover, &GridRange::rows("S", 5, 20)).is_none());
        assert!(Payload::Json(json!({"a": 1}))
            .slice(&cover, &GridRange::rows("S", 0, 5))
            .is_none());
    }
}
