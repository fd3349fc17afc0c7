//! Per-box neighbour tables.
//!
//! Row `i` of a [`ContextTable`] lists up to `n_context` flat indices of boxes
//! in the same batch that are neighbours of box `i`. Unused slots hold
//! [`NO_CONTEXT`]. A neighbour must belong to the same image as the box that
//! refers to it.

use crate::collate::BoxBatch;
use crate::error::{Result, WebToolsError};

/// Marks an empty neighbour slot.
pub const NO_CONTEXT: i64 = -1;

/// Fixed-width neighbour index table, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextTable {
    indices: Vec<i64>,
    n_context: usize,
}

impl ContextTable {
    pub fn new(indices: Vec<i64>, n_context: usize) -> Result<Self> {
        if n_context == 0 {
            return Err(WebToolsError::Context(
                "n_context must be at least 1".to_string(),
            ));
        }
        if indices.len() % n_context != 0 {
            return Err(WebToolsError::Context(format!(
                "{} indices do not form rows of width {}",
                indices.len(),
                n_context
            )));
        }
        Ok(Self { indices, n_context })
    }

    pub fn from_rows(rows: &[Vec<i64>]) -> Result<Self> {
        let n_context = rows.first().map(|r| r.len()).unwrap_or(1);
        if let Some(i) = rows.iter().position(|r| r.len() != n_context) {
            return Err(WebToolsError::Context(format!(
                "row {i} has {} slots, expected {n_context}",
                rows[i].len()
            )));
        }
        Self::new(rows.concat(), n_context)
    }

    /// For every box, its `n_context` closest other boxes of the same image by
    /// centre distance (ties broken by flat index), padded with [`NO_CONTEXT`].
    pub fn nearest(batch: &BoxBatch, n_context: usize) -> Result<Self> {
        let boxes = batch.boxes();
        let mut indices = Vec::with_capacity(boxes.len() * n_context);

        for range in batch.sample_ranges() {
            for i in range.clone() {
                let mut others: Vec<(f32, usize)> = range
                    .clone()
                    .filter(|&j| j != i)
                    .map(|j| (boxes[i].center_distance_sq(&boxes[j]), j))
                    .collect();
                others.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

                let row_start = indices.len();
                indices.extend(others.iter().take(n_context).map(|&(_, j)| j as i64));
                indices.resize(row_start + n_context, NO_CONTEXT);
            }
        }

        Self::new(indices, n_context)
    }

    pub fn n_boxes(&self) -> usize {
        self.indices.len() / self.n_context
    }

    pub fn n_context(&self) -> usize {
        self.n_context
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.indices
    }

    pub fn row(&self, i: usize) -> &[i64] {
        &self.indices[i * self.n_context..(i + 1) * self.n_context]
    }

    /// Check the table against the owning image of every box in the batch.
    ///
    /// Rejects a row count that differs from the box count, indices outside
    /// `[-1, n_boxes)`, and neighbours owned by a different image.
    pub fn validate(&self, owners: &[usize]) -> Result<()> {
        let n = owners.len();
        if self.n_boxes() != n {
            return Err(WebToolsError::Context(format!(
                "table has {} rows but the batch has {} boxes",
                self.n_boxes(),
                n
            )));
        }
        for i in 0..n {
            for &j in self.row(i) {
                if j == NO_CONTEXT {
                    continue;
                }
                if j < 0 || j as usize >= n {
                    return Err(WebToolsError::Context(format!(
                        "box {i} refers to index {j}, outside [-1, {n})"
                    )));
                }
                if owners[j as usize] != owners[i] {
                    return Err(WebToolsError::Context(format!(
                        "box {i} (image {}) refers to box {j} of image {}",
                        owners[i], owners[j as usize]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Gather indices into the feature table extended with one zero row:
    /// every [`NO_CONTEXT`] slot is remapped to `n_boxes`, the padding row.
    ///
    /// Call [`ContextTable::validate`] first; other negative values are
    /// remapped the same way here and must not reach this point.
    pub fn padded_indices(&self) -> Vec<u32> {
        let sentinel = self.n_boxes() as u32;
        self.indices
            .iter()
            .map(|&j| if j < 0 { sentinel } else { j as u32 })
            .collect()
    }

    /// 1 for a filled slot, 0 for an empty one.
    pub fn valid_mask(&self) -> Vec<u8> {
        self.indices.iter().map(|&j| u8::from(j >= 0)).collect()
    }

    /// Number of filled slots per row.
    pub fn valid_counts(&self) -> Vec<usize> {
        (0..self.n_boxes())
            .map(|i| self.row(i).iter().filter(|&&j| j >= 0).count())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::BBox;
    use crate::sample::SampleBoxes;

    fn sample(xs: &[f32]) -> SampleBoxes {
        SampleBoxes {
            boxes: xs.iter().map(|&x| BBox::new(x, 0.0, x + 1.0, 1.0)).collect(),
            labels: vec![0; xs.len()],
        }
    }

    #[test]
    fn test_shape_checks() {
        assert!(ContextTable::new(vec![0, 1, 2], 2).is_err());
        assert!(ContextTable::new(vec![], 0).is_err());
        assert!(ContextTable::from_rows(&[vec![1, -1], vec![0]]).is_err());
        let t = ContextTable::from_rows(&[vec![1, -1], vec![0, -1]]).unwrap();
        assert_eq!(t.n_boxes(), 2);
        assert_eq!(t.row(1), &[0, -1]);
    }

    #[test]
    fn test_padded_indices_remap_sentinel() {
        let t = ContextTable::from_rows(&[vec![1, -1, 2], vec![-1, -1, -1], vec![0, 1, -1]])
            .unwrap();
        assert_eq!(t.padded_indices(), vec![1, 3, 2, 3, 3, 3, 0, 1, 3]);
        assert_eq!(t.valid_mask(), vec![1, 0, 1, 0, 0, 0, 1, 1, 0]);
        assert_eq!(t.valid_counts(), vec![2, 0, 2]);
    }

    #[test]
    fn test_validate_out_of_range() {
        let owners = [0, 0];
        assert!(ContextTable::from_rows(&[vec![1], vec![2]])
            .unwrap()
            .validate(&owners)
            .is_err());
        assert!(ContextTable::from_rows(&[vec![1], vec![-2]])
            .unwrap()
            .validate(&owners)
            .is_err());
        assert!(ContextTable::from_rows(&[vec![1], vec![-1]])
            .unwrap()
            .validate(&owners)
            .is_ok());
    }

    #[test]
    fn test_validate_cross_image() {
        let owners = [0, 0, 1];
        let t = ContextTable::from_rows(&[vec![1], vec![0], vec![1]]).unwrap();
        let err = t.validate(&owners).unwrap_err();
        assert!(err.to_string().contains("box 2 (image 1) refers to box 1 of image 0"));
    }

    #[test]
    fn test_validate_row_count() {
        let t = ContextTable::from_rows(&[vec![-1]]).unwrap();
        assert!(t.validate(&[0, 0]).is_err());
    }

    #[test]
    fn test_nearest_stays_within_image() {
        let batch = BoxBatch::collate(&[sample(&[0.0, 10.0, 3.0]), sample(&[100.0, 50.0])]);
        let t = ContextTable::nearest(&batch, 3).unwrap();

        assert_eq!(t.row(0), &[2, 1, -1]);
        assert_eq!(t.row(1), &[2, 0, -1]);
        assert_eq!(t.row(2), &[0, 1, -1]);
        assert_eq!(t.row(3), &[4, -1, -1]);
        assert_eq!(t.row(4), &[3, -1, -1]);
        assert!(t.validate(batch.owners()).is_ok());
    }

    #[test]
    fn test_nearest_truncates_to_width() {
        let batch = BoxBatch::collate(&[sample(&[0.0, 1.0, 2.0, 3.0, 4.0])]);
        let t = ContextTable::nearest(&batch, 2).unwrap();
        assert_eq!(t.row(2), &[1, 3]);
        assert_eq!(t.valid_counts(), vec![2; 5]);
    }
}
