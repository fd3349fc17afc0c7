//! Flattening of variable-length per-sample box lists into one batch.
//!
//! Samples rarely share a box count, so boxes cannot be stacked into a
//! `[batch, boxes, 4]` array. Instead every box of every sample goes into a
//! single flat list, tagged with the index of the sample that owns it.

use std::ops::Range;

use crate::boxes::BBox;
use crate::sample::SampleBoxes;

/// Flat, owner-tagged box list of one batch.
///
/// Boxes of sample `i` precede those of sample `i + 1`, and each sample's
/// boxes keep their original order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxBatch {
    owners: Vec<usize>,
    boxes: Vec<BBox>,
    labels: Vec<u32>,
    num_samples: usize,
}

impl BoxBatch {
    pub fn collate<'a, I>(samples: I) -> Self
    where
        I: IntoIterator<Item = &'a SampleBoxes>,
    {
        let mut batch = Self {
            owners: Vec::new(),
            boxes: Vec::new(),
            labels: Vec::new(),
            num_samples: 0,
        };
        for (owner, sample) in samples.into_iter().enumerate() {
            batch.owners.extend(std::iter::repeat(owner).take(sample.len()));
            batch.boxes.extend_from_slice(&sample.boxes);
            batch.labels.extend_from_slice(&sample.labels);
            batch.num_samples = owner + 1;
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn owners(&self) -> &[usize] {
        &self.owners
    }

    pub fn boxes(&self) -> &[BBox] {
        &self.boxes
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Rows of `[owner, x1, y1, x2, y2]`, the layout consumed by region pooling.
    pub fn rows(&self) -> Vec<[f32; 5]> {
        self.owners
            .iter()
            .zip(&self.boxes)
            .map(|(&owner, b)| [owner as f32, b.x1, b.y1, b.x2, b.y2])
            .collect()
    }

    /// Contiguous flat-index range of each sample's boxes.
    pub fn sample_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::with_capacity(self.num_samples);
        let mut start = 0;
        for owner in 0..self.num_samples {
            let len = self.owners[start..]
                .iter()
                .take_while(|&&o| o == owner)
                .count();
            ranges.push(start..start + len);
            start += len;
        }
        ranges
    }

    /// Undo [`BoxBatch::collate`], recovering each sample's boxes in order.
    pub fn split(&self) -> Vec<SampleBoxes> {
        self.sample_ranges()
            .into_iter()
            .map(|r| SampleBoxes {
                boxes: self.boxes[r.clone()].to_vec(),
                labels: self.labels[r].to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(boxes: &[[f32; 4]], labels: &[u32]) -> SampleBoxes {
        SampleBoxes {
            boxes: boxes
                .iter()
                .map(|&[x1, y1, x2, y2]| BBox::new(x1, y1, x2, y2))
                .collect(),
            labels: labels.to_vec(),
        }
    }

    #[test]
    fn test_two_sample_scenario() {
        let a = sample(&[[0.0, 0.0, 10.0, 10.0], [5.0, 5.0, 15.0, 15.0]], &[1, 0]);
        let b = sample(&[[1.0, 1.0, 4.0, 4.0]], &[2]);
        let batch = BoxBatch::collate([&a, &b]);

        assert_eq!(
            batch.rows(),
            vec![
                [0.0, 0.0, 0.0, 10.0, 10.0],
                [0.0, 5.0, 5.0, 15.0, 15.0],
                [1.0, 1.0, 1.0, 4.0, 4.0],
            ]
        );
        assert_eq!(batch.labels(), &[1, 0, 2]);
        assert_eq!(batch.num_samples(), 2);
    }

    #[test]
    fn test_total_count_and_owner_coverage() {
        let samples = vec![
            sample(&[[0.0, 0.0, 1.0, 1.0]; 4], &[1, 2, 3, 0]),
            sample(&[[0.0, 0.0, 2.0, 2.0]; 7], &[1, 2, 3, 0, 0, 0, 0]),
            sample(&[[0.0, 0.0, 3.0, 3.0]; 3], &[1, 2, 3]),
        ];
        let batch = BoxBatch::collate(&samples);

        assert_eq!(batch.len(), samples.iter().map(|s| s.len()).sum::<usize>());
        let mut owners: Vec<usize> = batch.owners().to_vec();
        owners.dedup();
        assert_eq!(owners, vec![0, 1, 2]);
        assert_eq!(batch.sample_ranges(), vec![0..4, 4..11, 11..14]);
    }

    #[test]
    fn test_split_round_trip() {
        let samples = vec![
            sample(&[[0.0, 0.0, 1.0, 2.0], [3.0, 3.0, 9.0, 9.0]], &[1, 0]),
            sample(&[[2.0, 2.0, 5.0, 6.0]], &[3]),
            sample(&[[7.0, 1.0, 8.0, 4.0], [0.0, 0.0, 1.0, 1.0], [1.0, 1.0, 2.0, 2.0]], &[2, 0, 1]),
        ];
        let batch = BoxBatch::collate(&samples);
        assert_eq!(batch.split(), samples);
    }

    #[test]
    fn test_empty_sample_keeps_owner_numbering() {
        let samples = vec![
            sample(&[[0.0, 0.0, 1.0, 1.0]], &[1]),
            sample(&[], &[]),
            sample(&[[0.0, 0.0, 1.0, 1.0]], &[2]),
        ];
        let batch = BoxBatch::collate(&samples);
        assert_eq!(batch.owners(), &[0, 2]);
        assert_eq!(batch.num_samples(), 3);
        assert_eq!(batch.split(), samples);
    }
}
