//! Sorted index over the label table.

use std::collections::HashMap;

use crate::{Label, NO_OFFSET};

/// A label and the offset it points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LabelOffset {
    pub offset: usize,
    pub label: Label,
}

/// Offset of a label and the nearest label at a strictly greater offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelInfo {
    pub offset: usize,
    pub next: Option<LabelOffset>,
}

/// Answers "which labels are at this offset" and "where does the next label start".
#[derive(Debug, Clone, Default)]
pub struct LabelIndex {
    /// Sorted by offset, then label
    sorted: Vec<LabelOffset>,
    /// Label to position in `sorted`
    positions: HashMap<Label, usize>,
    /// Offset to all labels at that offset, sorted
    by_offset: HashMap<usize, Vec<Label>>,
}

impl LabelIndex {
    /// Builds the index from a label table where `label_offsets[label]` is the label's offset or
    /// [`NO_OFFSET`].
    pub fn new(label_offsets: &[u32]) -> Self {
        let mut sorted: Vec<LabelOffset> = label_offsets
            .iter()
            .enumerate()
            .filter(|(_, &offset)| offset != NO_OFFSET)
            .map(|(label, &offset)| LabelOffset {
                offset: offset as usize,
                label: label as Label,
            })
            .collect();

        sorted.sort();

        let mut positions = HashMap::with_capacity(sorted.len());
        let mut by_offset: HashMap<usize, Vec<Label>> = HashMap::new();

        for (i, lo) in sorted.iter().enumerate() {
            positions.insert(lo.label, i);
            by_offset.entry(lo.offset).or_default().push(lo.label);
        }

        Self {
            sorted,
            positions,
            by_offset,
        }
    }

    pub fn has_label(&self, label: Label) -> bool {
        self.positions.contains_key(&label)
    }

    /// Labels pointing at `offset`, in ascending order
    pub fn labels_at(&self, offset: usize) -> Option<&[Label]> {
        self.by_offset.get(&offset).map(Vec::as_slice)
    }

    pub fn info(&self, label: Label) -> Option<LabelInfo> {
        let &pos = self.positions.get(&label)?;
        let offset = self.sorted[pos].offset;

        Some(LabelInfo {
            offset,
            next: self.first_after(offset),
        })
    }

    /// First label at an offset strictly greater than `offset`
    pub fn first_after(&self, offset: usize) -> Option<LabelOffset> {
        let idx = self.sorted.partition_point(|lo| lo.offset <= offset);
        self.sorted.get(idx).copied()
    }

    /// All labels, sorted by offset and then label
    pub fn labels(&self) -> &[LabelOffset] {
        &self.sorted
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }
}
