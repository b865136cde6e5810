//! Segment discovery: turns raw bytecode and a label table into an ordered list of segments.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::labels::LabelIndex;
use crate::opcode::OpcodeTable;
use crate::segment::{DataSegment, InstructionSegment, Segment};
use crate::{BytecodeError, BytecodeIr, CharWidth, Label, Outcome, Severity};

pub mod classifier;
pub mod fixpoint;

pub use classifier::Thresholds;
pub use fixpoint::Discovery;

/// Labels the VM provides itself. Referencing them without a label table entry is fine.
pub const BUILTIN_LABELS: [Label; 23] = [
    60, 70, 80, 90, 100, 110, 120, 130, 140, 800, 810, 820, 830, 840, 850, 860, 900, 910, 920, 930,
    940, 950, 960,
];

/// Most values an analyzer result may have before a reference counts as unresolved.
pub const DEFAULT_CARDINALITY_BOUND: usize = 20;

/// Options for [`parse_bytecode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    /// Character width of string arguments and string segments
    pub width: CharWidth,
    /// Keep going after decode errors, size mismatches and unregistered labels
    pub lenient: bool,
    pub cardinality_bound: usize,
    pub builtin_labels: BTreeSet<Label>,
    pub thresholds: Thresholds,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            width: CharWidth::default(),
            lenient: false,
            cardinality_bound: DEFAULT_CARDINALITY_BOUND,
            builtin_labels: BUILTIN_LABELS.into_iter().collect(),
            thresholds: Thresholds::default(),
        }
    }
}

/// Parses `bytecode` into segments.
///
/// `label_offsets[label]` is the offset of `label`, or [`crate::NO_OFFSET`]. Discovery starts at
/// `entry_labels`, which are decoded as instructions. Ranges no reference explains are classified
/// heuristically.
///
/// Returns `Err` only when an instruction fails to decode in strict mode. Everything else ends up
/// in the outcome's problems; a strict parse with errors has no value.
pub fn parse_bytecode(
    bytecode: &[u8],
    label_offsets: &[u32],
    entry_labels: &BTreeSet<Label>,
    table: &OpcodeTable,
    options: &ParseOptions,
) -> Result<Outcome<BytecodeIr>, BytecodeError> {
    log::debug!(
        "Parsing {} bytes of bytecode with {} labels, {} entry labels",
        bytecode.len(),
        label_offsets.len(),
        entry_labels.len()
    );

    let labels = LabelIndex::new(label_offsets);

    let mut discovery = Discovery::new(bytecode, &labels, table, options);
    discovery.run(entry_labels)?;
    let (mut discovered, mut result, failed) = discovery.finish();

    let width = options.width;
    let mut segments: Vec<Segment> = Vec::new();
    let mut segment_at: HashMap<usize, usize> = HashMap::new();
    let mut offset = 0;
    let mut classified = 0;

    while offset < bytecode.len() {
        let segment = match discovered.remove(&offset) {
            Some(segment) if segment.byte_size(width) > 0 => segment,
            _ => {
                classified += 1;
                fill_gap(bytecode, offset, &labels, table, options)
            }
        };

        segment_at.insert(offset, segments.len());
        offset += segment.byte_size(width);
        segments.push(segment);
    }

    log::debug!(
        "Produced {} segments, {} of them classified heuristically",
        segments.len(),
        classified
    );

    // Attach every label to the segment starting at its offset
    for lo in labels.labels() {
        match segment_at.get(&lo.offset) {
            Some(&idx) => {
                segments[idx].labels_mut().insert(lo.label);
            }
            None => {
                result.add_problem(
                    Severity::Warning,
                    format!("Label {} doesn't point to anything.", lo.label),
                    format!("Label {} with offset {} doesn't point to anything.", lo.label, lo.offset),
                );
            }
        }
    }

    if offset != bytecode.len() {
        result.add_problem(
            Severity::Error,
            "The script code is corrupt.",
            format!("Expected to parse {} bytes but parsed {} instead.", bytecode.len(), offset),
        );

        if !options.lenient {
            return Ok(result.failure());
        }
    }

    if failed {
        return Ok(result.failure());
    }

    Ok(result.success(BytecodeIr::new(segments)))
}

/// Segment for an offset discovery left unclaimed. It reaches up to the next label or the end of
/// the bytecode and is instructions if the classifier accepts it, data otherwise.
fn fill_gap(
    bytecode: &[u8],
    offset: usize,
    labels: &LabelIndex,
    table: &OpcodeTable,
    options: &ParseOptions,
) -> Segment {
    let end = labels
        .first_after(offset)
        .map_or(bytecode.len(), |next| next.offset.min(bytecode.len()));
    let here = labels.labels_at(offset).unwrap_or_default();

    let instructions = classifier::classify(
        bytecode,
        offset,
        end,
        here,
        labels,
        table,
        options.width,
        &options.thresholds,
    );

    let labels = here.iter().copied().collect();

    match instructions {
        Some(instructions) => Segment::Instructions(InstructionSegment {
            labels,
            instructions,
        }),
        None => Segment::Data(DataSegment {
            labels,
            data: bytecode[offset..end].to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentType;
    use crate::NO_OFFSET;

    fn parse(bytecode: &[u8], label_offsets: &[u32], options: &ParseOptions) -> Outcome<BytecodeIr> {
        let table = OpcodeTable::standard();
        parse_bytecode(bytecode, label_offsets, &BTreeSet::from([0]), &table, options).unwrap()
    }

    fn types(ir: &BytecodeIr) -> Vec<SegmentType> {
        ir.segments.iter().map(Segment::segment_type).collect()
    }

    #[test]
    fn test_default_options() {
        let options = ParseOptions::default();
        assert_eq!(options.width, CharWidth::Wide);
        assert!(!options.lenient);
        assert_eq!(options.cardinality_bound, 20);
        assert!(options.builtin_labels.contains(&800));
        assert_eq!(options.builtin_labels.len(), 23);
        assert_eq!(options.thresholds.max_sequential_nops, 10);
    }

    #[test]
    fn test_unlabeled_head_becomes_data() {
        // 12 zero bytes nothing points at, then label 0: ret
        let mut bytes = vec![0; 12];
        bytes.push(0x01);

        let outcome = parse(&bytes, &[12], &ParseOptions::default());
        let ir = outcome.value.unwrap();

        assert_eq!(types(&ir), vec![SegmentType::Data, SegmentType::Instructions]);
        assert!(ir.segments[0].labels().is_empty());
        assert_eq!(ir.byte_size(CharWidth::Wide), bytes.len());
    }

    #[test]
    fn test_unterminated_string_head_becomes_data() {
        // arg_pushs "AB" without a terminator, then label 0: ret
        let bytes = [0x4e, 0x41, 0x00, 0x42, 0x00, 0x01];

        let outcome = parse(&bytes, &[5], &ParseOptions::default());
        assert!(outcome.problems.is_empty(), "{:?}", outcome.problems);
        let ir = outcome.value.unwrap();

        assert_eq!(types(&ir), vec![SegmentType::Data, SegmentType::Instructions]);
        assert!(ir.segments[0].labels().is_empty());
        assert_eq!(ir.segments[1].labels(), &BTreeSet::from([0]));
        assert_eq!(ir.byte_size(CharWidth::Wide), bytes.len());
    }

    #[test]
    fn test_unreferenced_code_is_classified() {
        // label 0: ret / label 1: leti r1, 1; ret, never referenced
        let bytes = [0x01, 0x09, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01];
        let outcome = parse(&bytes, &[0, 1], &ParseOptions::default());
        let ir = outcome.value.unwrap();

        assert_eq!(types(&ir), vec![SegmentType::Instructions, SegmentType::Instructions]);
        assert_eq!(ir.segments[1].labels(), &BTreeSet::from([1]));
    }

    #[test]
    fn test_label_inside_segment_is_warned() {
        // label 1 points into the middle of leti
        let bytes = [0x09, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01];
        let outcome = parse(&bytes, &[0, 2], &ParseOptions { lenient: true, ..ParseOptions::default() });

        let warnings: Vec<_> = outcome.warnings().collect();
        assert!(warnings.iter().any(|p| p.message == "Label 1 with offset 2 doesn't point to anything."));
    }

    #[test]
    fn test_absent_labels_are_skipped() {
        let bytes = [0x01];
        let outcome = parse(&bytes, &[0, NO_OFFSET], &ParseOptions::default());

        assert!(outcome.problems.is_empty());
        assert_eq!(outcome.value.unwrap().segments.len(), 1);
    }

    #[test]
    fn test_empty_bytecode() {
        let table = OpcodeTable::standard();
        let outcome =
            parse_bytecode(&[], &[], &BTreeSet::new(), &table, &ParseOptions::default()).unwrap();
        assert!(outcome.value.unwrap().segments.is_empty());
    }

    #[test]
    fn test_strict_unregistered_label_fails() {
        let bytes = [0x28, 0x09, 0x00];
        let outcome = parse(&bytes, &[0], &ParseOptions::default());

        assert!(!outcome.is_success());
        assert!(outcome.problems.iter().any(|p| p.message.contains("Label 9")));
    }
}
