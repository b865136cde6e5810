//! Label-driven segment discovery.
//!
//! Starting from the entry labels, decodes every labeled segment whose type can be inferred and
//! harvests the label references of the decoded instructions, until no new segment turns up.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::mem;

use super::ParseOptions;
use crate::analysis::{register_value, stack_value, ControlFlowGraph, InstructionRef, Resolution};
use crate::cursor::Cursor;
use crate::decoder::{decode_instruction, InstructionError};
use crate::labels::LabelIndex;
use crate::opcode::{LabelKind, OpcodeTable, ParamType, OP_JMP, OP_RET};
use crate::segment::{
    DataSegment, Instruction, InstructionSegment, Segment, SegmentType, StringSegment,
};
use crate::{BytecodeError, Label, OutcomeBuilder, Severity};

/// Label references found in one harvest, each with the highest priority type requested.
pub type PendingLabels = BTreeMap<Label, SegmentType>;

pub struct Discovery<'p> {
    bytecode: &'p [u8],
    labels: &'p LabelIndex,
    table: &'p OpcodeTable,
    options: &'p ParseOptions,
    /// Start offset to segment
    segments: BTreeMap<usize, Segment>,
    /// Offsets of instruction segments whose references are all resolved
    analyzed: HashSet<usize>,
    /// Unregistered labels that were already reported
    reported: HashSet<Label>,
    /// Segments decoded again with a higher priority type in the current pass
    redecoded: usize,
    /// Offsets requested as strings that aren't valid strings
    invalid_strings: HashSet<usize>,
    problems: OutcomeBuilder,
    failed: bool,
}

impl<'p> Discovery<'p> {
    pub fn new(
        bytecode: &'p [u8],
        labels: &'p LabelIndex,
        table: &'p OpcodeTable,
        options: &'p ParseOptions,
    ) -> Self {
        Self {
            bytecode,
            labels,
            table,
            options,
            segments: BTreeMap::new(),
            analyzed: HashSet::new(),
            reported: HashSet::new(),
            redecoded: 0,
            invalid_strings: HashSet::new(),
            problems: OutcomeBuilder::new(),
            failed: false,
        }
    }

    /// Alternates decoding and harvesting until a pass neither adds nor redecodes a segment.
    pub fn run(&mut self, entry_labels: &BTreeSet<Label>) -> Result<(), BytecodeError> {
        let mut pending: PendingLabels = entry_labels
            .iter()
            .map(|&label| (label, SegmentType::Instructions))
            .collect();
        let mut pass = 0;

        loop {
            pass += 1;
            let start_count = self.segments.len();
            self.redecoded = 0;

            for (label, ty) in mem::take(&mut pending) {
                self.parse_segment(label, ty)?;
            }

            pending = self.harvest();

            log::debug!(
                "Discovery pass {}: {} segments, {} analyzed, {} pending labels",
                pass,
                self.segments.len(),
                self.analyzed.len(),
                pending.len()
            );

            if self.segments.len() <= start_count && self.redecoded == 0 {
                break;
            }
        }

        Ok(())
    }

    pub fn segments(&self) -> &BTreeMap<usize, Segment> {
        &self.segments
    }

    /// Splits into the discovered segments, the problems found so far, and whether an
    /// unregistered label should fail a strict parse.
    pub fn finish(self) -> (BTreeMap<usize, Segment>, OutcomeBuilder, bool) {
        (self.segments, self.problems, self.failed)
    }

    /// Decodes the segment at `label` as `ty`, then any segment control drops through into.
    pub fn parse_segment(&mut self, label: Label, ty: SegmentType) -> Result<(), BytecodeError> {
        let mut next = Some((label, ty));

        while let Some((label, ty)) = next {
            next = self
                .parse_one(label, ty)?
                .map(|dropped_into| (dropped_into, SegmentType::Instructions));
        }

        Ok(())
    }

    /// Returns the label control drops through into, if any.
    fn parse_one(&mut self, label: Label, ty: SegmentType) -> Result<Option<Label>, BytecodeError> {
        let Some(info) = self.labels.info(label) else {
            self.unregistered(label);
            return Ok(None);
        };

        if info.offset >= self.bytecode.len() {
            log::warn!("Label {} points past the end of the bytecode at offset {}.", label, info.offset);
            return Ok(None);
        }

        let labels = match self.segments.get_mut(&info.offset) {
            None => BTreeSet::from([label]),
            Some(existing) => {
                existing.labels_mut().insert(label);

                let kept_as_data =
                    ty == SegmentType::String && self.invalid_strings.contains(&info.offset);

                if ty.priority() > existing.segment_type().priority() && !kept_as_data {
                    log::debug!(
                        "Decoding offset {} again as {} instead of {}",
                        info.offset,
                        ty,
                        existing.segment_type()
                    );
                    self.redecoded += 1;
                    existing.labels().clone()
                } else {
                    return Ok(None);
                }
            }
        };

        let start = info.offset;
        let end = info.next.map_or(self.bytecode.len(), |n| n.offset.min(self.bytecode.len()));

        let segment = match ty {
            SegmentType::Instructions => {
                let instructions = self.decode_instructions(start, end)?;

                // Control drops into the next label unless something leaves explicitly
                let drops_through = !instructions
                    .iter()
                    .any(|i| matches!(i.opcode.code, OP_RET | OP_JMP));
                let next = info.next.filter(|_| drops_through).map(|n| n.label);

                self.segments.insert(start, Segment::Instructions(InstructionSegment {
                    labels,
                    instructions,
                }));

                return Ok(next);
            }
            SegmentType::Data => Segment::Data(DataSegment {
                labels,
                data: self.bytecode[start..end].to_vec(),
            }),
            SegmentType::String => {
                let mut cursor = Cursor::bounded(self.bytecode, start, end);

                match cursor.string(self.options.width, end - start, true) {
                    Ok(value) => Segment::String(StringSegment {
                        labels,
                        value,
                        byte_len: Some(end - start),
                    }),
                    Err(e) => {
                        log::warn!("Keeping string segment at offset {} as data: {}", start, e);
                        self.invalid_strings.insert(start);

                        Segment::Data(DataSegment {
                            labels,
                            data: self.bytecode[start..end].to_vec(),
                        })
                    }
                }
            }
        };

        self.segments.insert(start, segment);
        Ok(None)
    }

    /// Decodes instructions from `start` while the position is before `end`. The last instruction
    /// may extend past `end`.
    fn decode_instructions(
        &self,
        start: usize,
        end: usize,
    ) -> Result<Vec<Instruction>, BytecodeError> {
        let mut cursor = Cursor::new(self.bytecode);
        cursor.seek(start);

        let mut instructions = Vec::new();

        while cursor.position() < end {
            let offset = cursor.position();

            match decode_instruction(&mut cursor, self.table, self.options.width) {
                Ok(instruction) => instructions.push(instruction),
                Err(InstructionError { source, .. }) if !self.options.lenient => {
                    return Err(BytecodeError::Decode { offset, source });
                }
                Err(InstructionError { opcode: Some(opcode), source }) => {
                    log::error!(
                        "Couldn't parse arguments for instruction {} at offset {}: {}",
                        opcode.mnemonic,
                        offset,
                        source
                    );
                    instructions.push(Instruction::invalid(opcode));
                }
                Err(InstructionError { opcode: None, source }) => {
                    log::error!("Couldn't fully parse byte code segment at offset {}: {}", start, source);
                    break;
                }
            }
        }

        Ok(instructions)
    }

    fn unregistered(&mut self, label: Label) {
        if self.options.builtin_labels.contains(&label) || !self.reported.insert(label) {
            return;
        }

        let message = format!("Label {} is not registered in the label table.", label);

        if self.options.lenient {
            self.problems.add_problem(Severity::Warning, message.clone(), message);
        } else {
            self.problems.add_problem(Severity::Error, message.clone(), message);
            self.failed = true;
        }
    }

    /// Collects the label references of every instruction segment not yet fully analyzed.
    fn harvest(&mut self) -> PendingLabels {
        let mut found = PendingLabels::new();
        let bound = self.options.cardinality_bound;

        let sorted: Vec<(usize, &InstructionSegment)> = self
            .segments
            .iter()
            .filter_map(|(&offset, s)| s.as_instructions().map(|s| (offset, s)))
            .collect();
        let cfg = ControlFlowGraph::new(sorted.iter().map(|&(_, s)| s).collect());

        let mut newly_analyzed = Vec::new();

        for (seg_idx, &(offset, segment)) in sorted.iter().enumerate() {
            if self.analyzed.contains(&offset) {
                continue;
            }

            let mut found_all = true;

            for (inst_idx, inst) in segment.instructions.iter().enumerate() {
                let at = InstructionRef::new(seg_idx, inst_idx);

                if !harvest_instruction(&cfg, at, inst, bound, &mut found) {
                    found_all = false;
                }
            }

            if found_all {
                newly_analyzed.push(offset);
            }
        }

        self.analyzed.extend(newly_analyzed);
        found
    }
}

fn request(found: &mut PendingLabels, value: i32, ty: SegmentType) {
    let Ok(label) = Label::try_from(value) else {
        log::debug!("Ignoring negative label reference {}", value);
        return;
    };

    match found.get(&label) {
        Some(old) if old.priority() >= ty.priority() => {}
        _ => {
            found.insert(label, ty);
        }
    }
}

fn resolved(values: Resolution, ty: SegmentType, found: &mut PendingLabels) -> bool {
    match values {
        Resolution::Values(values) => {
            for value in values {
                request(found, value, ty);
            }
            true
        }
        Resolution::Inconclusive => false,
    }
}

/// Adds the label references of one instruction to `found`. Returns false if some reference
/// couldn't be resolved yet.
fn harvest_instruction(
    cfg: &ControlFlowGraph<'_>,
    at: InstructionRef,
    inst: &Instruction,
    bound: usize,
    found: &mut PendingLabels,
) -> bool {
    let params = &inst.opcode.params;
    let mut found_all = true;

    for (i, param) in params.iter().enumerate() {
        match &param.ty {
            ParamType::Label(kind) => {
                let ty = match kind {
                    LabelKind::Instruction => SegmentType::Instructions,
                    LabelKind::Data => SegmentType::Data,
                    LabelKind::String => SegmentType::String,
                    LabelKind::Any => continue,
                };

                if inst.opcode.pops() {
                    let position = params.len() - i - 1;
                    let values = stack_value(cfg, at, position).resolve(bound);
                    found_all &= resolved(values, ty, found);
                } else if let Some(value) = inst.int_arg(i) {
                    request(found, value, ty);
                }
            }
            ParamType::Variadic(elem) if **elem == ParamType::Label(LabelKind::Instruction) => {
                for value in inst.args_for(i).iter().filter_map(|a| a.as_int()) {
                    request(found, value, SegmentType::Instructions);
                }
            }
            ParamType::Register(Some(registers)) if !inst.opcode.pops() => {
                let Some(first) = inst.int_arg(i) else {
                    continue;
                };

                for (j, register) in registers.iter().enumerate() {
                    if register.ty != ParamType::Label(LabelKind::Instruction) {
                        continue;
                    }

                    let values = register_value(cfg, at, first + j as i32).resolve(bound);
                    found_all &= resolved(values, SegmentType::Instructions, found);
                }
            }
            _ => {}
        }
    }

    found_all
}

#[cfg(test)]
mod tests {
    use super::*;

    type Discovered = (BTreeMap<usize, Segment>, OutcomeBuilder, bool);

    fn discover(
        bytecode: &[u8],
        label_offsets: &[u32],
        options: &ParseOptions,
    ) -> Result<Discovered, BytecodeError> {
        let labels = LabelIndex::new(label_offsets);
        let table = OpcodeTable::standard();

        let mut discovery = Discovery::new(bytecode, &labels, &table, options);
        discovery.run(&BTreeSet::from([0]))?;
        Ok(discovery.finish())
    }

    #[test]
    fn test_follows_direct_jump() {
        // 0: jmp 1 / 3: ret / 4: ret (label 1)
        let bytes = [0x28, 0x01, 0x00, 0x01, 0x01];
        let (segments, _, _) = discover(&bytes, &[0, 4], &ParseOptions::default()).unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[&4].segment_type(), SegmentType::Instructions);
        assert_eq!(segments[&4].labels(), &BTreeSet::from([1]));
    }

    #[test]
    fn test_drop_through_decodes_next_label() {
        // label 0: nop / label 1: ret
        let bytes = [0x00, 0x01];
        let (segments, _, _) = discover(&bytes, &[0, 1], &ParseOptions::default()).unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[&1].segment_type(), SegmentType::Instructions);
    }

    #[test]
    fn test_data_and_string_labels() {
        // get_npc_data 1; npc_action_string r0, r1, 2; ret
        let mut bytes = vec![0xf8, 0x41, 0x01, 0x00, 0xf8, 0xdc, 0x00, 0x01, 0x02, 0x00, 0x01];
        // label 1: 4 data bytes
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        // label 2: "ok" in UTF-16
        bytes.extend_from_slice(&[b'o', 0, b'k', 0, 0, 0, 0, 0]);

        let (segments, _, _) = discover(&bytes, &[0, 11, 15], &ParseOptions::default()).unwrap();

        assert_eq!(segments[&11], Segment::Data(DataSegment {
            labels: BTreeSet::from([1]),
            data: vec![1, 2, 3, 4],
        }));
        match &segments[&15] {
            Segment::String(s) => {
                assert_eq!(s.value, "ok");
                assert_eq!(s.byte_len, Some(8));
            }
            other => panic!("Expected a string segment, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_string_is_kept_as_data() {
        // npc_action_string r0, r1, 1; ret
        let mut bytes = vec![0xf8, 0xdc, 0x00, 0x01, 0x01, 0x00, 0x01];
        // label 1: 'a', unpaired low surrogate, terminator
        bytes.extend_from_slice(&[0x61, 0x00, 0x00, 0xdc, 0x00, 0x00]);

        let (segments, _, failed) = discover(&bytes, &[0, 7], &ParseOptions::default()).unwrap();

        assert!(!failed);
        assert_eq!(segments[&7], Segment::Data(DataSegment {
            labels: BTreeSet::from([1]),
            data: vec![0x61, 0x00, 0x00, 0xdc, 0x00, 0x00],
        }));
    }

    #[test]
    fn test_label_from_stack() {
        // arg_pushl 7; arg_pushw 1; set_floor_handler; ret / label 1: ret
        let bytes = [0x49, 0x07, 0, 0, 0, 0x4b, 0x01, 0x00, 0x95, 0x01, 0x01];
        let (segments, _, _) = discover(&bytes, &[0, 10], &ParseOptions::default()).unwrap();

        assert_eq!(segments[&10].segment_type(), SegmentType::Instructions);
    }

    #[test]
    fn test_label_from_register_tuple() {
        // leti r4, 1; at_coords_call r0; ret / label 1: ret
        let bytes = [0x09, 0x04, 0x01, 0, 0, 0, 0x8c, 0x00, 0x01, 0x01];
        let (segments, _, _) = discover(&bytes, &[0, 9], &ParseOptions::default()).unwrap();

        assert_eq!(segments[&9].segment_type(), SegmentType::Instructions);
    }

    #[test]
    fn test_higher_priority_redecodes() {
        // label 0: get_npc_data 1; call 2; ret
        // label 1: ret, first requested as data
        // label 2: jmp 1, only seen after label 1 was decoded
        let bytes = [0xf8, 0x41, 0x01, 0x00, 0x29, 0x02, 0x00, 0x01, 0x01, 0x28, 0x01, 0x00];
        let (segments, _, _) = discover(&bytes, &[0, 8, 9], &ParseOptions::default()).unwrap();

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[&8].segment_type(), SegmentType::Instructions);
        assert_eq!(segments[&8].labels(), &BTreeSet::from([1]));
    }

    #[test]
    fn test_redecoded_segment_is_harvested() {
        // label 0: get_npc_data 1; call 2; ret
        // label 1: jmp 3, requested as data first
        // label 2: jmp 1
        // label 3: only referenced by label 1
        let mut bytes = vec![
            0xf8, 0x41, 0x01, 0x00, 0x29, 0x02, 0x00, 0x01,
            0x28, 0x03, 0x00,
            0x28, 0x01, 0x00,
        ];
        bytes.extend_from_slice(&[0x00; 12]);
        bytes.push(0x01);

        let (segments, _, _) = discover(&bytes, &[0, 8, 11, 14], &ParseOptions::default()).unwrap();

        assert_eq!(segments.len(), 4);
        assert_eq!(segments[&8].segment_type(), SegmentType::Instructions);
        assert_eq!(segments[&14].segment_type(), SegmentType::Instructions);
    }

    #[test]
    fn test_unregistered_label_reported_once() {
        // jmp 5; jmp 5; ret
        let bytes = [0x28, 0x05, 0x00, 0x28, 0x05, 0x00, 0x01];
        let options = ParseOptions {
            lenient: true,
            ..ParseOptions::default()
        };

        let (_, problems, failed) = discover(&bytes, &[0], &options).unwrap();
        assert_eq!(problems.problems().len(), 1);
        assert!(problems.problems()[0].message.contains("Label 5"));
        assert!(!failed);
    }

    #[test]
    fn test_unregistered_label_fails_strict() {
        let bytes = [0x28, 0x05, 0x00];
        let (_, problems, failed) = discover(&bytes, &[0], &ParseOptions::default()).unwrap();

        assert!(failed);
        assert_eq!(problems.problems()[0].severity, Severity::Error);
    }

    #[test]
    fn test_builtin_label_is_silent() {
        // call 800; ret
        let bytes = [0x29, 0x20, 0x03, 0x01];
        let (_, problems, failed) = discover(&bytes, &[0], &ParseOptions::default()).unwrap();

        assert!(problems.problems().is_empty());
        assert!(!failed);
    }

    #[test]
    fn test_strict_decode_failure() {
        // leti with a truncated immediate
        let bytes = [0x09, 0x01, 0x05];
        let err = discover(&bytes, &[0], &ParseOptions::default()).unwrap_err();
        assert!(matches!(err, BytecodeError::Decode { offset: 0, .. }));
    }

    #[test]
    fn test_lenient_decode_failure_keeps_invalid_instruction() {
        let bytes = [0x09, 0x01, 0x05];
        let options = ParseOptions {
            lenient: true,
            ..ParseOptions::default()
        };
        let (segments, _, _) = discover(&bytes, &[0], &options).unwrap();

        let segment = segments[&0].as_instructions().unwrap();
        assert!(!segment.instructions[0].valid);
    }

    #[test]
    fn test_label_past_end_is_ignored() {
        let bytes = [0x28, 0x01, 0x00];
        let (segments, _, _) = discover(&bytes, &[0, 50], &ParseOptions::default()).unwrap();
        assert_eq!(segments.len(), 1);
    }
}
