//! Heuristic code/data classification of ranges no label reference explained.
//!
//! A range is accepted as instructions only if it decodes cleanly within its bounds and the
//! decoded instructions look like something a quest author would write.

use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::decoder::{decode_instruction, DecodeError};
use crate::labels::LabelIndex;
use crate::opcode::{OpcodeTable, StackInteraction, OP_NOP};
use crate::segment::Instruction;
use crate::{CharWidth, Label};

pub const MAX_TOTAL_NOPS: usize = 20;
pub const MAX_SEQUENTIAL_NOPS: usize = 10;
pub const MAX_UNKNOWN_OPCODE_RATIO: f64 = 0.2;
pub const MAX_STACK_POP_WITHOUT_PUSH_RATIO: f64 = 0.2;
pub const MAX_UNKNOWN_LABEL_RATIO: f64 = 0.2;

/// Limits above which a range is rejected as instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub max_total_nops: usize,
    pub max_sequential_nops: usize,
    pub max_unknown_opcode_ratio: f64,
    pub max_stack_pop_without_push_ratio: f64,
    pub max_unknown_label_ratio: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_total_nops: MAX_TOTAL_NOPS,
            max_sequential_nops: MAX_SEQUENTIAL_NOPS,
            max_unknown_opcode_ratio: MAX_UNKNOWN_OPCODE_RATIO,
            max_stack_pop_without_push_ratio: MAX_STACK_POP_WITHOUT_PUSH_RATIO,
            max_unknown_label_ratio: MAX_UNKNOWN_LABEL_RATIO,
        }
    }
}

/// Why a range isn't an instructions segment.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    #[error("parsing it failed: {0}")]
    Decode(#[from] DecodeError),

    /// An unterminated string argument re-encodes with a terminator the range doesn't have
    #[error("its {actual} bytes of instructions don't fill the {expected} bytes of the range")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("it has more than {0} nop instructions")]
    TooManyNops(usize),

    #[error("it has more than {0} sequential nop instructions")]
    TooManySequentialNops(usize),

    #[error("{percent:.1}% of its label references are to nonexistent labels")]
    UnknownLabels { percent: f64 },

    #[error("{percent:.1}% of its stack pop instructions don't have a preceding push instruction")]
    PopWithoutPush { percent: f64 },

    #[error("{percent:.1}% of its opcodes are unknown")]
    UnknownOpcodes { percent: f64 },
}

/// Decodes `[start, end)` strictly. An instruction crossing `end` is a failure.
pub fn decode_range(
    bytecode: &[u8],
    start: usize,
    end: usize,
    table: &OpcodeTable,
    width: CharWidth,
) -> Result<Vec<Instruction>, DecodeError> {
    let mut cursor = Cursor::bounded(bytecode, start, end);
    let mut instructions = Vec::new();

    while cursor.has_remaining() {
        let instruction = decode_instruction(&mut cursor, table, width).map_err(|e| e.source)?;
        instructions.push(instruction);
    }

    Ok(instructions)
}

/// Applies the heuristics to already decoded instructions.
pub fn check_heuristics(
    instructions: &[Instruction],
    labels: &LabelIndex,
    thresholds: &Thresholds,
) -> Result<(), Rejection> {
    let mut prev_stack = None;
    let mut total_nops = 0;
    let mut sequential_nops = 0;
    let mut unknown_opcodes = 0;
    let mut stack_pops = 0;
    let mut pops_without_push = 0;
    let mut label_refs = 0;
    let mut unknown_labels = 0;

    for inst in instructions {
        if inst.opcode.code == OP_NOP {
            total_nops += 1;
            if total_nops > thresholds.max_total_nops {
                return Err(Rejection::TooManyNops(thresholds.max_total_nops));
            }

            sequential_nops += 1;
            if sequential_nops > thresholds.max_sequential_nops {
                return Err(Rejection::TooManySequentialNops(thresholds.max_sequential_nops));
            }
        } else {
            sequential_nops = 0;
        }

        if !inst.opcode.known {
            unknown_opcodes += 1;
        }

        if inst.opcode.pops() {
            stack_pops += 1;

            if prev_stack != Some(StackInteraction::Push) {
                pops_without_push += 1;
            }
        }

        for (i, param) in inst.opcode.params.iter().enumerate() {
            if !param.ty.is_label() {
                continue;
            }

            for arg in inst.args_for(i) {
                label_refs += 1;

                let known = arg
                    .as_int()
                    .and_then(|v| Label::try_from(v).ok())
                    .is_some_and(|label| labels.has_label(label));

                if !known {
                    unknown_labels += 1;
                }
            }
        }

        prev_stack = Some(inst.opcode.stack);
    }

    let unknown_label_ratio = ratio(unknown_labels, label_refs);
    if unknown_label_ratio > thresholds.max_unknown_label_ratio {
        return Err(Rejection::UnknownLabels {
            percent: 100.0 * unknown_label_ratio,
        });
    }

    let pop_ratio = ratio(pops_without_push, stack_pops);
    if pop_ratio > thresholds.max_stack_pop_without_push_ratio {
        return Err(Rejection::PopWithoutPush {
            percent: 100.0 * pop_ratio,
        });
    }

    let unknown_opcode_ratio = ratio(unknown_opcodes, instructions.len());
    if unknown_opcode_ratio > thresholds.max_unknown_opcode_ratio {
        return Err(Rejection::UnknownOpcodes {
            percent: 100.0 * unknown_opcode_ratio,
        });
    }

    Ok(())
}

/// Zero when there is nothing to count
fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

/// Decodes `[start, end)` and keeps the result only if it passes the heuristics.
///
/// `range_labels` are the labels at `start`, used for logging only.
#[allow(clippy::too_many_arguments)]
pub fn classify(
    bytecode: &[u8],
    start: usize,
    end: usize,
    range_labels: &[Label],
    labels: &LabelIndex,
    table: &OpcodeTable,
    width: CharWidth,
    thresholds: &Thresholds,
) -> Option<Vec<Instruction>> {
    let result = decode_range(bytecode, start, end, table, width)
        .map_err(Rejection::from)
        .and_then(|instructions| {
            let expected = end.min(bytecode.len()) - start;
            let actual: usize = instructions.iter().map(|i| i.byte_size(width)).sum();

            if actual != expected {
                return Err(Rejection::SizeMismatch { expected, actual });
            }

            check_heuristics(&instructions, labels, thresholds).map(|_| instructions)
        });

    match result {
        Ok(instructions) => Some(instructions),
        Err(reason) => {
            let described = match range_labels {
                [] => "without label".to_string(),
                [label] => format!("with label {}", label),
                many => format!(
                    "with labels {}",
                    many.iter().map(|l| l.to_string()).collect::<Vec<_>>().join(", ")
                ),
            };

            log::trace!(
                "Determined that segment {} at offset {} is not an instructions segment because {}.",
                described,
                start,
                reason
            );

            None
        }
    }
}
