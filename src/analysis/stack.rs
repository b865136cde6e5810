//! Values on the argument stack at a pop instruction.
//!
//! Arguments are pushed with `arg_push*` right before the instruction that pops them. Position 0 is
//! the most recent push, i.e. the last parameter of the popping instruction.

use std::collections::HashSet;

use super::cfg::{ControlFlowGraph, InstructionRef};
use super::register::{RegisterFinder, MAX_ITERATIONS};
use super::value_set::ValueSet;
use crate::opcode::{OP_ARG_PUSHB, OP_ARG_PUSHL, OP_ARG_PUSHR, OP_ARG_PUSHW};

/// Values at stack `position` right before the instruction at `at` executes.
pub fn stack_value(cfg: &ControlFlowGraph<'_>, at: InstructionRef, position: usize) -> ValueSet {
    let Some(block) = cfg.block_of(at) else {
        log::debug!("No block contains instruction {:?}", at);
        return ValueSet::all();
    };

    StackFinder { cfg, iterations: 0 }.find(HashSet::new(), block, at.index, position)
}

struct StackFinder<'c, 'a> {
    cfg: &'c ControlFlowGraph<'a>,
    iterations: usize,
}

impl StackFinder<'_, '_> {
    fn find(
        &mut self,
        mut path: HashSet<usize>,
        block_idx: usize,
        end: usize,
        mut position: usize,
    ) -> ValueSet {
        self.iterations += 1;
        if self.iterations > MAX_ITERATIONS {
            log::debug!("Giving up on stack position {} after {} iterations", position, MAX_ITERATIONS);
            return ValueSet::all();
        }

        let cfg = self.cfg;
        let block = cfg.block(block_idx);
        let segment = cfg.segments()[block.segment];

        for i in (block.start..end).rev() {
            let inst = &segment.instructions[i];

            // Any other instruction consumes or clears the stack
            if !inst.opcode.pushes() {
                return ValueSet::all();
            }

            if position > 0 {
                position -= 1;
                continue;
            }

            return match (inst.opcode.code, inst.int_arg(0)) {
                (OP_ARG_PUSHL | OP_ARG_PUSHB | OP_ARG_PUSHW, Some(value)) => ValueSet::of(value),
                (OP_ARG_PUSHR, Some(register)) => {
                    RegisterFinder::new(cfg).find(HashSet::new(), block_idx, i, register)
                }
                _ => ValueSet::all(),
            };
        }

        path.insert(block_idx);

        let mut values = ValueSet::empty();

        for &from in &block.from {
            if path.contains(&from) {
                return ValueSet::all();
            }

            let from_end = cfg.block(from).end;
            values = values.union(&self.find(path.clone(), from, from_end, position));
        }

        if values.is_empty() {
            ValueSet::all()
        } else {
            values
        }
    }
}
