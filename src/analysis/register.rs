//! Backward data-flow analysis of register values.
//!
//! Starting just before an instruction, walks backward through its block looking for the last
//! write to a register, then continues into every predecessor block and unions the results.

use std::collections::HashSet;

use super::cfg::{ControlFlowGraph, InstructionRef};
use super::value_set::ValueSet;
use crate::opcode::{
    OP_ADDI, OP_ARG_PUSHB, OP_ARG_PUSHL, OP_ARG_PUSHR, OP_ARG_PUSHW, OP_CLEAR, OP_DIVI,
    OP_GET_DIFFLVL, OP_GET_RANDOM, OP_GET_SLOTNUMBER, OP_IF_ZONE_CLEAR, OP_LET, OP_LETB, OP_LETI,
    OP_LETW, OP_MULI, OP_REV, OP_SET, OP_STACK_POPM, OP_STACK_PUSHM, OP_SUBI, OP_SYNC,
    OP_SYNC_LETI, OP_VA_CALL, OP_VA_START,
};

/// Blocks visited per query before giving up.
pub const MAX_ITERATIONS: usize = 100;

/// Registers that va_call passes arguments in
const VA_CALL_REGISTERS: std::ops::RangeInclusive<i32> = 1..=7;

/// Values `register` can hold right before the instruction at `at` executes.
///
/// Anything that can't be tracked, such as a value written by the VM itself or a loop, widens the
/// result to every value.
pub fn register_value(cfg: &ControlFlowGraph<'_>, at: InstructionRef, register: i32) -> ValueSet {
    let Some(block) = cfg.block_of(at) else {
        log::debug!("No block contains instruction {:?}", at);
        return ValueSet::all();
    };

    RegisterFinder::new(cfg).find(HashSet::new(), block, at.index, register)
}

pub(crate) struct RegisterFinder<'c, 'a> {
    cfg: &'c ControlFlowGraph<'a>,
    iterations: usize,
}

impl<'c, 'a> RegisterFinder<'c, 'a> {
    pub(crate) fn new(cfg: &'c ControlFlowGraph<'a>) -> Self {
        Self { cfg, iterations: 0 }
    }

    /// Values of `register` right before instruction `end` of `block`.
    pub(crate) fn find(
        &mut self,
        mut path: HashSet<usize>,
        block_idx: usize,
        end: usize,
        register: i32,
    ) -> ValueSet {
        self.iterations += 1;
        if self.iterations > MAX_ITERATIONS {
            log::debug!("Giving up on register r{} after {} iterations", register, MAX_ITERATIONS);
            return ValueSet::all();
        }

        if !(0..=255).contains(&register) {
            return ValueSet::all();
        }

        let cfg = self.cfg;
        let block = cfg.block(block_idx);
        let segment = cfg.segments()[block.segment];

        for i in (block.start..end).rev() {
            let inst = &segment.instructions[i];
            let arg = |param: usize| inst.int_arg(param);
            let writes_target = arg(0) == Some(register);

            match inst.opcode.code {
                OP_SYNC => return ValueSet::all(),
                OP_VA_CALL => {
                    let value = self.va_call(&path, block_idx, i, register);
                    if !value.is_empty() {
                        return value;
                    }
                }
                OP_LET if writes_target => {
                    return match arg(1) {
                        Some(source) => self.find(path, block_idx, i, source),
                        None => ValueSet::all(),
                    };
                }
                OP_LETI | OP_LETB | OP_LETW | OP_SYNC_LETI if writes_target => {
                    return arg(1).map(ValueSet::of).unwrap_or_else(ValueSet::all);
                }
                OP_SET if writes_target => return ValueSet::of(1),
                OP_CLEAR if writes_target => return ValueSet::of(0),
                OP_REV if writes_target => {
                    let prev = self.find(path, block_idx, i, register);

                    return if prev == ValueSet::of(0) {
                        ValueSet::of(1)
                    } else if prev.contains(0) {
                        ValueSet::interval(0, 1)
                    } else {
                        ValueSet::of(0)
                    };
                }
                OP_ADDI | OP_SUBI | OP_MULI | OP_DIVI if writes_target => {
                    let Some(scalar) = arg(1) else {
                        return ValueSet::all();
                    };
                    let prev = self.find(path, block_idx, i, register);

                    return match inst.opcode.code {
                        OP_ADDI => prev.add(scalar),
                        OP_SUBI => prev.sub(scalar),
                        OP_MULI => prev.mul(scalar),
                        _ => prev.div(scalar),
                    };
                }
                OP_IF_ZONE_CLEAR if writes_target => return ValueSet::interval(0, 1),
                OP_GET_DIFFLVL if writes_target => return ValueSet::interval(0, 2),
                OP_GET_SLOTNUMBER if writes_target => return ValueSet::interval(0, 3),
                OP_GET_RANDOM if arg(1) == Some(register) => {
                    let Some(bounds) = arg(0) else {
                        return ValueSet::all();
                    };

                    // The upper bound is exclusive and always at least min + 1
                    let min = self
                        .find(path.clone(), block_idx, i, bounds)
                        .min()
                        .unwrap_or(i32::MIN);
                    let max = self
                        .find(path, block_idx, i, bounds + 1)
                        .max()
                        .unwrap_or(i32::MAX)
                        .max(min.saturating_add(1));

                    return ValueSet::interval(min, max - 1);
                }
                OP_STACK_PUSHM | OP_STACK_POPM => {
                    if let (Some(first), Some(count)) = (arg(0), arg(1)) {
                        let first = first as i64;
                        let reg = register as i64;
                        if first <= reg && reg < first + count as i64 {
                            return ValueSet::all();
                        }
                    }
                }
                _ => {
                    if writes_register(inst, register) {
                        return ValueSet::all();
                    }
                }
            }
        }

        path.insert(block_idx);

        let mut values = ValueSet::empty();

        for &from in &block.from {
            // Loops could change the value on every pass
            if path.contains(&from) {
                return ValueSet::all();
            }

            let from_end = cfg.block(from).end;
            values = values.union(&self.find(path.clone(), from, from_end, register));
        }

        if values.is_empty() {
            ValueSet::all()
        } else {
            values
        }
    }

    /// Arguments of a va_call arrive in r1 to r7, pushed with arg_push* after va_start.
    ///
    /// Returns an empty set when `register` isn't one of those, so the walk continues. Without a
    /// va_start every argument register is 0.
    fn va_call(
        &mut self,
        path: &HashSet<usize>,
        block_idx: usize,
        va_call_idx: usize,
        register: i32,
    ) -> ValueSet {
        if !VA_CALL_REGISTERS.contains(&register) {
            return ValueSet::empty();
        }

        let cfg = self.cfg;
        let block = cfg.block(block_idx);
        let segment = cfg.segments()[block.segment];

        let mut va_start_idx = None;
        let mut pushes = Vec::new();

        for i in block.start..va_call_idx {
            let inst = &segment.instructions[i];

            if inst.opcode.code == OP_VA_START {
                va_start_idx = Some(i);
                pushes.clear();
            } else if va_start_idx.is_some() && inst.opcode.pushes() {
                pushes.push(inst);
            }
        }

        // Registers without a pushed argument, or a va_call without va_start, get 0
        let (Some(va_start_idx), Some(push)) = (va_start_idx, pushes.get(register as usize - 1))
        else {
            return ValueSet::of(0);
        };

        match (push.opcode.code, push.int_arg(0)) {
            (OP_ARG_PUSHR, Some(source)) => self.find(path.clone(), block_idx, va_start_idx, source),
            (OP_ARG_PUSHL | OP_ARG_PUSHB | OP_ARG_PUSHW, Some(value)) => ValueSet::of(value),
            _ => ValueSet::all(),
        }
    }
}

/// Whether `inst` writes `register` through any of its register tuple parameters.
fn writes_register(inst: &crate::Instruction, register: i32) -> bool {
    inst.opcode.params.iter().enumerate().any(|(i, param)| {
        let Some(regs) = param.ty.registers() else {
            return false;
        };
        let Some(first) = inst.int_arg(i) else {
            return false;
        };

        regs.iter()
            .enumerate()
            .any(|(k, reg)| reg.writes() && first as i64 + k as i64 == register as i64)
    })
}
