//! Control flow graph over decoded instruction segments.
//!
//! Blocks live in one arena and refer to each other by index. The graph borrows the segments it
//! was built from and is rebuilt, never patched, when the segment set changes.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::opcode::{
    OP_CALL, OP_JMP, OP_JMPI_LE, OP_JMP_E, OP_JMP_OFF, OP_JMP_ON, OP_RET, OP_SWITCH_CALL,
    OP_SWITCH_JMP, OP_VA_CALL,
};
use crate::segment::{Instruction, InstructionSegment};

/// How control leaves a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchType {
    /// Last block of a segment that doesn't end in a branch
    None,
    /// ret
    Return,
    /// jmp
    Jump,
    /// Every other jump
    ConditionalJump,
    /// call, switch_call or va_call
    Call,
}

impl fmt::Display for BranchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchType::None => write!(f, "none"),
            BranchType::Return => write!(f, "return"),
            BranchType::Jump => write!(f, "jump"),
            BranchType::ConditionalJump => write!(f, "conditional_jump"),
            BranchType::Call => write!(f, "call"),
        }
    }
}

/// Position of an instruction: segment index within the graph, then instruction index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionRef {
    pub segment: usize,
    pub index: usize,
}

impl InstructionRef {
    pub fn new(segment: usize, index: usize) -> Self {
        Self { segment, index }
    }
}

/// Instructions that are only entered at the start and only left at the end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicBlock {
    pub segment: usize,
    /// First instruction
    pub start: usize,
    /// One past the last instruction
    pub end: usize,
    pub branch_type: BranchType,
    /// Jump or call targets, depending on `branch_type`
    pub branch_labels: Vec<i32>,
    /// Predecessors
    pub from: Vec<usize>,
    /// Successors
    pub to: Vec<usize>,
}

impl BasicBlock {
    pub fn contains(&self, at: InstructionRef) -> bool {
        at.segment == self.segment && self.start <= at.index && at.index < self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone)]
pub struct ControlFlowGraph<'a> {
    segments: Vec<&'a InstructionSegment>,
    blocks: Vec<BasicBlock>,
    /// Per segment, the block of every instruction
    instruction_blocks: Vec<Vec<usize>>,
}

impl<'a> ControlFlowGraph<'a> {
    /// Builds the graph. `segments` must be in offset order; fallthrough goes from one segment to
    /// the next in this list.
    pub fn new(segments: Vec<&'a InstructionSegment>) -> Self {
        let mut blocks = Vec::new();
        let mut instruction_blocks = Vec::with_capacity(segments.len());
        let mut labels_to_block: HashMap<i32, usize> = HashMap::new();

        for (seg_idx, segment) in segments.iter().enumerate() {
            let first_block = blocks.len();
            let owners = create_basic_blocks(&mut blocks, seg_idx, segment);

            if blocks.len() > first_block {
                for &label in &segment.labels {
                    labels_to_block.insert(label as i32, first_block);
                }
            }

            instruction_blocks.push(owners);
        }

        link_blocks(&mut blocks, &labels_to_block);

        log::trace!("Built CFG with {} blocks over {} segments", blocks.len(), segments.len());

        Self {
            segments,
            blocks,
            instruction_blocks,
        }
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, idx: usize) -> &BasicBlock {
        &self.blocks[idx]
    }

    pub fn segments(&self) -> &[&'a InstructionSegment] {
        &self.segments
    }

    /// Block containing the instruction, if it is part of the graph
    pub fn block_of(&self, at: InstructionRef) -> Option<usize> {
        self.instruction_blocks.get(at.segment)?.get(at.index).copied()
    }

    pub fn instruction(&self, at: InstructionRef) -> Option<&'a Instruction> {
        self.segments.get(at.segment)?.instructions.get(at.index)
    }
}

/// Targets and branch type of an instruction that ends a block.
fn branch_of(inst: &Instruction) -> Option<(BranchType, Vec<i32>)> {
    let first = || inst.args.first().and_then(|a| a.as_int()).into_iter().collect::<Vec<_>>();
    let rest = || inst.args.iter().skip(1).filter_map(|a| a.as_int()).collect::<Vec<_>>();

    let code = inst.opcode.code;

    let branch = match code {
        OP_RET => (BranchType::Return, Vec::new()),
        OP_JMP => (BranchType::Jump, first()),
        OP_JMP_ON | OP_JMP_OFF => (BranchType::ConditionalJump, first()),
        OP_JMP_E..=OP_JMPI_LE => (
            BranchType::ConditionalJump,
            inst.args.get(2).and_then(|a| a.as_int()).into_iter().collect(),
        ),
        OP_SWITCH_JMP => (BranchType::ConditionalJump, rest()),
        OP_CALL | OP_VA_CALL => (BranchType::Call, first()),
        OP_SWITCH_CALL => (BranchType::Call, rest()),
        _ => return None,
    };

    Some(branch)
}

fn create_basic_blocks(
    blocks: &mut Vec<BasicBlock>,
    seg_idx: usize,
    segment: &InstructionSegment,
) -> Vec<usize> {
    let len = segment.instructions.len();
    let mut owners = Vec::with_capacity(len);
    let mut start = 0;

    for (i, inst) in segment.instructions.iter().enumerate() {
        let (branch_type, branch_labels) = match branch_of(inst) {
            Some(branch) => branch,
            None if i == len - 1 => (BranchType::None, Vec::new()),
            None => continue,
        };

        let idx = blocks.len();
        blocks.push(BasicBlock {
            segment: seg_idx,
            start,
            end: i + 1,
            branch_type,
            branch_labels,
            from: Vec::new(),
            to: Vec::new(),
        });
        owners.resize(i + 1, idx);

        start = i + 1;
    }

    owners
}

fn link(blocks: &mut [BasicBlock], from: usize, to: usize) {
    if !blocks[from].to.contains(&to) {
        blocks[from].to.push(to);
        blocks[to].from.push(from);
    }
}

fn link_blocks(blocks: &mut [BasicBlock], labels_to_block: &HashMap<i32, usize>) {
    // Calling block and the block callees return to
    let mut callers = Vec::new();

    for i in 0..blocks.len() {
        let next = (i + 1 < blocks.len()).then_some(i + 1);

        match blocks[i].branch_type {
            BranchType::Return => continue,
            BranchType::Call => {
                if let Some(next) = next {
                    callers.push((i, next));
                }
            }
            BranchType::None | BranchType::ConditionalJump => {
                if let Some(next) = next {
                    link(blocks, i, next);
                }
            }
            BranchType::Jump => {}
        }

        for j in 0..blocks[i].branch_labels.len() {
            if let Some(&target) = labels_to_block.get(&blocks[i].branch_labels[j]) {
                link(blocks, i, target);
            }
        }
    }

    for (caller, ret) in callers {
        link_returning_blocks(blocks, labels_to_block, caller, ret);
    }
}

/// Links every return reachable from the callees of `caller` to `ret`.
fn link_returning_blocks(
    blocks: &mut [BasicBlock],
    labels_to_block: &HashMap<i32, usize>,
    caller: usize,
    ret: usize,
) {
    let callees: Vec<usize> = blocks[caller]
        .branch_labels
        .iter()
        .filter_map(|label| labels_to_block.get(label).copied())
        .collect();

    for callee in callees {
        if blocks[callee].branch_type == BranchType::Return {
            link(blocks, callee, ret);
            continue;
        }

        let mut encountered = HashSet::new();
        let mut stack = vec![callee];

        while let Some(block) = stack.pop() {
            if !encountered.insert(block) {
                continue;
            }

            let successors = blocks[block].to.clone();
            for to in successors {
                if blocks[to].branch_type == BranchType::Return {
                    link(blocks, to, ret);
                } else {
                    stack.push(to);
                }
            }
        }
    }
}
