//! Segment model: the decoded form of a bytecode region.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::opcode::{Opcode, ParamType};
use crate::{CharWidth, Label};

/// Kind of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    Instructions,
    Data,
    String,
}

impl SegmentType {
    /// Decoding priority. A label requested with a higher priority type than the segment already
    /// decoded at its offset causes that offset to be decoded again.
    pub fn priority(self) -> u8 {
        match self {
            SegmentType::Instructions => 2,
            SegmentType::String => 1,
            SegmentType::Data => 0,
        }
    }
}

impl fmt::Display for SegmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentType::Instructions => write!(f, "instructions"),
            SegmentType::Data => write!(f, "data"),
            SegmentType::String => write!(f, "string"),
        }
    }
}

/// A concrete instruction argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i32),
    Float(f32),
    String(String),
}

impl Arg {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Arg::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn coerce_int(&self) -> i32 {
        match self {
            Arg::Int(v) => *v,
            Arg::Float(v) => *v as i32,
            Arg::String(_) => 0,
        }
    }

    pub fn coerce_float(&self) -> f32 {
        match self {
            Arg::Int(v) => *v as f32,
            Arg::Float(v) => *v,
            Arg::String(_) => 0.0,
        }
    }

    pub fn coerce_string(&self) -> String {
        match self {
            Arg::Int(v) => v.to_string(),
            Arg::Float(v) => v.to_string(),
            Arg::String(s) => s.clone(),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(v) => write!(f, "{}", v),
            Arg::Float(v) => write!(f, "{:?}", v),
            Arg::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub opcode: Arc<Opcode>,
    /// Flat argument list; a variadic parameter contributes all of its elements
    pub args: Vec<Arg>,
    /// False when the arguments couldn't be decoded (lenient mode only)
    pub valid: bool,
}

impl Instruction {
    pub fn new(opcode: Arc<Opcode>, args: Vec<Arg>) -> Self {
        Self {
            opcode,
            args,
            valid: true,
        }
    }

    pub fn invalid(opcode: Arc<Opcode>) -> Self {
        Self {
            opcode,
            args: Vec::new(),
            valid: false,
        }
    }

    /// Arguments belonging to parameter `param`.
    ///
    /// Every parameter before the variadic one holds exactly one argument, so parameter `i`
    /// starts at argument `i`.
    pub fn args_for(&self, param: usize) -> &[Arg] {
        let Some(p) = self.opcode.params.get(param) else {
            return &[];
        };

        let start = param.min(self.args.len());
        let end = if p.ty.is_variadic() {
            self.args.len()
        } else {
            (param + 1).min(self.args.len())
        };

        &self.args[start..end]
    }

    /// First argument of parameter `param` as an integer
    pub fn int_arg(&self, param: usize) -> Option<i32> {
        self.args_for(param).first().and_then(Arg::as_int)
    }

    /// Encoded size in bytes
    pub fn byte_size(&self, width: CharWidth) -> usize {
        let mut size = self.opcode.size();

        if self.opcode.pops() {
            return size;
        }

        for (i, param) in self.opcode.params.iter().enumerate() {
            let args = self.args_for(i);

            size += match &param.ty {
                ParamType::Byte | ParamType::Register(_) => 1,
                ParamType::Word | ParamType::Label(_) => 2,
                ParamType::DWord | ParamType::Float => 4,
                ParamType::String => args
                    .first()
                    .map(|a| string_arg_size(&a.coerce_string(), width))
                    .unwrap_or(width.unit_size()),
                ParamType::Variadic(elem) => {
                    let elem_size = match elem.as_ref() {
                        ParamType::Label(_) | ParamType::Word => 2,
                        _ => 1,
                    };
                    1 + elem_size * args.len()
                }
                ParamType::Pointer | ParamType::Any => 0,
            };
        }

        size
    }
}

/// Encoded size of a null-terminated string argument.
pub fn string_arg_size(value: &str, width: CharWidth) -> usize {
    match width {
        CharWidth::Narrow => value.chars().count() + 1,
        CharWidth::Wide => 2 * value.encode_utf16().count() + 2,
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.mnemonic)?;

        for (i, arg) in self.args.iter().enumerate() {
            if i == 0 {
                write!(f, " {}", arg)?;
            } else {
                write!(f, ", {}", arg)?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct InstructionSegment {
    pub labels: BTreeSet<Label>,
    pub instructions: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataSegment {
    pub labels: BTreeSet<Label>,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct StringSegment {
    pub labels: BTreeSet<Label>,
    pub value: String,
    /// Bytes the string occupied in the source, padding included
    pub byte_len: Option<usize>,
}

impl StringSegment {
    pub fn byte_size(&self, width: CharWidth) -> usize {
        if let Some(len) = self.byte_len {
            return len;
        }

        let units = match width {
            CharWidth::Narrow => self.value.chars().count(),
            CharWidth::Wide => self.value.encode_utf16().count(),
        } + 1;

        // String segments are padded to a multiple of 4 bytes
        match width {
            CharWidth::Narrow => 4 * units.div_ceil(4),
            CharWidth::Wide => 4 * units.div_ceil(2),
        }
    }
}

/// A contiguous, classified region of bytecode.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Instructions(InstructionSegment),
    Data(DataSegment),
    String(StringSegment),
}

impl Segment {
    pub fn segment_type(&self) -> SegmentType {
        match self {
            Segment::Instructions(_) => SegmentType::Instructions,
            Segment::Data(_) => SegmentType::Data,
            Segment::String(_) => SegmentType::String,
        }
    }

    pub fn labels(&self) -> &BTreeSet<Label> {
        match self {
            Segment::Instructions(s) => &s.labels,
            Segment::Data(s) => &s.labels,
            Segment::String(s) => &s.labels,
        }
    }

    pub fn labels_mut(&mut self) -> &mut BTreeSet<Label> {
        match self {
            Segment::Instructions(s) => &mut s.labels,
            Segment::Data(s) => &mut s.labels,
            Segment::String(s) => &mut s.labels,
        }
    }

    pub fn byte_size(&self, width: CharWidth) -> usize {
        match self {
            Segment::Instructions(s) => s.instructions.iter().map(|i| i.byte_size(width)).sum(),
            Segment::Data(s) => s.data.len(),
            Segment::String(s) => s.byte_size(width),
        }
    }

    pub fn as_instructions(&self) -> Option<&InstructionSegment> {
        match self {
            Segment::Instructions(s) => Some(s),
            _ => None,
        }
    }
}

/// Ordered list of segments making up a whole bytecode blob.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BytecodeIr {
    pub segments: Vec<Segment>,
}

impl BytecodeIr {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    pub fn instruction_segments(&self) -> impl Iterator<Item = &InstructionSegment> {
        self.segments.iter().filter_map(Segment::as_instructions)
    }

    /// Start offset of every segment, in order
    pub fn offsets(&self, width: CharWidth) -> Vec<usize> {
        let mut offset = 0;
        self.segments
            .iter()
            .map(|s| {
                let start = offset;
                offset += s.byte_size(width);
                start
            })
            .collect()
    }

    pub fn byte_size(&self, width: CharWidth) -> usize {
        self.segments.iter().map(|s| s.byte_size(width)).sum()
    }
}
