//! JSON and JSON Lines output formatters

use serde::{Serialize, Deserialize};
use serde_json::{json, Value};

use crate::segment::{Arg, Instruction};
use crate::{BytecodeError, BytecodeIr, CharWidth, Label, Segment};
use super::{hex_bytes, IrFormatter};

/// Serializable instruction for JSON output
#[derive(Serialize, Deserialize)]
struct InstructionJson {
    /// Offset of the instruction from the start of the bytecode
    offset: usize,
    /// Opcode as hex, e.g. "0x09" or "0xf841"
    opcode: String,
    mnemonic: String,
    args: Vec<Value>,
    /// False if the arguments couldn't be decoded
    valid: bool,
}

/// Serializable segment for JSON output
#[derive(Serialize, Deserialize)]
struct SegmentJson {
    offset: usize,
    /// "instructions", "data" or "string"
    #[serde(rename = "type")]
    segment_type: String,
    labels: Vec<Label>,
    /// Encoded size in bytes
    size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<Vec<InstructionJson>>,
    /// Raw bytes of a data segment as hex string
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    /// Value of a string segment
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

/// Serializable parse result for JSON output
#[derive(Serialize, Deserialize)]
struct BytecodeJson {
    width: String,
    size: usize,
    segments: Vec<SegmentJson>,
}

fn json_error(e: serde_json::Error) -> BytecodeError {
    BytecodeError::Format(format!("JSON serialization error: {}", e))
}

impl IrFormatter for super::JsonFormatter {
    fn format(&self, ir: &BytecodeIr, width: CharWidth) -> Result<String, BytecodeError> {
        let offsets = ir.offsets(width);

        let result = BytecodeJson {
            width: width.to_string(),
            size: ir.byte_size(width),
            segments: ir
                .segments
                .iter()
                .zip(offsets)
                .map(|(segment, offset)| segment_to_json(segment, offset, width))
                .collect(),
        };

        serde_json::to_string_pretty(&result).map_err(json_error)
    }
}

impl IrFormatter for super::JsonLinesFormatter {
    fn format(&self, ir: &BytecodeIr, width: CharWidth) -> Result<String, BytecodeError> {
        let mut output = String::new();

        for (segment, offset) in ir.segments.iter().zip(ir.offsets(width)) {
            let line = json!(segment_to_json(segment, offset, width));
            output.push_str(&serde_json::to_string(&line).map_err(json_error)?);
            output.push('\n');
        }

        Ok(output)
    }
}

fn arg_to_json(arg: &Arg) -> Value {
    match arg {
        Arg::Int(v) => json!(v),
        Arg::Float(v) => json!(v),
        Arg::String(s) => json!(s),
    }
}

fn instruction_to_json(inst: &Instruction, offset: usize) -> InstructionJson {
    InstructionJson {
        offset,
        opcode: format!("0x{:02x}", inst.opcode.code),
        mnemonic: inst.opcode.mnemonic.clone(),
        args: inst.args.iter().map(arg_to_json).collect(),
        valid: inst.valid,
    }
}

fn segment_to_json(segment: &Segment, offset: usize, width: CharWidth) -> SegmentJson {
    let mut json = SegmentJson {
        offset,
        segment_type: segment.segment_type().to_string(),
        labels: segment.labels().iter().copied().collect(),
        size: segment.byte_size(width),
        instructions: None,
        data: None,
        value: None,
    };

    match segment {
        Segment::Instructions(s) => {
            let mut inst_offset = offset;
            let instructions = s
                .instructions
                .iter()
                .map(|inst| {
                    let json = instruction_to_json(inst, inst_offset);
                    inst_offset += inst.byte_size(width);
                    json
                })
                .collect();
            json.instructions = Some(instructions);
        }
        Segment::Data(s) => json.data = Some(hex_bytes(&s.data)),
        Segment::String(s) => json.value = Some(s.value.clone()),
    }

    json
}
