//! Write path: segments back to bytecode plus a label table.

use crate::cursor::WriteBuffer;
use crate::opcode::ParamType;
use crate::segment::{string_arg_size, Instruction, Segment};
use crate::{BytecodeError, BytecodeIr, CharWidth, NO_OFFSET};

/// Encoded bytecode and the offset of every label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBytecode {
    pub bytecode: Vec<u8>,
    /// Indexed by label; [`NO_OFFSET`] for labels no segment carries
    pub label_offsets: Vec<u32>,
}

/// Serializes `ir` in the given character width.
pub fn write_bytecode(ir: &BytecodeIr, width: CharWidth) -> Result<EncodedBytecode, BytecodeError> {
    let mut buf = WriteBuffer::with_capacity(100 * ir.segments.len());

    let label_count = ir
        .segments
        .iter()
        .flat_map(|s| s.labels().iter())
        .max()
        .map(|&max| max as usize + 1)
        .unwrap_or(0);
    let mut label_offsets = vec![NO_OFFSET; label_count];

    for segment in &ir.segments {
        for &label in segment.labels() {
            label_offsets[label as usize] = buf.position() as u32;
        }

        match segment {
            Segment::Instructions(s) => {
                for instruction in &s.instructions {
                    write_instruction(&mut buf, instruction, width)?;
                }
            }
            Segment::String(s) => buf.write_string(&s.value, width, s.byte_size(width)),
            Segment::Data(s) => buf.write_bytes(&s.data),
        }
    }

    log::debug!(
        "Wrote {} segments, {} bytes, {} label slots",
        ir.segments.len(),
        buf.position(),
        label_offsets.len()
    );

    Ok(EncodedBytecode {
        bytecode: buf.into_inner(),
        label_offsets,
    })
}

fn write_instruction(
    buf: &mut WriteBuffer,
    instruction: &Instruction,
    width: CharWidth,
) -> Result<(), BytecodeError> {
    let opcode = &instruction.opcode;

    if opcode.size() == 2 {
        buf.write_u8((opcode.code >> 8) as u8);
    }
    buf.write_u8(opcode.code as u8);

    if opcode.pops() {
        return Ok(());
    }

    for (i, param) in opcode.params.iter().enumerate() {
        let args = instruction.args_for(i);

        if let ParamType::Variadic(elem) = &param.ty {
            buf.write_u8(args.len() as u8);

            for arg in args {
                match elem.as_ref() {
                    ParamType::Label(_) => buf.write_u16(label_value(arg.coerce_int())?),
                    ParamType::Word => buf.write_u16(arg.coerce_int() as u16),
                    _ => buf.write_u8(arg.coerce_int() as u8),
                }
            }
            continue;
        }

        let Some(arg) = args.first() else {
            log::warn!("No argument passed to {} for parameter {}.", opcode.mnemonic, i + 1);
            continue;
        };

        match &param.ty {
            ParamType::Byte | ParamType::Register(_) => buf.write_u8(arg.coerce_int() as u8),
            ParamType::Word => buf.write_u16(arg.coerce_int() as u16),
            ParamType::Label(_) => buf.write_u16(label_value(arg.coerce_int())?),
            ParamType::DWord => buf.write_i32(arg.coerce_int()),
            ParamType::Float => buf.write_f32(arg.coerce_float()),
            ParamType::String => {
                let value = arg.coerce_string();
                buf.write_string(&value, width, string_arg_size(&value, width));
            }
            ParamType::Pointer | ParamType::Any | ParamType::Variadic(_) => {
                return Err(BytecodeError::UnsupportedParam {
                    mnemonic: opcode.mnemonic.clone(),
                    index: i,
                    ty: param.ty.to_string(),
                })
            }
        }
    }

    Ok(())
}

fn label_value(value: i32) -> Result<u16, BytecodeError> {
    u16::try_from(value).map_err(|_| BytecodeError::LabelOutOfRange(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use crate::opcode::{Opcode, OpcodeTable, Param, StackInteraction, OP_GET_RANDOM, OP_JMP, OP_MESSAGE, OP_SWITCH_CALL};
    use crate::segment::{Arg, DataSegment, InstructionSegment, StringSegment};

    fn labels(ls: &[u32]) -> BTreeSet<u32> {
        ls.iter().copied().collect()
    }

    #[test]
    fn test_write_instructions_and_labels() {
        let table = OpcodeTable::standard();
        let ir = BytecodeIr::new(vec![
            Segment::Instructions(InstructionSegment {
                labels: labels(&[0]),
                instructions: vec![
                    Instruction::new(table.get(OP_GET_RANDOM), vec![Arg::Int(1), Arg::Int(2)]),
                    Instruction::new(table.get(OP_JMP), vec![Arg::Int(2)]),
                ],
            }),
            Segment::Data(DataSegment {
                labels: labels(&[2]),
                data: vec![0xaa, 0xbb],
            }),
        ]);

        let encoded = write_bytecode(&ir, CharWidth::Wide).unwrap();
        assert_eq!(encoded.bytecode, vec![0xf8, 0x9a, 1, 2, 0x28, 2, 0, 0xaa, 0xbb]);
        assert_eq!(encoded.label_offsets, vec![0, NO_OFFSET, 7]);
    }

    #[test]
    fn test_write_pop_instruction_opcode_only() {
        let table = OpcodeTable::standard();
        let ir = BytecodeIr::new(vec![Segment::Instructions(InstructionSegment {
            labels: labels(&[0]),
            instructions: vec![Instruction::new(table.get(OP_MESSAGE), vec![])],
        })]);

        let encoded = write_bytecode(&ir, CharWidth::Wide).unwrap();
        assert_eq!(encoded.bytecode, vec![0x50]);
    }

    #[test]
    fn test_write_empty_variadic() {
        let table = OpcodeTable::standard();
        let ir = BytecodeIr::new(vec![Segment::Instructions(InstructionSegment {
            labels: BTreeSet::new(),
            instructions: vec![Instruction::new(table.get(OP_SWITCH_CALL), vec![Arg::Int(4)])],
        })]);

        let encoded = write_bytecode(&ir, CharWidth::Wide).unwrap();
        assert_eq!(encoded.bytecode, vec![0x41, 4, 0]);
        assert!(encoded.label_offsets.is_empty());
    }

    #[test]
    fn test_write_string_segment_padding() {
        let ir = BytecodeIr::new(vec![Segment::String(StringSegment {
            labels: labels(&[1]),
            value: "hey".to_string(),
            byte_len: None,
        })]);

        let narrow = write_bytecode(&ir, CharWidth::Narrow).unwrap();
        assert_eq!(narrow.bytecode, vec![b'h', b'e', b'y', 0]);

        let wide = write_bytecode(&ir, CharWidth::Wide).unwrap();
        assert_eq!(wide.bytecode.len(), 8);
        assert_eq!(wide.label_offsets, vec![NO_OFFSET, 0]);
    }

    #[test]
    fn test_unsupported_top_level_param() {
        let opcode = Opcode::new(0x70, "bogus", vec![Param::new(ParamType::Any)], StackInteraction::None);
        let table = OpcodeTable::new([opcode]);
        let ir = BytecodeIr::new(vec![Segment::Instructions(InstructionSegment {
            labels: BTreeSet::new(),
            instructions: vec![Instruction::new(table.get(0x70), vec![Arg::Int(0)])],
        })]);

        let err = write_bytecode(&ir, CharWidth::Wide).unwrap_err();
        assert!(matches!(err, BytecodeError::UnsupportedParam { index: 0, .. }));
    }

    #[test]
    fn test_label_out_of_range() {
        let table = OpcodeTable::standard();
        let ir = BytecodeIr::new(vec![Segment::Instructions(InstructionSegment {
            labels: BTreeSet::new(),
            instructions: vec![Instruction::new(table.get(OP_JMP), vec![Arg::Int(70000)])],
        })]);

        let err = write_bytecode(&ir, CharWidth::Wide).unwrap_err();
        assert!(matches!(err, BytecodeError::LabelOutOfRange(70000)));
    }
}
