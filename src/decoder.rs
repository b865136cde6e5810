//! Instruction decoder for quest script bytecode.

use std::sync::Arc;

use crate::cursor::Cursor;
use crate::opcode::{Opcode, OpcodeTable, ParamType, TWO_BYTE_PREFIXES};
use crate::segment::{Arg, Instruction};
use crate::CharWidth;

/// Longest string argument read in one go
pub const MAX_STRING_ARG_BYTES: usize = 4096;

/// Errors that can occur while decoding an instruction
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// Ran out of bytes
    #[error("Truncated input at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Fewer arguments than the opcode requires
    #[error("Expected at least {expected} arguments for {mnemonic}, parsed {parsed}")]
    MissingArguments {
        mnemonic: String,
        expected: usize,
        parsed: usize,
    },

    /// Wide string with an unpaired surrogate
    #[error("Invalid UTF-16 string at offset {offset}")]
    InvalidUtf16 { offset: usize },

    /// Parameter type that has no inline encoding
    #[error("Parameter type {ty} of {mnemonic} can't be decoded")]
    UnsupportedParam { mnemonic: String, ty: String },
}

/// Reads a one- or two-byte opcode code.
pub fn decode_opcode_code(cursor: &mut Cursor<'_>) -> Result<u16, DecodeError> {
    let main = cursor.u8()?;

    if TWO_BYTE_PREFIXES.contains(&main) {
        let low = cursor.u8()?;
        Ok(((main as u16) << 8) | low as u16)
    } else {
        Ok(main as u16)
    }
}

/// Reads the inline arguments of `opcode`. Pop instructions have none.
pub fn decode_arguments(
    cursor: &mut Cursor<'_>,
    opcode: &Opcode,
    width: CharWidth,
) -> Result<Vec<Arg>, DecodeError> {
    let mut args = Vec::new();

    if opcode.pops() {
        return Ok(args);
    }

    let mut variadic_count = 0;

    for param in &opcode.params {
        match &param.ty {
            ParamType::Byte | ParamType::Register(_) => args.push(Arg::Int(cursor.u8()? as i32)),
            ParamType::Word | ParamType::Label(_) => args.push(Arg::Int(cursor.u16()? as i32)),
            ParamType::DWord => args.push(Arg::Int(cursor.i32()?)),
            ParamType::Float => args.push(Arg::Float(cursor.f32()?)),
            ParamType::String => {
                let max_bytes = MAX_STRING_ARG_BYTES.min(cursor.bytes_left());
                args.push(Arg::String(cursor.string(width, max_bytes, false)?));
            }
            ParamType::Variadic(elem) => {
                variadic_count += 1;
                let count = cursor.u8()? as usize;

                match elem.as_ref() {
                    ParamType::Label(_) | ParamType::Word => args.extend(
                        cursor.u16_array(count)?.into_iter().map(|v| Arg::Int(v as i32)),
                    ),
                    _ => args.extend(
                        cursor.u8_array(count)?.into_iter().map(|v| Arg::Int(v as i32)),
                    ),
                }
            }
            ParamType::Pointer | ParamType::Any => {
                return Err(DecodeError::UnsupportedParam {
                    mnemonic: opcode.mnemonic.clone(),
                    ty: param.ty.to_string(),
                })
            }
        }
    }

    let expected = opcode.params.len() - variadic_count;
    if args.len() < expected {
        return Err(DecodeError::MissingArguments {
            mnemonic: opcode.mnemonic.clone(),
            expected,
            parsed: args.len(),
        });
    }

    Ok(args)
}

/// Decodes the instruction at the cursor position.
///
/// The opcode is consumed even when its arguments fail to decode; the error carries the opcode so
/// lenient callers can record an invalid instruction in its place.
pub fn decode_instruction(
    cursor: &mut Cursor<'_>,
    table: &OpcodeTable,
    width: CharWidth,
) -> Result<Instruction, InstructionError> {
    let code = decode_opcode_code(cursor).map_err(|source| InstructionError {
        opcode: None,
        source,
    })?;
    let opcode = table.get(code);

    match decode_arguments(cursor, &opcode, width) {
        Ok(args) => Ok(Instruction::new(opcode, args)),
        Err(source) => Err(InstructionError {
            opcode: Some(opcode),
            source,
        }),
    }
}

/// Failure to decode one instruction.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{source}")]
pub struct InstructionError {
    /// Set when the opcode itself was read
    pub opcode: Option<Arc<Opcode>>,
    #[source]
    pub source: DecodeError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::{OP_GET_RANDOM, OP_JMP, OP_LETI, OP_MESSAGE, OP_SWITCH_JMP};

    fn decode_all(bytes: &[u8], width: CharWidth) -> Vec<Instruction> {
        let table = OpcodeTable::standard();
        let mut cursor = Cursor::new(bytes);
        let mut out = Vec::new();
        while cursor.has_remaining() {
            out.push(decode_instruction(&mut cursor, &table, width).unwrap());
        }
        out
    }

    #[test]
    fn test_decode_simple_sequence() {
        // leti r3, 0x100; jmp 7; ret
        let bytes = [0x09, 0x03, 0x00, 0x01, 0x00, 0x00, 0x28, 0x07, 0x00, 0x01];
        let insts = decode_all(&bytes, CharWidth::Wide);

        assert_eq!(insts.len(), 3);
        assert_eq!(insts[0].opcode.code, OP_LETI);
        assert_eq!(insts[0].args, vec![Arg::Int(3), Arg::Int(0x100)]);
        assert_eq!(insts[1].opcode.code, OP_JMP);
        assert_eq!(insts[1].args, vec![Arg::Int(7)]);
        assert_eq!(insts[2].opcode.mnemonic, "ret");
    }

    #[test]
    fn test_decode_two_byte_opcode() {
        // get_random r10, r12
        let bytes = [0xf8, 0x9a, 0x0a, 0x0c];
        let insts = decode_all(&bytes, CharWidth::Wide);

        assert_eq!(insts[0].opcode.code, OP_GET_RANDOM);
        assert_eq!(insts[0].args, vec![Arg::Int(10), Arg::Int(12)]);
    }

    #[test]
    fn test_decode_variadic_labels() {
        // switch_jmp r1, [3, 4]
        let bytes = [0x40, 0x01, 0x02, 0x03, 0x00, 0x04, 0x00];
        let insts = decode_all(&bytes, CharWidth::Wide);

        assert_eq!(insts[0].opcode.code, OP_SWITCH_JMP);
        assert_eq!(insts[0].args_for(1), &[Arg::Int(3), Arg::Int(4)]);
    }

    #[test]
    fn test_pop_reads_no_inline_bytes() {
        let bytes = [0x50, 0x01];
        let insts = decode_all(&bytes, CharWidth::Wide);

        assert_eq!(insts[0].opcode.code, OP_MESSAGE);
        assert!(insts[0].args.is_empty());
        assert_eq!(insts[1].opcode.mnemonic, "ret");
    }

    #[test]
    fn test_string_argument_widths() {
        // list r0, "ab"
        let narrow = [0x51, 0x00, b'a', b'b', 0x00];
        let insts = decode_all(&narrow, CharWidth::Narrow);
        assert_eq!(insts[0].args[1], Arg::String("ab".to_string()));

        let wide = [0x51, 0x00, b'a', 0, b'b', 0, 0, 0];
        let insts = decode_all(&wide, CharWidth::Wide);
        assert_eq!(insts[0].args[1], Arg::String("ab".to_string()));
    }

    #[test]
    fn test_truncated_argument_keeps_opcode() {
        let table = OpcodeTable::standard();
        let bytes = [0x09, 0x03, 0x00];
        let mut cursor = Cursor::new(&bytes);

        let err = decode_instruction(&mut cursor, &table, CharWidth::Wide).unwrap_err();
        assert_eq!(err.opcode.map(|o| o.code), Some(OP_LETI));
        assert!(matches!(err.source, DecodeError::Truncated { .. }));
    }

    #[test]
    fn test_unknown_opcode_has_no_args() {
        let insts = decode_all(&[0x46, 0x47], CharWidth::Wide);
        assert_eq!(insts.len(), 2);
        assert!(!insts[0].opcode.known);
        assert_eq!(insts[1].opcode.mnemonic, "unknown_47");
    }
}
