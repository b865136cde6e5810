//! Opcode descriptions: parameter types, stack interaction, and the opcode table.
//!
//! An [`OpcodeTable`] is an ordinary value that is passed to every component that needs it, so
//! tests can swap in small synthetic tables.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub const OP_NOP: u16 = 0x00;
pub const OP_RET: u16 = 0x01;
pub const OP_SYNC: u16 = 0x02;
pub const OP_EXIT: u16 = 0x03;
pub const OP_THREAD: u16 = 0x04;
pub const OP_VA_START: u16 = 0x05;
pub const OP_VA_END: u16 = 0x06;
pub const OP_VA_CALL: u16 = 0x07;
pub const OP_LET: u16 = 0x08;
pub const OP_LETI: u16 = 0x09;
pub const OP_LETB: u16 = 0x0a;
pub const OP_LETW: u16 = 0x0b;
pub const OP_SET: u16 = 0x10;
pub const OP_CLEAR: u16 = 0x11;
pub const OP_REV: u16 = 0x12;
pub const OP_ADDI: u16 = 0x19;
pub const OP_SUBI: u16 = 0x1b;
pub const OP_MULI: u16 = 0x1d;
pub const OP_DIVI: u16 = 0x1f;
pub const OP_JMP: u16 = 0x28;
pub const OP_CALL: u16 = 0x29;
pub const OP_JMP_ON: u16 = 0x2a;
pub const OP_JMP_OFF: u16 = 0x2b;
pub const OP_JMP_E: u16 = 0x2c;
pub const OP_JMPI_LE: u16 = 0x3f;
pub const OP_SWITCH_JMP: u16 = 0x40;
pub const OP_SWITCH_CALL: u16 = 0x41;
pub const OP_STACK_PUSHM: u16 = 0x44;
pub const OP_STACK_POPM: u16 = 0x45;
pub const OP_ARG_PUSHR: u16 = 0x48;
pub const OP_ARG_PUSHL: u16 = 0x49;
pub const OP_ARG_PUSHB: u16 = 0x4a;
pub const OP_ARG_PUSHW: u16 = 0x4b;
pub const OP_ARG_PUSHA: u16 = 0x4c;
pub const OP_ARG_PUSHO: u16 = 0x4d;
pub const OP_ARG_PUSHS: u16 = 0x4e;
pub const OP_MESSAGE: u16 = 0x50;
pub const OP_IF_ZONE_CLEAR: u16 = 0x88;
pub const OP_SET_FLOOR_HANDLER: u16 = 0x95;
pub const OP_GET_DIFFLVL: u16 = 0xb9;
pub const OP_SYNC_LETI: u16 = 0xd9;
pub const OP_GET_SLOTNUMBER: u16 = 0xe6;
pub const OP_GET_NPC_DATA: u16 = 0xf841;
pub const OP_GET_RANDOM: u16 = 0xf89a;
pub const OP_NPC_ACTION_STRING: u16 = 0xf8dc;
pub const OP_LOAD_UNK_DATA: u16 = 0xf8f2;

/// Leading bytes that introduce a two-byte opcode.
pub const TWO_BYTE_PREFIXES: [u8; 2] = [0xf8, 0xf9];

/// What a label parameter points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelKind {
    /// Untyped label
    Any,
    /// Start of an instruction sequence
    Instruction,
    /// Start of a data segment
    Data,
    /// Start of a string segment
    String,
}

/// Type of an opcode parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    /// 8-bit integer
    Byte,
    /// 16-bit integer
    Word,
    /// 32-bit integer
    DWord,
    /// 32-bit float
    Float,
    /// 16-bit label reference
    Label(LabelKind),
    /// Null-terminated string in the active character width
    String,
    /// Reference to a register. With `Some`, a tuple of consecutive registers starting at the
    /// referenced one, each with its own type and access.
    Register(Option<Vec<Param>>),
    /// One-byte count followed by that many elements of the given type
    Variadic(Box<ParamType>),
    /// Raw memory pointer, only found inside register tuples
    Pointer,
    /// Anything, only found inside register tuples
    Any,
}

impl ParamType {
    pub fn is_variadic(&self) -> bool {
        matches!(self, ParamType::Variadic(_))
    }

    pub fn is_label(&self) -> bool {
        match self {
            ParamType::Label(_) => true,
            ParamType::Variadic(elem) => elem.is_label(),
            _ => false,
        }
    }

    /// Register tuple elements, if this is a register tuple
    pub fn registers(&self) -> Option<&[Param]> {
        match self {
            ParamType::Register(Some(regs)) => Some(regs),
            _ => None,
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamType::Byte => write!(f, "byte"),
            ParamType::Word => write!(f, "word"),
            ParamType::DWord => write!(f, "dword"),
            ParamType::Float => write!(f, "float"),
            ParamType::Label(LabelKind::Any) => write!(f, "label"),
            ParamType::Label(LabelKind::Instruction) => write!(f, "ilabel"),
            ParamType::Label(LabelKind::Data) => write!(f, "dlabel"),
            ParamType::Label(LabelKind::String) => write!(f, "slabel"),
            ParamType::String => write!(f, "string"),
            ParamType::Register(None) => write!(f, "reg"),
            ParamType::Register(Some(regs)) => write!(f, "reg_tuple[{}]", regs.len()),
            ParamType::Variadic(elem) => write!(f, "{}...", elem),
            ParamType::Pointer => write!(f, "pointer"),
            ParamType::Any => write!(f, "any"),
        }
    }
}

/// How an instruction accesses a referenced register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// One parameter of an opcode.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: ParamType,
    /// Only set for register references and register tuple elements
    pub access: Option<Access>,
}

impl Param {
    pub fn new(ty: ParamType) -> Self {
        Self { ty, access: None }
    }

    pub fn with_access(ty: ParamType, access: Access) -> Self {
        Self {
            ty,
            access: Some(access),
        }
    }

    pub fn writes(&self) -> bool {
        self.access.is_some_and(Access::writes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid parameter description {0:?}")]
pub struct ParamSpecError(pub String);

/// Parses the short parameter notation used by opcode table files.
///
/// `byte`, `word`, `dword`, `float`, `string`, `label`, `ilabel`, `dlabel`, `slabel` are plain
/// parameters. `reg` references a register, `reg:w` and `reg:rw` one that is written.
/// `reg(dword, dword:w)` is a tuple of consecutive registers, read unless marked otherwise, whose
/// elements may also be `pointer` or `any`. A trailing `...` makes any of these variadic.
impl FromStr for Param {
    type Err = ParamSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || ParamSpecError(s.to_string());

        if let Some(elem) = s.strip_suffix("...") {
            let elem: Param = elem.parse().map_err(|_| invalid())?;
            if elem.ty.is_variadic() {
                return Err(invalid());
            }
            return Ok(Param {
                ty: ParamType::Variadic(Box::new(elem.ty)),
                access: elem.access,
            });
        }

        if let Some(inner) = s.strip_prefix("reg(").and_then(|rest| rest.strip_suffix(')')) {
            let registers = inner
                .split(',')
                .map(|elem| {
                    let elem: Param = elem.parse().map_err(|_| invalid())?;
                    if matches!(elem.ty, ParamType::Register(_) | ParamType::Variadic(_)) {
                        return Err(invalid());
                    }
                    Ok(Param::with_access(elem.ty, elem.access.unwrap_or(Access::Read)))
                })
                .collect::<Result<Vec<_>, _>>()?;

            return Ok(Param::new(ParamType::Register(Some(registers))));
        }

        let (name, access) = match s.split_once(':') {
            None => (s, None),
            Some((name, "r")) => (name, Some(Access::Read)),
            Some((name, "w")) => (name, Some(Access::Write)),
            Some((name, "rw")) => (name, Some(Access::ReadWrite)),
            Some(_) => return Err(invalid()),
        };

        let ty = match name {
            "byte" => ParamType::Byte,
            "word" => ParamType::Word,
            "dword" => ParamType::DWord,
            "float" => ParamType::Float,
            "string" => ParamType::String,
            "label" => ParamType::Label(LabelKind::Any),
            "ilabel" => ParamType::Label(LabelKind::Instruction),
            "dlabel" => ParamType::Label(LabelKind::Data),
            "slabel" => ParamType::Label(LabelKind::String),
            "pointer" => ParamType::Pointer,
            "any" => ParamType::Any,
            "reg" => {
                return Ok(Param::with_access(
                    ParamType::Register(None),
                    access.unwrap_or(Access::Read),
                ))
            }
            _ => return Err(invalid()),
        };

        Ok(Param { ty, access })
    }
}

/// Whether an instruction interacts with the argument stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackInteraction {
    #[default]
    None,
    /// Pushes its argument onto the stack
    Push,
    /// Takes all of its arguments from the stack instead of inline bytes
    Pop,
}

/// Description of one VM instruction.
///
/// Variadic parameters are always the last parameter of an opcode.
#[derive(Debug, Clone)]
pub struct Opcode {
    /// One- or two-byte code; two-byte codes start with 0xf8 or 0xf9
    pub code: u16,
    pub mnemonic: String,
    pub params: Vec<Param>,
    pub stack: StackInteraction,
    /// False for opcodes synthesized for codes missing from the table
    pub known: bool,
}

impl Opcode {
    pub fn new(code: u16, mnemonic: &str, params: Vec<Param>, stack: StackInteraction) -> Self {
        Self {
            code,
            mnemonic: mnemonic.to_string(),
            params,
            stack,
            known: true,
        }
    }

    /// Placeholder for a code that isn't in the table.
    pub fn unknown(code: u16) -> Self {
        let mnemonic = if code <= 0xff {
            format!("unknown_{:02x}", code)
        } else {
            format!("unknown_{:04x}", code)
        };

        Self {
            code,
            mnemonic,
            params: Vec::new(),
            stack: StackInteraction::None,
            known: false,
        }
    }

    /// Encoded size of the opcode itself in bytes
    pub fn size(&self) -> usize {
        if self.code <= 0xff {
            1
        } else {
            2
        }
    }

    pub fn pops(&self) -> bool {
        self.stack == StackInteraction::Pop
    }

    pub fn pushes(&self) -> bool {
        self.stack == StackInteraction::Push
    }
}

impl PartialEq for Opcode {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl Eq for Opcode {}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic)
    }
}

/// Lookup from opcode code to its description.
#[derive(Debug, Clone, Default)]
pub struct OpcodeTable {
    opcodes: HashMap<u16, Arc<Opcode>>,
    by_mnemonic: HashMap<String, u16>,
}

impl OpcodeTable {
    pub fn new(opcodes: impl IntoIterator<Item = Opcode>) -> Self {
        let mut table = Self::default();
        for opcode in opcodes {
            table.insert(opcode);
        }
        table
    }

    pub fn insert(&mut self, opcode: Opcode) {
        self.by_mnemonic.insert(opcode.mnemonic.clone(), opcode.code);
        self.opcodes.insert(opcode.code, Arc::new(opcode));
    }

    /// Returns the opcode for `code`, or an unknown placeholder without parameters.
    pub fn get(&self, code: u16) -> Arc<Opcode> {
        match self.opcodes.get(&code) {
            Some(opcode) => Arc::clone(opcode),
            None => Arc::new(Opcode::unknown(code)),
        }
    }

    pub fn contains(&self, code: u16) -> bool {
        self.opcodes.contains_key(&code)
    }

    pub fn by_mnemonic(&self, mnemonic: &str) -> Option<Arc<Opcode>> {
        self.by_mnemonic
            .get(mnemonic)
            .and_then(|code| self.opcodes.get(code))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.opcodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.opcodes.is_empty()
    }

    /// The core instruction set: control flow, registers, arithmetic, the argument stack, and
    /// the opcodes whose parameters reference labels. Other codes decode as unknown opcodes
    /// unless added, e.g. through [`crate::config::Config::opcode_table`].
    pub fn standard() -> Self {
        use StackInteraction::{None as Plain, Pop, Push};

        let op = |code: u16, mnemonic: &str, params: Vec<Param>| Opcode::new(code, mnemonic, params, Plain);
        let pop = |code: u16, mnemonic: &str, params: Vec<Param>| Opcode::new(code, mnemonic, params, Pop);
        let push = |code: u16, mnemonic: &str, params: Vec<Param>| Opcode::new(code, mnemonic, params, Push);

        let mut opcodes = vec![
            op(OP_NOP, "nop", vec![]),
            op(OP_RET, "ret", vec![]),
            op(OP_SYNC, "sync", vec![]),
            pop(OP_EXIT, "exit", vec![dword()]),
            op(OP_THREAD, "thread", vec![ilabel()]),
            op(OP_VA_START, "va_start", vec![]),
            op(OP_VA_END, "va_end", vec![]),
            op(OP_VA_CALL, "va_call", vec![ilabel()]),
            op(OP_LET, "let", vec![reg(ParamType::DWord, Access::Write), reg(ParamType::DWord, Access::Read)]),
            op(OP_LETI, "leti", vec![reg(ParamType::DWord, Access::Write), dword()]),
            op(OP_LETB, "letb", vec![reg(ParamType::Byte, Access::Write), byte()]),
            op(OP_LETW, "letw", vec![reg(ParamType::Word, Access::Write), word()]),
            op(0x0c, "leta", vec![reg(ParamType::Pointer, Access::Write), reg(ParamType::Any, Access::Read)]),
            op(0x0d, "leto", vec![reg(ParamType::Pointer, Access::Write), label(LabelKind::Any)]),
            op(OP_SET, "set", vec![reg(ParamType::DWord, Access::Write)]),
            op(OP_CLEAR, "clear", vec![reg(ParamType::DWord, Access::Write)]),
            op(OP_REV, "rev", vec![reg(ParamType::DWord, Access::ReadWrite)]),
            op(0x13, "gset", vec![word()]),
            op(0x14, "gclear", vec![word()]),
            op(0x15, "grev", vec![word()]),
            op(0x16, "glet", vec![word()]),
            op(0x17, "gget", vec![word(), reg(ParamType::Word, Access::Write)]),
            op(OP_JMP, "jmp", vec![ilabel()]),
            op(OP_CALL, "call", vec![ilabel()]),
            op(OP_JMP_ON, "jmp_on", vec![ilabel(), reg_var()]),
            op(OP_JMP_OFF, "jmp_off", vec![ilabel(), reg_var()]),
            op(OP_SWITCH_JMP, "switch_jmp", vec![reg(ParamType::DWord, Access::Read), ilabel_var()]),
            op(OP_SWITCH_CALL, "switch_call", vec![reg(ParamType::DWord, Access::Read), ilabel_var()]),
            op(0x42, "stack_push", vec![reg(ParamType::Any, Access::Read)]),
            op(0x43, "stack_pop", vec![reg(ParamType::Any, Access::Write)]),
            op(OP_STACK_PUSHM, "stack_pushm", vec![reg_ref(Access::Read), dword()]),
            op(OP_STACK_POPM, "stack_popm", vec![reg_ref(Access::Write), dword()]),
            push(OP_ARG_PUSHR, "arg_pushr", vec![reg(ParamType::Any, Access::Read)]),
            push(OP_ARG_PUSHL, "arg_pushl", vec![dword()]),
            push(OP_ARG_PUSHB, "arg_pushb", vec![byte()]),
            push(OP_ARG_PUSHW, "arg_pushw", vec![word()]),
            push(OP_ARG_PUSHA, "arg_pusha", vec![reg(ParamType::Any, Access::Read)]),
            push(OP_ARG_PUSHO, "arg_pusho", vec![label(LabelKind::Any)]),
            push(OP_ARG_PUSHS, "arg_pushs", vec![string()]),
            pop(OP_MESSAGE, "message", vec![dword(), string()]),
            op(0x51, "list", vec![reg(ParamType::Byte, Access::Write), string()]),
            op(0x52, "fadein", vec![]),
            op(0x53, "fadeout", vec![]),
            pop(0x5a, "window_msg", vec![string()]),
            pop(0x5b, "add_msg", vec![string()]),
            op(0x5c, "mesend", vec![]),
            op(0x66, "npc_crp_v3", vec![tuple(vec![
                ParamType::Any,
                ParamType::Any,
                ParamType::Any,
                ParamType::Label(LabelKind::Instruction),
                ParamType::Any,
                ParamType::Any,
            ])]),
            op(OP_IF_ZONE_CLEAR, "if_zone_clear", vec![
                reg(ParamType::DWord, Access::Write),
                tuple(vec![ParamType::DWord, ParamType::DWord]),
            ]),
            op(0x8c, "at_coords_call", vec![coords_tuple()]),
            op(0x8d, "at_coords_talk", vec![coords_tuple()]),
            op(0x8e, "col_npcin", vec![coords_tuple()]),
            pop(OP_SET_FLOOR_HANDLER, "set_floor_handler", vec![dword(), ilabel()]),
            pop(0x96, "clr_floor_handler", vec![dword()]),
            op(0xa1, "set_qt_failure", vec![ilabel()]),
            op(0xa2, "set_qt_success", vec![ilabel()]),
            op(0xa5, "set_qt_cancel", vec![ilabel()]),
            op(OP_GET_DIFFLVL, "get_difflvl", vec![reg(ParamType::DWord, Access::Write)]),
            op(0xba, "set_qt_exit", vec![ilabel()]),
            op(OP_SYNC_LETI, "sync_leti", vec![reg(ParamType::DWord, Access::Write), dword()]),
            op(OP_GET_SLOTNUMBER, "get_slotnumber", vec![reg(ParamType::DWord, Access::Write)]),
            op(OP_GET_NPC_DATA, "get_npc_data", vec![label(LabelKind::Data)]),
            op(OP_GET_RANDOM, "get_random", vec![
                tuple(vec![ParamType::DWord, ParamType::DWord]),
                reg(ParamType::DWord, Access::Write),
            ]),
            op(OP_NPC_ACTION_STRING, "npc_action_string", vec![
                reg(ParamType::DWord, Access::Read),
                reg(ParamType::DWord, Access::Read),
                label(LabelKind::String),
            ]),
            pop(OP_LOAD_UNK_DATA, "load_unk_data", vec![
                dword(),
                dword(),
                dword(),
                dword(),
                reg(ParamType::DWord, Access::Read),
                label(LabelKind::Data),
            ]),
        ];

        // Register-register and register-immediate arithmetic, in pairs
        let arithmetic = ["add", "sub", "mul", "div", "and", "or", "xor", "mod"];
        for (i, name) in arithmetic.into_iter().enumerate() {
            let code = 0x18 + 2 * i as u16;
            opcodes.push(op(code, name, vec![reg(ParamType::DWord, Access::Write), reg(ParamType::DWord, Access::Read)]));
            opcodes.push(op(code + 1, &format!("{}i", name), vec![reg(ParamType::DWord, Access::Write), dword()]));
        }

        // Conditional jumps, register and immediate forms alternating
        let comparisons = [
            ("jmp_=", true),
            ("jmp_!=", true),
            ("ujmp_>", false),
            ("jmp_>", false),
            ("ujmp_<", false),
            ("jmp_<", false),
            ("ujmp_>=", false),
            ("jmp_>=", false),
            ("ujmp_<=", false),
            ("jmp_<=", false),
        ];
        for (i, (name, untyped)) in comparisons.into_iter().enumerate() {
            let code = OP_JMP_E + 2 * i as u16;
            let operand = if untyped { ParamType::Any } else { ParamType::DWord };
            let immediate_name = name.replacen("jmp", "jmpi", 1);

            opcodes.push(op(code, name, vec![
                reg(operand.clone(), Access::Read),
                reg(operand, Access::Read),
                ilabel(),
            ]));
            opcodes.push(op(code + 1, &immediate_name, vec![
                reg(ParamType::DWord, Access::Read),
                dword(),
                ilabel(),
            ]));
        }

        Self::new(opcodes)
    }
}

fn byte() -> Param {
    Param::new(ParamType::Byte)
}

fn word() -> Param {
    Param::new(ParamType::Word)
}

fn dword() -> Param {
    Param::new(ParamType::DWord)
}

fn string() -> Param {
    Param::new(ParamType::String)
}

fn label(kind: LabelKind) -> Param {
    Param::new(ParamType::Label(kind))
}

fn ilabel() -> Param {
    label(LabelKind::Instruction)
}

fn ilabel_var() -> Param {
    Param::new(ParamType::Variadic(Box::new(ParamType::Label(LabelKind::Instruction))))
}

fn reg_var() -> Param {
    Param::with_access(ParamType::Variadic(Box::new(ParamType::Register(None))), Access::Read)
}

fn reg_ref(access: Access) -> Param {
    Param::with_access(ParamType::Register(None), access)
}

/// Single register of the given type.
fn reg(ty: ParamType, access: Access) -> Param {
    Param::new(ParamType::Register(Some(vec![Param::with_access(ty, access)])))
}

/// Tuple of consecutive read-only registers.
fn tuple(types: Vec<ParamType>) -> Param {
    let registers = types
        .into_iter()
        .map(|ty| Param::with_access(ty, Access::Read))
        .collect();
    Param::new(ParamType::Register(Some(registers)))
}

fn coords_tuple() -> Param {
    tuple(vec![
        ParamType::DWord,
        ParamType::DWord,
        ParamType::DWord,
        ParamType::DWord,
        ParamType::Label(LabelKind::Instruction),
    ])
}
