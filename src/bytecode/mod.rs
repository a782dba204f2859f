use serde::Serialize;

/// One byte per instruction tag. The numbering is dense and stable: the
/// assembler and the interpreter both rely on it, and a byte stream produced
/// by one build must decode identically in any other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Opcode {
    Loadi = 0,
    Loadf,
    Loads,
    Loadnil,
    Stores,
    Add,
    Sub,
    Mul,
    Div,
    CvtID,
    CvtDI,
    Negate,
    Hlt,
    Jmp,
    JmpIf,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Bitand,
    Bitor,
    Bitxor,
    Bitnot,
    Bitshl,
    Bitshrl,
    Bitshra,
    Vmcall,
    Push,
    Pop,
    SetArg,
    GetArg,
    Call,
    Return,
    NewArray,
    SetArray,
    GetArray,
    RmArray,
    GetArrayLen,
    Funcdef,
    FuncdefG,
    Funcend,
    Igl,
    Nop,
    Store,
    Load,
}

/// Every opcode in numeric order. `OPCODES[b]` is the opcode with byte `b`.
const OPCODES: [Opcode; 47] = [
    Opcode::Loadi,
    Opcode::Loadf,
    Opcode::Loads,
    Opcode::Loadnil,
    Opcode::Stores,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::Div,
    Opcode::CvtID,
    Opcode::CvtDI,
    Opcode::Negate,
    Opcode::Hlt,
    Opcode::Jmp,
    Opcode::JmpIf,
    Opcode::Eq,
    Opcode::Neq,
    Opcode::Gt,
    Opcode::Gte,
    Opcode::Lt,
    Opcode::Lte,
    Opcode::Bitand,
    Opcode::Bitor,
    Opcode::Bitxor,
    Opcode::Bitnot,
    Opcode::Bitshl,
    Opcode::Bitshrl,
    Opcode::Bitshra,
    Opcode::Vmcall,
    Opcode::Push,
    Opcode::Pop,
    Opcode::SetArg,
    Opcode::GetArg,
    Opcode::Call,
    Opcode::Return,
    Opcode::NewArray,
    Opcode::SetArray,
    Opcode::GetArray,
    Opcode::RmArray,
    Opcode::GetArrayLen,
    Opcode::Funcdef,
    Opcode::FuncdefG,
    Opcode::Funcend,
    Opcode::Igl,
    Opcode::Nop,
    Opcode::Store,
    Opcode::Load,
];

/// Mnemonic table, index-aligned with `OPCODES`.
const MNEMONICS: [&str; 47] = [
    "LOADI",
    "LOADF",
    "LOADS",
    "LOADNIL",
    "STORES",
    "ADD",
    "SUB",
    "MUL",
    "DIV",
    "CVT_I_D",
    "CVT_D_I",
    "NEGATE",
    "HLT",
    "JMP",
    "JMP_IF",
    "EQ",
    "NEQ",
    "GT",
    "GTE",
    "LT",
    "LTE",
    "BITAND",
    "BITOR",
    "BITXOR",
    "BITNOT",
    "BITSHL",
    "BITSHRL",
    "BITSHRA",
    "VMCALL",
    "PUSH",
    "POP",
    "SET_ARG",
    "GET_ARG",
    "CALL",
    "RETURN",
    "NEW_ARRAY",
    "SET_ARRAY",
    "GET_ARRAY",
    "RM_ARRAY",
    "GET_ARRAY_LEN",
    "FUNCDEF",
    "FUNCDEF_G",
    "FUNCEND",
    "IGL",
    "NOP",
    "STORE",
    "LOAD",
];

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        OPCODES.get(byte as usize).copied()
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn mnemonic(self) -> &'static str {
        MNEMONICS[self as u8 as usize]
    }

    /// Case-sensitive mnemonic lookup, used by the scanner.
    pub fn from_mnemonic(name: &str) -> Option<Opcode> {
        MNEMONICS
            .iter()
            .position(|&m| m == name)
            .map(|i| OPCODES[i])
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

// ── Byte-stream encoding ─────────────────────────────────────────────
//
// All multi-byte immediates are big-endian. Floats travel as the big-endian
// encoding of their IEEE 754 bit pattern.

pub fn int32_to_bytes(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

pub fn bytes_to_int32(bytes: [u8; 4]) -> i32 {
    i32::from_be_bytes(bytes)
}

pub fn float32_to_bytes(value: f32) -> [u8; 4] {
    value.to_bits().to_be_bytes()
}

pub fn bytes_to_float32(bytes: [u8; 4]) -> f32 {
    f32::from_bits(u32::from_be_bytes(bytes))
}
