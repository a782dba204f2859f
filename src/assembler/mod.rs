use std::collections::HashMap;

use crate::bytecode::{bytes_to_float32, bytes_to_int32, float32_to_bytes, int32_to_bytes, Opcode};
use crate::scanner::{Span, Token, TokenKind};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AsmError {
    #[error("{message}")]
    Scan { message: String, span: Span },
    #[error("Type Error at position {position}")]
    OperandType { position: usize, span: Span },
    #[error("Unexpected token at position {position}")]
    UnexpectedToken { position: usize, span: Span },
    #[error("Unexpected end of input after {mnemonic}")]
    UnexpectedEof { mnemonic: &'static str },
    #[error("Undefined label: {name}")]
    UndefinedLabel { name: String, span: Span },
    #[error("Truncated instruction at offset {offset}")]
    Truncated { offset: usize },
    #[error("Unknown opcode byte {byte} at offset {offset}")]
    UnknownByte { byte: u8, offset: usize },
}

impl AsmError {
    pub fn span(&self) -> Option<Span> {
        match self {
            AsmError::Scan { span, .. }
            | AsmError::OperandType { span, .. }
            | AsmError::UnexpectedToken { span, .. }
            | AsmError::UndefinedLabel { span, .. } => Some(*span),
            _ => None,
        }
    }
}

/// One logical instruction between the passes: the opcode plus whichever
/// operands its grammar produced. Jump targets keep the label name until
/// pass 2 resolves it.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub rd: Option<u8>,
    pub r1: Option<u8>,
    pub r2: Option<u8>,
    pub int_val: Option<i32>,
    pub float_val: Option<f32>,
    pub str_val: Option<String>,
    pub label_ref: Option<String>,
}

impl Instruction {
    fn new(op: Opcode) -> Self {
        Instruction {
            op,
            rd: None,
            r1: None,
            r2: None,
            int_val: None,
            float_val: None,
            str_val: None,
            label_ref: None,
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.op)?;
        let mut sep = " ";
        let mut field = |f: &mut std::fmt::Formatter<'_>, text: String| {
            let r = write!(f, "{}{}", sep, text);
            sep = ", ";
            r
        };
        if let Some(rd) = self.rd {
            field(f, format!("r{rd}"))?;
        }
        if let Some(r1) = self.r1 {
            field(f, format!("r{r1}"))?;
        }
        if let Some(r2) = self.r2 {
            field(f, format!("r{r2}"))?;
        }
        if let Some(v) = self.int_val {
            field(f, format!("{v}"))?;
        }
        if let Some(v) = self.float_val {
            field(f, format!("{v:?}"))?;
        }
        if let Some(s) = &self.str_val {
            field(f, format!("{s:?}"))?;
        }
        if let Some(l) = &self.label_ref {
            field(f, format!("@{l}"))?;
        }
        Ok(())
    }
}

pub struct Assembly {
    pub bytes: Vec<u8>,
    pub errors: Vec<AsmError>,
}

/// Assemble a token stream. Errors accumulate; the byte stream is still
/// returned, but callers must not run it unless `errors` is empty.
pub fn assemble(tokens: &[Token]) -> Assembly {
    let mut asm = Assembler {
        tokens,
        pos: 0,
        instructions: Vec::new(),
        labels: HashMap::new(),
        errors: Vec::new(),
    };
    asm.first_pass();
    let bytes = asm.second_pass();
    Assembly {
        bytes,
        errors: asm.errors,
    }
}

struct Assembler<'t> {
    tokens: &'t [Token],
    pos: usize,
    instructions: Vec<Instruction>,
    labels: HashMap<String, u32>,
    errors: Vec<AsmError>,
}

impl<'t> Assembler<'t> {
    fn next(&mut self) -> Option<&'t Token> {
        let tokens: &'t [Token] = self.tokens;
        let tok = tokens.get(self.pos)?;
        self.pos += 1;
        Some(tok)
    }

    fn type_error(&mut self, tok: &Token) {
        self.errors.push(AsmError::OperandType {
            position: tok.span.start,
            span: tok.span,
        });
    }

    fn expect_register(&mut self, mnemonic: &'static str) -> Option<u8> {
        match self.next() {
            Some(tok) => match tok.kind {
                TokenKind::Register(r) => Some(r),
                _ => {
                    self.type_error(tok);
                    None
                }
            },
            None => {
                self.errors.push(AsmError::UnexpectedEof { mnemonic });
                None
            }
        }
    }

    fn expect_int(&mut self, mnemonic: &'static str) -> Option<i32> {
        match self.next() {
            Some(tok) => match tok.kind {
                TokenKind::Int32(v) => Some(v),
                _ => {
                    self.type_error(tok);
                    None
                }
            },
            None => {
                self.errors.push(AsmError::UnexpectedEof { mnemonic });
                None
            }
        }
    }

    fn expect_float(&mut self, mnemonic: &'static str) -> Option<f32> {
        match self.next() {
            Some(tok) => match tok.kind {
                TokenKind::Float32(v) => Some(v),
                _ => {
                    self.type_error(tok);
                    None
                }
            },
            None => {
                self.errors.push(AsmError::UnexpectedEof { mnemonic });
                None
            }
        }
    }

    fn expect_string(&mut self, mnemonic: &'static str) -> Option<String> {
        match self.next() {
            Some(tok) => match &tok.kind {
                TokenKind::Str(s) => Some(s.clone()),
                _ => {
                    self.type_error(tok);
                    None
                }
            },
            None => {
                self.errors.push(AsmError::UnexpectedEof { mnemonic });
                None
            }
        }
    }

    /// A jump target: either a raw byte offset or a label reference.
    fn expect_target(&mut self, mnemonic: &'static str, instr: &mut Instruction) -> bool {
        match self.next() {
            Some(tok) => match &tok.kind {
                TokenKind::Int32(v) => {
                    instr.int_val = Some(*v);
                    true
                }
                TokenKind::LabelRef(name) => {
                    instr.label_ref = Some(name.clone());
                    true
                }
                _ => {
                    self.type_error(tok);
                    false
                }
            },
            None => {
                self.errors.push(AsmError::UnexpectedEof { mnemonic });
                false
            }
        }
    }

    /// Pass 1: group tokens into instructions, compute the byte offset each
    /// one will occupy, and capture label positions. Nothing is emitted yet
    /// because a label may be referenced before it is defined.
    fn first_pass(&mut self) {
        let mut offset: u32 = 0;

        while let Some(tok) = self.next() {
            let op = match &tok.kind {
                TokenKind::Op(op) => *op,
                TokenKind::Label(name) => {
                    self.labels.insert(name.clone(), offset);
                    continue;
                }
                TokenKind::Err(msg) => {
                    self.errors.push(AsmError::Scan {
                        message: msg.clone(),
                        span: tok.span,
                    });
                    continue;
                }
                _ => {
                    self.errors.push(AsmError::UnexpectedToken {
                        position: tok.span.start,
                        span: tok.span,
                    });
                    continue;
                }
            };

            let mn = op.mnemonic();
            let mut instr = Instruction::new(op);
            let size: u32 = match op {
                Opcode::Loadi | Opcode::Loads => {
                    instr.rd = self.expect_register(mn);
                    instr.int_val = self.expect_int(mn);
                    6
                }
                Opcode::Loadf => {
                    instr.rd = self.expect_register(mn);
                    instr.float_val = self.expect_float(mn);
                    6
                }
                Opcode::Loadnil | Opcode::NewArray | Opcode::Pop => {
                    instr.rd = self.expect_register(mn);
                    2
                }
                Opcode::Push | Opcode::SetArg => {
                    instr.r1 = self.expect_register(mn);
                    2
                }
                Opcode::Stores => {
                    instr.int_val = self.expect_int(mn);
                    instr.str_val = self.expect_string(mn);
                    5 + instr.str_val.as_ref().map_or(0, |s| s.len() as u32) + 1
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Eq
                | Opcode::Neq
                | Opcode::Gt
                | Opcode::Gte
                | Opcode::Lt
                | Opcode::Lte
                | Opcode::Bitand
                | Opcode::Bitor
                | Opcode::Bitxor
                | Opcode::SetArray
                | Opcode::GetArray
                | Opcode::RmArray => {
                    instr.rd = self.expect_register(mn);
                    instr.r1 = self.expect_register(mn);
                    instr.r2 = self.expect_register(mn);
                    4
                }
                Opcode::Bitnot
                | Opcode::Negate
                | Opcode::CvtID
                | Opcode::CvtDI
                | Opcode::GetArrayLen => {
                    instr.rd = self.expect_register(mn);
                    instr.r1 = self.expect_register(mn);
                    3
                }
                Opcode::Bitshl | Opcode::Bitshrl | Opcode::Bitshra => {
                    instr.rd = self.expect_register(mn);
                    instr.r1 = self.expect_register(mn);
                    instr.int_val = self.expect_int(mn);
                    7
                }
                Opcode::Hlt | Opcode::Return | Opcode::Funcend | Opcode::Igl | Opcode::Nop => 1,
                Opcode::Jmp => {
                    self.expect_target(mn, &mut instr);
                    5
                }
                Opcode::JmpIf => {
                    instr.r1 = self.expect_register(mn);
                    self.expect_target(mn, &mut instr);
                    6
                }
                Opcode::Vmcall => {
                    instr.r1 = self.expect_register(mn);
                    instr.r2 = self.expect_register(mn);
                    instr.int_val = self.expect_int(mn);
                    7
                }
                Opcode::Call | Opcode::Store | Opcode::Load => {
                    instr.rd = self.expect_register(mn);
                    instr.r1 = self.expect_register(mn);
                    instr.int_val = self.expect_int(mn);
                    7
                }
                Opcode::GetArg => {
                    instr.rd = self.expect_register(mn);
                    instr.int_val = self.expect_int(mn);
                    6
                }
                Opcode::Funcdef | Opcode::FuncdefG => {
                    instr.rd = self.expect_register(mn);
                    instr.int_val = self.expect_int(mn);
                    6
                }
            };

            if instruction_complete(&instr) {
                offset += size;
                self.instructions.push(instr);
            }
        }
    }

    /// Pass 2: emit opcode and operand bytes, resolving label references to
    /// the offsets captured in pass 1.
    fn second_pass(&mut self) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut late_errors = Vec::new();

        for instr in &self.instructions {
            bytes.push(instr.op.byte());
            match instr.op {
                Opcode::Loadi | Opcode::Loads => {
                    bytes.push(instr.rd.unwrap_or(0));
                    bytes.extend_from_slice(&int32_to_bytes(instr.int_val.unwrap_or(0)));
                }
                Opcode::Loadf => {
                    bytes.push(instr.rd.unwrap_or(0));
                    bytes.extend_from_slice(&float32_to_bytes(instr.float_val.unwrap_or(0.0)));
                }
                Opcode::Loadnil | Opcode::NewArray | Opcode::Pop => {
                    bytes.push(instr.rd.unwrap_or(0));
                }
                Opcode::Push | Opcode::SetArg => {
                    bytes.push(instr.r1.unwrap_or(0));
                }
                Opcode::Stores => {
                    bytes.extend_from_slice(&int32_to_bytes(instr.int_val.unwrap_or(0)));
                    if let Some(s) = &instr.str_val {
                        bytes.extend_from_slice(s.as_bytes());
                    }
                    bytes.push(0);
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Eq
                | Opcode::Neq
                | Opcode::Gt
                | Opcode::Gte
                | Opcode::Lt
                | Opcode::Lte
                | Opcode::Bitand
                | Opcode::Bitor
                | Opcode::Bitxor
                | Opcode::SetArray
                | Opcode::GetArray
                | Opcode::RmArray => {
                    bytes.push(instr.rd.unwrap_or(0));
                    bytes.push(instr.r1.unwrap_or(0));
                    bytes.push(instr.r2.unwrap_or(0));
                }
                Opcode::Bitnot
                | Opcode::Negate
                | Opcode::CvtID
                | Opcode::CvtDI
                | Opcode::GetArrayLen => {
                    bytes.push(instr.rd.unwrap_or(0));
                    bytes.push(instr.r1.unwrap_or(0));
                }
                Opcode::Bitshl | Opcode::Bitshrl | Opcode::Bitshra => {
                    bytes.push(instr.rd.unwrap_or(0));
                    bytes.push(instr.r1.unwrap_or(0));
                    bytes.extend_from_slice(&int32_to_bytes(instr.int_val.unwrap_or(0)));
                }
                Opcode::Hlt | Opcode::Return | Opcode::Funcend | Opcode::Igl | Opcode::Nop => {}
                Opcode::Jmp => {
                    let target = self.resolve_target(instr, &mut late_errors);
                    bytes.extend_from_slice(&int32_to_bytes(target));
                }
                Opcode::JmpIf => {
                    bytes.push(instr.r1.unwrap_or(0));
                    let target = self.resolve_target(instr, &mut late_errors);
                    bytes.extend_from_slice(&int32_to_bytes(target));
                }
                Opcode::Vmcall => {
                    bytes.push(instr.r1.unwrap_or(0));
                    bytes.push(instr.r2.unwrap_or(0));
                    bytes.extend_from_slice(&int32_to_bytes(instr.int_val.unwrap_or(0)));
                }
                Opcode::Call | Opcode::Store | Opcode::Load => {
                    bytes.push(instr.rd.unwrap_or(0));
                    bytes.push(instr.r1.unwrap_or(0));
                    bytes.extend_from_slice(&int32_to_bytes(instr.int_val.unwrap_or(0)));
                }
                Opcode::GetArg | Opcode::Funcdef | Opcode::FuncdefG => {
                    bytes.push(instr.rd.unwrap_or(0));
                    bytes.extend_from_slice(&int32_to_bytes(instr.int_val.unwrap_or(0)));
                }
            }
        }

        self.errors.extend(late_errors);
        bytes
    }

    fn resolve_target(&self, instr: &Instruction, errors: &mut Vec<AsmError>) -> i32 {
        if let Some(name) = &instr.label_ref {
            match self.labels.get(name) {
                Some(offset) => *offset as i32,
                None => {
                    errors.push(AsmError::UndefinedLabel {
                        name: name.clone(),
                        span: Span { start: 0, end: 0 },
                    });
                    0
                }
            }
        } else {
            instr.int_val.unwrap_or(0)
        }
    }
}

/// True when every operand the opcode's grammar requires was parsed.
fn instruction_complete(instr: &Instruction) -> bool {
    match instr.op {
        Opcode::Loadi | Opcode::Loads | Opcode::GetArg | Opcode::Funcdef | Opcode::FuncdefG => {
            instr.rd.is_some() && instr.int_val.is_some()
        }
        Opcode::Loadf => instr.rd.is_some() && instr.float_val.is_some(),
        Opcode::Loadnil | Opcode::NewArray | Opcode::Pop => instr.rd.is_some(),
        Opcode::Push | Opcode::SetArg => instr.r1.is_some(),
        Opcode::Stores => instr.int_val.is_some() && instr.str_val.is_some(),
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Eq
        | Opcode::Neq
        | Opcode::Gt
        | Opcode::Gte
        | Opcode::Lt
        | Opcode::Lte
        | Opcode::Bitand
        | Opcode::Bitor
        | Opcode::Bitxor
        | Opcode::SetArray
        | Opcode::GetArray
        | Opcode::RmArray => instr.rd.is_some() && instr.r1.is_some() && instr.r2.is_some(),
        Opcode::Bitnot | Opcode::Negate | Opcode::CvtID | Opcode::CvtDI | Opcode::GetArrayLen => {
            instr.rd.is_some() && instr.r1.is_some()
        }
        Opcode::Bitshl | Opcode::Bitshrl | Opcode::Bitshra => {
            instr.rd.is_some() && instr.r1.is_some() && instr.int_val.is_some()
        }
        Opcode::Hlt | Opcode::Return | Opcode::Funcend | Opcode::Igl | Opcode::Nop => true,
        Opcode::Jmp => instr.int_val.is_some() || instr.label_ref.is_some(),
        Opcode::JmpIf => {
            instr.r1.is_some() && (instr.int_val.is_some() || instr.label_ref.is_some())
        }
        Opcode::Vmcall => instr.r1.is_some() && instr.r2.is_some() && instr.int_val.is_some(),
        Opcode::Call | Opcode::Store | Opcode::Load => {
            instr.rd.is_some() && instr.r1.is_some() && instr.int_val.is_some()
        }
    }
}

// ── Disassembly ──────────────────────────────────────────────────────
//
// The inverse of pass 2: used by the `--bytes` dump and by round-trip tests.
// Label references come back as raw offsets.

pub fn disassemble(bytes: &[u8]) -> Result<Vec<Instruction>, AsmError> {
    let mut out = Vec::new();
    let mut pos = 0usize;

    let take = |pos: &mut usize, n: usize| -> Result<usize, AsmError> {
        let at = *pos;
        if at + n > bytes.len() {
            return Err(AsmError::Truncated { offset: at });
        }
        *pos += n;
        Ok(at)
    };

    while pos < bytes.len() {
        let at = pos;
        let byte = bytes[pos];
        pos += 1;
        let op = Opcode::from_byte(byte).ok_or(AsmError::UnknownByte { byte, offset: at })?;
        let mut instr = Instruction::new(op);

        match op {
            Opcode::Loadi | Opcode::Loads | Opcode::GetArg | Opcode::Funcdef | Opcode::FuncdefG => {
                let i = take(&mut pos, 5)?;
                instr.rd = Some(bytes[i]);
                instr.int_val = Some(bytes_to_int32(word(bytes, i + 1)));
            }
            Opcode::Loadf => {
                let i = take(&mut pos, 5)?;
                instr.rd = Some(bytes[i]);
                instr.float_val = Some(bytes_to_float32(word(bytes, i + 1)));
            }
            Opcode::Loadnil | Opcode::NewArray | Opcode::Pop => {
                let i = take(&mut pos, 1)?;
                instr.rd = Some(bytes[i]);
            }
            Opcode::Push | Opcode::SetArg => {
                let i = take(&mut pos, 1)?;
                instr.r1 = Some(bytes[i]);
            }
            Opcode::Stores => {
                let i = take(&mut pos, 4)?;
                instr.int_val = Some(bytes_to_int32(word(bytes, i)));
                let start = pos;
                while pos < bytes.len() && bytes[pos] != 0 {
                    pos += 1;
                }
                if pos >= bytes.len() {
                    return Err(AsmError::Truncated { offset: at });
                }
                instr.str_val = Some(String::from_utf8_lossy(&bytes[start..pos]).into_owned());
                pos += 1; // terminator
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Eq
            | Opcode::Neq
            | Opcode::Gt
            | Opcode::Gte
            | Opcode::Lt
            | Opcode::Lte
            | Opcode::Bitand
            | Opcode::Bitor
            | Opcode::Bitxor
            | Opcode::SetArray
            | Opcode::GetArray
            | Opcode::RmArray => {
                let i = take(&mut pos, 3)?;
                instr.rd = Some(bytes[i]);
                instr.r1 = Some(bytes[i + 1]);
                instr.r2 = Some(bytes[i + 2]);
            }
            Opcode::Bitnot | Opcode::Negate | Opcode::CvtID | Opcode::CvtDI | Opcode::GetArrayLen => {
                let i = take(&mut pos, 2)?;
                instr.rd = Some(bytes[i]);
                instr.r1 = Some(bytes[i + 1]);
            }
            Opcode::Bitshl | Opcode::Bitshrl | Opcode::Bitshra => {
                let i = take(&mut pos, 6)?;
                instr.rd = Some(bytes[i]);
                instr.r1 = Some(bytes[i + 1]);
                instr.int_val = Some(bytes_to_int32(word(bytes, i + 2)));
            }
            Opcode::Hlt | Opcode::Return | Opcode::Funcend | Opcode::Igl | Opcode::Nop => {}
            Opcode::Jmp => {
                let i = take(&mut pos, 4)?;
                instr.int_val = Some(bytes_to_int32(word(bytes, i)));
            }
            Opcode::JmpIf => {
                let i = take(&mut pos, 5)?;
                instr.r1 = Some(bytes[i]);
                instr.int_val = Some(bytes_to_int32(word(bytes, i + 1)));
            }
            Opcode::Vmcall => {
                let i = take(&mut pos, 6)?;
                instr.r1 = Some(bytes[i]);
                instr.r2 = Some(bytes[i + 1]);
                instr.int_val = Some(bytes_to_int32(word(bytes, i + 2)));
            }
            Opcode::Call | Opcode::Store | Opcode::Load => {
                let i = take(&mut pos, 6)?;
                instr.rd = Some(bytes[i]);
                instr.r1 = Some(bytes[i + 1]);
                instr.int_val = Some(bytes_to_int32(word(bytes, i + 2)));
            }
        }

        out.push(instr);
    }

    Ok(out)
}

fn word(bytes: &[u8], at: usize) -> [u8; 4] {
    [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]
}
