pub mod loader;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Write};
use std::rc::Rc;

use crate::bytecode::{bytes_to_float32, bytes_to_int32, Opcode};
use crate::value::{ArrayObj, Function, ObjRef, StrObj, Value, ValueKind};

pub const MAX_FRAMES: usize = 2048;
pub const NUM_REGISTERS: usize = 256;

/// Table selectors for the STORE/LOAD side-table instructions.
pub const INT_TABLE: i32 = 0;
pub const FLOAT_TABLE: i32 = 1;
pub const STR_TABLE: i32 = 2;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("Type Error: {op} operation on {lhs} and {rhs}")]
    BinaryType {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
    #[error("Type Error: {op} operation on {operand}")]
    UnaryType {
        op: &'static str,
        operand: &'static str,
    },
    #[error("Division by zero")]
    DivisionByZero,
    #[error("No string in the table at key {key}")]
    MissingString { key: u64 },
    #[error("No table entry at index {index}")]
    MissingTableEntry { index: i32 },
    #[error("STORE/LOAD operation on unknown table selector {0}")]
    BadTableSelector(i32),
    #[error("Array index {index} out of bounds (len {len})")]
    ArrayBounds { index: i32, len: usize },
    #[error("No function at index {index}")]
    MissingFunction { index: i32 },
    #[error("Argument index {index} out of range")]
    MissingArgument { index: i32 },
    #[error("CALL selector must be 0, got {0}")]
    BadCallSelector(i32),
    #[error("Operand stack is empty")]
    StackUnderflow,
    #[error("Invalid integer input")]
    InvalidIntInput,
    #[error("Invalid float input")]
    InvalidFloatInput,
    #[error("Failed to read input")]
    InputFailed,
    #[error("Invalid host call {0}")]
    BadHostCall(i32),
    #[error("Call frame limit exceeded")]
    FrameOverflow,
    #[error("Unexpected end of bytecode")]
    TruncatedStream,
    #[error("Illegal instruction")]
    IllegalInstruction,
    #[error("Unknown opcode byte {0}")]
    UnknownOpcode(u8),
    #[error("Jump target {0} out of range")]
    BadJumpTarget(i32),
    #[error("Function marker in executable stream")]
    StrayFunctionMarker,
    #[error("Nested function definition")]
    NestedFunction,
    #[error("Function definition without FUNCEND")]
    UnterminatedFunction,
}

impl RuntimeError {
    /// Fatal errors stop the machine; everything else is recorded and the
    /// decode loop moves on with the destination register untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RuntimeError::FrameOverflow
                | RuntimeError::TruncatedStream
                | RuntimeError::IllegalInstruction
                | RuntimeError::UnknownOpcode(_)
                | RuntimeError::BadJumpTarget(_)
                | RuntimeError::StrayFunctionMarker
        )
    }
}

/// One activation record: a fixed register bank, a LIFO operand stack, the
/// program counter, and the function whose bytes are being executed.
pub struct Frame {
    pub registers: Vec<Value>,
    pub stack: Vec<Value>,
    pub pc: usize,
    pub function: Rc<Function>,
    pub args: Vec<Value>,
}

impl Frame {
    fn new(function: Rc<Function>) -> Self {
        Frame {
            registers: vec![Value::unit(); NUM_REGISTERS],
            stack: Vec::new(),
            pc: 0,
            function,
            args: Vec::new(),
        }
    }
}

pub struct Vm {
    frames: Vec<Frame>,
    functions: Vec<Rc<Function>>,
    int_table: Vec<i32>,
    float_table: Vec<f32>,
    str_table: HashMap<u64, Rc<StrObj>>,
    staged_args: Vec<Value>,
    errors: Vec<RuntimeError>,
    running: bool,
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
}

// ── Operand decoding ─────────────────────────────────────────────────

fn next_u8(frame: &mut Frame) -> Result<u8, RuntimeError> {
    let byte = frame
        .function
        .bytes
        .get(frame.pc)
        .copied()
        .ok_or(RuntimeError::TruncatedStream)?;
    frame.pc += 1;
    Ok(byte)
}

fn next_word(frame: &mut Frame) -> Result<[u8; 4], RuntimeError> {
    Ok([
        next_u8(frame)?,
        next_u8(frame)?,
        next_u8(frame)?,
        next_u8(frame)?,
    ])
}

fn next_i32(frame: &mut Frame) -> Result<i32, RuntimeError> {
    Ok(bytes_to_int32(next_word(frame)?))
}

fn next_f32(frame: &mut Frame) -> Result<f32, RuntimeError> {
    Ok(bytes_to_float32(next_word(frame)?))
}

/// Reads bytes up to (and consuming) the 0x00 terminator.
fn next_str_bytes(frame: &mut Frame) -> Result<Vec<u8>, RuntimeError> {
    let mut out = Vec::new();
    loop {
        let byte = next_u8(frame)?;
        if byte == 0 {
            return Ok(out);
        }
        out.push(byte);
    }
}

/// Hash used for string-table keys. Confined to the 32-bit range so keys
/// survive the round trip through Int registers.
fn string_key(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish() & 0xFFFF_FFFF
}

fn int_key(v: i32) -> u64 {
    v as u32 as u64
}

impl Vm {
    pub fn new() -> Self {
        Vm::with_io(
            Box::new(BufReader::new(std::io::stdin())),
            Box::new(std::io::stdout()),
        )
    }

    pub fn with_io(input: Box<dyn BufRead>, output: Box<dyn Write>) -> Self {
        let main = Rc::new(Function {
            name: "main".to_string(),
            arity: 0,
            bytes: Vec::new(),
        });
        Vm {
            frames: vec![Frame::new(Rc::clone(&main))],
            functions: vec![main],
            int_table: Vec::new(),
            float_table: Vec::new(),
            str_table: HashMap::new(),
            staged_args: Vec::new(),
            errors: Vec::new(),
            running: true,
            input,
            output,
        }
    }

    pub fn errors(&self) -> &[RuntimeError] {
        &self.errors
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Register of the active frame.
    pub fn register(&self, index: u8) -> &Value {
        &self.top().registers[index as usize]
    }

    fn top(&self) -> &Frame {
        self.frames.last().expect("frame stack is never empty")
    }

    fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack is never empty")
    }

    fn set_reg(&mut self, index: u8, value: Value) {
        self.top_mut().registers[index as usize] = value;
    }

    fn reg(&self, index: u8) -> Value {
        self.top().registers[index as usize].clone()
    }

    /// Canonicalise a string: equal byte content always yields the same key
    /// and the same shared object. Collisions probe upward one key at a time.
    pub fn intern(&mut self, s: &str) -> (u64, Rc<StrObj>) {
        let mut key = string_key(s);
        loop {
            match self.str_table.get(&key) {
                Some(existing) if existing.value == s => {
                    debug_assert_eq!(existing.hash, key);
                    return (key, Rc::clone(existing));
                }
                Some(_) => key = key.wrapping_add(1),
                None => break,
            }
        }
        let obj = Rc::new(StrObj {
            hash: key,
            value: s.to_string(),
        });
        self.str_table.insert(key, Rc::clone(&obj));
        (key, obj)
    }

    /// Run the loaded program until HLT, a return from the main chunk, a
    /// fatal error, or the program counter running off the end of the
    /// active function.
    pub fn run(&mut self) {
        while self.running {
            let frame = self.top();
            if frame.pc >= frame.function.bytes.len() {
                break;
            }
            if let Err(e) = self.step() {
                let fatal = e.is_fatal();
                self.errors.push(e);
                if fatal {
                    self.running = false;
                }
            }
        }
        let _ = self.output.flush();
    }

    fn step(&mut self) -> Result<(), RuntimeError> {
        let byte = next_u8(self.top_mut())?;
        let op = Opcode::from_byte(byte).ok_or(RuntimeError::UnknownOpcode(byte))?;

        match op {
            Opcode::Loadi => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let v = next_i32(frame)?;
                self.set_reg(rd, Value::int(v));
            }
            Opcode::Loadf => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let v = next_f32(frame)?;
                self.set_reg(rd, Value::float(v));
            }
            Opcode::Loadnil => {
                let rd = next_u8(self.top_mut())?;
                self.set_reg(rd, Value::unit());
            }
            Opcode::Loads => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let idx = next_i32(frame)?;
                let key = int_key(idx);
                let obj = self
                    .str_table
                    .get(&key)
                    .cloned()
                    .ok_or(RuntimeError::MissingString { key })?;
                self.set_reg(rd, Value::string(obj));
            }
            Opcode::Stores => {
                let frame = self.top_mut();
                let idx = next_i32(frame)?;
                let raw = next_str_bytes(frame)?;
                let key = int_key(idx);
                let value = String::from_utf8_lossy(&raw).into_owned();
                self.str_table
                    .insert(key, Rc::new(StrObj { hash: key, value }));
            }
            Opcode::Store => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let selector = next_i32(frame)?;
                let item = self.reg(r1);
                let key = self.store_table(op, selector, &item)?;
                self.set_reg(rd, Value::int(key));
            }
            Opcode::Load => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let selector = next_i32(frame)?;
                let keyval = self.reg(r1);
                let index = keyval.as_int().ok_or(RuntimeError::UnaryType {
                    op: "LOAD",
                    operand: keyval.type_name(),
                })?;
                let value = self.load_table(selector, index)?;
                self.set_reg(rd, value);
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let r2 = next_u8(frame)?;
                let result = arith(op, &self.reg(r1), &self.reg(r2))?;
                self.set_reg(rd, result);
            }
            Opcode::Eq | Opcode::Neq | Opcode::Gt | Opcode::Gte | Opcode::Lt | Opcode::Lte => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let r2 = next_u8(frame)?;
                let result = compare(op, &self.reg(r1), &self.reg(r2))?;
                self.set_reg(rd, result);
            }
            Opcode::Bitand | Opcode::Bitor | Opcode::Bitxor => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let r2 = next_u8(frame)?;
                let a = self.reg(r1);
                let b = self.reg(r2);
                let result = match (a.as_int(), b.as_int()) {
                    (Some(x), Some(y)) => match op {
                        Opcode::Bitand => x & y,
                        Opcode::Bitor => x | y,
                        _ => x ^ y,
                    },
                    _ => {
                        return Err(RuntimeError::BinaryType {
                            op: op.mnemonic(),
                            lhs: a.type_name(),
                            rhs: b.type_name(),
                        })
                    }
                };
                self.set_reg(rd, Value::int(result));
            }
            Opcode::Bitnot => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let a = self.reg(r1);
                let v = a.as_int().ok_or(RuntimeError::UnaryType {
                    op: "BITNOT",
                    operand: a.type_name(),
                })?;
                self.set_reg(rd, Value::int(!v));
            }
            Opcode::Bitshl | Opcode::Bitshrl | Opcode::Bitshra => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let amount = next_i32(frame)?;
                let a = self.reg(r1);
                let v = a.as_int().ok_or(RuntimeError::UnaryType {
                    op: op.mnemonic(),
                    operand: a.type_name(),
                })?;
                let result = match op {
                    Opcode::Bitshl => v.wrapping_shl(amount as u32),
                    // Logical right shift: the operand is reinterpreted as
                    // unsigned so the sign bit never smears.
                    Opcode::Bitshrl => ((v as u32).wrapping_shr(amount as u32)) as i32,
                    _ => v.wrapping_shr(amount as u32),
                };
                self.set_reg(rd, Value::int(result));
            }
            Opcode::CvtID => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let a = self.reg(r1);
                let result = match a.kind {
                    ValueKind::Int(v) => Value::float(v as f32),
                    ValueKind::Float(_) => a,
                    _ => {
                        return Err(RuntimeError::UnaryType {
                            op: "CVT_I_D",
                            operand: a.type_name(),
                        })
                    }
                };
                self.set_reg(rd, result);
            }
            Opcode::CvtDI => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let a = self.reg(r1);
                let result = match a.kind {
                    ValueKind::Int(_) => a,
                    // `as` truncates toward zero.
                    ValueKind::Float(v) => Value::int(v as i32),
                    _ => {
                        return Err(RuntimeError::UnaryType {
                            op: "CVT_D_I",
                            operand: a.type_name(),
                        })
                    }
                };
                self.set_reg(rd, result);
            }
            Opcode::Negate => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let a = self.reg(r1);
                let result = match a.kind {
                    ValueKind::Int(v) => Value::int(v.wrapping_neg()),
                    ValueKind::Float(v) => Value::float(-v),
                    _ => {
                        return Err(RuntimeError::UnaryType {
                            op: "NEGATE",
                            operand: a.type_name(),
                        })
                    }
                };
                self.set_reg(rd, result);
            }
            Opcode::Hlt => {
                self.running = false;
            }
            Opcode::Jmp => {
                let target = next_i32(self.top_mut())?;
                if target < 0 {
                    return Err(RuntimeError::BadJumpTarget(target));
                }
                self.top_mut().pc = target as usize;
            }
            Opcode::JmpIf => {
                let frame = self.top_mut();
                let r1 = next_u8(frame)?;
                let target = next_i32(frame)?;
                if target < 0 {
                    return Err(RuntimeError::BadJumpTarget(target));
                }
                let cond = self.reg(r1);
                let taken = match cond.kind {
                    ValueKind::Int(v) => v != 0,
                    ValueKind::Float(v) => v != 0.0,
                    _ => {
                        return Err(RuntimeError::UnaryType {
                            op: "JMP_IF",
                            operand: cond.type_name(),
                        })
                    }
                };
                if taken {
                    self.top_mut().pc = target as usize;
                }
            }
            Opcode::Push => {
                let frame = self.top_mut();
                let r1 = next_u8(frame)?;
                let v = frame.registers[r1 as usize].clone();
                frame.stack.push(v);
            }
            Opcode::Pop => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let v = frame.stack.pop().ok_or(RuntimeError::StackUnderflow)?;
                frame.registers[rd as usize] = v;
            }
            Opcode::Vmcall => {
                let frame = self.top_mut();
                let r1 = next_u8(frame)?;
                let r2 = next_u8(frame)?;
                let mode = next_i32(frame)?;
                self.host_call(r1, r2, mode)?;
            }
            Opcode::SetArg => {
                let frame = self.top_mut();
                let r1 = next_u8(frame)?;
                let v = frame.registers[r1 as usize].clone();
                self.staged_args.push(v);
            }
            Opcode::GetArg => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let index = next_i32(frame)?;
                let arg = usize::try_from(index)
                    .ok()
                    .and_then(|i| self.top().args.get(i))
                    .cloned()
                    .ok_or(RuntimeError::MissingArgument { index })?;
                self.set_reg(rd, arg);
            }
            Opcode::Call => {
                let frame = self.top_mut();
                let _rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let index = next_i32(frame)?;
                let selector = self.reg(r1);
                match selector.as_int() {
                    Some(0) => {}
                    Some(v) => return Err(RuntimeError::BadCallSelector(v)),
                    None => {
                        return Err(RuntimeError::UnaryType {
                            op: "CALL",
                            operand: selector.type_name(),
                        })
                    }
                }
                let function = usize::try_from(index)
                    .ok()
                    .and_then(|i| self.functions.get(i))
                    .cloned()
                    .ok_or(RuntimeError::MissingFunction { index })?;
                if self.frames.len() >= MAX_FRAMES {
                    return Err(RuntimeError::FrameOverflow);
                }
                let mut callee = Frame::new(function);
                callee.registers = self.top().registers.clone();
                callee.args = std::mem::take(&mut self.staged_args);
                self.frames.push(callee);
            }
            Opcode::Return => {
                self.staged_args.clear();
                if self.frames.len() == 1 {
                    self.running = false;
                } else {
                    self.frames.pop();
                }
            }
            Opcode::NewArray => {
                let rd = next_u8(self.top_mut())?;
                let array = Rc::new(std::cell::RefCell::new(ArrayObj::default()));
                self.set_reg(rd, Value::obj(ObjRef::Array(array)));
            }
            Opcode::SetArray => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let r2 = next_u8(frame)?;
                let item = self.reg(rd);
                let (array, index) = self.array_and_index(op, r1, r2)?;
                let mut inner = array.borrow_mut();
                let len = inner.values.len();
                // Writing one past the end grows the array by one slot.
                let at = usize::try_from(index)
                    .ok()
                    .filter(|&i| i <= len)
                    .ok_or(RuntimeError::ArrayBounds { index, len })?;
                if at == len {
                    inner.values.push(item);
                } else {
                    inner.values[at] = item;
                }
            }
            Opcode::GetArray => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let r2 = next_u8(frame)?;
                let (array, index) = self.array_and_index(op, r1, r2)?;
                let value = {
                    let inner = array.borrow();
                    let at = bounded_index(index, inner.values.len())?;
                    inner.values[at].clone()
                };
                self.set_reg(rd, value);
            }
            Opcode::RmArray => {
                let frame = self.top_mut();
                let _rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let r2 = next_u8(frame)?;
                let (array, index) = self.array_and_index(op, r1, r2)?;
                let mut inner = array.borrow_mut();
                let at = bounded_index(index, inner.values.len())?;
                inner.values.remove(at);
            }
            Opcode::GetArrayLen => {
                let frame = self.top_mut();
                let rd = next_u8(frame)?;
                let r1 = next_u8(frame)?;
                let a = self.reg(r1);
                let array = a.as_array().ok_or(RuntimeError::UnaryType {
                    op: "GET_ARRAY_LEN",
                    operand: a.type_name(),
                })?;
                let len = array.borrow().values.len() as i32;
                self.set_reg(rd, Value::int(len));
            }
            Opcode::Igl => return Err(RuntimeError::IllegalInstruction),
            Opcode::Nop => {}
            Opcode::Funcdef | Opcode::FuncdefG | Opcode::Funcend => {
                return Err(RuntimeError::StrayFunctionMarker)
            }
        }

        Ok(())
    }

    fn array_and_index(
        &self,
        op: Opcode,
        r1: u8,
        r2: u8,
    ) -> Result<(Rc<std::cell::RefCell<ArrayObj>>, i32), RuntimeError> {
        let a = self.reg(r1);
        let i = self.reg(r2);
        match (a.as_array(), i.as_int()) {
            (Some(array), Some(index)) => Ok((Rc::clone(array), index)),
            _ => Err(RuntimeError::BinaryType {
                op: op.mnemonic(),
                lhs: a.type_name(),
                rhs: i.type_name(),
            }),
        }
    }

    fn store_table(&mut self, op: Opcode, selector: i32, item: &Value) -> Result<i32, RuntimeError> {
        match selector {
            INT_TABLE => {
                let v = item.as_int().ok_or(RuntimeError::UnaryType {
                    op: op.mnemonic(),
                    operand: item.type_name(),
                })?;
                let key = self.int_table.len() as i32;
                self.int_table.push(v);
                Ok(key)
            }
            FLOAT_TABLE => {
                let v = item.as_float().ok_or(RuntimeError::UnaryType {
                    op: op.mnemonic(),
                    operand: item.type_name(),
                })?;
                let key = self.float_table.len() as i32;
                self.float_table.push(v);
                Ok(key)
            }
            STR_TABLE => {
                let s = item.as_str().ok_or(RuntimeError::UnaryType {
                    op: op.mnemonic(),
                    operand: item.type_name(),
                })?;
                // Always installs a fresh entry: probe upward for a free key.
                let mut key = string_key(&s.value);
                while self.str_table.contains_key(&key) {
                    key = key.wrapping_add(1);
                }
                self.str_table.insert(
                    key,
                    Rc::new(StrObj {
                        hash: key,
                        value: s.value.clone(),
                    }),
                );
                Ok(key as i32)
            }
            other => Err(RuntimeError::BadTableSelector(other)),
        }
    }

    fn load_table(&self, selector: i32, index: i32) -> Result<Value, RuntimeError> {
        match selector {
            INT_TABLE => usize::try_from(index)
                .ok()
                .and_then(|i| self.int_table.get(i))
                .map(|v| Value::int(*v))
                .ok_or(RuntimeError::MissingTableEntry { index }),
            FLOAT_TABLE => usize::try_from(index)
                .ok()
                .and_then(|i| self.float_table.get(i))
                .map(|v| Value::float(*v))
                .ok_or(RuntimeError::MissingTableEntry { index }),
            STR_TABLE => {
                let key = int_key(index);
                self.str_table
                    .get(&key)
                    .cloned()
                    .map(Value::string)
                    .ok_or(RuntimeError::MissingString { key })
            }
            other => Err(RuntimeError::BadTableSelector(other)),
        }
    }

    /// The single IO trap. Mode 0 prints, modes 1-3 read a stdin line into
    /// the target register. A print of an unprintable value is recorded
    /// directly so the newline flag still gets its turn.
    fn host_call(&mut self, r1: u8, r2: u8, mode: i32) -> Result<(), RuntimeError> {
        match mode {
            0 => {
                let v = self.reg(r1);
                match &v.kind {
                    ValueKind::Int(n) => {
                        let _ = write!(self.output, "{}", n);
                    }
                    ValueKind::Float(n) => {
                        let _ = write!(self.output, "{:.6}", n);
                    }
                    ValueKind::Obj(ObjRef::Str(s)) => {
                        let _ = self.output.write_all(s.value.as_bytes());
                    }
                    _ => self.errors.push(RuntimeError::UnaryType {
                        op: "VMCALL",
                        operand: v.type_name(),
                    }),
                }
                let flag = self.reg(r2);
                match flag.as_int() {
                    Some(1) => {
                        let _ = self.output.write_all(b"\n");
                    }
                    Some(_) => {}
                    None => self.errors.push(RuntimeError::UnaryType {
                        op: "VMCALL",
                        operand: flag.type_name(),
                    }),
                }
                let _ = self.output.flush();
                Ok(())
            }
            1 => {
                let line = self.read_line()?;
                match line.parse::<i32>() {
                    Ok(v) => {
                        self.set_reg(r1, Value::int(v));
                        Ok(())
                    }
                    Err(_) => Err(RuntimeError::InvalidIntInput),
                }
            }
            2 => {
                let line = self.read_line()?;
                match line.parse::<f32>() {
                    Ok(v) => {
                        self.set_reg(r1, Value::float(v));
                        Ok(())
                    }
                    Err(_) => Err(RuntimeError::InvalidFloatInput),
                }
            }
            3 => {
                let line = self.read_line()?;
                let (_, obj) = self.intern(&line);
                self.set_reg(r1, Value::string(obj));
                Ok(())
            }
            other => Err(RuntimeError::BadHostCall(other)),
        }
    }

    fn read_line(&mut self) -> Result<String, RuntimeError> {
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => Err(RuntimeError::InputFailed),
            Ok(_) => {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Ok(line)
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

fn bounded_index(index: i32, len: usize) -> Result<usize, RuntimeError> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < len)
        .ok_or(RuntimeError::ArrayBounds { index, len })
}

fn arith(op: Opcode, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    match (&a.kind, &b.kind) {
        (ValueKind::Int(x), ValueKind::Int(y)) => {
            let v = match op {
                Opcode::Add => x.wrapping_add(*y),
                Opcode::Sub => x.wrapping_sub(*y),
                Opcode::Mul => x.wrapping_mul(*y),
                _ => {
                    if *y == 0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    x.wrapping_div(*y)
                }
            };
            Ok(Value::int(v))
        }
        (ValueKind::Float(x), ValueKind::Float(y)) => {
            let v = match op {
                Opcode::Add => x + y,
                Opcode::Sub => x - y,
                Opcode::Mul => x * y,
                _ => {
                    if *y == 0.0 {
                        return Err(RuntimeError::DivisionByZero);
                    }
                    x / y
                }
            };
            Ok(Value::float(v))
        }
        _ => Err(RuntimeError::BinaryType {
            op: op.mnemonic(),
            lhs: a.type_name(),
            rhs: b.type_name(),
        }),
    }
}

fn compare(op: Opcode, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    let result = match (&a.kind, &b.kind) {
        (ValueKind::Int(x), ValueKind::Int(y)) => match op {
            Opcode::Eq => x == y,
            Opcode::Neq => x != y,
            Opcode::Gt => x > y,
            Opcode::Gte => x >= y,
            Opcode::Lt => x < y,
            _ => x <= y,
        },
        (ValueKind::Float(x), ValueKind::Float(y)) => match op {
            Opcode::Eq => x == y,
            Opcode::Neq => x != y,
            Opcode::Gt => x > y,
            Opcode::Gte => x >= y,
            Opcode::Lt => x < y,
            _ => x <= y,
        },
        _ => {
            return Err(RuntimeError::BinaryType {
                op: op.mnemonic(),
                lhs: a.type_name(),
                rhs: b.type_name(),
            })
        }
    };
    Ok(Value::int(result as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::assemble;
    use crate::scanner::scan;
    use std::cell::RefCell;
    use std::io::Cursor;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn compile(source: &str) -> Vec<u8> {
        let asm = assemble(&scan(source));
        assert!(asm.errors.is_empty(), "assembly failed: {:?}", asm.errors);
        asm.bytes
    }

    fn run_with_io(source: &str, stdin: &str) -> (Vm, SharedBuf) {
        let out = SharedBuf::default();
        let mut vm = Vm::with_io(
            Box::new(Cursor::new(stdin.to_string())),
            Box::new(out.clone()),
        );
        vm.load_program(&compile(source)).expect("load failed");
        vm.run();
        (vm, out)
    }

    fn run_source(source: &str) -> Vm {
        run_with_io(source, "").0
    }

    #[test]
    fn add_and_print() {
        let (vm, out) = run_with_io(
            "LOADI r3, 1\nLOADI r0, 5\nLOADI r1, 7\nADD r2, r0, r1\nVMCALL r2, r3, 0\nHLT",
            "",
        );
        assert_eq!(out.contents(), "12\n");
        assert_eq!(*vm.register(2), Value::int(12));
        assert!(vm.errors().is_empty());
    }

    #[test]
    fn print_without_newline_flag() {
        let (_, out) = run_with_io("LOADI r0, 9\nLOADI r1, 0\nVMCALL r0, r1, 0\nHLT", "");
        assert_eq!(out.contents(), "9");
    }

    #[test]
    fn float_division_by_zero_leaves_rd_unit() {
        let vm = run_source("LOADF r0, 1.0\nLOADF r1, 0.0\nDIV r2, r0, r1\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::DivisionByZero]);
        assert_eq!(*vm.register(2), Value::unit());
    }

    #[test]
    fn int_division_by_zero_leaves_rd_unit() {
        let vm = run_source("LOADI r0, 1\nLOADI r1, 0\nDIV r2, r0, r1\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::DivisionByZero]);
        assert_eq!(*vm.register(2), Value::unit());
    }

    #[test]
    fn mixed_tags_are_a_type_error() {
        let vm = run_source("LOADI r0, 1\nLOADF r1, 1.0\nADD r2, r0, r1\nHLT");
        assert!(matches!(
            vm.errors()[0],
            RuntimeError::BinaryType { op: "ADD", .. }
        ));
        assert_eq!(*vm.register(2), Value::unit());
    }

    #[test]
    fn integer_arithmetic_wraps() {
        let vm = run_source("LOADI r0, 2147483647\nLOADI r1, 1\nADD r2, r0, r1\nHLT");
        assert_eq!(*vm.register(2), Value::int(i32::MIN));
    }

    #[test]
    fn interning_shares_one_object() {
        let vm = run_source("STORES 0, \"hi\"\nLOADS r0, 0\nLOADS r1, 0\nHLT");
        let a = vm.register(0).as_str().expect("string in r0");
        let b = vm.register(1).as_str().expect("string in r1");
        assert!(Rc::ptr_eq(a, b));
        assert_eq!(vm.str_table.len(), 1);
        assert_eq!(vm.str_table[&0].value, "hi");
    }

    #[test]
    fn stores_overwrites_existing_key() {
        let vm = run_source("STORES 0, \"one\"\nSTORES 0, \"two\"\nLOADS r0, 0\nHLT");
        assert_eq!(vm.register(0).as_str().unwrap().value, "two");
        assert_eq!(vm.str_table.len(), 1);
    }

    #[test]
    fn loads_missing_entry_is_a_diagnostic() {
        let vm = run_source("LOADS r0, 3\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::MissingString { key: 3 }]);
        assert_eq!(*vm.register(0), Value::unit());
    }

    #[test]
    fn jump_not_taken_on_zero() {
        let vm = run_source("LOADI r0, 0\nJMP_IF r0, @end\nLOADI r1, 42\nend: HLT");
        assert_eq!(*vm.register(1), Value::int(42));
        assert!(vm.errors().is_empty());
    }

    #[test]
    fn jump_taken_on_nonzero() {
        let vm = run_source("LOADI r0, 1\nJMP_IF r0, @end\nLOADI r1, 42\nend: HLT");
        assert_eq!(*vm.register(1), Value::unit());
    }

    #[test]
    fn jump_taken_on_nonzero_float() {
        let vm = run_source("LOADF r0, 0.5\nJMP_IF r0, @end\nLOADI r1, 42\nend: HLT");
        assert_eq!(*vm.register(1), Value::unit());
    }

    #[test]
    fn jump_if_on_unit_records_and_falls_through() {
        let vm = run_source("JMP_IF r0, @end\nLOADI r1, 42\nend: HLT");
        assert!(matches!(
            vm.errors()[0],
            RuntimeError::UnaryType { op: "JMP_IF", .. }
        ));
        assert_eq!(*vm.register(1), Value::int(42));
    }

    #[test]
    fn array_round_trip() {
        let vm = run_source(
            "NEW_ARRAY r0\nLOADI r1, 99\nLOADI r2, 0\nSET_ARRAY r1, r0, r2\nGET_ARRAY r3, r0, r2\nHLT",
        );
        assert_eq!(*vm.register(3), Value::int(99));
        assert!(vm.errors().is_empty());
    }

    #[test]
    fn array_length_and_remove() {
        let vm = run_source(
            "NEW_ARRAY r0\nLOADI r1, 5\nLOADI r2, 0\nSET_ARRAY r1, r0, r2\n\
             LOADI r1, 6\nLOADI r2, 1\nSET_ARRAY r1, r0, r2\n\
             GET_ARRAY_LEN r3, r0\n\
             RM_ARRAY r4, r0, r2\n\
             GET_ARRAY_LEN r5, r0\nHLT",
        );
        assert_eq!(*vm.register(3), Value::int(2));
        assert_eq!(*vm.register(5), Value::int(1));
    }

    #[test]
    fn array_index_past_end_is_a_diagnostic() {
        let vm = run_source("NEW_ARRAY r0\nLOADI r1, 9\nLOADI r2, 1\nSET_ARRAY r1, r0, r2\nHLT");
        assert!(matches!(
            vm.errors()[0],
            RuntimeError::ArrayBounds { index: 1, .. }
        ));
    }

    #[test]
    fn logical_right_shift_never_sign_extends() {
        let vm = run_source("LOADI r0, -1\nBITSHRL r1, r0, 1\nHLT");
        assert_eq!(*vm.register(1), Value::int(0x7FFF_FFFF));
    }

    #[test]
    fn arithmetic_right_shift_keeps_sign() {
        let vm = run_source("LOADI r0, -4\nBITSHRA r1, r0, 1\nHLT");
        assert_eq!(*vm.register(1), Value::int(-2));
    }

    #[test]
    fn bitwise_ops() {
        let vm = run_source(
            "LOADI r0, 12\nLOADI r1, 10\nBITAND r2, r0, r1\nBITOR r3, r0, r1\n\
             BITXOR r4, r0, r1\nBITNOT r5, r0\nBITSHL r6, r1, 2\nHLT",
        );
        assert_eq!(*vm.register(2), Value::int(8));
        assert_eq!(*vm.register(3), Value::int(14));
        assert_eq!(*vm.register(4), Value::int(6));
        assert_eq!(*vm.register(5), Value::int(!12));
        assert_eq!(*vm.register(6), Value::int(40));
    }

    #[test]
    fn compares_yield_int_flags() {
        let vm = run_source(
            "LOADI r0, 3\nLOADI r1, 4\nLT r2, r0, r1\nGTE r3, r0, r1\nEQ r4, r0, r0\nHLT",
        );
        assert_eq!(*vm.register(2), Value::int(1));
        assert_eq!(*vm.register(3), Value::int(0));
        assert_eq!(*vm.register(4), Value::int(1));
    }

    #[test]
    fn conversions() {
        let vm = run_source(
            "LOADI r0, 3\nCVT_I_D r1, r0\nLOADF r2, 2.7\nCVT_D_I r3, r2\n\
             LOADF r4, -2.7\nCVT_D_I r5, r4\nHLT",
        );
        assert_eq!(*vm.register(1), Value::float(3.0));
        assert_eq!(*vm.register(3), Value::int(2));
        assert_eq!(*vm.register(5), Value::int(-2));
    }

    #[test]
    fn negate_preserves_tag() {
        let vm = run_source("LOADI r0, 5\nNEGATE r1, r0\nLOADF r2, 1.5\nNEGATE r3, r2\nHLT");
        assert_eq!(*vm.register(1), Value::int(-5));
        assert_eq!(*vm.register(3), Value::float(-1.5));
    }

    #[test]
    fn push_pop_round_trip() {
        let vm = run_source("LOADI r0, 7\nPUSH r0\nLOADI r0, 0\nPOP r1\nHLT");
        assert_eq!(*vm.register(1), Value::int(7));
    }

    #[test]
    fn pop_on_empty_stack_is_a_diagnostic() {
        let vm = run_source("POP r1\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::StackUnderflow]);
        assert_eq!(*vm.register(1), Value::unit());
    }

    #[test]
    fn halt_stops_execution() {
        let vm = run_source("HLT\nLOADI r0, 9");
        assert_eq!(*vm.register(0), Value::unit());
        assert!(!vm.is_running());
    }

    #[test]
    fn untouched_registers_stay_unit() {
        let vm = run_source("LOADI r0, 1\nHLT");
        for i in 1..=255u8 {
            assert_eq!(*vm.register(i), Value::unit(), "register {i}");
        }
    }

    #[test]
    fn side_tables_round_trip() {
        let vm = run_source(
            "LOADI r0, 77\nSTORE r1, r0, 0\nLOAD r2, r1, 0\n\
             LOADF r3, 1.5\nSTORE r4, r3, 1\nLOAD r5, r4, 1\nHLT",
        );
        assert_eq!(*vm.register(1), Value::int(0));
        assert_eq!(*vm.register(2), Value::int(77));
        assert_eq!(*vm.register(4), Value::int(0));
        assert_eq!(*vm.register(5), Value::float(1.5));
    }

    #[test]
    fn string_store_probes_to_a_fresh_key() {
        let vm =
            run_source("STORES 0, \"hi\"\nLOADS r0, 0\nSTORE r1, r0, 2\nLOAD r2, r1, 2\nHLT");
        assert!(vm.errors().is_empty(), "{:?}", vm.errors());
        assert_eq!(vm.register(2).as_str().unwrap().value, "hi");
        // STORE never reuses the existing entry.
        assert_eq!(vm.str_table.len(), 2);
    }

    #[test]
    fn unknown_table_selector_is_a_diagnostic() {
        let vm = run_source("LOADI r0, 1\nSTORE r1, r0, 9\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::BadTableSelector(9)]);
    }

    #[test]
    fn missing_table_entry_is_a_diagnostic() {
        let vm = run_source("LOADI r0, 4\nLOAD r1, r0, 0\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::MissingTableEntry { index: 4 }]);
        assert_eq!(*vm.register(1), Value::unit());
    }

    #[test]
    fn call_passes_args_and_shares_heap() {
        // The callee reads its argument, adds one, and stores the result in
        // an array the caller also holds a handle to.
        let vm = run_source(
            "NEW_ARRAY r9\n\
             LOADI r0, 50\n\
             SET_ARG r0\n\
             LOADI r1, 0\n\
             CALL r0, r1, 1\n\
             LOADI r2, 0\n\
             GET_ARRAY r3, r9, r2\n\
             HLT\n\
             FUNCDEF r0, 1\n\
             GET_ARG r4, 0\n\
             LOADI r5, 1\n\
             ADD r6, r4, r5\n\
             LOADI r7, 0\n\
             SET_ARRAY r6, r9, r7\n\
             RETURN\n\
             FUNCEND",
        );
        assert!(vm.errors().is_empty(), "{:?}", vm.errors());
        assert_eq!(*vm.register(3), Value::int(51));
        assert_eq!(vm.frame_depth(), 1);
    }

    #[test]
    fn call_with_nonzero_selector_is_a_diagnostic() {
        let vm =
            run_source("LOADI r1, 1\nCALL r0, r1, 1\nHLT\nFUNCDEF r0, 1\nRETURN\nFUNCEND");
        assert_eq!(vm.errors(), &[RuntimeError::BadCallSelector(1)]);
        assert_eq!(vm.frame_depth(), 1);
    }

    #[test]
    fn call_missing_function_is_a_diagnostic() {
        let vm = run_source("LOADI r1, 0\nCALL r0, r1, 5\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::MissingFunction { index: 5 }]);
    }

    #[test]
    fn get_arg_out_of_range_is_a_diagnostic() {
        let vm = run_source("GET_ARG r0, 0\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::MissingArgument { index: 0 }]);
    }

    #[test]
    fn unbounded_recursion_hits_the_frame_limit() {
        let vm = run_source(
            "LOADI r1, 0\n\
             CALL r0, r1, 1\n\
             HLT\n\
             FUNCDEF r0, 1\n\
             LOADI r1, 0\n\
             CALL r0, r1, 1\n\
             RETURN\n\
             FUNCEND",
        );
        assert_eq!(vm.errors(), &[RuntimeError::FrameOverflow]);
        assert!(!vm.is_running());
        assert!(vm.frame_depth() <= MAX_FRAMES);
    }

    #[test]
    fn return_from_main_halts() {
        let vm = run_source("RETURN\nLOADI r0, 9");
        assert_eq!(*vm.register(0), Value::unit());
        assert!(!vm.is_running());
        assert_eq!(vm.frame_depth(), 1);
    }

    #[test]
    fn illegal_instruction_is_fatal() {
        let vm = run_source("IGL\nLOADI r0, 9");
        assert_eq!(vm.errors(), &[RuntimeError::IllegalInstruction]);
        assert!(!vm.is_running());
        assert_eq!(*vm.register(0), Value::unit());
    }

    #[test]
    fn unknown_opcode_byte_is_fatal() {
        let mut vm = Vm::new();
        vm.load_program(&[200]).unwrap();
        vm.run();
        assert_eq!(vm.errors(), &[RuntimeError::UnknownOpcode(200)]);
        assert!(!vm.is_running());
    }

    #[test]
    fn truncated_stream_is_fatal() {
        let mut vm = Vm::new();
        // LOADI with only one operand byte.
        vm.load_program(&[0, 0]).unwrap();
        vm.run();
        assert_eq!(vm.errors(), &[RuntimeError::TruncatedStream]);
        assert!(!vm.is_running());
    }

    #[test]
    fn nop_does_nothing() {
        let vm = run_source("NOP\nLOADI r0, 1\nNOP\nHLT");
        assert_eq!(*vm.register(0), Value::int(1));
        assert!(vm.errors().is_empty());
    }

    #[test]
    fn read_int_from_stdin() {
        let (vm, _) = run_with_io("VMCALL r0, r0, 1\nHLT", "42\n");
        assert_eq!(*vm.register(0), Value::int(42));
    }

    #[test]
    fn read_int_parse_failure_leaves_register() {
        let (vm, _) = run_with_io("LOADI r0, 7\nVMCALL r0, r0, 1\nHLT", "nope\n");
        assert_eq!(vm.errors(), &[RuntimeError::InvalidIntInput]);
        assert_eq!(*vm.register(0), Value::int(7));
    }

    #[test]
    fn read_float_from_stdin() {
        let (vm, _) = run_with_io("VMCALL r0, r0, 2\nHLT", "2.5\n");
        assert_eq!(*vm.register(0), Value::float(2.5));
    }

    #[test]
    fn read_string_interns_the_line() {
        let (vm, out) = run_with_io(
            "VMCALL r0, r0, 3\nLOADI r1, 1\nVMCALL r0, r1, 0\nHLT",
            "hello\n",
        );
        assert_eq!(out.contents(), "hello\n");
        let obj = vm.register(0).as_str().expect("interned string").clone();
        assert_eq!(obj.value, "hello");
        assert!(vm.str_table.contains_key(&obj.hash));
    }

    #[test]
    fn read_past_eof_is_a_diagnostic() {
        let (vm, _) = run_with_io("VMCALL r0, r0, 1\nHLT", "");
        assert_eq!(vm.errors(), &[RuntimeError::InputFailed]);
    }

    #[test]
    fn unknown_host_call_is_a_diagnostic() {
        let vm = run_source("VMCALL r0, r0, 9\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::BadHostCall(9)]);
    }

    #[test]
    fn print_float_uses_six_decimals() {
        let (_, out) = run_with_io("LOADF r0, 1.5\nLOADI r1, 1\nVMCALL r0, r1, 0\nHLT", "");
        assert_eq!(out.contents(), "1.500000\n");
    }

    #[test]
    fn print_unit_is_a_diagnostic_but_flag_still_runs() {
        let (vm, out) = run_with_io("LOADI r1, 1\nVMCALL r0, r1, 0\nHLT", "");
        assert!(matches!(
            vm.errors()[0],
            RuntimeError::UnaryType { op: "VMCALL", .. }
        ));
        assert_eq!(out.contents(), "\n");
    }

    #[test]
    fn intern_is_idempotent() {
        let mut vm = Vm::new();
        let (k1, o1) = vm.intern("abc");
        let (k2, o2) = vm.intern("abc");
        assert_eq!(k1, k2);
        assert!(Rc::ptr_eq(&o1, &o2));
        assert_eq!(vm.str_table.len(), 1);
    }

    #[test]
    fn intern_probes_past_a_colliding_key() {
        let mut vm = Vm::new();
        let key = string_key("abc");
        vm.str_table.insert(
            key,
            Rc::new(StrObj {
                hash: key,
                value: "squatter".to_string(),
            }),
        );
        let (k, obj) = vm.intern("abc");
        assert_eq!(k, key + 1);
        assert_eq!(obj.value, "abc");
        // A second intern finds the probed entry again.
        let (k2, obj2) = vm.intern("abc");
        assert_eq!(k2, k);
        assert!(Rc::ptr_eq(&obj, &obj2));
    }

    #[test]
    fn const_flag_round_trips_through_stack_and_assignment() {
        let mut vm = Vm::new();
        vm.load_program(&compile("PUSH r0\nPOP r1\nHLT")).unwrap();
        let mut v = Value::int(7);
        v.is_const = true;
        vm.frames[0].registers[0] = v;
        vm.run();
        assert!(vm.register(1).is_const);
        assert_eq!(vm.register(1).as_int(), Some(7));
    }

    #[test]
    fn negative_jump_target_is_fatal() {
        let vm = run_source("JMP -4\nHLT");
        assert_eq!(vm.errors(), &[RuntimeError::BadJumpTarget(-4)]);
        assert!(!vm.is_running());
    }

    #[test]
    fn jump_past_end_stops_the_frame() {
        let vm = run_source("LOADI r0, 1\nJMP 100");
        assert!(vm.errors().is_empty());
        assert_eq!(*vm.register(0), Value::int(1));
    }

    #[test]
    fn backward_jump_loops() {
        // Counts r0 down from 3 to 0.
        let vm = run_source(
            "LOADI r0, 3\n\
             LOADI r1, 1\n\
             top: SUB r0, r0, r1\n\
             JMP_IF r0, @top\n\
             HLT",
        );
        assert_eq!(*vm.register(0), Value::int(0));
        assert!(vm.errors().is_empty());
    }
}
