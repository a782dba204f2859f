use std::rc::Rc;

use super::{Frame, RuntimeError, Vm};
use crate::bytecode::{bytes_to_int32, Opcode};
use crate::value::Function;

const FUNCDEF: u8 = Opcode::Funcdef as u8;
const FUNCDEF_G: u8 = Opcode::FuncdefG as u8;
const FUNCEND: u8 = Opcode::Funcend as u8;

impl Vm {
    /// Split a raw byte stream into the main chunk plus one chunk per
    /// FUNCDEF..FUNCEND bracket, and reset the machine to run it. Bytes
    /// outside any bracket belong to the main function (index 0).
    pub fn load_program(&mut self, bytes: &[u8]) -> Result<(), RuntimeError> {
        let mut main_bytes = Vec::new();
        let mut functions: Vec<Rc<Function>> = Vec::new();

        let mut pos = 0usize;
        while pos < bytes.len() {
            match bytes[pos] {
                FUNCDEF | FUNCDEF_G => {
                    pos += 1; // header opcode
                    pos += 1; // register byte
                    let index = if pos + 4 <= bytes.len() {
                        bytes_to_int32([
                            bytes[pos],
                            bytes[pos + 1],
                            bytes[pos + 2],
                            bytes[pos + 3],
                        ])
                    } else {
                        return Err(RuntimeError::TruncatedStream);
                    };
                    pos += 4;

                    let mut body = Vec::new();
                    loop {
                        match bytes.get(pos) {
                            None => return Err(RuntimeError::UnterminatedFunction),
                            Some(&FUNCEND) => {
                                pos += 1;
                                break;
                            }
                            Some(&(FUNCDEF | FUNCDEF_G)) => {
                                return Err(RuntimeError::NestedFunction)
                            }
                            Some(&b) => {
                                body.push(b);
                                pos += 1;
                            }
                        }
                    }

                    functions.push(Rc::new(Function {
                        name: format!("fn{}", index),
                        arity: 0,
                        bytes: body,
                    }));
                }
                b => {
                    main_bytes.push(b);
                    pos += 1;
                }
            }
        }

        let main = Rc::new(Function {
            name: "main".to_string(),
            arity: 0,
            bytes: main_bytes,
        });
        self.functions.clear();
        self.functions.push(Rc::clone(&main));
        self.functions.extend(functions);
        self.frames.clear();
        self.frames.push(Frame::new(main));
        self.int_table.clear();
        self.float_table.clear();
        self.str_table.clear();
        self.staged_args.clear();
        self.errors.clear();
        self.running = true;
        Ok(())
    }
}
