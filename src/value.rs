use std::cell::RefCell;
use std::rc::Rc;

/// An interned string. Immutable once installed; `hash` always equals the
/// key it is stored under in the string table.
#[derive(Debug, PartialEq)]
pub struct StrObj {
    pub hash: u64,
    pub value: String,
}

#[derive(Debug, Default, PartialEq)]
pub struct ArrayObj {
    pub values: Vec<Value>,
}

/// One executable chunk. Immutable after load; `bytes` is what a frame's
/// program counter indexes into.
#[derive(Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub arity: usize,
    pub bytes: Vec<u8>,
}

/// Shared handle to a heap object. Clones share the underlying allocation;
/// the object is released when the last handle drops.
#[derive(Debug, Clone)]
pub enum ObjRef {
    Str(Rc<StrObj>),
    Array(Rc<RefCell<ArrayObj>>),
    // Chunks live in the interpreter's function list today; the variant
    // exists so they can circulate as first-class values.
    #[allow(dead_code)]
    Function(Rc<Function>),
}

impl PartialEq for ObjRef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ObjRef::Str(a), ObjRef::Str(b)) => Rc::ptr_eq(a, b),
            (ObjRef::Array(a), ObjRef::Array(b)) => Rc::ptr_eq(a, b),
            (ObjRef::Function(a), ObjRef::Function(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Int(i32),
    Float(f32),
    Unit,
    Obj(ObjRef),
}

/// A tagged runtime value. `is_const` is carried through every copy and
/// assignment but is not enforced by any instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub kind: ValueKind,
    pub is_const: bool,
}

impl Value {
    pub fn int(v: i32) -> Self {
        Value {
            kind: ValueKind::Int(v),
            is_const: false,
        }
    }

    pub fn float(v: f32) -> Self {
        Value {
            kind: ValueKind::Float(v),
            is_const: false,
        }
    }

    pub fn unit() -> Self {
        Value {
            kind: ValueKind::Unit,
            is_const: false,
        }
    }

    pub fn obj(obj: ObjRef) -> Self {
        Value {
            kind: ValueKind::Obj(obj),
            is_const: false,
        }
    }

    pub fn string(s: Rc<StrObj>) -> Self {
        Value::obj(ObjRef::Str(s))
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ValueKind::Int(_) => "int32",
            ValueKind::Float(_) => "float32",
            ValueKind::Unit => "unit",
            ValueKind::Obj(_) => "object",
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self.kind {
            ValueKind::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self.kind {
            ValueKind::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&Rc<StrObj>> {
        match &self.kind {
            ValueKind::Obj(ObjRef::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Rc<RefCell<ArrayObj>>> {
        match &self.kind {
            ValueKind::Obj(ObjRef::Array(a)) => Some(a),
            _ => None,
        }
    }

}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ValueKind::Int(v) => write!(f, "{}", v),
            ValueKind::Float(v) => write!(f, "{:.6}", v),
            ValueKind::Unit => write!(f, "NIL"),
            ValueKind::Obj(ObjRef::Str(s)) => write!(f, "{}", s.value),
            ValueKind::Obj(ObjRef::Array(a)) => {
                write!(f, "[")?;
                for (i, v) in a.borrow().values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            ValueKind::Obj(ObjRef::Function(func)) => {
                write!(f, "<fn {}/{}>", func.name, func.arity)
            }
        }
    }
}
