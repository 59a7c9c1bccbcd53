use crate::parsers::value::{PyObject, PyValue};
use chrono::NaiveDate;
use memchr::memchr;
use std::collections::HashMap;
use thiserror::Error;

const HIGHEST_PROTOCOL: u8 = 5;

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const POP: u8 = b'0';
    pub const POP_MARK: u8 = b'1';
    pub const DUP: u8 = b'2';
    pub const FLOAT: u8 = b'F';
    pub const INT: u8 = b'I';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const LONG: u8 = b'L';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const PERSID: u8 = b'P';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const STRING: u8 = b'S';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const UNICODE: u8 = b'V';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const GET: u8 = b'g';
    pub const BINGET: u8 = b'h';
    pub const INST: u8 = b'i';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const OBJ: u8 = b'o';
    pub const PUT: u8 = b'p';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINFLOAT: u8 = b'G';

    // protocol 2
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const EXT1: u8 = 0x82;
    pub const EXT2: u8 = 0x83;
    pub const EXT4: u8 = 0x84;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;

    // protocol 3
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';

    // protocol 4
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const EMPTY_SET: u8 = 0x8f;
    pub const ADDITEMS: u8 = 0x90;
    pub const FROZENSET: u8 = 0x91;
    pub const NEWOBJ_EX: u8 = 0x92;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;

    // protocol 5
    pub const BYTEARRAY8: u8 = 0x96;
    pub const NEXT_BUFFER: u8 = 0x97;
    pub const READONLY_BUFFER: u8 = 0x98;
}

#[derive(Debug, Error)]
pub enum PickleError {
    #[error("pickle data was truncated at byte {0}")]
    Truncated(usize),

    #[error("invalid load key {opcode:#04x} at byte {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },

    #[error("unsupported pickle protocol: {0}")]
    UnsupportedProtocol(u8),

    #[error("unpickling stack underflow")]
    StackUnderflow,

    #[error("could not find MARK")]
    MissingMark,

    #[error("memo value not found at index {0}")]
    MissingMemo(u32),

    #[error("invalid {kind} literal: {text:?}")]
    InvalidLiteral { kind: &'static str, text: String },

    #[error("invalid UTF-8 in string at byte {0}")]
    InvalidUtf8(usize),

    #[error("{0} pickle has negative byte count")]
    NegativeLength(&'static str),

    #[error("odd number of items for {0}")]
    OddItems(&'static str),

    #[error("{opcode} cannot be applied to {kind}")]
    BadTarget {
        opcode: &'static str,
        kind: &'static str,
    },

    #[error("persistent IDs are not supported")]
    PersistentId,

    #[error("out-of-band buffers are not supported")]
    OutOfBandBuffer,

    #[error("object at memo index {0} contains itself")]
    Recursive(u32),
}

type Result<T> = std::result::Result<T, PickleError>;

/// Decodes one pickled object from `input`.
pub fn parse(input: &[u8]) -> Result<PyValue> {
    let mut unpickler = Unpickler::new(input);
    let value = unpickler.run()?;
    tracing::trace!(
        consumed = unpickler.pos,
        memo_entries = unpickler.memo.len(),
        "pickle machine stopped"
    );
    unpickler.resolve(value, &mut Vec::new())
}

struct Unpickler<'a> {
    input: &'a [u8],
    pos: usize,
    stack: Vec<PyValue>,
    marks: Vec<Vec<PyValue>>,
    memo: HashMap<u32, PyValue>,
}

impl<'a> Unpickler<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            input,
            pos: 0,
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    fn run(&mut self) -> Result<PyValue> {
        loop {
            let offset = self.pos;
            let opcode = self.read_u8()?;
            match opcode {
                op::PROTO => {
                    let version = self.read_u8()?;
                    if version > HIGHEST_PROTOCOL {
                        return Err(PickleError::UnsupportedProtocol(version));
                    }
                }
                op::FRAME => {
                    self.read_bytes(8)?;
                }
                op::STOP => return self.pop(),

                op::NONE => self.stack.push(PyValue::None),
                op::NEWTRUE => self.stack.push(PyValue::Bool(true)),
                op::NEWFALSE => self.stack.push(PyValue::Bool(false)),
                op::INT => {
                    let text = self.read_line_str()?;
                    let value = match text {
                        "00" => PyValue::Bool(false),
                        "01" => PyValue::Bool(true),
                        _ => int_from_text(text)?,
                    };
                    self.stack.push(value);
                }
                op::LONG => {
                    let text = self.read_line_str()?;
                    let value = int_from_text(text.strip_suffix('L').unwrap_or(text))?;
                    self.stack.push(value);
                }
                op::BININT => {
                    let n = i32::from_le_bytes(self.read_array()?);
                    self.stack.push(PyValue::Int(n.into()));
                }
                op::BININT1 => {
                    let n = self.read_u8()?;
                    self.stack.push(PyValue::Int(n.into()));
                }
                op::BININT2 => {
                    let n = u16::from_le_bytes(self.read_array()?);
                    self.stack.push(PyValue::Int(n.into()));
                }
                op::LONG1 => {
                    let len = usize::from(self.read_u8()?);
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(long_from_le(bytes));
                }
                op::LONG4 => {
                    let len = self.read_i32_len("LONG4")?;
                    let bytes = self.read_bytes(len)?;
                    self.stack.push(long_from_le(bytes));
                }
                op::FLOAT => {
                    let text = self.read_line_str()?;
                    let f = text.trim().parse::<f64>().map_err(|_| invalid("float", text))?;
                    self.stack.push(PyValue::Float(f));
                }
                op::BINFLOAT => {
                    let f = f64::from_be_bytes(self.read_array()?);
                    self.stack.push(PyValue::Float(f));
                }

                op::STRING => {
                    let line = self.read_line()?;
                    let bytes = unquote_string(line)?;
                    let s = self.utf8(bytes)?;
                    self.stack.push(PyValue::Str(s));
                }
                op::BINSTRING => {
                    let len = self.read_i32_len("BINSTRING")?;
                    let s = self.read_utf8(len)?;
                    self.stack.push(PyValue::Str(s));
                }
                op::SHORT_BINSTRING | op::SHORT_BINUNICODE => {
                    let len = usize::from(self.read_u8()?);
                    let s = self.read_utf8(len)?;
                    self.stack.push(PyValue::Str(s));
                }
                op::UNICODE => {
                    let line = self.read_line()?;
                    let s = raw_unicode_escape(line)?;
                    self.stack.push(PyValue::Str(s));
                }
                op::BINUNICODE => {
                    let len = self.read_u32_len()?;
                    let s = self.read_utf8(len)?;
                    self.stack.push(PyValue::Str(s));
                }
                op::BINUNICODE8 => {
                    let len = self.read_u64_len()?;
                    let s = self.read_utf8(len)?;
                    self.stack.push(PyValue::Str(s));
                }
                op::BINBYTES => {
                    let len = self.read_u32_len()?;
                    let bytes = self.read_bytes(len)?.to_vec();
                    self.stack.push(PyValue::Bytes(bytes));
                }
                op::SHORT_BINBYTES => {
                    let len = usize::from(self.read_u8()?);
                    let bytes = self.read_bytes(len)?.to_vec();
                    self.stack.push(PyValue::Bytes(bytes));
                }
                op::BINBYTES8 => {
                    let len = self.read_u64_len()?;
                    let bytes = self.read_bytes(len)?.to_vec();
                    self.stack.push(PyValue::Bytes(bytes));
                }
                op::BYTEARRAY8 => {
                    let len = self.read_u64_len()?;
                    let bytes = self.read_bytes(len)?.to_vec();
                    self.stack.push(PyValue::ByteArray(bytes));
                }
                op::NEXT_BUFFER => return Err(PickleError::OutOfBandBuffer),
                op::READONLY_BUFFER => {}

                op::EMPTY_LIST => self.stack.push(PyValue::List(Vec::new())),
                op::EMPTY_TUPLE => self.stack.push(PyValue::Tuple(Vec::new())),
                op::EMPTY_DICT => self.stack.push(PyValue::Dict(Vec::new())),
                op::EMPTY_SET => self.stack.push(PyValue::Set(Vec::new())),
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.stack.push(PyValue::List(items));
                }
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.stack.push(PyValue::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = usize::from(opcode - op::TUPLE1 + 1);
                    let at = self
                        .stack
                        .len()
                        .checked_sub(n)
                        .ok_or(PickleError::StackUnderflow)?;
                    let items = self.stack.split_off(at);
                    self.stack.push(PyValue::Tuple(items));
                }
                op::DICT => {
                    let items = self.pop_mark()?;
                    let pairs = pairs(items, "DICT")?;
                    self.stack.push(PyValue::Dict(pairs));
                }
                op::FROZENSET => {
                    let items = self.pop_mark()?;
                    self.stack.push(PyValue::FrozenSet(items));
                }

                op::APPEND => {
                    let item = self.pop()?;
                    self.extend_target(vec![item], "APPEND")?;
                }
                op::APPENDS => {
                    let items = self.pop_mark()?;
                    self.extend_target(items, "APPENDS")?;
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.set_items(vec![(key, value)], "SETITEM")?;
                }
                op::SETITEMS => {
                    let items = self.pop_mark()?;
                    let pairs = pairs(items, "SETITEMS")?;
                    self.set_items(pairs, "SETITEMS")?;
                }
                op::ADDITEMS => {
                    let items = self.pop_mark()?;
                    match self.target_mut()? {
                        PyValue::Set(set) => set.extend(items),
                        PyValue::Object(_) => {}
                        other => {
                            return Err(PickleError::BadTarget {
                                opcode: "ADDITEMS",
                                kind: other.type_name(),
                            });
                        }
                    }
                }
                op::BUILD => {
                    let state = self.pop()?;
                    match self.target_mut()? {
                        PyValue::Object(obj) => obj.state = Some(Box::new(state)),
                        // dict subclasses restore their instance __dict__ here
                        PyValue::Dict(_) => {}
                        other => {
                            return Err(PickleError::BadTarget {
                                opcode: "BUILD",
                                kind: other.type_name(),
                            });
                        }
                    }
                }

                op::MARK => self.marks.push(std::mem::take(&mut self.stack)),
                op::POP => {
                    if self.stack.pop().is_none() {
                        self.pop_mark()?;
                    }
                }
                op::POP_MARK => {
                    self.pop_mark()?;
                }
                op::DUP => {
                    let top = self.stack.last().ok_or(PickleError::StackUnderflow)?.clone();
                    self.stack.push(top);
                }

                op::PUT => {
                    let text = self.read_line_str()?;
                    let id = text.trim().parse().map_err(|_| invalid("memo index", text))?;
                    self.memoize(id)?;
                }
                op::BINPUT => {
                    let id = self.read_u8()?;
                    self.memoize(id.into())?;
                }
                op::LONG_BINPUT => {
                    let id = u32::from_le_bytes(self.read_array()?);
                    self.memoize(id)?;
                }
                op::MEMOIZE => {
                    let id = u32::try_from(self.memo.len())
                        .map_err(|_| invalid("memo index", &self.memo.len().to_string()))?;
                    self.memoize(id)?;
                }
                op::GET => {
                    let text = self.read_line_str()?;
                    let id = text.trim().parse().map_err(|_| invalid("memo index", text))?;
                    self.push_memo_ref(id)?;
                }
                op::BINGET => {
                    let id = self.read_u8()?;
                    self.push_memo_ref(id.into())?;
                }
                op::LONG_BINGET => {
                    let id = u32::from_le_bytes(self.read_array()?);
                    self.push_memo_ref(id)?;
                }

                op::GLOBAL => {
                    let module = self.read_line_str()?.to_owned();
                    let name = self.read_line_str()?.to_owned();
                    self.stack.push(PyValue::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop_resolved()?;
                    let module = self.pop_resolved()?;
                    match (module, name) {
                        (PyValue::Str(module), PyValue::Str(name)) => {
                            self.stack.push(PyValue::Global { module, name });
                        }
                        (module, _) => {
                            return Err(PickleError::BadTarget {
                                opcode: "STACK_GLOBAL",
                                kind: module.type_name(),
                            });
                        }
                    }
                }
                op::REDUCE => {
                    let args = self.pop_resolved()?;
                    let callable = self.pop_resolved()?;
                    let args = match args {
                        PyValue::Tuple(args) => args,
                        other => {
                            return Err(PickleError::BadTarget {
                                opcode: "REDUCE",
                                kind: other.type_name(),
                            });
                        }
                    };
                    self.stack.push(reconstruct(callable, args));
                }
                op::NEWOBJ => {
                    let args = self.pop_resolved()?;
                    let cls = self.pop_resolved()?;
                    self.stack.push(reconstruct(cls, into_args(args)));
                }
                op::NEWOBJ_EX => {
                    let _kwargs = self.pop()?;
                    let args = self.pop_resolved()?;
                    let cls = self.pop_resolved()?;
                    self.stack.push(reconstruct(cls, into_args(args)));
                }
                op::INST => {
                    let module = self.read_line_str()?.to_owned();
                    let name = self.read_line_str()?.to_owned();
                    let items = self.pop_mark()?;
                    let args = self.resolve_all(items, &mut Vec::new())?;
                    self.stack
                        .push(reconstruct(PyValue::Global { module, name }, args));
                }
                op::OBJ => {
                    let items = self.pop_mark()?;
                    let mut items = self.resolve_all(items, &mut Vec::new())?.into_iter();
                    let cls = items.next().ok_or(PickleError::StackUnderflow)?;
                    self.stack.push(reconstruct(cls, items.collect()));
                }

                op::EXT1 => {
                    let code = self.read_u8()?;
                    self.stack.push(extension(code.into()));
                }
                op::EXT2 => {
                    let code = u16::from_le_bytes(self.read_array()?);
                    self.stack.push(extension(code.into()));
                }
                op::EXT4 => {
                    let code = i32::from_le_bytes(self.read_array()?);
                    self.stack.push(extension(code.into()));
                }
                op::PERSID | op::BINPERSID => return Err(PickleError::PersistentId),

                _ => return Err(PickleError::UnknownOpcode { opcode, offset }),
            }
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .input
            .get(self.pos)
            .ok_or(PickleError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.input.len())
            .ok_or(PickleError::Truncated(self.input.len()))?;
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    fn read_i32_len(&mut self, opcode: &'static str) -> Result<usize> {
        let len = i32::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| PickleError::NegativeLength(opcode))
    }

    fn read_u32_len(&mut self) -> Result<usize> {
        let len = u32::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| PickleError::Truncated(self.input.len()))
    }

    fn read_u64_len(&mut self) -> Result<usize> {
        let len = u64::from_le_bytes(self.read_array()?);
        usize::try_from(len).map_err(|_| PickleError::Truncated(self.input.len()))
    }

    fn read_line(&mut self) -> Result<&'a [u8]> {
        let rest = &self.input[self.pos..];
        let newline = memchr(b'\n', rest).ok_or(PickleError::Truncated(self.input.len()))?;
        self.pos += newline + 1;
        let line = &rest[..newline];
        Ok(line.strip_suffix(b"\r").unwrap_or(line))
    }

    fn read_line_str(&mut self) -> Result<&'a str> {
        let start = self.pos;
        let line = self.read_line()?;
        std::str::from_utf8(line).map_err(|_| PickleError::InvalidUtf8(start))
    }

    fn read_utf8(&mut self, len: usize) -> Result<String> {
        let start = self.pos;
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| PickleError::InvalidUtf8(start))
    }

    fn utf8(&self, bytes: Vec<u8>) -> Result<String> {
        String::from_utf8(bytes).map_err(|_| PickleError::InvalidUtf8(self.pos))
    }

    fn pop(&mut self) -> Result<PyValue> {
        self.stack.pop().ok_or(PickleError::StackUnderflow)
    }

    fn pop_resolved(&mut self) -> Result<PyValue> {
        let value = self.pop()?;
        self.resolve(value, &mut Vec::new())
    }

    fn pop_mark(&mut self) -> Result<Vec<PyValue>> {
        let previous = self.marks.pop().ok_or(PickleError::MissingMark)?;
        Ok(std::mem::replace(&mut self.stack, previous))
    }

    /// Moves the top of the stack into the memo, leaving a reference behind so
    /// later mutations reach the shared value.
    fn memoize(&mut self, id: u32) -> Result<()> {
        let top = self.stack.last_mut().ok_or(PickleError::StackUnderflow)?;
        if let PyValue::MemoRef(existing) = *top {
            if existing != id {
                self.memo.insert(id, PyValue::MemoRef(existing));
            }
        } else {
            let value = std::mem::replace(top, PyValue::MemoRef(id));
            self.memo.insert(id, value);
        }
        Ok(())
    }

    fn push_memo_ref(&mut self, id: u32) -> Result<()> {
        if !self.memo.contains_key(&id) {
            return Err(PickleError::MissingMemo(id));
        }
        self.stack.push(PyValue::MemoRef(id));
        Ok(())
    }

    /// The value a mutating opcode applies to, following memo references.
    fn target_mut(&mut self) -> Result<&mut PyValue> {
        let top = self.stack.last_mut().ok_or(PickleError::StackUnderflow)?;
        let mut id = match *top {
            PyValue::MemoRef(id) => id,
            _ => return Ok(top),
        };
        let mut hops = 0;
        while let Some(PyValue::MemoRef(next)) = self.memo.get(&id) {
            hops += 1;
            if hops > self.memo.len() {
                return Err(PickleError::Recursive(id));
            }
            id = *next;
        }
        self.memo.get_mut(&id).ok_or(PickleError::MissingMemo(id))
    }

    fn extend_target(&mut self, items: Vec<PyValue>, opcode: &'static str) -> Result<()> {
        match self.target_mut()? {
            PyValue::List(list) => list.extend(items),
            PyValue::Object(obj) => obj.list_items.extend(items),
            other => {
                return Err(PickleError::BadTarget {
                    opcode,
                    kind: other.type_name(),
                });
            }
        }
        Ok(())
    }

    fn set_items(&mut self, items: Vec<(PyValue, PyValue)>, opcode: &'static str) -> Result<()> {
        match self.target_mut()? {
            PyValue::Dict(dict) => dict.extend(items),
            PyValue::Object(obj) => obj.dict_items.extend(items),
            other => {
                return Err(PickleError::BadTarget {
                    opcode,
                    kind: other.type_name(),
                });
            }
        }
        Ok(())
    }

    /// Replaces memo references with copies of the values they point to.
    fn resolve(&self, value: PyValue, visiting: &mut Vec<u32>) -> Result<PyValue> {
        Ok(match value {
            PyValue::MemoRef(id) => {
                if visiting.contains(&id) {
                    return Err(PickleError::Recursive(id));
                }
                let target = self
                    .memo
                    .get(&id)
                    .cloned()
                    .ok_or(PickleError::MissingMemo(id))?;
                visiting.push(id);
                let resolved = self.resolve(target, visiting)?;
                visiting.pop();
                resolved
            }
            PyValue::List(items) => PyValue::List(self.resolve_all(items, visiting)?),
            PyValue::Tuple(items) => PyValue::Tuple(self.resolve_all(items, visiting)?),
            PyValue::Set(items) => PyValue::Set(self.resolve_all(items, visiting)?),
            PyValue::FrozenSet(items) => PyValue::FrozenSet(self.resolve_all(items, visiting)?),
            PyValue::Dict(pairs) => PyValue::Dict(self.resolve_pairs(pairs, visiting)?),
            PyValue::Object(obj) => PyValue::Object(PyObject {
                class: obj.class,
                args: self.resolve_all(obj.args, visiting)?,
                state: match obj.state {
                    Some(state) => Some(Box::new(self.resolve(*state, visiting)?)),
                    None => None,
                },
                list_items: self.resolve_all(obj.list_items, visiting)?,
                dict_items: self.resolve_pairs(obj.dict_items, visiting)?,
            }),
            PyValue::Scalar { dtype, value } => PyValue::Scalar {
                dtype,
                value: Box::new(self.resolve(*value, visiting)?),
            },
            other => other,
        })
    }

    fn resolve_all(&self, items: Vec<PyValue>, visiting: &mut Vec<u32>) -> Result<Vec<PyValue>> {
        items
            .into_iter()
            .map(|item| self.resolve(item, visiting))
            .collect()
    }

    fn resolve_pairs(
        &self,
        pairs: Vec<(PyValue, PyValue)>,
        visiting: &mut Vec<u32>,
    ) -> Result<Vec<(PyValue, PyValue)>> {
        pairs
            .into_iter()
            .map(|(key, value)| {
                Ok::<_, PickleError>((self.resolve(key, visiting)?, self.resolve(value, visiting)?))
            })
            .collect()
    }
}

fn invalid(kind: &'static str, text: &str) -> PickleError {
    PickleError::InvalidLiteral {
        kind,
        text: text.to_owned(),
    }
}

fn pairs(items: Vec<PyValue>, opcode: &'static str) -> Result<Vec<(PyValue, PyValue)>> {
    if items.len() % 2 != 0 {
        return Err(PickleError::OddItems(opcode));
    }
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        out.push((key, value));
    }
    Ok(out)
}

fn into_args(args: PyValue) -> Vec<PyValue> {
    match args {
        PyValue::Tuple(items) => items,
        other => vec![other],
    }
}

fn extension(code: i64) -> PyValue {
    PyValue::Object(PyObject::new(None, vec![PyValue::Int(code)]))
}

fn int_from_text(text: &str) -> Result<PyValue> {
    let text = text.trim();
    if let Ok(n) = text.parse::<i64>() {
        return Ok(PyValue::Int(n));
    }
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("int", text));
    }
    let digits = digits.trim_start_matches('0');
    let sign = if negative { "-" } else { "" };
    Ok(PyValue::BigInt(format!("{sign}{digits}")))
}

/// Little-endian two's complement integer, as written by LONG1 and LONG4.
fn long_from_le(bytes: &[u8]) -> PyValue {
    let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);
    if bytes.len() <= 8 {
        let mut buf = if negative { [0xff; 8] } else { [0; 8] };
        buf[..bytes.len()].copy_from_slice(bytes);
        return PyValue::Int(i64::from_le_bytes(buf));
    }

    // magnitude, most significant byte first
    let mut magnitude: Vec<u8> = bytes.iter().rev().copied().collect();
    if negative {
        for b in magnitude.iter_mut() {
            *b = !*b;
        }
        for b in magnitude.iter_mut().rev() {
            let (sum, carry) = b.overflowing_add(1);
            *b = sum;
            if !carry {
                break;
            }
        }
    }

    let mut digits = Vec::new();
    while magnitude.iter().any(|&b| b != 0) {
        let mut remainder = 0u32;
        for b in magnitude.iter_mut() {
            let acc = (remainder << 8) | u32::from(*b);
            *b = (acc / 10) as u8;
            remainder = acc % 10;
        }
        digits.push(b'0' + remainder as u8);
    }
    if digits.is_empty() {
        digits.push(b'0');
    }
    if negative {
        digits.push(b'-');
    }
    digits.reverse();
    let text = String::from_utf8_lossy(&digits).into_owned();
    match text.parse::<i64>() {
        Ok(n) => PyValue::Int(n),
        Err(_) => PyValue::BigInt(text),
    }
}

/// Body of a protocol 0 `STRING`: a quoted Python 2 string literal.
fn unquote_string(line: &[u8]) -> Result<Vec<u8>> {
    let text = String::from_utf8_lossy(line);
    let inner = match line {
        [b'\'', inner @ .., b'\''] | [b'"', inner @ .., b'"'] => inner,
        _ => return Err(invalid("string", &text)),
    };

    let mut out = Vec::with_capacity(inner.len());
    let mut bytes = inner.iter().copied();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'a') => out.push(0x07),
            Some(b'b') => out.push(0x08),
            Some(b'f') => out.push(0x0c),
            Some(b'v') => out.push(0x0b),
            Some(b'x') => {
                let hex = [bytes.next(), bytes.next()];
                let value = match hex {
                    [Some(hi), Some(lo)] => hex_value(hi)
                        .zip(hex_value(lo))
                        .map(|(hi, lo)| hi << 4 | lo),
                    _ => None,
                };
                out.push(value.ok_or_else(|| invalid("string", &text))?);
            }
            Some(digit @ b'0'..=b'7') => {
                let mut value = u32::from(digit - b'0');
                let mut rest = bytes.clone();
                for _ in 0..2 {
                    match rest.next() {
                        Some(d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            bytes.next();
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xff) as u8);
            }
            Some(b'\n') => {}
            Some(other @ (b'\\' | b'\'' | b'"')) => out.push(other),
            Some(other) => {
                out.push(b'\\');
                out.push(other);
            }
            None => out.push(b'\\'),
        }
    }
    Ok(out)
}

/// Decodes Python's `raw-unicode-escape`: bytes are Latin-1 except for
/// `\uXXXX` and `\UXXXXXXXX` sequences.
fn raw_unicode_escape(line: &[u8]) -> Result<String> {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        let width = match (b, line.get(i + 1)) {
            (b'\\', Some(b'u')) => 4,
            (b'\\', Some(b'U')) => 8,
            _ => 0,
        };
        if width == 0 {
            out.push(char::from(b));
            i += 1;
            continue;
        }
        let hex = line
            .get(i + 2..i + 2 + width)
            .ok_or_else(|| invalid("unicode escape", &String::from_utf8_lossy(&line[i..])))?;
        let code = hex.iter().try_fold(0u32, |acc, &h| {
            hex_value(h).map(|v| acc << 4 | u32::from(v))
        });
        let c = code
            .and_then(char::from_u32)
            .ok_or_else(|| invalid("unicode escape", &String::from_utf8_lossy(hex)))?;
        out.push(c);
        i += 2 + width;
    }
    Ok(out)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Text whose characters all fit in Latin-1, as bytes.
fn latin1(text: &str) -> Option<Vec<u8>> {
    text.chars().map(|c| u8::try_from(u32::from(c)).ok()).collect()
}

/// Payload bytes of a `bytes` argument, which protocols 0-2 encode as Latin-1 text.
fn byte_payload(value: &PyValue) -> Option<Vec<u8>> {
    match value {
        PyValue::Bytes(b) => Some(b.clone()),
        PyValue::Str(s) => latin1(s),
        _ => None,
    }
}

fn as_f64(value: &PyValue) -> Option<f64> {
    match value {
        PyValue::Float(f) => Some(*f),
        PyValue::Int(n) => Some(*n as f64),
        PyValue::Bool(b) => Some(f64::from(u8::from(*b))),
        _ => None,
    }
}

/// Applies a pickled callable to its arguments for the classes we know how to
/// rebuild; everything else becomes an opaque instance.
fn reconstruct(callable: PyValue, args: Vec<PyValue>) -> PyValue {
    let (module, name) = match callable {
        PyValue::Global { module, name } => (module, name),
        _ => return PyValue::Object(PyObject::new(None, args)),
    };

    let rebuilt = match (module.as_str(), name.as_str(), args.as_slice()) {
        ("builtins" | "__builtin__", "complex", [re, im]) => as_f64(re)
            .zip(as_f64(im))
            .map(|(re, im)| PyValue::Complex { re, im }),
        ("builtins" | "__builtin__", "complex", [re]) => {
            as_f64(re).map(|re| PyValue::Complex { re, im: 0.0 })
        }
        ("builtins" | "__builtin__", "set", []) => Some(PyValue::Set(Vec::new())),
        ("builtins" | "__builtin__", "set", [PyValue::List(items)]) => {
            Some(PyValue::Set(items.clone()))
        }
        ("builtins" | "__builtin__", "frozenset", []) => Some(PyValue::FrozenSet(Vec::new())),
        ("builtins" | "__builtin__", "frozenset", [PyValue::List(items)]) => {
            Some(PyValue::FrozenSet(items.clone()))
        }
        ("builtins" | "__builtin__", "bytes", []) => Some(PyValue::Bytes(Vec::new())),
        ("builtins" | "__builtin__", "bytes", [payload]) => byte_payload(payload).map(PyValue::Bytes),
        ("builtins" | "__builtin__", "bytearray", []) => Some(PyValue::ByteArray(Vec::new())),
        ("builtins" | "__builtin__", "bytearray", [payload, ..]) => {
            byte_payload(payload).map(PyValue::ByteArray)
        }
        ("_codecs", "encode", [PyValue::Str(text), PyValue::Str(encoding)])
            if matches!(encoding.as_str(), "latin1" | "latin-1" | "iso-8859-1") =>
        {
            latin1(text).map(PyValue::Bytes)
        }
        ("builtins" | "__builtin__", "dict", [])
        | ("collections", "OrderedDict" | "defaultdict", _) => {
            let items = match args.first() {
                Some(PyValue::List(items)) => items
                    .iter()
                    .filter_map(|item| match item {
                        PyValue::List(kv) | PyValue::Tuple(kv) if kv.len() == 2 => {
                            Some((kv[0].clone(), kv[1].clone()))
                        }
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Some(PyValue::Dict(items))
        }
        // protocols 0 and 1 pickle container subclasses with their base and contents
        ("copy_reg" | "copyreg", "_reconstructor", [PyValue::Global { module, name }, rest @ ..]) => {
            let mut obj = PyObject::new(Some(format!("{module}.{name}")), rest.to_vec());
            match rest {
                [PyValue::Global { name: base, .. }, PyValue::Dict(pairs)] if base == "dict" => {
                    obj.dict_items = pairs.clone();
                }
                [PyValue::Global { name: base, .. }, PyValue::List(items)] if base == "list" => {
                    obj.list_items = items.clone();
                }
                _ => {}
            }
            Some(PyValue::Object(obj))
        }
        // ndarray and its subclasses; the first argument is the array type
        (
            "numpy.core.multiarray" | "numpy._core.multiarray",
            "_reconstruct",
            [PyValue::Global { module, name }, rest @ ..],
        ) => Some(PyValue::Object(PyObject::new(
            Some(format!("{module}.{name}")),
            rest.to_vec(),
        ))),
        ("datetime", "datetime", [payload, ..]) => byte_payload(payload).and_then(|b| datetime(&b)),
        ("datetime", "date", [payload]) => byte_payload(payload).and_then(|b| date(&b)),
        ("numpy.core.multiarray" | "numpy._core.multiarray", "scalar", [dtype, payload]) => {
            byte_payload(payload).and_then(|b| numpy_scalar(dtype, &b))
        }
        _ => None,
    };

    rebuilt.unwrap_or_else(|| PyValue::Object(PyObject::new(Some(format!("{module}.{name}")), args)))
}

fn date(state: &[u8]) -> Option<PyValue> {
    match state {
        [hi, lo, month, day] => {
            let year = i32::from(*hi) << 8 | i32::from(*lo);
            NaiveDate::from_ymd_opt(year, u32::from(*month), u32::from(*day)).map(PyValue::Date)
        }
        _ => None,
    }
}

fn datetime(state: &[u8]) -> Option<PyValue> {
    match state {
        [hi, lo, month, day, hour, minute, second, u1, u2, u3] => {
            let year = i32::from(*hi) << 8 | i32::from(*lo);
            // the high bit of the month byte carries the `fold` flag
            let month = u32::from(*month & 0x7f);
            let micros = u32::from(*u1) << 16 | u32::from(*u2) << 8 | u32::from(*u3);
            NaiveDate::from_ymd_opt(year, month, u32::from(*day))
                .and_then(|d| {
                    d.and_hms_micro_opt(
                        u32::from(*hour),
                        u32::from(*minute),
                        u32::from(*second),
                        micros,
                    )
                })
                .map(PyValue::DateTime)
        }
        _ => None,
    }
}

/// `numpy.core.multiarray.scalar(dtype, data)` for plain numeric dtypes.
/// `float64` subclasses Python's float and stays a float; other kinds keep
/// their numpy identity.
fn numpy_scalar(dtype: &PyValue, data: &[u8]) -> Option<PyValue> {
    let PyValue::Object(PyObject {
        class: Some(class),
        args,
        state,
        ..
    }) = dtype
    else {
        return None;
    };
    if class != "numpy.dtype" {
        return None;
    }
    let code = match args.first() {
        Some(PyValue::Str(code)) => code.as_str(),
        _ => return None,
    };
    let big_endian = match state.as_deref() {
        Some(PyValue::Tuple(fields)) => matches!(fields.get(1), Some(PyValue::Str(e)) if e == ">"),
        _ => false,
    };

    let mut buf = [0u8; 8];
    let size = data.len();
    if size == 0 || size > 8 || !code.ends_with(&size.to_string()) {
        return None;
    }
    if big_endian {
        for (slot, b) in buf.iter_mut().zip(data.iter().rev()) {
            *slot = *b;
        }
    } else {
        buf[..size].copy_from_slice(data);
    }

    let (dtype_name, value) = match (code.as_bytes()[0], size) {
        (b'f', 8) => return Some(PyValue::Float(f64::from_le_bytes(buf))),
        (b'f', 4) => {
            let bits = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            ("float32", PyValue::Float(f64::from(f32::from_bits(bits))))
        }
        (b'i', _) => {
            let shift = 64 - 8 * size as u32;
            let n = (i64::from_le_bytes(buf) << shift) >> shift;
            (signed_name(size), PyValue::Int(n))
        }
        (b'u', _) => {
            let n = u64::from_le_bytes(buf);
            let value = i64::try_from(n)
                .map(PyValue::Int)
                .unwrap_or_else(|_| PyValue::BigInt(n.to_string()));
            (unsigned_name(size), value)
        }
        (b'b', 1) => ("bool", PyValue::Bool(buf[0] != 0)),
        _ => return None,
    };
    Some(PyValue::Scalar {
        dtype: dtype_name.to_owned(),
        value: Box::new(value),
    })
}

fn signed_name(size: usize) -> &'static str {
    match size {
        1 => "int8",
        2 => "int16",
        4 => "int32",
        _ => "int64",
    }
}

fn unsigned_name(size: usize) -> &'static str {
    match size {
        1 => "uint8",
        2 => "uint16",
        4 => "uint32",
        _ => "uint64",
    }
}
