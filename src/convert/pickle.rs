//! Pickle codec for PyTorch checkpoints.
//!
//! Reads the opcodes `torch.save` emits and writes protocol 2 streams.
//! Class instances are never resolved: they stay symbolic as the callable and
//! arguments that rebuild them, so a checkpoint can be rewritten without a
//! Python runtime.

use crate::error::{FedServeError, Result};
use std::collections::HashMap;

mod op {
    pub const MARK: u8 = b'(';
    pub const STOP: u8 = b'.';
    pub const BINFLOAT: u8 = b'G';
    pub const BININT: u8 = b'J';
    pub const BININT1: u8 = b'K';
    pub const BININT2: u8 = b'M';
    pub const NONE: u8 = b'N';
    pub const BINPERSID: u8 = b'Q';
    pub const REDUCE: u8 = b'R';
    pub const BINSTRING: u8 = b'T';
    pub const SHORT_BINSTRING: u8 = b'U';
    pub const BINUNICODE: u8 = b'X';
    pub const APPEND: u8 = b'a';
    pub const BUILD: u8 = b'b';
    pub const GLOBAL: u8 = b'c';
    pub const DICT: u8 = b'd';
    pub const EMPTY_DICT: u8 = b'}';
    pub const APPENDS: u8 = b'e';
    pub const BINGET: u8 = b'h';
    pub const LONG_BINGET: u8 = b'j';
    pub const LIST: u8 = b'l';
    pub const EMPTY_LIST: u8 = b']';
    pub const BINPUT: u8 = b'q';
    pub const LONG_BINPUT: u8 = b'r';
    pub const SETITEM: u8 = b's';
    pub const TUPLE: u8 = b't';
    pub const EMPTY_TUPLE: u8 = b')';
    pub const SETITEMS: u8 = b'u';
    pub const BINBYTES: u8 = b'B';
    pub const SHORT_BINBYTES: u8 = b'C';
    pub const PROTO: u8 = 0x80;
    pub const NEWOBJ: u8 = 0x81;
    pub const TUPLE1: u8 = 0x85;
    pub const TUPLE2: u8 = 0x86;
    pub const TUPLE3: u8 = 0x87;
    pub const NEWTRUE: u8 = 0x88;
    pub const NEWFALSE: u8 = 0x89;
    pub const LONG1: u8 = 0x8a;
    pub const LONG4: u8 = 0x8b;
    pub const SHORT_BINUNICODE: u8 = 0x8c;
    pub const BINUNICODE8: u8 = 0x8d;
    pub const BINBYTES8: u8 = 0x8e;
    pub const STACK_GLOBAL: u8 = 0x93;
    pub const MEMOIZE: u8 = 0x94;
    pub const FRAME: u8 = 0x95;
}

/// A decoded pickle value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    /// Little-endian two's-complement integer too wide for `i64`.
    Long(Vec<u8>),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Value>),
    List(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    /// Reference to `module.name`.
    Global { module: String, name: String },
    /// `callable(*args)`, then `items` set on the result and `state` applied.
    Object {
        callable: Box<Value>,
        args: Box<Value>,
        /// Built with `cls.__new__` rather than a plain call.
        new_object: bool,
        items: Vec<(Value, Value)>,
        state: Option<Box<Value>>,
    },
    /// Reference resolved by the loader, such as a tensor storage.
    PersistentId(Box<Value>),
}

impl Value {
    pub fn global(module: &str, name: &str) -> Self {
        Value::Global {
            module: module.to_string(),
            name: name.to_string(),
        }
    }

    /// `collections.OrderedDict` holding `items`.
    pub fn ordered_dict(items: Vec<(Value, Value)>) -> Self {
        Value::Object {
            callable: Box::new(Value::global("collections", "OrderedDict")),
            args: Box::new(Value::Tuple(Vec::new())),
            new_object: false,
            items,
            state: None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Key/value pairs of a dict or of a dict-like object.
    pub fn items(&self) -> Option<&[(Value, Value)]> {
        match self {
            Value::Dict(items) | Value::Object { items, .. } => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Value stored under the string key `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.items()?
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    fn set_items(&mut self, pairs: Vec<(Value, Value)>) -> Result<()> {
        match self {
            Value::Dict(items) | Value::Object { items, .. } => {
                items.extend(pairs);
                Ok(())
            }
            other => Err(malformed(format!("cannot set items on {:?}", other))),
        }
    }
}

fn malformed(reason: impl Into<String>) -> FedServeError {
    FedServeError::InvalidCheckpoint(format!("pickle: {}", reason.into()))
}

/// Decode the pickle at the start of `data`.
pub fn loads(data: &[u8]) -> Result<Value> {
    load_prefix(data).map(|(value, _)| value)
}

/// Decode the pickle at the start of `data` and return the number of bytes
/// it spans. Legacy checkpoints are several pickles back to back.
pub fn load_prefix(data: &[u8]) -> Result<(Value, usize)> {
    Machine {
        data,
        pos: 0,
        stack: Vec::new(),
        slots: Vec::new(),
        marks: Vec::new(),
        memo: HashMap::new(),
    }
    .run()
}

enum Memo {
    /// Still on the stack and possibly being filled.
    Live(usize),
    Done(Value),
}

struct Machine<'a> {
    data: &'a [u8],
    pos: usize,
    stack: Vec<Value>,
    /// Memo ids that point at each stack slot.
    slots: Vec<Vec<u32>>,
    marks: Vec<usize>,
    memo: HashMap<u32, Memo>,
}

impl<'a> Machine<'a> {
    fn run(mut self) -> Result<(Value, usize)> {
        loop {
            match self.byte()? {
                op::PROTO => {
                    self.byte()?;
                }
                op::FRAME => {
                    self.take(8)?;
                }
                op::STOP => {
                    let value = self.pop()?;
                    return Ok((value, self.pos));
                }
                op::MARK => self.marks.push(self.stack.len()),

                op::NONE => self.push(Value::None),
                op::NEWTRUE => self.push(Value::Bool(true)),
                op::NEWFALSE => self.push(Value::Bool(false)),
                op::BININT => {
                    let v = i32::from_le_bytes(self.array()?);
                    self.push(Value::Int(v.into()));
                }
                op::BININT1 => {
                    let v = self.byte()?;
                    self.push(Value::Int(v.into()));
                }
                op::BININT2 => {
                    let v = u16::from_le_bytes(self.array()?);
                    self.push(Value::Int(v.into()));
                }
                op::LONG1 => {
                    let n = self.byte()? as usize;
                    let bytes = self.take(n)?;
                    self.push(long(bytes));
                }
                op::LONG4 => {
                    let n = self.len_u32()?;
                    let bytes = self.take(n)?;
                    self.push(long(bytes));
                }
                op::BINFLOAT => {
                    let v = f64::from_be_bytes(self.array()?);
                    self.push(Value::Float(v));
                }

                op::BINUNICODE => {
                    let n = self.len_u32()?;
                    self.push_str(n)?;
                }
                op::SHORT_BINUNICODE => {
                    let n = self.byte()? as usize;
                    self.push_str(n)?;
                }
                op::BINUNICODE8 => {
                    let n = self.len_u64()?;
                    self.push_str(n)?;
                }
                op::BINSTRING => {
                    let n = self.len_u32()?;
                    let bytes = self.take(n)?;
                    self.push(Value::Str(String::from_utf8_lossy(bytes).into_owned()));
                }
                op::SHORT_BINSTRING => {
                    let n = self.byte()? as usize;
                    let bytes = self.take(n)?;
                    self.push(Value::Str(String::from_utf8_lossy(bytes).into_owned()));
                }
                op::BINBYTES => {
                    let n = self.len_u32()?;
                    let bytes = self.take(n)?;
                    self.push(Value::Bytes(bytes.to_vec()));
                }
                op::SHORT_BINBYTES => {
                    let n = self.byte()? as usize;
                    let bytes = self.take(n)?;
                    self.push(Value::Bytes(bytes.to_vec()));
                }
                op::BINBYTES8 => {
                    let n = self.len_u64()?;
                    let bytes = self.take(n)?;
                    self.push(Value::Bytes(bytes.to_vec()));
                }

                op::EMPTY_TUPLE => self.push(Value::Tuple(Vec::new())),
                op::TUPLE => {
                    let items = self.pop_mark()?;
                    self.push(Value::Tuple(items));
                }
                op::TUPLE1 | op::TUPLE2 | op::TUPLE3 => {
                    let n = (self.data[self.pos - 1] - op::TUPLE1 + 1) as usize;
                    let mut items = Vec::with_capacity(n);
                    for _ in 0..n {
                        items.push(self.pop()?);
                    }
                    items.reverse();
                    self.push(Value::Tuple(items));
                }
                op::EMPTY_LIST => self.push(Value::List(Vec::new())),
                op::LIST => {
                    let items = self.pop_mark()?;
                    self.push(Value::List(items));
                }
                op::APPEND => {
                    let value = self.pop()?;
                    self.append(vec![value])?;
                }
                op::APPENDS => {
                    let values = self.pop_mark()?;
                    self.append(values)?;
                }
                op::EMPTY_DICT => self.push(Value::Dict(Vec::new())),
                op::DICT => {
                    let flat = self.pop_mark()?;
                    self.push(Value::Dict(pairs(flat)?));
                }
                op::SETITEM => {
                    let value = self.pop()?;
                    let key = self.pop()?;
                    self.top()?.set_items(vec![(key, value)])?;
                }
                op::SETITEMS => {
                    let flat = self.pop_mark()?;
                    let items = pairs(flat)?;
                    self.top()?.set_items(items)?;
                }

                op::BINPUT => {
                    let id = self.byte()?.into();
                    self.memoize(id)?;
                }
                op::LONG_BINPUT => {
                    let id = u32::from_le_bytes(self.array()?);
                    self.memoize(id)?;
                }
                op::MEMOIZE => {
                    let id = self.memo.len() as u32;
                    self.memoize(id)?;
                }
                op::BINGET => {
                    let id = self.byte()?.into();
                    self.recall(id)?;
                }
                op::LONG_BINGET => {
                    let id = u32::from_le_bytes(self.array()?);
                    self.recall(id)?;
                }

                op::GLOBAL => {
                    let module = self.line()?;
                    let name = self.line()?;
                    self.push(Value::Global { module, name });
                }
                op::STACK_GLOBAL => {
                    let name = self.pop_str()?;
                    let module = self.pop_str()?;
                    self.push(Value::Global { module, name });
                }
                op::REDUCE | op::NEWOBJ => {
                    let new_object = self.data[self.pos - 1] == op::NEWOBJ;
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    self.push(Value::Object {
                        callable: Box::new(callable),
                        args: Box::new(args),
                        new_object,
                        items: Vec::new(),
                        state: None,
                    });
                }
                op::BUILD => {
                    let value = self.pop()?;
                    match self.top()? {
                        Value::Object { state, .. } => *state = Some(Box::new(value)),
                        other => return Err(malformed(format!("cannot apply state to {:?}", other))),
                    }
                }
                op::BINPERSID => {
                    let pid = self.pop()?;
                    self.push(Value::PersistentId(Box::new(pid)));
                }

                other => {
                    return Err(malformed(format!(
                        "unsupported opcode 0x{:02x} at offset {}",
                        other,
                        self.pos - 1
                    )))
                }
            }
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let data = self.data;
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| malformed("truncated stream"))?;
        let bytes = &data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn len_u32(&mut self) -> Result<usize> {
        Ok(u32::from_le_bytes(self.array()?) as usize)
    }

    fn len_u64(&mut self) -> Result<usize> {
        usize::try_from(u64::from_le_bytes(self.array()?)).map_err(|_| malformed("length overflow"))
    }

    fn line(&mut self) -> Result<String> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| malformed("unterminated GLOBAL"))?;
        let line = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(line)
    }

    fn push_str(&mut self, n: usize) -> Result<()> {
        let bytes = self.take(n)?;
        let s = std::str::from_utf8(bytes).map_err(|e| malformed(e.to_string()))?;
        self.push(Value::Str(s.to_string()));
        Ok(())
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
        self.slots.push(Vec::new());
    }

    fn pop(&mut self) -> Result<Value> {
        if self.marks.last().is_some_and(|mark| *mark >= self.stack.len()) {
            return Err(malformed("pop across a mark"));
        }
        let value = self.stack.pop().ok_or_else(|| malformed("stack underflow"))?;
        let ids = self.slots.pop().unwrap_or_default();
        self.settle(ids, &value);
        Ok(value)
    }

    fn pop_str(&mut self) -> Result<String> {
        match self.pop()? {
            Value::Str(s) => Ok(s),
            other => Err(malformed(format!("expected a string, got {:?}", other))),
        }
    }

    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let mark = self.marks.pop().ok_or_else(|| malformed("missing MARK"))?;
        if mark > self.stack.len() {
            return Err(malformed("stack underflow"));
        }
        let values = self.stack.split_off(mark);
        let slots = self.slots.split_off(mark);
        for (ids, value) in slots.into_iter().zip(&values) {
            self.settle(ids, value);
        }
        Ok(values)
    }

    /// Freeze memo entries of a value leaving the stack.
    fn settle(&mut self, ids: Vec<u32>, value: &Value) {
        for id in ids {
            self.memo.insert(id, Memo::Done(value.clone()));
        }
    }

    fn top(&mut self) -> Result<&mut Value> {
        self.stack.last_mut().ok_or_else(|| malformed("stack underflow"))
    }

    fn append(&mut self, values: Vec<Value>) -> Result<()> {
        match self.top()? {
            Value::List(items) => {
                items.extend(values);
                Ok(())
            }
            other => Err(malformed(format!("cannot append to {:?}", other))),
        }
    }

    fn memoize(&mut self, id: u32) -> Result<()> {
        let slot = self
            .stack
            .len()
            .checked_sub(1)
            .ok_or_else(|| malformed("memoize on empty stack"))?;
        self.slots[slot].push(id);
        self.memo.insert(id, Memo::Live(slot));
        Ok(())
    }

    fn recall(&mut self, id: u32) -> Result<()> {
        let value = match self.memo.get(&id) {
            Some(Memo::Live(slot)) => self.stack[*slot].clone(),
            Some(Memo::Done(value)) => value.clone(),
            None => return Err(malformed(format!("memo {} not found", id))),
        };
        self.push(value);
        Ok(())
    }
}

fn long(bytes: &[u8]) -> Value {
    if bytes.len() > 8 {
        return Value::Long(bytes.to_vec());
    }
    let negative = bytes.last().is_some_and(|b| b & 0x80 != 0);
    let mut buf = if negative { [0xff; 8] } else { [0; 8] };
    buf[..bytes.len()].copy_from_slice(bytes);
    Value::Int(i64::from_le_bytes(buf))
}

fn pairs(flat: Vec<Value>) -> Result<Vec<(Value, Value)>> {
    if flat.len() % 2 != 0 {
        return Err(malformed("odd number of dict items"));
    }
    let mut items = Vec::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        items.push((key, value));
    }
    Ok(items)
}

/// Encode `value` as a protocol 2 pickle.
pub fn dumps(value: &Value) -> Vec<u8> {
    let mut out = vec![op::PROTO, 2];
    write_value(value, &mut out);
    out.push(op::STOP);
    out
}

fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::None => out.push(op::NONE),
        Value::Bool(true) => out.push(op::NEWTRUE),
        Value::Bool(false) => out.push(op::NEWFALSE),
        Value::Int(v) => write_int(*v, out),
        Value::Long(bytes) => write_long(bytes, out),
        Value::Float(v) => {
            out.push(op::BINFLOAT);
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Str(s) => {
            out.push(op::BINUNICODE);
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(bytes) => {
            out.push(op::BINBYTES);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        Value::Tuple(items) => match items.len() {
            0 => out.push(op::EMPTY_TUPLE),
            n @ 1..=3 => {
                items.iter().for_each(|item| write_value(item, out));
                out.push(op::TUPLE1 + (n as u8 - 1));
            }
            _ => {
                out.push(op::MARK);
                items.iter().for_each(|item| write_value(item, out));
                out.push(op::TUPLE);
            }
        },
        Value::List(items) => {
            out.push(op::EMPTY_LIST);
            if !items.is_empty() {
                out.push(op::MARK);
                items.iter().for_each(|item| write_value(item, out));
                out.push(op::APPENDS);
            }
        }
        Value::Dict(items) => {
            out.push(op::EMPTY_DICT);
            write_items(items, out);
        }
        Value::Global { module, name } => {
            out.push(op::GLOBAL);
            out.extend_from_slice(module.as_bytes());
            out.push(b'\n');
            out.extend_from_slice(name.as_bytes());
            out.push(b'\n');
        }
        Value::Object {
            callable,
            args,
            new_object,
            items,
            state,
        } => {
            write_value(callable, out);
            write_value(args, out);
            out.push(if *new_object { op::NEWOBJ } else { op::REDUCE });
            write_items(items, out);
            if let Some(state) = state {
                write_value(state, out);
                out.push(op::BUILD);
            }
        }
        Value::PersistentId(pid) => {
            write_value(pid, out);
            out.push(op::BINPERSID);
        }
    }
}

fn write_items(items: &[(Value, Value)], out: &mut Vec<u8>) {
    if items.is_empty() {
        return;
    }
    out.push(op::MARK);
    for (key, value) in items {
        write_value(key, out);
        write_value(value, out);
    }
    out.push(op::SETITEMS);
}

fn write_int(v: i64, out: &mut Vec<u8>) {
    match v {
        0..=0xff => {
            out.push(op::BININT1);
            out.push(v as u8);
        }
        0x100..=0xffff => {
            out.push(op::BININT2);
            out.extend_from_slice(&(v as u16).to_le_bytes());
        }
        _ => match i32::try_from(v) {
            Ok(v) => {
                out.push(op::BININT);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Err(_) => {
                let mut bytes = v.to_le_bytes().to_vec();
                // Drop sign-extension bytes the value does not need.
                while bytes.len() > 1 {
                    let last = bytes[bytes.len() - 1];
                    let next_sign = bytes[bytes.len() - 2] & 0x80;
                    if (last == 0 && next_sign == 0) || (last == 0xff && next_sign != 0) {
                        bytes.pop();
                    } else {
                        break;
                    }
                }
                write_long(&bytes, out);
            }
        },
    }
}

fn write_long(bytes: &[u8], out: &mut Vec<u8>) {
    match u8::try_from(bytes.len()) {
        Ok(n) => {
            out.push(op::LONG1);
            out.push(n);
        }
        Err(_) => {
            out.push(op::LONG4);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        }
    }
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `pickle.dumps({'w': (1, 'cpu'), 'b': ['cpu', 300]}, protocol=2)`
    /// with the second `'cpu'` memoized and recalled.
    const MEMOIZED: &[u8] = b"\x80\x02}q\x00(X\x01\x00\x00\x00wq\x01K\x01X\x03\x00\x00\x00cpuq\x02\x86q\x03X\x01\x00\x00\x00bq\x04]q\x05(h\x02M,\x01eu.";

    #[test]
    fn test_load_memoized_dict() {
        let value = loads(MEMOIZED).unwrap();
        assert_eq!(
            value.get("w"),
            Some(&Value::Tuple(vec![Value::Int(1), Value::Str("cpu".into())]))
        );
        assert_eq!(
            value.get("b"),
            Some(&Value::List(vec![Value::Str("cpu".into()), Value::Int(300)]))
        );
    }

    #[test]
    fn test_recall_sees_filled_container() {
        // d = {}; d['k'] = 1; [d, d]
        let data = b"\x80\x02](}q\x00X\x01\x00\x00\x00kK\x01sh\x00e.";
        let value = loads(data).unwrap();
        let inner = Value::Dict(vec![(Value::Str("k".into()), Value::Int(1))]);
        assert_eq!(value, Value::List(vec![inner.clone(), inner]));
    }

    #[test]
    fn test_torch_tensor_reference() {
        let storage = Value::PersistentId(Box::new(Value::Tuple(vec![
            Value::Str("storage".into()),
            Value::global("torch", "FloatStorage"),
            Value::Str("0".into()),
            Value::Str("cpu".into()),
            Value::Int(6),
        ])));
        let tensor = Value::Object {
            callable: Box::new(Value::global("torch._utils", "_rebuild_tensor_v2")),
            args: Box::new(Value::Tuple(vec![
                storage,
                Value::Int(0),
                Value::Tuple(vec![Value::Int(2), Value::Int(3)]),
                Value::Tuple(vec![Value::Int(3), Value::Int(1)]),
                Value::Bool(false),
                Value::ordered_dict(Vec::new()),
            ])),
            new_object: false,
            items: Vec::new(),
            state: None,
        };
        let state = Value::ordered_dict(vec![(Value::Str("0.weight".into()), tensor)]);

        let bytes = dumps(&state);
        assert_eq!(&bytes[..2], b"\x80\x02");
        assert_eq!(loads(&bytes).unwrap(), state);
    }

    #[test]
    fn test_integer_widths() {
        for v in [0, 255, 256, 65_535, 65_536, -1, i32::MIN as i64, 1 << 40, -(1 << 40), i64::MAX] {
            assert_eq!(loads(&dumps(&Value::Int(v))).unwrap(), Value::Int(v), "{}", v);
        }
    }

    #[test]
    fn test_load_prefix_reports_length() {
        let first = dumps(&Value::Int(1001));
        let mut data = first.clone();
        data.extend_from_slice(&dumps(&Value::None));

        let (value, used) = load_prefix(&data).unwrap();
        assert_eq!(value, Value::Int(1001));
        assert_eq!(used, first.len());
        assert_eq!(loads(&data[used..]).unwrap(), Value::None);
    }

    #[test]
    fn test_rejects_truncated_and_unknown() {
        assert!(matches!(loads(b"\x80\x02X\x05\x00\x00\x00ab"), Err(FedServeError::InvalidCheckpoint(_))));
        let err = loads(b"\x80\x02\xff.").unwrap_err();
        assert!(err.to_string().contains("unsupported opcode 0xff"));
    }
}
