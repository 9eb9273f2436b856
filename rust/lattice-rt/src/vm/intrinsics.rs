//! Builtin methods, indexing, field access, and iteration helpers.
//!
//! Every builtin has a stable handler id; the inline cache stores these ids
//! per call site. Ids at or above [`CALLBACK_BASE`] call back into the VM
//! and never mutate their receiver in place.

use super::ops::compare_values;
use super::{buffers, strings, Vm, VmError};
use crate::phase::PressureMode;
use crate::pic::NOT_BUILTIN;
use crate::values::{Data, Phase, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// First handler id of the array methods that take a callback.
pub const CALLBACK_BASE: u8 = 128;

// Receiver type tags, as reported by `Value::type_tag`.
const TAG_STRING: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_MAP: u8 = 7;
const TAG_SET: u8 = 8;
const TAG_ENUM: u8 = 10;
const TAG_RANGE: u8 = 12;
const TAG_BUFFER: u8 = 14;
const TAG_CHANNEL: u8 = 15;
const TAG_REF: u8 = 16;

const ARRAY_METHODS: &[(&str, u8)] = &[
    ("len", 1),
    ("length", 2),
    ("push", 3),
    ("pop", 4),
    ("insert", 5),
    ("remove_at", 6),
    ("contains", 7),
    ("enumerate", 8),
    ("reverse", 9),
    ("join", 10),
    ("flat", 11),
    ("flatten", 12),
    ("slice", 13),
    ("take", 14),
    ("drop", 15),
    ("index_of", 16),
    ("zip", 17),
    ("unique", 18),
    ("first", 19),
    ("last", 20),
    ("sum", 21),
    ("min", 22),
    ("max", 23),
    ("chunk", 24),
    ("map", 128),
    ("filter", 129),
    ("reduce", 130),
    ("each", 131),
    ("for_each", 132),
    ("sort", 133),
    ("sort_by", 134),
    ("find", 135),
    ("any", 136),
    ("all", 137),
    ("flat_map", 138),
    ("group_by", 139),
];

const MAP_METHODS: &[(&str, u8)] = &[
    ("len", 60),
    ("length", 61),
    ("keys", 62),
    ("values", 63),
    ("entries", 64),
    ("get", 65),
    ("has", 66),
    ("contains", 67),
    ("remove", 68),
    ("merge", 69),
    ("set", 70),
];

const SET_METHODS: &[(&str, u8)] = &[
    ("len", 100),
    ("length", 101),
    ("has", 102),
    ("contains", 103),
    ("add", 104),
    ("remove", 105),
    ("to_array", 106),
    ("union", 107),
    ("intersection", 108),
    ("difference", 109),
    ("symmetric_difference", 110),
    ("is_subset", 111),
    ("is_superset", 112),
];

const ENUM_METHODS: &[(&str, u8)] = &[
    ("tag", 115),
    ("enum_name", 116),
    ("payload", 117),
    ("is_variant", 118),
    ("variant_name", 119),
];

const CHANNEL_METHODS: &[(&str, u8)] = &[("send", 120), ("recv", 121), ("close", 122)];

const RANGE_METHODS: &[(&str, u8)] = &[("contains", 123), ("to_array", 124)];

const REF_METHODS: &[(&str, u8)] = &[
    ("deref", 125),
    ("get", 125),
    ("set", 126),
    ("inner_type", 127),
];

/// Handler id for `method` on a receiver with `type_tag`, or
/// [`NOT_BUILTIN`].
pub fn builtin_handler(type_tag: u8, method: &str) -> u8 {
    let table = match type_tag {
        TAG_STRING => strings::METHODS,
        TAG_ARRAY => ARRAY_METHODS,
        TAG_MAP => MAP_METHODS,
        TAG_SET => SET_METHODS,
        TAG_ENUM => ENUM_METHODS,
        TAG_RANGE => RANGE_METHODS,
        TAG_BUFFER => buffers::METHODS,
        TAG_CHANNEL => CHANNEL_METHODS,
        TAG_REF => REF_METHODS,
        _ => return NOT_BUILTIN,
    };
    table
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, id)| *id)
        .unwrap_or(NOT_BUILTIN)
}

// ---------------------------------------------------------------------------
// Argument and mutation guards
// ---------------------------------------------------------------------------

pub(super) fn arg<'a>(args: &'a [Value], i: usize, method: &str) -> Result<&'a Value, VmError> {
    args.get(i).ok_or_else(|| {
        VmError::Runtime(format!("{method}() expects at least {} argument(s)", i + 1))
    })
}

pub(super) fn int_arg(args: &[Value], i: usize, method: &str) -> Result<i64, VmError> {
    let v = arg(args, i, method)?;
    v.as_int().ok_or_else(|| {
        VmError::Type(format!("{method}() expects an Int, got {}", v.type_name()))
    })
}

pub(super) fn str_arg<'a>(args: &'a [Value], i: usize, method: &str) -> Result<&'a str, VmError> {
    let v = arg(args, i, method)?;
    v.as_str().ok_or_else(|| {
        VmError::Type(format!("{method}() expects a String, got {}", v.type_name()))
    })
}

/// Crystal values reject every mutation; sublimated values reject
/// structural ones (adding or removing elements).
pub(super) fn guard_phase(phase: Phase, structural: bool, verb: &str, kind: &str) -> Result<(), VmError> {
    match phase {
        Phase::Crystal => Err(VmError::Phase(format!("cannot {verb} a crystal {kind}"))),
        Phase::Sublimated if structural => {
            Err(VmError::Phase(format!("cannot {verb} a sublimated {kind}")))
        }
        _ => Ok(()),
    }
}

/// Pressure mode in force for the receiving variable, if it has a name.
pub(super) struct Pressure<'a> {
    pub(super) var: Option<&'a str>,
    pub(super) mode: Option<PressureMode>,
}

impl Pressure<'_> {
    pub(super) fn check(&self, grows: bool, shrinks: bool, verb: &str) -> Result<(), VmError> {
        let (Some(var), Some(mode)) = (self.var, self.mode) else {
            return Ok(());
        };
        if (grows && mode.blocks_growth()) || (shrinks && mode.blocks_shrink()) {
            return Err(VmError::Phase(format!(
                "pressurized ({}): cannot {verb} '{var}'",
                mode.as_ref()
            )));
        }
        Ok(())
    }
}

fn index_in(i: i64, len: usize) -> Option<usize> {
    usize::try_from(i).ok().filter(|i| *i < len)
}

fn out_of_bounds(i: i64, len: usize) -> VmError {
    VmError::Runtime(format!("index {i} out of bounds (length {len})"))
}

// ---------------------------------------------------------------------------
// Indexing, fields, iteration
// ---------------------------------------------------------------------------

pub(crate) fn index_value(target: &Value, index: &Value) -> Result<Value, VmError> {
    match (&target.data, &index.data) {
        (Data::Array(items) | Data::Tuple(items), Data::Int(i)) => index_in(*i, items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| out_of_bounds(*i, items.len())),
        (Data::Array(items), Data::Range(s, e)) => {
            let len = items.len() as i64;
            let (s, e) = ((*s).clamp(0, len) as usize, (*e).clamp(0, len) as usize);
            Ok(Value::array(items[s..e.max(s)].to_vec()))
        }
        (Data::String(s), Data::Int(i)) => s
            .chars()
            .nth(usize::try_from(*i).unwrap_or(usize::MAX))
            .map(|c| Value::string(c.to_string()))
            .ok_or_else(|| out_of_bounds(*i, s.chars().count())),
        (Data::String(s), Data::Range(a, b)) => {
            let (a, b) = ((*a).max(0) as usize, (*b).max(0) as usize);
            Ok(Value::string(
                s.chars().skip(a).take(b.saturating_sub(a)).collect::<String>(),
            ))
        }
        (Data::Map(m), Data::String(k)) => Ok(m.get(k).cloned().unwrap_or_default()),
        (Data::Buffer(b), Data::Int(i)) => index_in(*i, b.len())
            .map(|i| Value::int(b[i] as i64))
            .ok_or_else(|| out_of_bounds(*i, b.len())),
        (Data::Ref(cell), _) => index_value(&cell.lock(), index),
        _ => Err(VmError::Type(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        ))),
    }
}

pub(crate) fn set_index(target: &mut Value, index: &Value, value: Value) -> Result<(), VmError> {
    if target.is_crystal() {
        return Err(VmError::Phase("cannot modify a frozen value".into()));
    }
    let sublimated = target.is_sublimated();
    let type_name = target.type_name();
    match (&mut target.data, &index.data) {
        (Data::Array(items), Data::Int(i)) => {
            let len = items.len();
            let slot = index_in(*i, len).ok_or_else(|| out_of_bounds(*i, len))?;
            items[slot] = value;
        }
        (Data::Map(m), Data::String(k)) => {
            if sublimated && !m.contains_key(k) {
                return Err(VmError::Phase("cannot add keys to a sublimated map".into()));
            }
            m.insert(k.clone(), value);
        }
        (Data::Buffer(b), Data::Int(i)) => {
            let len = b.len();
            let slot = index_in(*i, len).ok_or_else(|| out_of_bounds(*i, len))?;
            let byte = value
                .as_int()
                .and_then(|v| u8::try_from(v).ok())
                .ok_or_else(|| VmError::Type("buffer elements must be Ints in 0..=255".into()))?;
            b[slot] = byte;
        }
        (Data::Ref(cell), _) => set_index(&mut cell.lock(), index, value)?,
        _ => {
            return Err(VmError::Type(format!(
                "cannot assign index {} on {type_name}",
                index.type_name()
            )))
        }
    }
    Ok(())
}

pub(crate) fn get_field(target: &Value, name: &str) -> Result<Value, VmError> {
    match &target.data {
        Data::Struct(s) => s.get(name).cloned().ok_or_else(|| {
            VmError::Runtime(format!("struct '{}' has no field '{name}'", s.name))
        }),
        Data::Map(m) => Ok(m.get(name).cloned().unwrap_or_default()),
        Data::Tuple(items) => name
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i).cloned())
            .ok_or_else(|| VmError::Runtime(format!("tuple has no field '{name}'"))),
        Data::Ref(cell) => get_field(&cell.lock(), name),
        _ => Err(VmError::Type(format!(
            "cannot access field '{name}' on {}",
            target.type_name()
        ))),
    }
}

pub(crate) fn set_field(target: &mut Value, name: &str, value: Value) -> Result<(), VmError> {
    if target.is_crystal() {
        return Err(VmError::Phase(format!(
            "cannot set field '{name}' on a crystal value"
        )));
    }
    let sublimated = target.is_sublimated();
    let type_name = target.type_name();
    match &mut target.data {
        Data::Struct(s) => {
            let struct_name = s.name.clone();
            let slot = s.get_mut(name).ok_or_else(|| {
                VmError::Runtime(format!("struct '{struct_name}' has no field '{name}'"))
            })?;
            *slot = value;
        }
        Data::Map(m) => {
            if sublimated && !m.contains_key(name) {
                return Err(VmError::Phase("cannot add keys to a sublimated map".into()));
            }
            m.insert(name.to_string(), value);
        }
        Data::Ref(cell) => set_field(&mut cell.lock(), name, value)?,
        _ => {
            return Err(VmError::Type(format!(
                "cannot set field '{name}' on {type_name}"
            )))
        }
    }
    Ok(())
}

/// Normalize a collection for `ITER_INIT`: ranges stay lazy, everything
/// else becomes an array.
pub(crate) fn iterable(collection: Value) -> Result<Value, VmError> {
    let items = match collection.data {
        Data::Array(_) | Data::Range(..) => return Ok(collection),
        Data::Tuple(items) => items,
        Data::Map(m) => m
            .into_iter()
            .map(|(k, v)| Value::array(vec![Value::string(k), v]))
            .collect(),
        Data::Set(m) => m.into_values().collect(),
        Data::String(s) => s.chars().map(|c| Value::string(c.to_string())).collect(),
        Data::Buffer(b) => b.into_iter().map(|x| Value::int(x as i64)).collect(),
        _ => {
            return Err(VmError::Type(format!(
                "cannot iterate over {}",
                collection.type_name()
            )))
        }
    };
    Ok(Value::array(items))
}

pub(crate) fn iter_element(collection: &Value, index: i64) -> Option<Value> {
    match &collection.data {
        Data::Array(items) => index_in(index, items.len()).map(|i| items[i].clone()),
        Data::Range(s, e) => s.checked_add(index).filter(|v| v < e).map(Value::int),
        _ => None,
    }
}

pub(crate) fn flatten_once(v: &Value) -> Result<Value, VmError> {
    let Some(items) = v.as_array() else {
        return Err(VmError::Type(format!("cannot flatten {}", v.type_name())));
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match &item.data {
            Data::Array(inner) => out.extend(inner.iter().cloned()),
            _ => out.push(item.clone()),
        }
    }
    Ok(Value::array(out))
}

/// `TRY_UNWRAP`: `Ok(inner)` continues, `Err(value)` returns `value` from
/// the current frame.
pub(crate) fn unwrap_result(v: Value) -> Result<Result<Value, Value>, VmError> {
    let ok = match &v.data {
        Data::Enum(e) if e.variant == "Ok" => Some(e.payload.first().cloned().unwrap_or_else(Value::unit)),
        Data::Enum(e) if e.variant == "Err" => None,
        Data::Map(m) => match m.get("tag").and_then(Value::as_str) {
            Some("ok") => Some(m.get("value").cloned().unwrap_or_else(Value::unit)),
            Some("err") => None,
            _ => return Err(not_a_result(&v)),
        },
        _ => return Err(not_a_result(&v)),
    };
    Ok(ok.ok_or(v))
}

fn not_a_result(v: &Value) -> VmError {
    VmError::Type(format!(
        "'?' operator requires a Result value, got {}",
        v.type_name()
    ))
}

// ---------------------------------------------------------------------------
// Builtins without callbacks
// ---------------------------------------------------------------------------

fn set_key(v: &Value) -> String {
    v.to_string()
}

fn array_method(id: u8, recv: &mut Value, args: &[Value], pressure: &Pressure<'_>) -> Result<Value, VmError> {
    let phase = recv.phase;
    let Data::Array(items) = &mut recv.data else {
        return Err(VmError::Type("array method on a non-Array".into()));
    };
    Ok(match id {
        1 | 2 => Value::int(items.len() as i64),
        3 => {
            guard_phase(phase, true, "push to", "array")?;
            pressure.check(true, false, "push to")?;
            items.push(arg(args, 0, "push")?.clone());
            Value::unit()
        }
        4 => {
            guard_phase(phase, true, "pop from", "array")?;
            pressure.check(false, true, "pop from")?;
            items.pop().unwrap_or_default()
        }
        5 => {
            guard_phase(phase, true, "insert into", "array")?;
            pressure.check(true, false, "insert into")?;
            let i = int_arg(args, 0, "insert")?;
            let at = usize::try_from(i)
                .ok()
                .filter(|at| *at <= items.len())
                .ok_or_else(|| out_of_bounds(i, items.len()))?;
            items.insert(at, arg(args, 1, "insert")?.clone());
            Value::unit()
        }
        6 => {
            guard_phase(phase, true, "remove from", "array")?;
            pressure.check(false, true, "remove from")?;
            let i = int_arg(args, 0, "remove_at")?;
            let at = index_in(i, items.len()).ok_or_else(|| out_of_bounds(i, items.len()))?;
            items.remove(at)
        }
        7 => {
            let needle = arg(args, 0, "contains")?;
            Value::bool(items.iter().any(|v| v == needle))
        }
        8 => Value::array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| Value::array(vec![Value::int(i as i64), v.clone()]))
                .collect(),
        ),
        9 => Value::array(items.iter().rev().cloned().collect()),
        10 => {
            let sep = match args.first() {
                Some(_) => str_arg(args, 0, "join")?,
                None => "",
            };
            Value::string(
                items
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(sep),
            )
        }
        11 | 12 => flatten_once(&Value::array(items.clone()))?,
        13 => {
            let len = items.len() as i64;
            let start = int_arg(args, 0, "slice")?.clamp(0, len) as usize;
            let end = match args.get(1) {
                Some(_) => int_arg(args, 1, "slice")?.clamp(start as i64, len) as usize,
                None => len as usize,
            };
            Value::array(items[start..end].to_vec())
        }
        14 => {
            let n = int_arg(args, 0, "take")?.max(0) as usize;
            Value::array(items.iter().take(n).cloned().collect())
        }
        15 => {
            let n = int_arg(args, 0, "drop")?.max(0) as usize;
            Value::array(items.iter().skip(n).cloned().collect())
        }
        16 => {
            let needle = arg(args, 0, "index_of")?;
            Value::int(
                items
                    .iter()
                    .position(|v| v == needle)
                    .map(|i| i as i64)
                    .unwrap_or(-1),
            )
        }
        17 => {
            let other = arg(args, 0, "zip")?.as_array().ok_or_else(|| {
                VmError::Type("zip() expects an Array".into())
            })?;
            Value::array(
                items
                    .iter()
                    .zip(other.iter())
                    .map(|(a, b)| Value::array(vec![a.clone(), b.clone()]))
                    .collect(),
            )
        }
        18 => {
            let mut out: Vec<Value> = Vec::new();
            for v in items.iter() {
                if !out.contains(v) {
                    out.push(v.clone());
                }
            }
            Value::array(out)
        }
        19 => items.first().cloned().unwrap_or_default(),
        20 => items.last().cloned().unwrap_or_default(),
        21 => {
            let mut acc = Value::int(0);
            for v in items.iter() {
                acc = super::ops::arith(super::ops::BinaryOp::Add, &acc, v)?;
            }
            acc
        }
        22 | 23 => {
            let want = if id == 22 { Ordering::Less } else { Ordering::Greater };
            let mut best: Option<&Value> = None;
            for v in items.iter() {
                best = match best {
                    Some(b) if compare_values(v, b)? != want => Some(b),
                    _ => Some(v),
                };
            }
            best.cloned().unwrap_or_default()
        }
        24 => {
            let n = int_arg(args, 0, "chunk")?;
            let n = usize::try_from(n)
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| VmError::Runtime("chunk() size must be positive".into()))?;
            Value::array(items.chunks(n).map(|c| Value::array(c.to_vec())).collect())
        }
        _ => return Err(VmError::Runtime(format!("unknown array builtin {id}"))),
    })
}

fn map_method(id: u8, recv: &mut Value, args: &[Value], pressure: &Pressure<'_>) -> Result<Value, VmError> {
    let phase = recv.phase;
    let Data::Map(m) = &mut recv.data else {
        return Err(VmError::Type("map method on a non-Map".into()));
    };
    Ok(match id {
        60 | 61 => Value::int(m.len() as i64),
        62 => Value::array(m.keys().map(|k| Value::string(k.as_str())).collect()),
        63 => Value::array(m.values().cloned().collect()),
        64 => Value::array(
            m.iter()
                .map(|(k, v)| Value::array(vec![Value::string(k.as_str()), v.clone()]))
                .collect(),
        ),
        65 => {
            let key = str_arg(args, 0, "get")?;
            m.get(key)
                .cloned()
                .or_else(|| args.get(1).cloned())
                .unwrap_or_default()
        }
        66 | 67 => Value::bool(m.contains_key(str_arg(args, 0, "has")?)),
        68 => {
            guard_phase(phase, true, "remove from", "map")?;
            pressure.check(false, true, "remove from")?;
            m.remove(str_arg(args, 0, "remove")?).unwrap_or_default()
        }
        69 => {
            let Some(Data::Map(other)) = args.first().map(|v| &v.data) else {
                return Err(VmError::Type("merge() expects a Map".into()));
            };
            let mut merged = m.clone();
            merged.extend(other.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::map(merged)
        }
        70 => {
            let key = str_arg(args, 0, "set")?;
            let value = arg(args, 1, "set")?.clone();
            let adds = !m.contains_key(key);
            guard_phase(phase, adds, "add keys to", "map")?;
            if adds {
                pressure.check(true, false, "insert into")?;
            }
            m.insert(key.to_string(), value);
            Value::unit()
        }
        _ => return Err(VmError::Runtime(format!("unknown map builtin {id}"))),
    })
}

fn set_members(v: &Value, method: &str) -> Result<BTreeMap<String, Value>, VmError> {
    match &v.data {
        Data::Set(m) => Ok(m.clone()),
        Data::Array(items) => Ok(items.iter().map(|i| (set_key(i), i.clone())).collect()),
        _ => Err(VmError::Type(format!("{method}() expects a Set"))),
    }
}

fn set_method(id: u8, recv: &mut Value, args: &[Value], pressure: &Pressure<'_>) -> Result<Value, VmError> {
    let phase = recv.phase;
    let Data::Set(m) = &mut recv.data else {
        return Err(VmError::Type("set method on a non-Set".into()));
    };
    let set = |members: BTreeMap<String, Value>| Value::new(Data::Set(members));
    Ok(match id {
        100 | 101 => Value::int(m.len() as i64),
        102 | 103 => Value::bool(m.contains_key(&set_key(arg(args, 0, "has")?))),
        104 => {
            guard_phase(phase, true, "add to", "set")?;
            pressure.check(true, false, "insert into")?;
            let v = arg(args, 0, "add")?.clone();
            m.insert(set_key(&v), v);
            Value::unit()
        }
        105 => {
            guard_phase(phase, true, "remove from", "set")?;
            pressure.check(false, true, "remove from")?;
            Value::bool(m.remove(&set_key(arg(args, 0, "remove")?)).is_some())
        }
        106 => Value::array(m.values().cloned().collect()),
        107..=110 => {
            let other = set_members(arg(args, 0, "union")?, "union")?;
            let out: BTreeMap<String, Value> = match id {
                107 => m.iter().chain(other.iter()).map(|(k, v)| (k.clone(), v.clone())).collect(),
                108 => m
                    .iter()
                    .filter(|(k, _)| other.contains_key(*k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                109 => m
                    .iter()
                    .filter(|(k, _)| !other.contains_key(*k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                _ => m
                    .iter()
                    .filter(|(k, _)| !other.contains_key(*k))
                    .chain(other.iter().filter(|(k, _)| !m.contains_key(*k)))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            };
            set(out)
        }
        111 => {
            let other = set_members(arg(args, 0, "is_subset")?, "is_subset")?;
            Value::bool(m.keys().all(|k| other.contains_key(k)))
        }
        112 => {
            let other = set_members(arg(args, 0, "is_superset")?, "is_superset")?;
            Value::bool(other.keys().all(|k| m.contains_key(k)))
        }
        _ => return Err(VmError::Runtime(format!("unknown set builtin {id}"))),
    })
}

fn enum_method(id: u8, recv: &Value, args: &[Value]) -> Result<Value, VmError> {
    let Data::Enum(e) = &recv.data else {
        return Err(VmError::Type("enum method on a non-Enum".into()));
    };
    Ok(match id {
        115 | 119 => Value::string(e.variant.as_str()),
        116 => Value::string(e.enum_name.as_str()),
        117 => Value::array(e.payload.clone()),
        118 => Value::bool(e.variant == str_arg(args, 0, "is_variant")?),
        _ => return Err(VmError::Runtime(format!("unknown enum builtin {id}"))),
    })
}

fn channel_method(id: u8, recv: &Value, args: &[Value]) -> Result<Value, VmError> {
    let Some(ch) = recv.as_channel() else {
        return Err(VmError::Type("channel method on a non-Channel".into()));
    };
    Ok(match id {
        120 => {
            let v = arg(args, 0, "send")?;
            if !matches!(v.phase, Phase::Crystal | Phase::Unphased) {
                return Err(VmError::Concurrency(
                    "channel send requires crystal or unphased values".into(),
                ));
            }
            ch.send(v.deep_clone())
                .map_err(|e| VmError::Concurrency(e.to_string()))?;
            Value::unit()
        }
        121 => ch.recv().unwrap_or_else(Value::unit),
        122 => {
            ch.close();
            Value::unit()
        }
        _ => return Err(VmError::Runtime(format!("unknown channel builtin {id}"))),
    })
}

fn range_method(id: u8, recv: &Value, args: &[Value]) -> Result<Value, VmError> {
    let Data::Range(s, e) = recv.data else {
        return Err(VmError::Type("range method on a non-Range".into()));
    };
    Ok(match id {
        123 => {
            let v = int_arg(args, 0, "contains")?;
            Value::bool(s <= v && v < e)
        }
        124 => Value::array((s..e).map(Value::int).collect()),
        _ => return Err(VmError::Runtime(format!("unknown range builtin {id}"))),
    })
}

fn ref_method(id: u8, recv: &Value, args: &[Value]) -> Result<Value, VmError> {
    let Data::Ref(cell) = &recv.data else {
        return Err(VmError::Type("ref method on a non-Ref".into()));
    };
    Ok(match id {
        125 => cell.lock().clone(),
        126 => {
            if recv.is_crystal() {
                return Err(VmError::Phase("cannot mutate a frozen Ref".into()));
            }
            *cell.lock() = arg(args, 0, "set")?.clone();
            Value::unit()
        }
        127 => Value::string(cell.lock().type_name()),
        _ => return Err(VmError::Runtime(format!("unknown ref builtin {id}"))),
    })
}

// ---------------------------------------------------------------------------
// Callback builtins
// ---------------------------------------------------------------------------

/// Stable merge sort with a fallible comparator.
fn merge_sort<T>(
    mut items: Vec<T>,
    cmp: &mut dyn FnMut(&T, &T) -> Result<Ordering, VmError>,
) -> Result<Vec<T>, VmError> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, cmp)?;
    let right = merge_sort(right, cmp)?;
    let mut out = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(a), Some(b)) => cmp(b, a)? == Ordering::Less,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        out.extend(next);
    }
    Ok(out)
}

fn comparator_result(v: &Value) -> Result<Ordering, VmError> {
    match v.data {
        Data::Int(n) => Ok(n.cmp(&0)),
        Data::Bool(true) => Ok(Ordering::Less),
        Data::Bool(false) => Ok(Ordering::Greater),
        _ => Err(VmError::Type(format!(
            "sort comparator must return Int or Bool, got {}",
            v.type_name()
        ))),
    }
}

impl Vm {
    /// Run builtin `id` against `recv`. `var` names the receiving variable
    /// when it is known, so its pressure mode applies.
    pub(crate) fn call_builtin(
        &mut self,
        id: u8,
        recv: &mut Value,
        args: Vec<Value>,
        var: Option<&str>,
    ) -> Result<Value, VmError> {
        let pressure = Pressure {
            var,
            mode: var.and_then(|v| self.phases.pressure(v)),
        };
        match id {
            1..=24 => array_method(id, recv, &args, &pressure),
            30..=56 => match recv.as_str() {
                Some(s) => strings::string_method(id, s, &args),
                None => Err(VmError::Type("string method on a non-String".into())),
            },
            60..=70 => map_method(id, recv, &args, &pressure),
            75..=98 => buffers::buffer_method(id, recv, &args, &pressure),
            100..=112 => set_method(id, recv, &args, &pressure),
            115..=119 => enum_method(id, recv, &args),
            120..=122 => channel_method(id, recv, &args),
            123..=124 => range_method(id, recv, &args),
            125..=127 => ref_method(id, recv, &args),
            CALLBACK_BASE..=139 => self.array_callback(id, recv, args),
            _ => Err(VmError::Runtime(format!("unknown builtin handler {id}"))),
        }
    }

    fn array_callback(&mut self, id: u8, recv: &Value, args: Vec<Value>) -> Result<Value, VmError> {
        let Some(items) = recv.as_array() else {
            return Err(VmError::Type("array method on a non-Array".into()));
        };
        let items = items.to_vec();
        let callback = |method: &str| -> Result<Value, VmError> {
            match args.first() {
                Some(f) if f.as_closure().is_some() => Ok(f.clone()),
                _ => Err(VmError::Type(format!("{method}() expects a closure"))),
            }
        };
        Ok(match id {
            128 => {
                let f = callback("map")?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.call_closure(&f, vec![item])?);
                }
                Value::array(out)
            }
            129 => {
                let f = callback("filter")?;
                let mut out = Vec::new();
                for item in items {
                    if self.call_closure(&f, vec![item.clone()])?.is_truthy() {
                        out.push(item);
                    }
                }
                Value::array(out)
            }
            130 => {
                let f = callback("reduce")?;
                let mut iter = items.into_iter();
                let mut acc = match args.get(1) {
                    Some(init) => init.clone(),
                    None => iter.next().unwrap_or_default(),
                };
                for item in iter {
                    acc = self.call_closure(&f, vec![acc, item])?;
                }
                acc
            }
            131 | 132 => {
                let f = callback("each")?;
                for item in items {
                    self.call_closure(&f, vec![item])?;
                }
                Value::unit()
            }
            133 => {
                let sorted = match args.first() {
                    Some(f) => {
                        let f = f.clone();
                        merge_sort(items, &mut |a, b| {
                            let r = self.call_closure(&f, vec![a.clone(), b.clone()])?;
                            comparator_result(&r)
                        })?
                    }
                    None => merge_sort(items, &mut |a, b| compare_values(a, b))?,
                };
                Value::array(sorted)
            }
            134 => {
                let f = callback("sort_by")?;
                let mut keyed = Vec::with_capacity(items.len());
                for item in items {
                    keyed.push((self.call_closure(&f, vec![item.clone()])?, item));
                }
                let sorted = merge_sort(keyed, &mut |a, b| compare_values(&a.0, &b.0))?;
                Value::array(sorted.into_iter().map(|(_, v)| v).collect())
            }
            135 => {
                let f = callback("find")?;
                for item in items {
                    if self.call_closure(&f, vec![item.clone()])?.is_truthy() {
                        return Ok(item);
                    }
                }
                Value::nil()
            }
            136 | 137 => {
                let f = callback(if id == 136 { "any" } else { "all" })?;
                let want = id == 136;
                for item in items {
                    if self.call_closure(&f, vec![item])?.is_truthy() == want {
                        return Ok(Value::bool(want));
                    }
                }
                Value::bool(!want)
            }
            138 => {
                let f = callback("flat_map")?;
                let mut out = Vec::new();
                for item in items {
                    let mapped = self.call_closure(&f, vec![item])?;
                    match mapped.data {
                        Data::Array(inner) => out.extend(inner),
                        _ => out.push(mapped),
                    }
                }
                Value::array(out)
            }
            139 => {
                let f = callback("group_by")?;
                let mut groups: BTreeMap<String, Value> = BTreeMap::new();
                for item in items {
                    let key = self.call_closure(&f, vec![item.clone()])?;
                    let key = match key.as_str() {
                        Some(s) => s.to_string(),
                        None => key.to_string(),
                    };
                    let group = groups.entry(key).or_insert_with(|| Value::array(Vec::new()));
                    if let Data::Array(members) = &mut group.data {
                        members.push(item);
                    }
                }
                Value::map(groups)
            }
            _ => return Err(VmError::Runtime(format!("unknown array builtin {id}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREE: Pressure<'static> = Pressure { var: None, mode: None };

    fn ints(v: &[i64]) -> Value {
        Value::array(v.iter().copied().map(Value::int).collect())
    }

    #[test]
    fn type_tags_match_values() {
        assert_eq!(Value::string("").type_tag(), TAG_STRING);
        assert_eq!(ints(&[]).type_tag(), TAG_ARRAY);
        assert_eq!(Value::map(BTreeMap::new()).type_tag(), TAG_MAP);
        assert_eq!(Value::set_of(Vec::new()).type_tag(), TAG_SET);
        assert_eq!(Value::enumeration("E", "V", Vec::new()).type_tag(), TAG_ENUM);
        assert_eq!(Value::range(0, 1).type_tag(), TAG_RANGE);
        assert_eq!(Value::buffer(Vec::new()).type_tag(), TAG_BUFFER);
        assert_eq!(Value::channel(crate::channel::Channel::new()).type_tag(), TAG_CHANNEL);
        assert_eq!(Value::new_ref(Value::nil()).type_tag(), TAG_REF);
    }

    #[test]
    fn handler_ids_are_stable() {
        assert_eq!(builtin_handler(TAG_ARRAY, "push"), 3);
        assert_eq!(builtin_handler(TAG_ARRAY, "group_by"), 139);
        assert_eq!(builtin_handler(TAG_STRING, "kebab_case"), 56);
        assert_eq!(builtin_handler(TAG_BUFFER, "to_hex"), 98);
        assert_eq!(builtin_handler(TAG_REF, "get"), builtin_handler(TAG_REF, "deref"));
        assert_eq!(builtin_handler(TAG_ARRAY, "nope"), NOT_BUILTIN);
        assert_eq!(builtin_handler(3, "len"), NOT_BUILTIN);
    }

    #[test]
    fn no_grow_blocks_push_without_mutating() {
        let mut arr = ints(&[1, 2]);
        let p = Pressure {
            var: Some("arr"),
            mode: Some(PressureMode::NoGrow),
        };
        let err = array_method(3, &mut arr, &[Value::int(3)], &p).unwrap_err();
        assert_eq!(err.to_string(), "pressurized (no_grow): cannot push to 'arr'");
        assert_eq!(arr, ints(&[1, 2]));
        assert_eq!(array_method(4, &mut arr, &[], &p).unwrap(), Value::int(2));
    }

    #[test]
    fn crystal_and_sublimated_arrays() {
        let mut frozen = ints(&[1]).with_phase(Phase::Crystal);
        let err = array_method(3, &mut frozen, &[Value::int(2)], &FREE).unwrap_err();
        assert_eq!(err.to_string(), "cannot push to a crystal array");
        let mut sub = ints(&[1]).with_phase(Phase::Sublimated);
        assert!(array_method(4, &mut sub, &[], &FREE).is_err());
        set_index(&mut sub, &Value::int(0), Value::int(5)).unwrap();
        assert_eq!(sub, ints(&[5]));
    }

    #[test]
    fn sublimated_map_rejects_new_keys() {
        let mut m = Value::map(BTreeMap::from([("a".to_string(), Value::int(1))]))
            .with_phase(Phase::Sublimated);
        set_field(&mut m, "a", Value::int(2)).unwrap();
        let err = set_field(&mut m, "b", Value::int(3)).unwrap_err();
        assert_eq!(err.to_string(), "cannot add keys to a sublimated map");
    }

    #[test]
    fn array_queries() {
        let mut arr = ints(&[3, 1, 3, 2]);
        assert_eq!(array_method(18, &mut arr, &[], &FREE).unwrap(), ints(&[3, 1, 2]));
        assert_eq!(array_method(21, &mut arr, &[], &FREE).unwrap(), Value::int(9));
        assert_eq!(array_method(22, &mut arr, &[], &FREE).unwrap(), Value::int(1));
        assert_eq!(array_method(23, &mut arr, &[], &FREE).unwrap(), Value::int(3));
        assert_eq!(
            array_method(10, &mut arr, &[Value::string("-")], &FREE).unwrap(),
            Value::string("3-1-3-2")
        );
        assert_eq!(
            array_method(24, &mut arr, &[Value::int(3)], &FREE).unwrap(),
            Value::array(vec![ints(&[3, 1, 3]), ints(&[2])])
        );
    }

    #[test]
    fn set_algebra() {
        let mut a = Value::set_of(vec![Value::int(1), Value::int(2)]);
        let b = Value::set_of(vec![Value::int(2), Value::int(3)]);
        let inter = set_method(108, &mut a, &[b.clone()], &FREE).unwrap();
        assert_eq!(set_method(106, &mut inter.clone(), &[], &FREE).unwrap(), ints(&[2]));
        let sym = set_method(110, &mut a, &[b], &FREE).unwrap();
        assert_eq!(set_method(100, &mut sym.clone(), &[], &FREE).unwrap(), Value::int(2));
    }

    #[test]
    fn result_unwrapping() {
        let ok = Value::enumeration("Result", "Ok", vec![Value::int(1)]);
        assert_eq!(unwrap_result(ok).unwrap().unwrap(), Value::int(1));
        let err = Value::map(BTreeMap::from([("tag".to_string(), Value::string("err"))]));
        assert!(unwrap_result(err).unwrap().is_err());
        assert!(unwrap_result(Value::int(1)).is_err());
    }

    #[test]
    fn iteration_helpers() {
        let r = iterable(Value::range(2, 4)).unwrap();
        assert_eq!(iter_element(&r, 1), Some(Value::int(3)));
        assert_eq!(iter_element(&r, 2), None);
        let chars = iterable(Value::string("ab")).unwrap();
        assert_eq!(iter_element(&chars, 1), Some(Value::string("b")));
        assert!(iterable(Value::int(1)).is_err());
    }

    #[test]
    fn merge_sort_is_stable() {
        let items = vec![(1, 'a'), (0, 'b'), (1, 'c'), (0, 'd')];
        let sorted = merge_sort(items, &mut |a, b| Ok(a.0.cmp(&b.0))).unwrap();
        assert_eq!(sorted, [(0, 'b'), (0, 'd'), (1, 'a'), (1, 'c')]);
    }
}
