//! Native function interface and the core natives.
//!
//! A native receives an explicit [`NativeContext`] (the calling VM) and its
//! argument slice. Returning `Err(message)` raises a catchable runtime error
//! at the call site.

use crate::channel::Channel;
use crate::config::VmConfig;
use crate::heap::GcStats;
use crate::values::{Data, Value};
use crate::vm::Vm;
use std::collections::BTreeMap;
use std::time::Duration;

pub type NativeFn = fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, String>;

/// Handle a native uses to reach the VM that called it.
pub struct NativeContext<'vm> {
    pub(crate) vm: &'vm mut Vm,
}

impl<'vm> NativeContext<'vm> {
    pub(crate) fn new(vm: &'vm mut Vm) -> Self {
        Self { vm }
    }

    /// Call a closure value (compiled, native, or extension).
    pub fn call(&mut self, callee: &Value, args: Vec<Value>) -> Result<Value, String> {
        self.vm
            .call_closure(callee, args)
            .map_err(|e| e.message())
    }

    /// Source line of the instruction that made the call.
    pub fn line(&self) -> u32 {
        self.vm.current_line()
    }

    pub fn config(&self) -> &VmConfig {
        &self.vm.config
    }

    pub fn print(&mut self, text: &str) {
        self.vm.emit_output(text);
    }

    pub fn gc_stats(&self) -> GcStats {
        self.vm.gc_stats()
    }

    /// Run a collection now; returns the number of freed allocations.
    pub fn collect_garbage(&mut self) -> usize {
        self.vm.collect_garbage()
    }

    /// Keep `value` alive across a collection triggered while the native
    /// holds it. Pair with [`NativeContext::unroot`].
    pub fn root(&mut self, value: Value) {
        self.vm.shadow_roots.push(value);
    }

    pub fn unroot(&mut self) -> Option<Value> {
        self.vm.shadow_roots.pop()
    }
}

/// Named natives available to a VM and every VM it spawns.
#[derive(Clone, Default)]
pub struct NativeRegistry {
    entries: BTreeMap<String, NativeFn>,
}

impl NativeRegistry {
    pub fn register(&mut self, name: &str, f: NativeFn) {
        self.entries.insert(name.to_string(), f);
    }

    pub fn get(&self, name: &str) -> Option<NativeFn> {
        self.entries.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, NativeFn)> {
        self.entries.iter().map(|(k, f)| (k.as_str(), *f))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for NativeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

pub(crate) fn expect_args(name: &str, args: &[Value], n: usize) -> Result<(), String> {
    if args.len() == n {
        Ok(())
    } else {
        Err(format!("{name}() expects {n} argument(s), got {}", args.len()))
    }
}

pub(crate) fn str_arg<'a>(name: &str, args: &'a [Value], i: usize) -> Result<&'a str, String> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("{name}() expects a String argument"))
}

pub(crate) fn int_arg(name: &str, args: &[Value], i: usize) -> Result<i64, String> {
    args.get(i)
        .and_then(Value::as_int)
        .ok_or_else(|| format!("{name}() expects an Int argument"))
}

// ---------------------------------------------------------------------------
// Core natives
// ---------------------------------------------------------------------------

pub(crate) fn core_natives() -> Vec<(&'static str, NativeFn)> {
    vec![
        ("channel", native_channel),
        ("Channel::new", native_channel),
        ("len", native_len),
        ("typeof", native_typeof),
        ("to_string", native_to_string),
        ("repr", native_repr),
        ("assert", native_assert),
        ("ref", native_ref),
        ("Ref::new", native_ref),
        ("Map::new", native_map_new),
        ("Set::new", native_set_new),
        ("Buffer::new", native_buffer_new),
        ("sleep", native_sleep),
        ("gc", native_gc),
        ("gc_stats", native_gc_stats),
        ("phase_of", native_phase_of),
    ]
}

fn native_channel(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("channel", args, 0)?;
    Ok(Value::channel(Channel::new()))
}

/// Length of a sized value, `None` for unsized ones.
pub(crate) fn length_of(v: &Value) -> Option<usize> {
    Some(match &v.data {
        Data::String(s) => s.chars().count(),
        Data::Array(items) | Data::Tuple(items) => items.len(),
        Data::Map(m) | Data::Set(m) => m.len(),
        Data::Buffer(b) => b.len(),
        Data::Range(s, e) => (e - s).max(0) as usize,
        Data::Channel(ch) => ch.len(),
        _ => return None,
    })
}

fn native_len(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("len", args, 1)?;
    length_of(&args[0])
        .map(|n| Value::int(n as i64))
        .ok_or_else(|| format!("len() not supported for {}", args[0].type_name()))
}

fn native_typeof(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("typeof", args, 1)?;
    Ok(Value::string(args[0].type_name()))
}

fn native_to_string(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("to_string", args, 1)?;
    Ok(Value::string(args[0].to_string()))
}

fn native_repr(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("repr", args, 1)?;
    Ok(Value::string(args[0].repr()))
}

fn native_assert(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    let Some(cond) = args.first() else {
        return Err("assert() expects at least 1 argument".into());
    };
    if cond.is_truthy() {
        return Ok(Value::unit());
    }
    match args.get(1) {
        Some(msg) => Err(format!("assertion failed: {msg}")),
        None => Err("assertion failed".into()),
    }
}

fn native_ref(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("ref", args, 1)?;
    Ok(Value::new_ref(args[0].clone()))
}

fn native_map_new(_: &mut NativeContext<'_>, _: &[Value]) -> Result<Value, String> {
    Ok(Value::map(BTreeMap::new()))
}

fn native_set_new(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    match args.first().map(|v| &v.data) {
        Some(Data::Array(items)) => Ok(Value::set_of(items.clone())),
        _ => Ok(Value::set_of(Vec::new())),
    }
}

fn native_buffer_new(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    let size = match args.first() {
        Some(_) => int_arg("Buffer::new", args, 0)?,
        None => 0,
    };
    let size = usize::try_from(size).map_err(|_| "Buffer::new() size must be >= 0".to_string())?;
    Ok(Value::buffer(vec![0; size]))
}

fn native_sleep(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("sleep", args, 1)?;
    let ms = int_arg("sleep", args, 0)?;
    std::thread::sleep(Duration::from_millis(ms.max(0) as u64));
    Ok(Value::unit())
}

fn native_gc(ctx: &mut NativeContext<'_>, _: &[Value]) -> Result<Value, String> {
    Ok(Value::int(ctx.collect_garbage() as i64))
}

fn native_gc_stats(ctx: &mut NativeContext<'_>, _: &[Value]) -> Result<Value, String> {
    let stats = ctx.gc_stats();
    let mut m = BTreeMap::new();
    m.insert("live_allocations".into(), Value::int(stats.live_allocations as i64));
    m.insert("live_bytes".into(), Value::int(stats.live_bytes as i64));
    m.insert("peak_bytes".into(), Value::int(stats.peak_bytes as i64));
    m.insert("regions".into(), Value::int(stats.regions as i64));
    m.insert("cycles".into(), Value::int(stats.cycles as i64));
    Ok(Value::map(m))
}

fn native_phase_of(_: &mut NativeContext<'_>, args: &[Value]) -> Result<Value, String> {
    expect_args("phase_of", args, 1)?;
    Ok(Value::string(args[0].phase.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lengths() {
        assert_eq!(length_of(&Value::string("héllo")), Some(5));
        assert_eq!(length_of(&Value::range(2, 5)), Some(3));
        assert_eq!(length_of(&Value::range(5, 2)), Some(0));
        assert_eq!(length_of(&Value::int(3)), None);
    }

    #[test]
    fn arg_helpers_report_the_native_name() {
        let args = [Value::int(1)];
        assert_eq!(
            str_arg("track", &args, 0).unwrap_err(),
            "track() expects a String argument"
        );
        assert_eq!(int_arg("sleep", &args, 0), Ok(1));
        assert!(expect_args("len", &args, 2).unwrap_err().contains("expects 2"));
    }

    #[test]
    fn registry_lookup() {
        let mut reg = NativeRegistry::default();
        for (name, f) in core_natives() {
            reg.register(name, f);
        }
        assert!(reg.get("len").is_some());
        assert!(reg.get("nope").is_none());
        assert!(reg.len() >= 10);
    }
}
