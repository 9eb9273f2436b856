//! Human-readable bytecode listing.

use crate::chunk::{Chunk, Constant};
use crate::opcode::{OpCode, VarLocation, ARM_BINDING, ARM_DEFAULT, ARM_TIMEOUT, NO_INDEX};
use std::fmt::Write;

/// Disassemble a chunk and every function constant nested inside it.
pub fn disassemble(chunk: &Chunk) -> String {
    let mut out = String::new();
    disassemble_into(&mut out, chunk);
    out
}

fn disassemble_into(out: &mut String, chunk: &Chunk) {
    let _ = writeln!(out, "== {} ==", chunk.display_name());

    let mut offset = 0;
    let mut last_line = None;
    while offset < chunk.code.len() {
        let line = chunk.line_at(offset);
        if last_line == Some(line) {
            let _ = write!(out, "{offset:04}    | ");
        } else {
            let _ = write!(out, "{offset:04} {line:4} ");
            last_line = Some(line);
        }

        let Some(len) = chunk.instruction_len(offset) else {
            let _ = writeln!(out, "UNKNOWN({:#04x})", chunk.code[offset]);
            offset += 1;
            continue;
        };
        // instruction_len only succeeds for known opcodes
        let Some(op) = OpCode::decode(chunk.code[offset]) else {
            offset += 1;
            continue;
        };
        let _ = writeln!(out, "{:<24}{}", op.name(), operands(chunk, op, offset, len));
        offset += len;
    }

    for constant in &chunk.constants {
        if let Constant::Function(inner) = constant {
            out.push('\n');
            disassemble_into(out, inner);
        }
    }
}

fn constant_label(chunk: &Chunk, idx: usize) -> String {
    match chunk.constants.get(idx) {
        Some(Constant::String(s)) => format!("{s:?}"),
        Some(Constant::Int(i)) => i.to_string(),
        Some(Constant::Float(f)) => f.to_string(),
        Some(Constant::Bool(b)) => b.to_string(),
        Some(Constant::Nil) => "nil".into(),
        Some(Constant::Unit) => "()".into(),
        Some(Constant::Function(f)) => format!("<fn {}>", f.display_name()),
        None => "<bad constant>".into(),
    }
}

fn operands(chunk: &Chunk, op: OpCode, offset: usize, len: usize) -> String {
    use OpCode::*;
    let mut r = chunk.operands(offset);
    let next = offset + len;
    match op {
        Constant | GetGlobal | SetGlobal | DefineGlobal | GetField | SetField | React
        | Unreact | Bond | Unbond | Seed | Unseed | Import => {
            let idx = r.index();
            format!("{idx:4} ; {}", constant_label(chunk, idx))
        }
        Constant16 | GetGlobal16 | SetGlobal16 | DefineGlobal16 => {
            let idx = r.wide_index();
            format!("{idx:4} ; {}", constant_label(chunk, idx))
        }
        GetLocal | SetLocal | IncLocal | DecLocal | SetIndexLocal => {
            let slot = r.index();
            match chunk.local_name(slot) {
                Some(name) => format!("{slot:4} ; {name}"),
                None => format!("{slot:4}"),
            }
        }
        GetUpvalue | SetUpvalue | Call | BuildArray | BuildMap | BuildTuple | DeferRun
        | Print => format!("{:4}", r.u8()),
        LoadInt8 => format!("{:4}", r.i8()),
        Jump | JumpIfFalse | JumpIfTrue | JumpIfNotNil | IterNext | PushExceptionHandler => {
            let dist = r.wide_index();
            format!("{dist:4} ; -> {:04}", next + dist)
        }
        Loop => {
            let dist = r.wide_index();
            format!("{dist:4} ; -> {:04}", next.saturating_sub(dist))
        }
        BuildStruct => {
            let name = r.index();
            let count = r.u8();
            format!("{name:4} {count} ; {}", constant_label(chunk, name))
        }
        BuildEnum => {
            let e = r.index();
            let v = r.index();
            let n = r.u8();
            format!(
                "{e:4} {v} {n} ; {}::{}",
                chunk.constant_str(e).unwrap_or("?"),
                chunk.constant_str(v).unwrap_or("?")
            )
        }
        Invoke => {
            let name = r.index();
            let argc = r.u8();
            format!("{name:4} {argc} ; .{}", chunk.constant_str(name).unwrap_or("?"))
        }
        InvokeLocal | InvokeGlobal => {
            let target = r.index();
            let name = r.index();
            let argc = r.u8();
            format!(
                "{target:4} {name} {argc} ; .{}",
                chunk.constant_str(name).unwrap_or("?")
            )
        }
        DeferPush => {
            let depth = r.u8();
            let skip = r.wide_index();
            format!("{depth:4} {skip} ; -> {:04}", next + skip)
        }
        FreezeVar | ThawVar | SublimateVar => {
            let name = r.index();
            let loc = r.u8();
            let slot = r.u8();
            let (kind, consume) = match VarLocation::decode(loc) {
                Some((VarLocation::Local, c)) => ("local", c),
                Some((VarLocation::Upvalue, c)) => ("upvalue", c),
                Some((VarLocation::Global, c)) => ("global", c),
                None => ("?", false),
            };
            format!(
                "{name:4} {kind} {slot}{} ; {}",
                if consume { " consume" } else { "" },
                chunk.constant_str(name).unwrap_or("?")
            )
        }
        Closure | Closure16 => {
            let idx = if op == Closure { r.index() } else { r.wide_index() };
            let count = r.u8();
            let mut s = format!("{idx:4} ; {}", constant_label(chunk, idx));
            for _ in 0..count {
                let is_local = r.u8();
                let index = r.u8();
                let _ = write!(
                    s,
                    " {}{}",
                    if is_local == 1 { "local " } else { "upvalue " },
                    index
                );
            }
            s
        }
        Scope => {
            let spawns = r.u8();
            let sync = r.u8();
            let mut s = if sync == NO_INDEX {
                format!("{spawns:4} sync=none")
            } else {
                format!("{spawns:4} sync={sync}")
            };
            for _ in 0..spawns {
                let _ = write!(s, " spawn={}", r.u8());
            }
            s
        }
        Select => {
            let arms = r.u8();
            let mut s = format!("{arms:4}");
            for _ in 0..arms {
                let flags = r.u8();
                let chan = r.u8();
                let body = r.u8();
                let binding = r.u8();
                let kind = if flags & ARM_DEFAULT != 0 {
                    "default".to_string()
                } else if flags & ARM_TIMEOUT != 0 {
                    format!("timeout({chan})")
                } else {
                    format!("recv({chan})")
                };
                let _ = write!(s, " [{kind} body={body}");
                if flags & ARM_BINDING != 0 {
                    let _ = write!(s, " as {}", chunk.constant_str(binding.into()).unwrap_or("?"));
                }
                s.push(']');
            }
            s
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ChunkBuilder;

    #[test]
    fn lists_nested_functions_after_parent() {
        let mut inner = ChunkBuilder::function("add_one", &["n"]);
        inner.get_local(1);
        inner.int(1);
        inner.op(OpCode::Add);
        inner.ret();
        let inner = inner.build().unwrap();

        let mut script = ChunkBuilder::script();
        script.closure(inner, &[]);
        script.define_global("add_one");
        script.op(OpCode::Halt);
        let text = disassemble(&script.build().unwrap());

        let top = text.find("== <script> ==").unwrap();
        let nested = text.find("== add_one ==").unwrap();
        assert!(top < nested);
        assert!(text.contains("CLOSURE"));
        assert!(text.contains("DEFINE_GLOBAL"));
        assert!(text.contains("\"add_one\""));
        assert!(text.contains("LOAD_INT8"));
    }

    #[test]
    fn jump_targets_are_resolved() {
        let mut b = ChunkBuilder::script();
        b.op(OpCode::True);
        let at = b.jump(OpCode::JumpIfFalse);
        b.op(OpCode::Pop);
        b.patch_jump(at);
        b.op(OpCode::Halt);
        let text = disassemble(&b.build().unwrap());
        // JUMP_IF_FALSE at 1, operand ends at 4, skips POP
        assert!(text.contains("-> 0005"), "{text}");
    }
}
