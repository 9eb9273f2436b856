//! Defer, exception unwinding across frames, VM limits and uncaught error
//! reporting.

use lattice_core::{ChunkBuilder, OpCode};
use lattice_rt::{Value, Vm, VmConfig};

fn vm() -> Vm {
    let mut vm = Vm::with_config(VmConfig::default());
    vm.capture_output();
    vm
}

fn print(b: &mut ChunkBuilder, text: &str) {
    b.string(text);
    b.op_u8(OpCode::Print, 1);
    b.op(OpCode::Pop);
}

// ─── Defer ───

#[test]
fn return_runs_defers_lifo_and_keeps_the_result() {
    let mut f = ChunkBuilder::function("f", &[]);
    f.defer(0, |b| print(b, "first"));
    f.defer(0, |b| print(b, "second"));
    f.int(5);
    f.ret();

    let mut b = ChunkBuilder::script();
    b.closure(f.build().unwrap(), &[]);
    b.call(0);
    b.ret();

    let mut vm = vm();
    assert_eq!(vm.run(b.build().unwrap()).unwrap(), Value::int(5));
    assert_eq!(vm.take_output(), vec!["second", "first"]);
}

#[test]
fn defer_run_only_runs_blocks_at_or_above_depth() {
    let mut b = ChunkBuilder::script();
    b.defer(0, |b| print(b, "outer"));
    b.defer(1, |b| print(b, "inner"));
    b.int(9);
    b.op_u8(OpCode::DeferRun, 1);
    b.define_global("kept");
    print(&mut b, "after");
    b.op(OpCode::Unit);
    b.ret();

    let mut vm = vm();
    vm.run(b.build().unwrap()).unwrap();
    assert_eq!(vm.take_output(), vec!["inner", "after", "outer"]);
    assert_eq!(vm.get_global("kept"), Some(Value::int(9)));
}

#[test]
fn defer_body_reads_the_owning_frame_locals() {
    let mut f = ChunkBuilder::function("f", &["x"]);
    f.defer(0, |b| {
        b.get_local(1);
        b.op_u8(OpCode::Print, 1);
        b.op(OpCode::Pop);
    });
    f.op(OpCode::Unit);
    f.ret();

    let mut b = ChunkBuilder::script();
    b.closure(f.build().unwrap(), &[]);
    b.string("from x");
    b.call(1);
    b.ret();

    let mut vm = vm();
    vm.run(b.build().unwrap()).unwrap();
    assert_eq!(vm.take_output(), vec!["from x"]);
}

// ─── Exceptions ───

#[test]
fn handler_in_caller_catches_throw_in_callee() {
    let mut thrower = ChunkBuilder::function("thrower", &[]);
    thrower.string("bad input");
    thrower.op(OpCode::Throw);
    thrower.ret();

    let mut b = ChunkBuilder::script();
    b.closure(thrower.build().unwrap(), &[]);
    b.define_global("thrower");
    let handler = b.jump(OpCode::PushExceptionHandler);
    b.get_global("thrower");
    b.call(0);
    b.op(OpCode::PopExceptionHandler);
    let done = b.jump(OpCode::Jump);
    b.patch_jump(handler);
    b.ret();
    b.patch_jump(done);
    b.op(OpCode::Nil);
    b.ret();

    assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::string("bad input"));
}

#[test]
fn handler_nesting_limit_is_itself_catchable() {
    let mut b = ChunkBuilder::script();
    let handlers: Vec<usize> = (0..65)
        .map(|_| b.jump(OpCode::PushExceptionHandler))
        .collect();
    b.op(OpCode::Nil);
    b.ret();
    for h in handlers {
        b.patch_jump(h);
    }
    b.ret();

    let caught = vm().run(b.build().unwrap()).unwrap();
    assert_eq!(caught, Value::string("too many nested exception handlers"));
}

#[test]
fn unbounded_recursion_overflows() {
    let mut f = ChunkBuilder::function("f", &[]);
    f.get_global("f");
    f.call(0);
    f.ret();

    let mut b = ChunkBuilder::script();
    b.closure(f.build().unwrap(), &[]);
    b.define_global("f");
    b.get_global("f");
    b.call(0);
    b.ret();

    let err = vm().run(b.build().unwrap()).unwrap_err();
    assert!(err.is_stack_overflow(), "{err}");
}

// ─── Uncaught errors ───

#[test]
fn uncaught_error_carries_line_and_stack_trace() {
    let mut f = ChunkBuilder::function("f", &[]);
    f.line(7);
    f.int(1);
    f.int(0);
    f.op(OpCode::Div);
    f.ret();

    let mut b = ChunkBuilder::script();
    b.closure(f.build().unwrap(), &[]);
    b.line(2);
    b.call(0);
    b.ret();

    let err = vm().run(b.build().unwrap()).unwrap_err();
    let text = err.to_string();
    assert!(text.starts_with("[line 7] division by zero"), "{text}");
    assert!(text.contains("Stack trace (most recent call last):"), "{text}");
    assert_eq!(err.line(), Some(7));
    let frames: Vec<(&str, u32)> = err
        .stack_frames()
        .iter()
        .map(|f| (f.function.as_str(), f.line))
        .collect();
    assert_eq!(frames, vec![("<script>", 2), ("f", 7)]);
}

#[test]
fn uncaught_error_at_top_level_has_only_the_line() {
    let mut b = ChunkBuilder::script();
    b.line(4);
    b.get_global("missing");
    b.ret();

    let err = vm().run(b.build().unwrap()).unwrap_err();
    assert_eq!(err.to_string(), "[line 4] undefined variable 'missing'");
    assert!(err.stack_frames().is_empty());
}

// ─── Halt ───

#[test]
fn halt_in_a_callback_returns_to_the_caller() {
    let mut cb = ChunkBuilder::function("cb", &["x"]);
    cb.int(7);
    cb.op(OpCode::Halt);

    let mut b = ChunkBuilder::script();
    b.int(1);
    b.int(2);
    b.op_u8(OpCode::BuildArray, 2);
    b.closure(cb.build().unwrap(), &[]);
    b.invoke("map", 1);
    b.define_global("mapped");
    b.string("after");
    b.ret();

    let mut vm = vm();
    assert_eq!(vm.run(b.build().unwrap()).unwrap(), Value::string("after"));
    assert_eq!(
        vm.get_global("mapped"),
        Some(Value::array(vec![Value::int(7), Value::int(7)]))
    );
}
