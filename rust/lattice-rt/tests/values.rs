//! Arithmetic, phase round-trips and closure capture, driven through
//! hand-assembled chunks.

use lattice_core::{Capture, ChunkBuilder, OpCode};
use lattice_rt::values::Data;
use lattice_rt::{Phase, Value, Vm, VmConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

fn vm() -> Vm {
    Vm::with_config(VmConfig::default())
}

fn binary(lhs: Value, rhs: Value, op: OpCode) -> Result<Value, lattice_rt::VmError> {
    let mut vm = vm();
    vm.define_global("lhs", lhs);
    vm.define_global("rhs", rhs);
    let mut b = ChunkBuilder::script();
    b.get_global("lhs");
    b.get_global("rhs");
    b.op(op);
    b.ret();
    vm.run(b.build().unwrap())
}

fn sample(rng: &mut StdRng) -> Value {
    if rng.gen_bool(0.5) {
        Value::int(rng.gen_range(-1_000_000_000_000i64..1_000_000_000_000))
    } else {
        Value::float(rng.gen_range(-1.0e9..1.0e9))
    }
}

// ─── Arithmetic ───

#[test]
fn addition_commutes_across_numeric_pairs() {
    let mut rng = StdRng::seed_from_u64(0x1a77);
    for _ in 0..200 {
        let a = sample(&mut rng);
        let b = sample(&mut rng);
        let ab = binary(a.clone(), b.clone(), OpCode::Add).unwrap();
        let ba = binary(b, a, OpCode::Add).unwrap();
        assert_eq!(ab, ba);
    }
}

#[test]
fn division_and_modulo_by_zero_fail() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let a = sample(&mut rng);
        for zero in [Value::int(0), Value::float(0.0)] {
            let div = binary(a.clone(), zero.clone(), OpCode::Div).unwrap_err();
            assert!(div.is_division_by_zero(), "{div}");
            let rem = binary(a.clone(), zero, OpCode::Mod).unwrap_err();
            assert!(rem.is_division_by_zero(), "{rem}");
        }
    }
}

#[test]
fn failed_division_leaves_no_result_for_the_handler() {
    let mut b = ChunkBuilder::script();
    b.int(7);
    let handler = b.jump(OpCode::PushExceptionHandler);
    b.int(1);
    b.int(0);
    b.op(OpCode::Div);
    b.op(OpCode::PopExceptionHandler);
    let done = b.jump(OpCode::Jump);
    b.patch_jump(handler);
    // catch: [7, message]
    b.op_u8(OpCode::BuildArray, 2);
    b.ret();
    b.patch_jump(done);
    b.op(OpCode::Nil);
    b.ret();
    let result = vm().run(b.build().unwrap()).unwrap();
    let items = result.as_array().unwrap();
    assert_eq!(items[0], Value::int(7));
    assert!(items[1].as_str().unwrap().contains("division by zero"));
}

// ─── Freeze / thaw ───

fn samples() -> Vec<Value> {
    let mut map = BTreeMap::new();
    map.insert("k".to_string(), Value::array(vec![Value::int(1), Value::string("x")]));
    vec![
        Value::int(3),
        Value::string("hello"),
        Value::array(vec![Value::int(1), Value::array(vec![Value::float(2.5)])]),
        Value::map(map),
        Value::set_of(vec![Value::int(1), Value::int(2)]),
        Value::tuple(vec![Value::bool(true), Value::nil()]),
        Value::structure("P", vec![("x".into(), Value::int(1)), ("y".into(), Value::unit())]),
        Value::enumeration("Opt", "Some", vec![Value::int(9)]),
        Value::buffer(vec![1, 2, 3]),
        Value::range(0, 4),
    ]
}

#[test]
fn freeze_thaw_freeze_matches_single_freeze() {
    for v in samples() {
        let mut vm = vm();
        vm.define_global("v", v.clone());

        let mut once = ChunkBuilder::script();
        once.get_global("v");
        once.op(OpCode::Freeze);
        once.ret();
        let once = vm.run(once.build().unwrap()).unwrap();

        let mut thrice = ChunkBuilder::script();
        thrice.get_global("v");
        thrice.op(OpCode::Freeze);
        thrice.op(OpCode::Thaw);
        thrice.op(OpCode::Freeze);
        thrice.ret();
        let thrice = vm.run(thrice.build().unwrap()).unwrap();

        assert_eq!(once, thrice, "{v:?}");
        assert_eq!(thrice.phase, Phase::Crystal);
    }
}

#[test]
fn freezing_a_channel_fails() {
    let mut b = ChunkBuilder::script();
    b.get_global("channel");
    b.call(0);
    b.op(OpCode::Freeze);
    b.ret();
    let err = vm().run(b.build().unwrap()).unwrap_err();
    assert!(err.message_contains("cannot freeze a channel"));
}

#[test]
fn freezing_a_self_referencing_ref_keeps_the_cycle() {
    let mut b = ChunkBuilder::script();
    b.get_global("ref");
    b.int(0);
    b.call(1);
    b.define_global("r");
    b.get_global("r");
    b.op_u8(OpCode::BuildArray, 1);
    b.invoke_global("r", "set", 1);
    b.op(OpCode::Pop);
    b.get_global("r");
    b.op(OpCode::Freeze);
    b.ret();
    let mut vm = vm();
    let frozen = vm.run(b.build().unwrap()).unwrap();
    assert!(frozen.is_crystal());
    assert_ne!(Some(frozen.clone()), vm.get_global("r"));

    let Data::Ref(cell) = &frozen.data else {
        panic!("Ref expected, got {frozen:?}")
    };
    let inner = cell.lock().clone();
    assert!(inner.is_crystal());
    assert_eq!(inner.as_array().unwrap(), &[frozen.clone()]);
}

// ─── Closures ───

#[test]
fn open_capture_sees_updates_and_closed_capture_keeps_its_value() {
    let mut get_i = ChunkBuilder::function("get_i", &[]);
    get_i.get_upvalue(0);
    get_i.ret();

    let mut b = ChunkBuilder::script();
    b.local(1, "i");
    b.int(0);
    b.closure(get_i.build().unwrap(), &[Capture::Local(1)]);
    b.define_global("g");

    // i += 1 while the capture is still open
    b.get_local(1);
    b.int(1);
    b.op(OpCode::Add);
    b.set_local(1);
    b.op(OpCode::Pop);
    b.get_global("g");
    b.call(0);
    b.define_global("inside");

    // leave the block: close the capture, then reuse the slot
    b.op(OpCode::CloseUpvalue);
    b.int(100);
    b.int(5);
    b.set_local(1);
    b.op(OpCode::Pop);
    b.get_global("g");
    b.call(0);
    b.ret();

    let mut vm = vm();
    assert_eq!(vm.run(b.build().unwrap()).unwrap(), Value::int(1));
    assert_eq!(vm.get_global("inside"), Some(Value::int(1)));
}

#[test]
fn closures_sharing_a_slot_share_the_cell() {
    let mut get = ChunkBuilder::function("get", &[]);
    get.get_upvalue(0);
    get.ret();
    let mut set = ChunkBuilder::function("set", &["v"]);
    set.get_local(1);
    set.set_upvalue(0);
    set.ret();

    let mut b = ChunkBuilder::script();
    b.local(1, "n");
    b.int(1);
    b.closure(get.build().unwrap(), &[Capture::Local(1)]);
    b.define_global("get");
    b.closure(set.build().unwrap(), &[Capture::Local(1)]);
    b.define_global("set");
    b.op(OpCode::CloseUpvalue);
    b.get_global("set");
    b.int(42);
    b.call(1);
    b.op(OpCode::Pop);
    b.get_global("get");
    b.call(0);
    b.ret();
    assert_eq!(vm().run(b.build().unwrap()).unwrap(), Value::int(42));
}
