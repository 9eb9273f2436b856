//! Phase subsystem scenarios: bonds, seeds, pressure and reactions.

use lattice_core::{ChunkBuilder, OpCode, VarLocation};
use lattice_rt::{Phase, Value, Vm, VmConfig};

fn vm() -> Vm {
    Vm::with_config(VmConfig::default())
}

fn transition(b: &mut ChunkBuilder, op: OpCode, name: &str) {
    b.get_global(name);
    b.phase_var(op, name, VarLocation::Global, 0, false);
    b.op(OpCode::Pop);
}

fn bond(b: &mut ChunkBuilder, target: &str, dependent: &str, strategy: &str) {
    b.string(dependent);
    b.string(strategy);
    b.named(OpCode::Bond, target);
    b.op(OpCode::Pop);
}

fn call_native(b: &mut ChunkBuilder, name: &str, args: &[&str]) {
    b.get_global(name);
    for a in args {
        b.string(a);
    }
    b.call(args.len() as u8);
    b.op(OpCode::Pop);
}

fn finish(mut b: ChunkBuilder) -> lattice_core::Chunk {
    b.op(OpCode::Unit);
    b.ret();
    b.build().unwrap()
}

fn phase_of(vm: &Vm, name: &str) -> Phase {
    vm.get_global(name).map(|v| v.phase).unwrap_or_default()
}

#[test]
fn mirror_bond_fires_once() {
    let mut vm = vm();
    vm.define_global("a", Value::int(1));
    vm.define_global("b", Value::int(2));

    let mut b = ChunkBuilder::script();
    bond(&mut b, "a", "b", "mirror");
    transition(&mut b, OpCode::FreezeVar, "a");
    vm.run(finish(b)).unwrap();
    assert_eq!(phase_of(&vm, "b"), Phase::Crystal);
    assert!(!vm.phases().has_bond("a"));

    let mut again = ChunkBuilder::script();
    transition(&mut again, OpCode::ThawVar, "b");
    transition(&mut again, OpCode::FreezeVar, "a");
    vm.run(finish(again)).unwrap();
    assert_eq!(phase_of(&vm, "b"), Phase::Fluid);
}

#[test]
fn gate_on_fluid_dependent_blocks_freeze() {
    let mut vm = vm();
    vm.define_global("a", Value::array(vec![Value::int(1)]));
    vm.define_global("b", Value::int(2));

    let mut setup = ChunkBuilder::script();
    transition(&mut setup, OpCode::ThawVar, "a");
    transition(&mut setup, OpCode::ThawVar, "b");
    bond(&mut setup, "a", "b", "gate");
    vm.run(finish(setup)).unwrap();

    let mut b = ChunkBuilder::script();
    transition(&mut b, OpCode::FreezeVar, "a");
    let err = vm.run(finish(b)).unwrap_err();
    assert!(err.message_contains("gate"), "{err}");
    assert_eq!(phase_of(&vm, "a"), Phase::Fluid);
    assert_eq!(phase_of(&vm, "b"), Phase::Fluid);
}

#[test]
fn gate_passes_once_dependent_is_crystal() {
    let mut vm = vm();
    vm.define_global("a", Value::int(1));
    vm.define_global("b", Value::int(2));

    let mut b = ChunkBuilder::script();
    bond(&mut b, "a", "b", "gate");
    transition(&mut b, OpCode::FreezeVar, "b");
    transition(&mut b, OpCode::FreezeVar, "a");
    vm.run(finish(b)).unwrap();
    assert_eq!(phase_of(&vm, "a"), Phase::Crystal);
}

#[test]
fn false_seed_contract_blocks_freeze() {
    let mut contract = ChunkBuilder::function("positive", &["v"]);
    contract.op(OpCode::False);
    contract.ret();

    let mut vm = vm();
    vm.define_global("x", Value::int(5));
    let mut b = ChunkBuilder::script();
    b.closure(contract.build().unwrap(), &[]);
    b.named(OpCode::Seed, "x");
    b.op(OpCode::Pop);
    transition(&mut b, OpCode::FreezeVar, "x");
    let err = vm.run(finish(b)).unwrap_err();
    assert!(err.message_contains("seed contract returned false"), "{err}");
    assert_eq!(phase_of(&vm, "x"), Phase::Unphased);
    assert_eq!(vm.phases().seeds("x").len(), 1);
}

#[test]
fn no_grow_pressure_rejects_push_on_global() {
    let mut vm = vm();
    vm.define_global("arr", Value::array(vec![Value::int(1), Value::int(2)]));
    let mut b = ChunkBuilder::script();
    call_native(&mut b, "pressurize", &["arr", "no_grow"]);
    b.int(1);
    b.invoke_global("arr", "push", 1);
    let err = vm.run(finish(b)).unwrap_err();
    assert!(err.message_contains("pressurized (no_grow): cannot push to 'arr'"), "{err}");
    assert_eq!(vm.get_global("arr").unwrap().as_array().unwrap().len(), 2);
}

#[test]
fn no_grow_pressure_applies_to_named_local() {
    let mut b = ChunkBuilder::script();
    b.local(1, "arr");
    b.op_u8(OpCode::BuildArray, 0);
    call_native(&mut b, "pressurize", &["arr", "no_grow"]);
    b.int(1);
    b.invoke_local(1, "push", 1);
    let err = vm().run(finish(b)).unwrap_err();
    assert!(err.message_contains("pressurized (no_grow)"), "{err}");
}

#[test]
fn depressurize_lifts_the_restriction() {
    let mut vm = vm();
    vm.define_global("arr", Value::array(vec![]));
    let mut b = ChunkBuilder::script();
    call_native(&mut b, "pressurize", &["arr", "no_resize"]);
    call_native(&mut b, "depressurize", &["arr"]);
    b.int(1);
    b.invoke_global("arr", "push", 1);
    b.op(OpCode::Pop);
    vm.run(finish(b)).unwrap();
    assert_eq!(vm.get_global("arr").unwrap().as_array().unwrap().len(), 1);
}

#[test]
fn sublimated_array_rejects_push() {
    let mut vm = vm();
    vm.define_global("arr", Value::array(vec![Value::int(1)]));
    let mut b = ChunkBuilder::script();
    transition(&mut b, OpCode::SublimateVar, "arr");
    b.int(1);
    b.invoke_global("arr", "push", 1);
    let err = vm.run(finish(b)).unwrap_err();
    assert!(err.message_contains("sublimated"), "{err}");
    assert_eq!(phase_of(&vm, "arr"), Phase::Sublimated);
}

#[test]
fn bond_dependent_skips_caller_slot_now_owned_by_callee() {
    // Slot 1 of the script is named `x` but is only occupied by the callee
    // `f` once the call starts, so the dependent must resolve to global `x`.
    let mut f = ChunkBuilder::function("f", &[]);
    bond(&mut f, "t", "x", "mirror");
    transition(&mut f, OpCode::FreezeVar, "t");
    f.op(OpCode::Unit);
    f.ret();

    let mut vm = vm();
    vm.define_global("t", Value::int(1));
    vm.define_global("x", Value::int(2));
    let mut b = ChunkBuilder::script();
    b.local(1, "x");
    b.closure(f.build().unwrap(), &[]);
    b.call(0);
    b.op(OpCode::Pop);
    vm.run(finish(b)).unwrap();
    assert_eq!(phase_of(&vm, "t"), Phase::Crystal);
    assert_eq!(phase_of(&vm, "x"), Phase::Crystal);
}
