//! Integration tests: building, encoding, and decoding whole functions.

use tarn_bytecode::context::Context;
use tarn_bytecode::decoder::decode;
use tarn_bytecode::encoder::BcBuilder;
use tarn_bytecode::feedback::{FeedbackSlot, ObservedTest, ObservedType, TypeRecord};
use tarn_bytecode::module::{BcFunction, BcModule, CallSite, Formals};
use tarn_bytecode::value::BcValue;
use tarn_bytecode::{Opcode, Symbol};

#[test]
fn build_and_decode_branchy_function() {
    let mut module = BcModule::new("m");
    let x = module.symbols.intern("x");
    let one = module.pool.insert(BcValue::Int(1));
    let two = module.pool.insert(BcValue::Int(2));

    let mut b = BcBuilder::new();
    let else_l = b.label();
    let done = b.label();
    b.ld_var(x);
    b.record_test(FeedbackSlot::Test(ObservedTest::default()));
    b.br_false(else_l);
    b.push_const(one);
    b.br(done);
    b.bind(else_l);
    b.push_const(two);
    b.bind(done);
    b.op(Opcode::Ret);
    let body = b.finish().unwrap();

    let fun = module.add_function(BcFunction {
        name: "f".into(),
        formals: Formals::new(vec![x]),
        body,
        ..Default::default()
    });

    let code = &module.function(fun).body;
    let instrs = decode(&code.code).unwrap();

    // Every jump resolves to an instruction boundary
    for i in &instrs {
        if let Some(target) = i.jump_target() {
            assert!(instrs.iter().any(|j| j.offset == target), "target {target} dangles");
        }
    }
    assert_eq!(instrs.last().unwrap().opcode, Opcode::Ret);
    assert_eq!(code.feedback.len(), 1);
}

#[test]
fn feedback_slots_accumulate() {
    let mut t = ObservedType::default();
    t.record(TypeRecord::of(&BcValue::Int(1)));
    t.record(TypeRecord::of(&BcValue::Real(1.0)));
    assert_eq!(t.records.len(), 2);
    assert!(!t.overflow);
    assert!(!t.maybe_object());
}

#[test]
fn call_sites_survive_the_builder() {
    let mut b = BcBuilder::new();
    let mut site = CallSite::positional(2);
    site.names[1] = Some(Symbol(9));
    b.ld_fun(Symbol(3));
    b.call(site.clone());
    let code = b.finish().unwrap();

    let instrs = decode(&code.code).unwrap();
    // Named arguments routed to the named-call opcode
    assert_eq!(instrs[1].opcode, Opcode::NamedCall);
    assert_eq!(code.call_sites.len(), 1);
    assert_eq!(code.call_sites[0], site);
}

#[test]
fn contexts_dispatch_by_strength() {
    let weak = Context::minimal();
    let mut strong = weak;
    strong.set_eager(0);
    assert!(strong.includes(&weak));
    assert!(!weak.includes(&strong));
    assert!(strong.strength() > weak.strength());
    let u = weak.union(&strong);
    assert_eq!(u, strong);
}
