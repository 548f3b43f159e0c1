use std::collections::{BTreeSet, HashMap};

use dashmap::DashMap;

use crate::analysis::escape::{self, object_init, EscapeSummary, ParamSet, FRESH_RETURN};
use crate::analysis::override_graph::{build_graph, get_overridden_methods, get_overriding_methods};
use crate::analysis::side_effects::{self, Effects};
use crate::analysis::CallGraph;
use crate::config::DexOptions;
use crate::dex::code::DexCode;
use crate::dex::instruction::{DexInstruction, DexRef};
use crate::dex::opcodes::DexOpcode;
use crate::model::access::DexAccessFlags;
use crate::model::class::{DexClass, DexMethod};
use crate::model::pool::{DexFieldRef, DexMethodRef, DexType};

fn mref(desc: &str) -> DexMethodRef {
    DexMethodRef::make_from_descriptor(desc).unwrap()
}

fn dex(registers_size: u16, ins_size: u16, insns: Vec<DexInstruction>) -> DexCode {
    DexCode { registers_size, ins_size, insns, ..DexCode::default() }
}

fn op(opcode: DexOpcode, regs: &[u16]) -> DexInstruction {
    DexInstruction::new(opcode).with_regs(regs)
}

fn add(cls: &mut DexClass, desc: &str, access: DexAccessFlags, code: Option<DexCode>, is_virtual: bool) -> DexMethodRef {
    let m = mref(desc);
    let mut method = DexMethod::new(m);
    method.make_concrete(access, code, is_virtual).unwrap();
    cls.add_method(method).unwrap();
    m
}

/// `make` allocates, `pick` returns its first argument, `store` publishes
/// its argument, and `caller` combines all three.
#[test]
fn summaries_flow_bottom_up_through_ballooned_code() {
    let st = DexAccessFlags::PUBLIC | DexAccessFlags::STATIC;
    let object = DexType::make("Ljava/lang/Object;");
    let sink = DexFieldRef::make_from_descriptor("Lpipe/Box;.sink:Ljava/lang/Object;").unwrap();
    let mut cls = DexClass::new(DexType::make("Lpipe/Box;"), "pipeline").unwrap();
    cls.set_super_class(Some(object));

    let make = add(
        &mut cls,
        "Lpipe/Box;.make:()Ljava/lang/Object;",
        st,
        Some(dex(
            1,
            0,
            vec![
                op(DexOpcode::NewInstance, &[0]).with_ref(DexRef::Type(object)),
                op(DexOpcode::InvokeDirect, &[0]).with_ref(DexRef::Method(object_init())),
                op(DexOpcode::ReturnObject, &[0]),
            ],
        )),
        false,
    );
    let pick = add(
        &mut cls,
        "Lpipe/Box;.pick:(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;",
        st,
        Some(dex(2, 2, vec![op(DexOpcode::ReturnObject, &[0])])),
        false,
    );
    let store = add(
        &mut cls,
        "Lpipe/Box;.store:(Ljava/lang/Object;)V",
        st,
        Some(dex(
            1,
            1,
            vec![op(DexOpcode::SputObject, &[0]).with_ref(DexRef::Field(sink)), op(DexOpcode::ReturnVoid, &[])],
        )),
        false,
    );
    let caller = add(
        &mut cls,
        "Lpipe/Box;.caller:(Ljava/lang/Object;)Ljava/lang/Object;",
        st,
        Some(dex(
            3,
            1,
            vec![
                op(DexOpcode::InvokeStatic, &[]).with_ref(DexRef::Method(make)),
                op(DexOpcode::MoveResultObject, &[0]),
                op(DexOpcode::InvokeStatic, &[0, 2]).with_ref(DexRef::Method(pick)),
                op(DexOpcode::MoveResultObject, &[1]),
                op(DexOpcode::InvokeStatic, &[2]).with_ref(DexRef::Method(store)),
                op(DexOpcode::ReturnObject, &[1]),
            ],
        )),
        false,
    );
    cls.balloon_all(&DexOptions::default()).unwrap();

    let scope = vec![&cls];
    let overrides = build_graph(&scope);
    let cg = CallGraph::build(&scope, &overrides);
    assert_eq!(cg.callees(caller).len(), 3);
    let order = cg.bottom_up_order();
    assert_eq!(order.last(), Some(&caller));

    let escapes = DashMap::new();
    let iterators = escape::analyze_scope(&scope, &cg, &escapes).unwrap();
    assert_eq!(iterators.len(), 4);
    let escapes: HashMap<DexMethodRef, EscapeSummary> = escapes.into_iter().collect();
    assert_eq!(escapes[&make].returned_parameters, ParamSet::of(&[FRESH_RETURN]));
    assert_eq!(escapes[&pick], EscapeSummary { escaping_parameters: BTreeSet::new(), returned_parameters: ParamSet::of(&[0]) });
    assert_eq!(escapes[&store].escaping_parameters, BTreeSet::from([0]));
    assert_eq!(
        escapes[&caller],
        EscapeSummary { escaping_parameters: BTreeSet::from([0]), returned_parameters: ParamSet::of(&[FRESH_RETURN]) }
    );

    let effects = DashMap::new();
    side_effects::analyze_scope(&scope, &cg, &iterators, &effects);
    let effects: HashMap<_, _> = effects.into_iter().collect();
    assert!(effects[&make].is_pure());
    assert!(effects[&pick].is_pure());
    assert_eq!(effects[&store].effects, Effects::WRITE_MAY_ESCAPE);
    assert_eq!(effects[&caller].effects, Effects::WRITE_MAY_ESCAPE);

    // The analyses only read the bodies; they still sync.
    cls.sync_all().unwrap();
}

#[test]
fn package_privacy_bounds_overrides() {
    let public = DexAccessFlags::PUBLIC;
    let mut x = DexClass::new(DexType::make("Lscen/a/X;"), "overrides").unwrap();
    x.set_access(public);
    let xm = add(&mut x, "Lscen/a/X;.m:()V", DexAccessFlags::empty(), Some(dex(1, 1, vec![op(DexOpcode::ReturnVoid, &[])])), true);

    let mut far = DexClass::new(DexType::make("Lscen/b/Y;"), "overrides").unwrap();
    far.set_super_class(Some(x.get_type()));
    add(&mut far, "Lscen/b/Y;.m:()V", public, Some(dex(1, 1, vec![op(DexOpcode::ReturnVoid, &[])])), true);
    {
        let scope = vec![&x, &far];
        assert!(get_overriding_methods(&build_graph(&scope), xm).is_empty());
    }

    let mut near = DexClass::new(DexType::make("Lscen/a/Y;"), "overrides").unwrap();
    near.set_super_class(Some(x.get_type()));
    let ym = add(&mut near, "Lscen/a/Y;.m:()V", public, Some(dex(1, 1, vec![op(DexOpcode::ReturnVoid, &[])])), true);
    let scope = vec![&x, &near];
    let graph = build_graph(&scope);
    assert_eq!(get_overriding_methods(&graph, xm), vec![ym]);
    assert_eq!(get_overridden_methods(&graph, ym), vec![xm]);
}
