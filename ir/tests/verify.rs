use codedefender_ir::{
    builder::{Builder, InsertPoint},
    function::Function,
    inst::InstKind,
    module::Module,
    types::{Constant, Type},
    value::{BinOp, ICmpPred, Value},
    verify::{verify_function, verify_module},
};

/// Builds:
/// ```text
/// entry: %slot = alloca i32; store %slot, 0; br body
/// body:  %v = load %slot; %c = icmp eq %v, 0; condbr %c, then, els
/// then:  ret 1
/// els:   ret 0
/// ```
fn sample_function(name: &str) -> Function {
    let mut f = Function::new(name, Type::I32, vec![]);
    let entry = f.push_block("entry");
    let body = f.push_block("body");
    let then_blk = f.push_block("then");
    let els = f.push_block("els");

    let slot = {
        let mut b = Builder::at_end(&mut f, entry);
        b.emit(InstKind::Alloca { ty: Type::I32 }, Type::Ptr, "slot")
    };
    {
        let mut b = Builder::at_end(&mut f, entry);
        b.emit_void(InstKind::Store {
            ptr: slot.clone(),
            value: Value::Const(Constant::Int(Type::I32, 0)),
        });
    }
    f.block_mut(entry).terminator = codedefender_ir::block::Terminator::Br { target: body };

    let v = {
        let mut b = Builder::at_end(&mut f, body);
        b.emit(
            InstKind::Load {
                ptr: slot.clone(),
                ty: Type::I32,
            },
            Type::I32,
            "v",
        )
    };
    let c = {
        let mut b = Builder::at_end(&mut f, body);
        b.emit(
            InstKind::ICmp {
                pred: ICmpPred::Eq,
                lhs: v,
                rhs: Value::Const(Constant::Int(Type::I32, 0)),
            },
            Type::I1,
            "c",
        )
    };
    f.block_mut(body).terminator = codedefender_ir::block::Terminator::CondBr {
        cond: c,
        if_true: then_blk,
        if_false: els,
    };

    f.block_mut(then_blk).terminator = codedefender_ir::block::Terminator::Ret {
        value: Some(Value::Const(Constant::Int(Type::I32, 1))),
    };
    f.block_mut(els).terminator = codedefender_ir::block::Terminator::Ret {
        value: Some(Value::Const(Constant::Int(Type::I32, 0))),
    };

    f.recompute_preds();
    f
}

#[test]
fn well_formed_function_verifies() {
    let f = sample_function("validate");
    verify_function(&f).expect("well-formed function must verify");
}

#[test]
fn module_with_ctor_verifies() {
    let mut m = Module::new("unit");
    m.add_function(sample_function("validate"));
    m.add_global_ctor("validate", 100);
    verify_module(&m).expect("module with a valid ctor reference must verify");
}

#[test]
fn dangling_ctor_reference_fails() {
    let mut m = Module::new("unit");
    m.add_function(sample_function("validate"));
    m.add_global_ctor("does_not_exist", 100);
    assert!(verify_module(&m).is_err());
}

#[test]
fn non_dominating_use_is_rejected() {
    let mut f = Function::new("broken", Type::I32, vec![]);
    let entry = f.push_block("entry");
    let left = f.push_block("left");
    let right = f.push_block("right");

    let cond = Value::Const(Constant::Int(Type::I1, 1));
    f.block_mut(entry).terminator = codedefender_ir::block::Terminator::CondBr {
        cond,
        if_true: left,
        if_false: right,
    };

    let defined_in_left = {
        let mut b = Builder::at_end(&mut f, left);
        b.emit(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: Value::Const(Constant::Int(Type::I32, 1)),
                rhs: Value::Const(Constant::Int(Type::I32, 1)),
            },
            Type::I32,
            "x",
        )
    };
    f.block_mut(left).terminator = codedefender_ir::block::Terminator::Ret {
        value: Some(defined_in_left.clone()),
    };

    // `right` illegally uses a value defined only in `left`, which does not dominate it.
    let _ = {
        let mut b = Builder::at_end(&mut f, right);
        b.emit(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: defined_in_left,
                rhs: Value::Const(Constant::Int(Type::I32, 0)),
            },
            Type::I32,
            "y",
        )
    };
    f.block_mut(right).terminator = codedefender_ir::block::Terminator::Ret {
        value: Some(Value::Const(Constant::Int(Type::I32, 0))),
    };

    f.recompute_preds();
    assert!(verify_function(&f).is_err());
}

#[test]
fn builder_insertion_point_helpers_respect_phi_prefix() {
    let mut f = Function::new("phi_fn", Type::I32, vec![]);
    let entry = f.push_block("entry");
    let join = f.push_block("join");

    f.block_mut(entry).terminator = codedefender_ir::block::Terminator::Br { target: join };
    f.recompute_preds();

    let phi = {
        let mut b = Builder::at(&mut f, join, InsertPoint::Index(0));
        b.emit(
            InstKind::Phi {
                incomings: vec![(entry, Value::Const(Constant::Int(Type::I32, 7)))],
            },
            Type::I32,
            "p",
        )
    };

    {
        let mut b = Builder::after_phis(&mut f, join);
        assert_eq!(b.position(), 1);
        b.emit(
            InstKind::Binary {
                op: BinOp::Add,
                lhs: phi.clone(),
                rhs: Value::Const(Constant::Int(Type::I32, 1)),
            },
            Type::I32,
            "sum",
        );
    }

    f.block_mut(join).terminator = codedefender_ir::block::Terminator::Ret { value: Some(phi) };
    verify_function(&f).expect("phi with matching single predecessor must verify");
}
