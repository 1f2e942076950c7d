//! Bytecode emission.
//!
//! Walks blocks in the stable breadth-first order, staging operands from
//! slots (or reusing the value the previous instruction left on the stack),
//! emitting the opcode, and storing the result. The operand stack is
//! simulated throughout; a block that does not come back to depth zero is a
//! lowering bug and fails the emit.
//!
//! The current-environment slot is tracked per block so consecutive
//! operations on the same environment skip the `SetEnv` dance.

use rustc_hash::FxHashMap;

use tarn_bytecode::encoder::{BcBuilder, Label};
use tarn_bytecode::module::{BcCode, CallSite, ConstPool, DeoptFrame, DeoptMetadata};
use tarn_bytecode::opcode::Opcode;
use tarn_bytecode::value::{BcValue, Builtin, SexpKind};

use super::alloc::{staged_args, Allocation};
use super::LowerError;
use crate::analysis::last_env::LastEnvAt;
use crate::config::CompilerConfig;
use crate::ir::bb::BBId;
use crate::ir::code::Code;
use crate::ir::tag::{Tag, TypeTestKind};
use crate::ir::ty::BaseType;
use crate::ir::value::{InstrId, Value};
use crate::visitor::BreadthFirstVisitor;

struct Emitter<'a> {
    code: &'a Code,
    allocation: &'a Allocation,
    pool: &'a mut ConstPool,
    b: BcBuilder,
    labels: FxHashMap<BBId, Label>,
    /// Slot holding the function's lexical environment
    base_slot: u16,
    /// Value currently resting on the stack from the previous instruction
    stack_top: Option<InstrId>,
    /// Environment known to be in the interpreter's env slot
    cur_env: Option<Value>,
    depth: isize,
}

pub fn emit(
    code: &Code,
    allocation: &Allocation,
    pool: &mut ConstPool,
    config: &CompilerConfig,
) -> Result<BcCode, LowerError> {
    let order = BreadthFirstVisitor::order(code);
    let mut b = BcBuilder::new();
    let labels: FxHashMap<BBId, Label> = order.iter().map(|bb| (*bb, b.label())).collect();
    // Which environment every predecessor leaves in the slot; lets blocks
    // start without a redundant SetEnv
    let last_env = LastEnvAt::compute(code);

    let mut e = Emitter {
        code,
        allocation,
        pool,
        b,
        labels,
        base_slot: allocation.num_slots,
        stack_top: None,
        cur_env: None,
        depth: 0,
    };

    // Save the lexical environment for later re-entry
    e.b.op(Opcode::GetEnv);
    e.b.st_loc(e.base_slot);

    for bb in &order {
        let label = e.labels[bb];
        e.b.bind(label);
        e.stack_top = None;
        e.cur_env = if *bb == code.entry {
            Some(Value::BaseEnv)
        } else {
            code.bb(*bb)
                .instrs
                .first()
                .and_then(|first| last_env.before(code, *first))
        };
        e.depth = 0;

        for id in &code.bb(*bb).instrs {
            e.emit_instr(*id, config)?;
        }

        let block = code.bb(*bb);
        if block.is_jump() {
            let target = e.labels[&block.next0.unwrap()];
            e.b.br(target);
        }
        if e.depth != 0 {
            return Err(LowerError::StackImbalance(bb.0));
        }
    }

    e.b.finish().ok_or(LowerError::BadLabels)
}

impl Emitter<'_> {
    fn slot(&self, id: InstrId) -> Result<u16, LowerError> {
        self.allocation.slot(id).ok_or(LowerError::Unsupported("value without storage"))
    }

    fn stage(&mut self, v: &Value) -> Result<(), LowerError> {
        if let Value::Instr(id) = v {
            if self.stack_top == Some(*id) {
                // Already resting on the stack, and already counted
                self.stack_top = None;
                return Ok(());
            }
        }
        match v {
            Value::Instr(id) => {
                let slot = self.slot(*id)?;
                self.b.ld_loc(slot);
            }
            Value::True => self.push_const(BcValue::TRUE),
            Value::False => self.push_const(BcValue::FALSE),
            Value::Nil => self.push_const(BcValue::Nil),
            Value::Missing => self.push_const(BcValue::Missing),
            Value::Unbound => self.push_const(BcValue::Unbound),
            Value::BaseEnv => self.b.ld_loc(self.base_slot),
            // A tombstone can only flow into dead positions
            Value::Tombstone(_) => self.push_const(BcValue::Nil),
            Value::ElidedEnv | Value::NotClosedEnv => {
                return Err(LowerError::Unsupported("environment placeholder as operand"));
            }
        }
        self.depth += 1;
        Ok(())
    }

    fn push_const(&mut self, v: BcValue) {
        let idx = self.pool.insert(v);
        self.b.push_const(idx);
    }

    /// Make `env` the interpreter's current environment.
    fn ensure_env(&mut self, env: Option<Value>) -> Result<(), LowerError> {
        let Some(env) = env else { return Ok(()) };
        if env == Value::ElidedEnv || self.cur_env == Some(env) {
            return Ok(());
        }
        match env {
            Value::BaseEnv => self.b.ld_loc(self.base_slot),
            Value::Instr(id) => {
                let slot = self.slot(id)?;
                self.b.ld_loc(slot);
            }
            _ => return Err(LowerError::Unsupported("unrepresentable environment")),
        }
        self.b.op(Opcode::SetEnv);
        self.cur_env = Some(env);
        Ok(())
    }

    /// Store (or keep) the instruction's result; balances the stack.
    fn finish_result(&mut self, id: InstrId) {
        if self.allocation.on_stack.contains(&id) {
            // Stays on the stack, still counted, for the next instruction
            self.stack_top = Some(id);
            return;
        }
        match self.allocation.slot(id) {
            Some(slot) => self.b.st_loc(slot),
            None => self.b.op(Opcode::Pop),
        }
        self.depth -= 1;
    }

    fn stage_all(&mut self, id: InstrId) -> Result<usize, LowerError> {
        let args = staged_args(self.code, id);
        let n = args.len();
        for a in &args {
            self.stage(a)?;
        }
        Ok(n)
    }

    fn emit_instr(&mut self, id: InstrId, config: &CompilerConfig) -> Result<(), LowerError> {
        let instr = self.code.instr(id);
        let tag = instr.tag.clone();

        match &tag {
            Tag::Nop | Tag::Phi { .. } | Tag::FrameState { .. } | Tag::RecordDeoptReason { .. } => {
                return Ok(());
            }
            Tag::Checkpoint | Tag::Assume { .. } | Tag::Deopt => {
                return Err(LowerError::Unsupported("speculation survived lowering"));
            }
            Tag::LdFunctionEnv => {
                return Err(LowerError::Unsupported("promise environment in a function body"));
            }
            _ => {}
        }

        match tag {
            Tag::LdConst { idx } => {
                self.b.push_const(idx);
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::LdArg { index } => {
                self.b.ld_arg(index as u16);
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::LdVar { name } => {
                self.ensure_env(instr.env())?;
                self.b.ld_var_no_force(name);
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::LdVarSuper { name } => {
                self.ensure_env(instr.env())?;
                self.b.ld_var_super(name);
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::LdFun { name } => {
                self.ensure_env(instr.env())?;
                self.b.ld_fun(name);
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::Missing { name } => {
                self.ensure_env(instr.env())?;
                self.b.missing(name);
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::StVar { name } => {
                self.ensure_env(instr.env())?;
                self.stage(&instr.args[0].clone())?;
                self.b.st_var(name);
                self.depth -= 1;
            }
            Tag::StVarSuper { name } => {
                self.ensure_env(instr.env())?;
                self.stage(&instr.args[0].clone())?;
                self.b.st_var_super(name);
                self.depth -= 1;
            }
            Tag::MkEnv { ref names, .. } => {
                let n = self.stage_all(id)?;
                self.b.mk_env(names.clone());
                self.depth -= n as isize;
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::Force { .. } => {
                self.stage(&instr.args[0].clone())?;
                self.b.op(Opcode::Force);
                self.finish_result(id);
            }
            Tag::MkArg { prom } => {
                self.ensure_env(instr.env())?;
                let eager = instr.args[0];
                if eager == Value::Missing {
                    self.b.mk_promise(prom.0);
                    self.depth += 1;
                } else {
                    self.stage(&eager)?;
                    self.b.mk_eager_promise(prom.0);
                }
                self.finish_result(id);
            }
            Tag::MkFunCls { fun } => {
                self.ensure_env(instr.env())?;
                self.b.mk_closure(fun.0 as u16);
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::CastType { .. } | Tag::PirCopy => {
                self.stage(&instr.args[0].clone())?;
                self.finish_result(id);
            }
            Tag::Call { .. } | Tag::NamedCall { .. } => {
                self.ensure_env(instr.env())?;
                let n = self.stage_all(id)?;
                let names = match &self.code.instr(id).tag {
                    Tag::NamedCall { names, .. } => names.clone(),
                    _ => vec![None; n - 1],
                };
                let site = CallSite {
                    nargs: (n - 1) as u16,
                    names,
                    src: self.code.instr(id).src,
                    ctx: None,
                };
                self.b.call(site);
                self.depth -= n as isize;
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::StaticCall { fun, ctx, nargs, .. } => {
                self.ensure_env(instr.env())?;
                // The callee closure, then the matched arguments
                self.push_const(BcValue::Closure(fun));
                self.depth += 1;
                let n = self.stage_all(id)?;
                let site = CallSite {
                    nargs: nargs as u16,
                    names: vec![None; nargs],
                    src: self.code.instr(id).src,
                    ctx: Some(ctx),
                };
                self.b.call(site);
                self.depth -= (n + 1) as isize;
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::CallBuiltin { builtin, nargs } => {
                self.ensure_env(instr.env())?;
                let n = self.stage_all(id)?;
                self.b.call_builtin(builtin, nargs as u16);
                self.depth -= n as isize;
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::CallSafeBuiltin { builtin, nargs } => {
                let n = self.stage_all(id)?;
                self.b.call_builtin(builtin, nargs as u16);
                self.depth -= n as isize;
                self.depth += 1;
                self.finish_result(id);
            }
            t if t.is_binop() || t.is_unop() => {
                self.ensure_env(instr.env())?;
                let n = self.stage_all(id)?;
                self.b.op(binop_opcode(&t));
                self.depth -= n as isize;
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::Extract1 | Tag::Extract2 | Tag::Subassign1 | Tag::Subassign2 => {
                self.ensure_env(instr.env())?;
                let n = self.stage_all(id)?;
                self.b.op(match tag {
                    Tag::Extract1 => Opcode::Extract1,
                    Tag::Extract2 => Opcode::Extract2,
                    Tag::Subassign1 => Opcode::Subassign1,
                    _ => Opcode::Subassign2,
                });
                self.depth -= n as isize;
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::Length => {
                self.stage(&instr.args[0].clone())?;
                self.b.op(Opcode::Length);
                self.finish_result(id);
            }
            Tag::ForSeqSize => {
                // The opcode keeps the sequence and pushes its length
                self.stage(&instr.args[0].clone())?;
                self.b.op(Opcode::ForSeqSize);
                self.depth += 1;
                self.finish_result(id);
                self.b.op(Opcode::Pop);
                self.depth -= 1;
            }
            Tag::Identical => {
                let n = self.stage_all(id)?;
                self.b.op(Opcode::Identical);
                self.depth -= n as isize;
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::CheckTrueFalse | Tag::AsLogical => {
                self.stage(&instr.args[0].clone())?;
                self.b.op(Opcode::AsLogical);
                self.finish_result(id);
            }
            Tag::ChkMissing => {
                self.stage(&instr.args[0].clone())?;
                self.b.op(Opcode::ChkMissing);
                self.finish_result(id);
            }
            Tag::IsKind { kind } => {
                self.stage(&instr.args[0].clone())?;
                self.b.is(kind);
                self.finish_result(id);
            }
            Tag::TypeTest { test } => {
                self.stage(&instr.args[0].clone())?;
                match test {
                    TypeTestKind::Object => {
                        self.b.call_builtin(Builtin::IsObject, 1);
                    }
                    TypeTestKind::IsA(ty) => {
                        let kind =
                            single_kind(&ty).ok_or(LowerError::Unsupported("wide type guard"))?;
                        self.b.is(kind);
                    }
                    TypeTestKind::EnvStub => {
                        return Err(LowerError::Unsupported("environment stub guard"));
                    }
                }
                self.finish_result(id);
            }
            Tag::DotsList { .. } => {
                let n = self.stage_all(id)?;
                self.b.call_builtin(Builtin::List, n as u16);
                self.depth -= n as isize;
                self.depth += 1;
                self.finish_result(id);
            }
            Tag::Visible => self.b.op(Opcode::Visible),
            Tag::Invisible => self.b.op(Opcode::Invisible),
            Tag::Branch => {
                let block = self.code.bb(instr.bb);
                self.stage(&instr.args[0].clone())?;
                self.b.br_true(self.labels[&block.next0.unwrap()]);
                self.depth -= 1;
                self.b.br(self.labels[&block.next1.unwrap()]);
            }
            Tag::Return => {
                self.stage(&instr.args[0].clone())?;
                self.b.op(Opcode::Ret);
                self.depth -= 1;
            }
            Tag::NonLocalReturn => {
                self.ensure_env(instr.env())?;
                self.stage(&instr.args[0].clone())?;
                self.b.op(Opcode::NonLocalRet);
                self.depth -= 1;
            }
            Tag::Unreachable => {
                // Proven dead; keep the interpreter safe anyway
                self.push_const(BcValue::Nil);
                self.b.op(Opcode::Ret);
            }
            Tag::ScheduledDeopt { ref frames } => {
                if config.debug_deopts {
                    let msg = self.pool.insert(BcValue::Str("deopt".to_string()));
                    self.b.push_const(msg);
                    self.b.call_builtin(Builtin::Cat, 1);
                    self.b.op(Opcode::Pop);
                }
                // Innermost environment, then every captured stack value
                let env_val = {
                    let mut cursor = 0usize;
                    let mut env = None;
                    for f in frames {
                        env = Some(instr.args[cursor + f.stack_len]);
                        cursor += f.stack_len + 1;
                    }
                    env
                };
                self.ensure_env(env_val)?;
                let n = self.stage_all(id)?;
                let meta = DeoptMetadata {
                    frames: frames
                        .iter()
                        .map(|f| DeoptFrame {
                            code: f.code,
                            pc: f.pc,
                            stack_depth: f.stack_len as u32,
                        })
                        .collect(),
                };
                self.b.deopt(meta);
                self.depth -= n as isize;
            }
            _ => return Err(LowerError::Unsupported("unhandled instruction")),
        }
        Ok(())
    }
}

fn binop_opcode(tag: &Tag) -> Opcode {
    match tag {
        Tag::Add => Opcode::Add,
        Tag::Sub => Opcode::Sub,
        Tag::Mul => Opcode::Mul,
        Tag::Div => Opcode::Div,
        Tag::IDiv => Opcode::IDiv,
        Tag::Mod => Opcode::Mod,
        Tag::Pow => Opcode::Pow,
        Tag::Lt => Opcode::Lt,
        Tag::Lte => Opcode::Lte,
        Tag::Gt => Opcode::Gt,
        Tag::Gte => Opcode::Gte,
        Tag::Eq => Opcode::Eq,
        Tag::Neq => Opcode::Neq,
        Tag::LAnd => Opcode::LAnd,
        Tag::LOr => Opcode::LOr,
        Tag::Colon => Opcode::Colon,
        Tag::Not => Opcode::Not,
        Tag::Plus => Opcode::UPlus,
        _ => Opcode::UMinus,
    }
}

/// The single value kind of a type, when it has exactly one. The bit order
/// of the R kind union mirrors the host's kind tags.
fn single_kind(ty: &crate::ir::ty::PirType) -> Option<SexpKind> {
    let BaseType::R(kinds) = ty.base else { return None };
    if kinds.bits().count_ones() != 1 {
        return None;
    }
    let kind = kinds.bits().trailing_zeros() as u8;
    SexpKind::from_u8(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::alloc::allocate;
    use tarn_bytecode::decoder::decode;
    use tarn_bytecode::PoolIdx;

    fn emit_code(code: &Code, pool: &mut ConstPool) -> BcCode {
        let allocation = allocate(code).unwrap();
        let config = CompilerConfig::default();
        emit(code, &allocation, pool, &config).unwrap()
    }

    #[test]
    fn test_emit_constant_return() {
        let mut pool = ConstPool::new();
        let idx = pool.insert(BcValue::Int(42));
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        let c = code.push(bb, Tag::LdConst { idx }, vec![]);
        code.push(bb, Tag::Return, vec![Value::Instr(c)]);

        let out = emit_code(&code, &mut pool);
        let instrs = decode(&out.code).unwrap();
        let ops: Vec<Opcode> = instrs.iter().map(|i| i.opcode).collect();
        // Prologue saves the env, then the constant flows straight to Ret
        assert!(ops.contains(&Opcode::Push));
        assert_eq!(*ops.last().unwrap(), Opcode::Ret);
        // Stack mode: the constant is not stored into a local
        assert!(!ops.contains(&Opcode::StLoc) || ops.iter().filter(|o| **o == Opcode::StLoc).count() == 1);
    }

    #[test]
    fn test_emit_branch_shape() {
        let mut pool = ConstPool::new();
        let mut code = Code::new();
        let head = code.new_bb();
        let t = code.new_bb();
        let f = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(head);
        let c = code.push(head, Tag::LdArg { index: 0 }, vec![]);
        code.instr_mut(c).ty = crate::ir::ty::PirType::test();
        code.push(head, Tag::Branch, vec![Value::Instr(c)]);
        code.bb_mut(head).next0 = Some(t);
        code.bb_mut(head).next1 = Some(f);
        code.push(t, Tag::Return, vec![Value::True]);
        code.push(f, Tag::Return, vec![Value::False]);

        let out = emit_code(&code, &mut pool);
        let instrs = decode(&out.code).unwrap();
        let ops: Vec<Opcode> = instrs.iter().map(|i| i.opcode).collect();
        assert!(ops.contains(&Opcode::BrTrue));
        assert!(ops.contains(&Opcode::LdArg));
        assert_eq!(ops.iter().filter(|o| **o == Opcode::Ret).count(), 2);
    }

    #[test]
    fn test_emit_env_ops_set_env_once() {
        let mut pool = ConstPool::new();
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        let env = code.push(
            bb,
            Tag::MkEnv { names: vec![], stub: false },
            vec![Value::BaseEnv],
        );
        let a = code.push(bb, Tag::LdVar { name: tarn_bytecode::Symbol(5) }, vec![Value::Instr(env)]);
        code.push(bb, Tag::StVar { name: tarn_bytecode::Symbol(6) }, vec![Value::Instr(a), Value::Instr(env)]);
        let r = code.push(bb, Tag::LdVar { name: tarn_bytecode::Symbol(6) }, vec![Value::Instr(env)]);
        code.push(bb, Tag::Return, vec![Value::Instr(r)]);

        let out = emit_code(&code, &mut pool);
        let instrs = decode(&out.code).unwrap();
        let set_envs = instrs.iter().filter(|i| i.opcode == Opcode::SetEnv).count();
        // The same environment stays current across the three accesses
        assert_eq!(set_envs, 1);
    }

    #[test]
    fn test_emit_deopt_metadata() {
        let mut pool = ConstPool::new();
        let mut code = Code::new();
        let bb = code.new_bb();
        code.bb_mut(code.entry).next0 = Some(bb);
        let v = code.push(bb, Tag::LdConst { idx: PoolIdx(0) }, vec![]);
        code.push(
            bb,
            Tag::ScheduledDeopt {
                frames: vec![crate::ir::tag::FrameShape {
                    code: tarn_bytecode::CodeRef {
                        fun: tarn_bytecode::FunId(0),
                        which: tarn_bytecode::WhichCode::Body,
                    },
                    pc: 12,
                    stack_len: 1,
                    in_promise: false,
                }],
            },
            vec![Value::Instr(v), Value::BaseEnv],
        );

        let out = emit_code(&code, &mut pool);
        assert_eq!(out.deopts.len(), 1);
        assert_eq!(out.deopts[0].frames.len(), 1);
        assert_eq!(out.deopts[0].frames[0].pc, 12);
        assert_eq!(out.deopts[0].frames[0].stack_depth, 1);
        let instrs = decode(&out.code).unwrap();
        assert!(instrs.iter().any(|i| i.opcode == Opcode::Deopt));
    }
}
