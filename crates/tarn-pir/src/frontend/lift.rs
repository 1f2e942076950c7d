//! The stack-to-SSA lifter.
//!
//! A symbolic interpreter over the baseline operand stack. Every stack slot
//! holds an SSA value; at merge offsets the slots become phis, seeded by the
//! first arriving edge and extended by later ones. Runtime feedback guides
//! speculation: monomorphic call sites become guarded direct calls, and
//! one-sided branches become straight-line code with a deopt on the cold
//! side.
//!
//! Promises are compiled recursively. A promise whose body has no observable
//! effect is spliced inline at the call site and its result becomes the
//! argument's eager value; everything else stays a lazy `MkArg`.

use rustc_hash::FxHashMap;
use thiserror::Error;

use tarn_bytecode::context::{ArgAssumptions, Assumptions, Context};
use tarn_bytecode::decoder::{decode, DecodeError, DecodedInstr, Operands};
use tarn_bytecode::feedback::{FeedbackSlot, ObservedCallee, ObservedTest, ObservedType};
use tarn_bytecode::module::{BcFunction, CallSite, CodeRef, ConstPool, FunId, PoolIdx, WhichCode};
use tarn_bytecode::opcode::Opcode;
use tarn_bytecode::value::{BcValue, Builtin, SexpKind};
use tarn_bytecode::Symbol;

use crate::ir::bb::BBId;
use crate::ir::builder::Builder;
use crate::ir::code::Code;
use crate::ir::tag::{DeoptReason, Tag};
use crate::ir::ty::PirType;
use crate::ir::value::{InstrId, Value};
use crate::ir::version::{ClosureVersion, PromisePool};
use crate::query;

/// Request to compile an inner closure, drained by the driver between
/// passes.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileRequest {
    pub fun: FunId,
    pub ctx: Context,
}

#[derive(Debug, Error)]
pub enum LiftError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("operand stack underflow at offset {offset}")]
    StackUnderflow { offset: usize },
    #[error("unsupported opcode {opcode} at offset {offset}")]
    UnsupportedOpcode { opcode: Opcode, offset: usize },
    #[error("operand stack depth mismatch at merge offset {offset}")]
    StackDepthMismatch { offset: usize },
    #[error("malformed bytecode at offset {offset}")]
    MalformedCode { offset: usize },
}

/// Lift a baseline function body into a fresh version. Returns the compile
/// requests for inner closures discovered along the way.
pub fn lift_function(
    functions: &[BcFunction],
    pool: &mut ConstPool,
    fun: FunId,
    version: &mut ClosureVersion,
) -> Result<Vec<CompileRequest>, LiftError> {
    let bc_fun = &functions[fun.0 as usize];
    let ctx = version.ctx;
    let mut requests = Vec::new();

    let (entry_bb, env, _args) = {
        let b = Builder::function(&mut version.code, &bc_fun.formals, &ctx);
        (b.current, b.env, b.args.clone())
    };

    let mut lifter = Lifter {
        functions,
        pool,
        promises: &mut version.promises,
        code: &mut version.code,
        fun,
        which: WhichCode::Body,
        in_promise: false,
        env,
        cur: entry_bb,
        stack: Vec::new(),
        requests: &mut requests,
        pending_callee: None,
        pending_test: None,
    };
    lifter.run()?;
    Ok(requests)
}

/// Lift one promise body into its own code unit.
fn lift_promise_code(
    functions: &[BcFunction],
    pool: &mut ConstPool,
    promises: &mut PromisePool,
    fun: FunId,
    prom_idx: u16,
    requests: &mut Vec<CompileRequest>,
) -> Result<Code, LiftError> {
    let mut code = Code::new();
    let (entry_bb, env) = {
        let b = Builder::promise(&mut code);
        (b.current, b.env)
    };
    let mut lifter = Lifter {
        functions,
        pool,
        promises,
        code: &mut code,
        fun,
        which: WhichCode::Promise(prom_idx),
        in_promise: true,
        env,
        cur: entry_bb,
        stack: Vec::new(),
        requests,
        pending_callee: None,
        pending_test: None,
    };
    lifter.run()?;
    Ok(code)
}

/// Per-merge-offset bookkeeping.
struct BlockEntry {
    bb: BBId,
    /// The phi per stack slot, present once seeded as a merge
    phis: Vec<InstrId>,
    /// Entry stack, present once any edge delivered
    stack: Option<Vec<Value>>,
    is_merge: bool,
}

struct Lifter<'a> {
    functions: &'a [BcFunction],
    pool: &'a mut ConstPool,
    promises: &'a mut PromisePool,
    code: &'a mut Code,
    fun: FunId,
    which: WhichCode,
    in_promise: bool,
    env: Value,
    cur: BBId,
    stack: Vec<Value>,
    requests: &'a mut Vec<CompileRequest>,
    /// Hint from the last `RecordCall` slot, consumed by the next call
    pending_callee: Option<ObservedCallee>,
    /// Hint from the last `RecordTest` slot, consumed by the next branch
    pending_test: Option<ObservedTest>,
}

impl Lifter<'_> {
    fn bc_fun(&self) -> &BcFunction {
        &self.functions[self.fun.0 as usize]
    }

    fn code_ref(&self) -> CodeRef {
        CodeRef { fun: self.fun, which: self.which }
    }

    fn emit(&mut self, tag: Tag, args: Vec<Value>) -> Value {
        Value::Instr(self.code.push(self.cur, tag, args))
    }

    fn pop(&mut self, offset: usize) -> Result<Value, LiftError> {
        self.stack.pop().ok_or(LiftError::StackUnderflow { offset })
    }

    fn ty(&self, v: &Value) -> PirType {
        v.ty(self.code)
    }

    /// A frame state capturing the interpreter state before the bytecode at
    /// `pc`: the current abstract stack plus the environment.
    fn frame_state(&mut self, pc: usize) -> Value {
        let mut args = self.stack.clone();
        args.push(self.env);
        self.emit(
            Tag::FrameState {
                code: self.code_ref(),
                pc: pc as u32,
                stack_len: self.stack.len(),
                in_promise: self.in_promise,
                has_parent: false,
            },
            args,
        )
    }

    /// Split control flow through a checkpoint; the deopt branch resumes the
    /// interpreter at `pc`. Returns the checkpoint value; emission continues
    /// in the surviving branch.
    fn checkpoint(&mut self, pc: usize) -> Value {
        let cont = self.code.new_bb();
        let deopt_bb = self.code.new_bb();
        let cp = self.emit(Tag::Checkpoint, vec![]);
        self.code.bb_mut(self.cur).next0 = Some(cont);
        self.code.bb_mut(self.cur).next1 = Some(deopt_bb);

        self.cur = deopt_bb;
        let fs = self.frame_state(pc);
        self.emit(Tag::Deopt, vec![fs]);
        self.cur = cont;
        cp
    }

    /// Coerce a value to a machine test.
    fn as_test(&mut self, v: Value) -> Value {
        if self.ty(&v).is_a(&PirType::test()) {
            v
        } else if self.ty(&v).is_a(&PirType::simple_lgl()) {
            self.emit(Tag::Identical, vec![v, Value::True])
        } else {
            self.emit(Tag::CheckTrueFalse, vec![v])
        }
    }

    /// Fold well-known pool constants to singletons.
    fn load_const(&mut self, idx: PoolIdx) -> Value {
        let singleton = match self.pool.get(idx) {
            BcValue::Lgl(Some(true)) => Some(Value::True),
            BcValue::Lgl(Some(false)) => Some(Value::False),
            BcValue::Nil => Some(Value::Nil),
            BcValue::Missing => Some(Value::Missing),
            BcValue::Unbound => Some(Value::Unbound),
            _ => None,
        };
        if let Some(v) = singleton {
            return v;
        }
        let ty = const_type(self.pool.get(idx));
        let out = self.emit(Tag::LdConst { idx }, vec![]);
        if let Value::Instr(id) = out {
            self.code.instr_mut(id).ty = ty;
        }
        out
    }

    fn run(&mut self) -> Result<(), LiftError> {
        let bcode = self.bc_fun().code(self.which).clone();
        let instrs = decode(&bcode.code)?;
        if instrs.is_empty() {
            self.emit(Tag::Return, vec![Value::Nil]);
            return Ok(());
        }

        // Block boundaries and incoming-edge counts
        let starts = block_starts(&instrs);
        let mut sorted: Vec<usize> = starts.iter().copied().collect();
        sorted.sort_unstable();
        let block_of: FxHashMap<usize, usize> =
            sorted.iter().enumerate().map(|(i, o)| (*o, i)).collect();
        let incoming = incoming_edges(&instrs, &block_of, &sorted);

        let mut entries: Vec<BlockEntry> = sorted
            .iter()
            .enumerate()
            .map(|(i, _)| BlockEntry {
                bb: self.code.new_bb(),
                phis: Vec::new(),
                stack: None,
                is_merge: incoming[i] > 1,
            })
            .collect();

        // The prologue block flows into the first bytecode block
        self.code.bb_mut(self.cur).next0 = Some(entries[0].bb);
        deliver(self.code, &mut entries[0], self.cur, Vec::new())
            .map_err(|_| LiftError::StackDepthMismatch { offset: 0 })?;

        // Group decoded instructions by block
        let mut by_block: Vec<Vec<DecodedInstr>> = vec![Vec::new(); sorted.len()];
        let mut cur_block = 0;
        for instr in &instrs {
            if cur_block + 1 < sorted.len() && instr.offset >= sorted[cur_block + 1] {
                cur_block += 1;
            }
            by_block[cur_block].push(*instr);
        }

        // Process blocks as their entry stacks become available; a block
        // reachable only through a backward jump is delivered late
        let mut processed = vec![false; sorted.len()];
        let mut progress = true;
        while progress {
            progress = false;
            for bi in 0..sorted.len() {
                if processed[bi] || entries[bi].stack.is_none() {
                    continue;
                }
                processed[bi] = true;
                progress = true;

                self.cur = entries[bi].bb;
                self.stack = entries[bi].stack.clone().unwrap();
                self.pending_callee = None;
                self.pending_test = None;

                let block = by_block[bi].clone();
                let mut terminated = false;
                for instr in &block {
                    if self.lift_instr(instr, &bcode, &mut entries, &block_of)? {
                        terminated = true;
                        break;
                    }
                }

                if !terminated {
                    // Fallthrough into the next block
                    if bi + 1 < sorted.len() {
                        let stack = std::mem::take(&mut self.stack);
                        let from = self.cur;
                        self.code.bb_mut(from).next0 = Some(entries[bi + 1].bb);
                        deliver(self.code, &mut entries[bi + 1], from, stack)
                            .map_err(|_| LiftError::StackDepthMismatch { offset: sorted[bi + 1] })?;
                    } else if !self.code.bb(self.cur).is_branch() {
                        // Ran off the end of the stream
                        return Err(LiftError::MalformedCode {
                            offset: block.last().map(|i| i.offset).unwrap_or(0),
                        });
                    }
                }
            }
        }
        // Whatever never received a stack is dead code
        for (bi, entry) in entries.iter().enumerate() {
            if !processed[bi] {
                self.code.bb_mut(entry.bb).deleted = true;
            }
        }
        Ok(())
    }

    /// Lift one bytecode. Returns true when the instruction terminated the
    /// block.
    fn lift_instr(
        &mut self,
        instr: &DecodedInstr,
        bcode: &tarn_bytecode::BcCode,
        entries: &mut [BlockEntry],
        block_of: &FxHashMap<usize, usize>,
    ) -> Result<bool, LiftError> {
        let offset = instr.offset;
        match instr.opcode {
            Opcode::Nop => {}
            Opcode::Pop => {
                self.pop(offset)?;
            }
            Opcode::Dup => {
                let top = *self.stack.last().ok_or(LiftError::StackUnderflow { offset })?;
                self.stack.push(top);
            }
            Opcode::Dup2 => {
                let n = self.stack.len();
                if n < 2 {
                    return Err(LiftError::StackUnderflow { offset });
                }
                let (y, x) = (self.stack[n - 2], self.stack[n - 1]);
                self.stack.push(y);
                self.stack.push(x);
            }
            Opcode::Swap => {
                let n = self.stack.len();
                if n < 2 {
                    return Err(LiftError::StackUnderflow { offset });
                }
                self.stack.swap(n - 2, n - 1);
            }
            Opcode::Pick => {
                if let Operands::U16(n) = instr.operands {
                    let len = self.stack.len();
                    let idx = len
                        .checked_sub(1 + n as usize)
                        .ok_or(LiftError::StackUnderflow { offset })?;
                    let v = self.stack[idx];
                    self.stack.push(v);
                }
            }

            Opcode::Push => {
                if let Operands::U32(idx) = instr.operands {
                    let v = self.load_const(PoolIdx(idx));
                    self.stack.push(v);
                }
            }

            Opcode::LdVar => {
                if let Operands::U32(sym) = instr.operands {
                    let env = self.env;
                    let v = self.emit(Tag::LdVar { name: Symbol(sym) }, vec![env]);
                    self.emit(Tag::Visible, vec![]);
                    // Deopt resumes after the load, with the unforced value
                    // on the stack
                    self.stack.push(v);
                    let fs = self.frame_state(instr.next_offset());
                    self.stack.pop();
                    let forced = self.emit(Tag::Force { has_fs: true }, vec![v, fs]);
                    self.stack.push(forced);
                }
            }
            Opcode::LdVarNoForce => {
                if let Operands::U32(sym) = instr.operands {
                    let env = self.env;
                    let v = self.emit(Tag::LdVar { name: Symbol(sym) }, vec![env]);
                    self.stack.push(v);
                }
            }
            Opcode::LdVarSuper => {
                if let Operands::U32(sym) = instr.operands {
                    let env = self.env;
                    let v = self.emit(Tag::LdVarSuper { name: Symbol(sym) }, vec![env]);
                    self.stack.push(v);
                    let fs = self.frame_state(instr.next_offset());
                    self.stack.pop();
                    let forced = self.emit(Tag::Force { has_fs: true }, vec![v, fs]);
                    self.stack.push(forced);
                }
            }
            Opcode::StVar | Opcode::StVarSuper => {
                if let Operands::U32(sym) = instr.operands {
                    let mut v = self.pop(offset)?;
                    if self.ty(&v).maybe_promise_wrapped() {
                        v = self.emit(Tag::Force { has_fs: false }, vec![v]);
                    }
                    let env = self.env;
                    let tag = if instr.opcode == Opcode::StVar {
                        Tag::StVar { name: Symbol(sym) }
                    } else {
                        Tag::StVarSuper { name: Symbol(sym) }
                    };
                    self.emit(tag, vec![v, env]);
                }
            }
            Opcode::LdFun => {
                if let Operands::U32(sym) = instr.operands {
                    let env = self.env;
                    let v = self.emit(Tag::LdFun { name: Symbol(sym) }, vec![env]);
                    // Later speculation may move the lookup into the deopt
                    // branch; give it a checkpoint to hang off. Deopt
                    // re-executes the lookup.
                    self.checkpoint(offset);
                    self.stack.push(v);
                }
            }
            Opcode::Missing => {
                if let Operands::U32(sym) = instr.operands {
                    let env = self.env;
                    let v = self.emit(Tag::Missing { name: Symbol(sym) }, vec![env]);
                    self.stack.push(v);
                }
            }

            Opcode::Force => {
                let v = self.pop(offset)?;
                if self.ty(&v).maybe_promise_wrapped() {
                    self.stack.push(v);
                    let fs = self.frame_state(offset);
                    self.stack.pop();
                    let forced = self.emit(Tag::Force { has_fs: true }, vec![v, fs]);
                    self.stack.push(forced);
                } else {
                    self.stack.push(v);
                }
            }

            Opcode::MkPromise => {
                if let Operands::U16(idx) = instr.operands {
                    self.mk_promise(idx, None, offset)?;
                }
            }
            Opcode::MkEagerPromise => {
                if let Operands::U16(idx) = instr.operands {
                    let eager = self.pop(offset)?;
                    self.mk_promise(idx, Some(eager), offset)?;
                }
            }

            Opcode::MkClosure => {
                if let Operands::U16(f) = instr.operands {
                    let fun = FunId(f as u32);
                    let env = self.env;
                    let v = self.emit(Tag::MkFunCls { fun }, vec![env]);
                    self.stack.push(v);
                    // Inner closures are compiled in the same driver step so
                    // the inliner finds their bodies
                    self.requests.push(CompileRequest { fun, ctx: Context::minimal() });
                }
            }

            Opcode::Call | Opcode::NamedCall => {
                if let Operands::U16(site_idx) = instr.operands {
                    let site = bcode.call_site(site_idx).clone();
                    self.translate_call(offset, &site)?;
                }
            }
            Opcode::CallBuiltin => {
                if let Operands::U16x2(b, nargs) = instr.operands {
                    let builtin = Builtin::from_u16(b)
                        .ok_or(LiftError::MalformedCode { offset })?;
                    let args = self.pop_n(nargs as usize, offset)?;
                    let v = self.emit_builtin_call(builtin, args);
                    self.stack.push(v);
                }
            }

            // ===== Binary / unary operations =====
            // A checkpoint in front of each dispatch-capable operation lets
            // the speculative passes guard it; unused ones are swept later
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::IDiv
            | Opcode::Mod | Opcode::Pow | Opcode::Lt | Opcode::Lte | Opcode::Gt
            | Opcode::Gte | Opcode::Eq | Opcode::Neq | Opcode::LAnd | Opcode::LOr
            | Opcode::Colon => {
                self.checkpoint(offset);
                let rhs = self.pop(offset)?;
                let lhs = self.pop(offset)?;
                let env = self.env;
                let tag = binop_tag(instr.opcode);
                let v = self.emit(tag, vec![lhs, rhs, env]);
                self.refresh(v);
                self.stack.push(v);
            }
            Opcode::Not | Opcode::UPlus | Opcode::UMinus => {
                self.checkpoint(offset);
                let operand = self.pop(offset)?;
                let env = self.env;
                let tag = match instr.opcode {
                    Opcode::Not => Tag::Not,
                    Opcode::UPlus => Tag::Plus,
                    _ => Tag::Minus,
                };
                let v = self.emit(tag, vec![operand, env]);
                self.refresh(v);
                self.stack.push(v);
            }

            // ===== Vectors =====
            Opcode::Extract1 | Opcode::Extract2 => {
                self.checkpoint(offset);
                let idx = self.pop(offset)?;
                let vec = self.pop(offset)?;
                let env = self.env;
                let tag = if instr.opcode == Opcode::Extract1 { Tag::Extract1 } else { Tag::Extract2 };
                let v = self.emit(tag, vec![vec, idx, env]);
                self.stack.push(v);
            }
            Opcode::Subassign1 | Opcode::Subassign2 => {
                self.checkpoint(offset);
                let val = self.pop(offset)?;
                let idx = self.pop(offset)?;
                let vec = self.pop(offset)?;
                let env = self.env;
                let tag =
                    if instr.opcode == Opcode::Subassign1 { Tag::Subassign1 } else { Tag::Subassign2 };
                let v = self.emit(tag, vec![vec, idx, val, env]);
                self.stack.push(v);
            }
            Opcode::Length => {
                let v = self.pop(offset)?;
                let out = self.emit(Tag::Length, vec![v]);
                self.stack.push(out);
            }
            Opcode::ForSeqSize => {
                let seq = *self.stack.last().ok_or(LiftError::StackUnderflow { offset })?;
                let out = self.emit(Tag::ForSeqSize, vec![seq]);
                self.stack.push(out);
            }

            // ===== Tests =====
            Opcode::Is => {
                if let Operands::U8(k) = instr.operands {
                    let kind =
                        SexpKind::from_u8(k).ok_or(LiftError::MalformedCode { offset })?;
                    let v = self.pop(offset)?;
                    let out = self.emit(Tag::IsKind { kind }, vec![v]);
                    self.stack.push(out);
                }
            }
            Opcode::Identical => {
                let b = self.pop(offset)?;
                let a = self.pop(offset)?;
                let out = self.emit(Tag::Identical, vec![a, b]);
                self.stack.push(out);
            }
            Opcode::AsLogical => {
                let v = self.pop(offset)?;
                let out = self.emit(Tag::AsLogical, vec![v]);
                self.stack.push(out);
            }
            Opcode::ChkMissing => {
                let v = self.pop(offset)?;
                let out = self.emit(Tag::ChkMissing, vec![v]);
                self.stack.push(out);
            }

            Opcode::Visible => {
                self.emit(Tag::Visible, vec![]);
            }
            Opcode::Invisible => {
                self.emit(Tag::Invisible, vec![]);
            }

            // ===== Feedback =====
            Opcode::RecordTest => {
                if let Operands::U16(slot) = instr.operands {
                    if let Some(FeedbackSlot::Test(t)) = bcode.feedback.get(slot as usize) {
                        self.pending_test = Some(*t);
                    }
                }
            }
            Opcode::RecordType => {
                if let Operands::U16(slot) = instr.operands {
                    if let Some(FeedbackSlot::Type(t)) = bcode.feedback.get(slot as usize) {
                        let obs: ObservedType = t.clone();
                        if let Some(Value::Instr(top)) = self.stack.last().copied() {
                            self.code.instr_mut(top).type_feedback = Some(obs);
                        }
                    }
                }
            }
            Opcode::RecordCall => {
                if let Operands::U16(slot) = instr.operands {
                    if let Some(FeedbackSlot::Call(c)) = bcode.feedback.get(slot as usize) {
                        self.pending_callee = c.monomorphic();
                    }
                }
            }

            // ===== Control flow =====
            Opcode::Br => {
                let target = instr.jump_target().ok_or(LiftError::MalformedCode { offset })?;
                let bi = *block_of.get(&target).ok_or(LiftError::MalformedCode { offset })?;
                let stack = std::mem::take(&mut self.stack);
                let from = self.cur;
                self.code.bb_mut(from).next0 = Some(entries[bi].bb);
                deliver(self.code, &mut entries[bi], from, stack)
                    .map_err(|_| LiftError::StackDepthMismatch { offset: target })?;
                return Ok(true);
            }
            Opcode::BrTrue | Opcode::BrFalse => {
                return self.translate_branch(instr, entries, block_of);
            }
            Opcode::Ret => {
                let v = self.pop(offset)?;
                self.emit(Tag::Return, vec![v]);
                self.stack.clear();
                return Ok(true);
            }
            Opcode::NonLocalRet => {
                let v = self.pop(offset)?;
                if self.in_promise {
                    let env = self.env;
                    self.emit(Tag::NonLocalReturn, vec![v, env]);
                } else {
                    self.emit(Tag::Return, vec![v]);
                }
                self.stack.clear();
                return Ok(true);
            }

            // Lowered-only opcodes never appear in front-end input
            Opcode::MkEnv | Opcode::SetEnv | Opcode::GetEnv | Opcode::LdLoc | Opcode::StLoc
            | Opcode::LdArg | Opcode::Deopt => {
                return Err(LiftError::UnsupportedOpcode { opcode: instr.opcode, offset });
            }
        }
        Ok(false)
    }

    fn pop_n(&mut self, n: usize, offset: usize) -> Result<Vec<Value>, LiftError> {
        if self.stack.len() < n {
            return Err(LiftError::StackUnderflow { offset });
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn refresh(&mut self, v: Value) {
        if let Value::Instr(id) = v {
            self.code.update_type_and_effects(id);
        }
    }

    /// Force arguments that may still be lazy (builtins evaluate eagerly).
    fn force_all(&mut self, args: Vec<Value>) -> Vec<Value> {
        args.into_iter()
            .map(|a| {
                if self.ty(&a).maybe_promise_wrapped() {
                    let f = self.emit(Tag::Force { has_fs: false }, vec![a]);
                    self.refresh(f);
                    f
                } else {
                    a
                }
            })
            .collect()
    }

    fn emit_builtin_call(&mut self, builtin: Builtin, args: Vec<Value>) -> Value {
        let nargs = args.len();
        let forced = self.force_all(args);
        if builtin.is_pure() {
            self.emit(Tag::CallSafeBuiltin { builtin, nargs }, forced)
        } else {
            let mut full = forced;
            full.push(self.env);
            self.emit(Tag::CallBuiltin { builtin, nargs }, full)
        }
    }

    /// Compile a promise child; splice it inline when it is pure.
    fn mk_promise(&mut self, idx: u16, eager: Option<Value>, _offset: usize) -> Result<(), LiftError> {
        let pcode = lift_promise_code(
            self.functions,
            self.pool,
            self.promises,
            self.fun,
            idx,
            self.requests,
        )?;
        let bc_ref = CodeRef { fun: self.fun, which: WhichCode::Promise(idx) };

        let eager = match eager {
            Some(v) => Some(v),
            None if query::pure_except_deopt(&pcode) => Some(self.splice_inline(&pcode)),
            None => None,
        };

        let prom = self.promises.create(bc_ref, pcode);
        let env = self.env;
        let v = self.emit(Tag::MkArg { prom }, vec![eager.unwrap_or(Value::Missing), env]);
        self.stack.push(v);
        Ok(())
    }

    /// Clone a pure promise body into the current position and return its
    /// result value.
    fn splice_inline(&mut self, pcode: &Code) -> Value {
        let map = self.code.clone_from(pcode);

        // The promise's environment placeholder becomes the current one
        let cloned: Vec<InstrId> = map.instrs.values().copied().collect();
        for id in cloned {
            if matches!(self.code.instr(id).tag, Tag::LdFunctionEnv) {
                self.code.replace_uses_with(id, self.env);
                self.code.remove_instr(id);
            }
        }

        let cont = self.code.new_bb();
        let result = self.code.inline_returns(map.entry, cont);
        self.code.bb_mut(self.cur).next0 = Some(map.entry);
        self.cur = cont;
        result
    }

    /// Lower a call site, speculating on recorded callees.
    fn translate_call(&mut self, offset: usize, site: &CallSite) -> Result<(), LiftError> {
        let nargs = site.nargs as usize;
        let hint = self.pending_callee.take();

        // Speculative path: guard the callee's identity, then call directly
        if let Some(target) = hint {
            if let Some(done) = self.try_speculative_call(offset, site, target)? {
                self.stack.push(done);
                return Ok(());
            }
        }

        let fs = self.frame_state(offset);
        let args = self.pop_n(nargs, offset)?;
        let callee = self.pop(offset)?;
        let env = self.env;

        let mut full = vec![callee];
        full.extend(args);
        full.push(env);
        full.push(fs);
        let tag = if site.has_names() {
            Tag::NamedCall { names: site.names.clone(), has_fs: true }
        } else {
            Tag::Call { nargs, has_fs: true }
        };
        let v = self.emit(tag, full);
        self.stack.push(v);
        Ok(())
    }

    /// Attempt a guarded direct call; None when speculation does not apply.
    fn try_speculative_call(
        &mut self,
        offset: usize,
        site: &CallSite,
        target: ObservedCallee,
    ) -> Result<Option<Value>, LiftError> {
        let nargs = site.nargs as usize;
        if self.stack.len() < nargs + 1 {
            return Err(LiftError::StackUnderflow { offset });
        }
        let callee = self.stack[self.stack.len() - nargs - 1];

        // For a closure target, the call must be statically matchable
        let matched = match target {
            ObservedCallee::Closure(f) => {
                let formals = &self.functions[f.0 as usize].formals;
                if formals.has_dots() || self.functions[f.0 as usize].unoptimizable {
                    return Ok(None);
                }
                let args = &self.stack[self.stack.len() - nargs..];
                match crate::frontend::args::match_call_args(formals, args, &site.names) {
                    Some(m) => Some(m),
                    None => return Ok(None),
                }
            }
            ObservedCallee::Builtin(_) => None,
        };

        let cp = self.checkpoint(offset);
        let expected_value = match target {
            ObservedCallee::Closure(f) => BcValue::Closure(f),
            ObservedCallee::Builtin(b) => BcValue::Builtin(b),
        };
        let idx = self.pool.insert(expected_value);
        let expected = self.load_const(idx);
        let guard = self.emit(Tag::Identical, vec![callee, expected]);
        self.emit(
            Tag::Assume { not: false, reason: DeoptReason::CalleeChanged },
            vec![guard, cp],
        );

        let fs = self.frame_state(offset);
        let args = self.pop_n(nargs, offset)?;
        self.pop(offset)?; // callee, now guarded

        match target {
            ObservedCallee::Builtin(b) => Ok(Some(self.emit_builtin_call(b, args))),
            ObservedCallee::Closure(f) => {
                let matched = matched.unwrap_or_default();
                let mut ctx = Context::minimal();
                ctx.flags |= Assumptions::STATICALLY_ARG_MATCHED
                    | Assumptions::NOT_TOO_FEW_ARGUMENTS
                    | Assumptions::NO_EXPLICITLY_MISSING_ARGS;
                let mut missing = 0u8;
                let mut call_args = Vec::with_capacity(matched.len());
                for (i, m) in matched.iter().enumerate() {
                    match m {
                        crate::frontend::args::MatchedArg::Val(v) => {
                            let ty = self.ty(v);
                            let mut a = ArgAssumptions::empty();
                            if !ty.maybe_lazy() {
                                a |= ArgAssumptions::EAGER;
                            }
                            if !ty.maybe_obj() {
                                a |= ArgAssumptions::NOT_OBJ;
                            }
                            ctx.set_arg(i, a);
                            call_args.push(*v);
                        }
                        crate::frontend::args::MatchedArg::Missing => {
                            missing = missing.saturating_add(1);
                            call_args.push(Value::Missing);
                        }
                        crate::frontend::args::MatchedArg::Dots(_) => return Ok(None),
                    }
                }
                ctx.missing = missing;
                if missing > 0 {
                    ctx.flags -= Assumptions::NO_EXPLICITLY_MISSING_ARGS;
                }

                self.requests.push(CompileRequest { fun: f, ctx });

                let n = call_args.len();
                let mut full = call_args;
                full.push(self.env);
                full.push(fs);
                Ok(Some(self.emit(
                    Tag::StaticCall { fun: f, ctx, nargs: n, has_fs: true },
                    full,
                )))
            }
        }
    }

    /// Lower a conditional branch, speculating on one-sided test feedback.
    fn translate_branch(
        &mut self,
        instr: &DecodedInstr,
        entries: &mut [BlockEntry],
        block_of: &FxHashMap<usize, usize>,
    ) -> Result<bool, LiftError> {
        let offset = instr.offset;
        let target = instr.jump_target().ok_or(LiftError::MalformedCode { offset })?;
        let target_bi = *block_of.get(&target).ok_or(LiftError::MalformedCode { offset })?;
        let fall = instr.next_offset();
        let fall_bi = *block_of.get(&fall).ok_or(LiftError::MalformedCode { offset })?;

        let feedback = self.pending_test.take();
        let cond_raw = self.pop(offset)?;

        // One-sided feedback: straighten the branch and deopt on the cold side
        if let Some(observed_true) = feedback.and_then(|t| t.only_one_branch()) {
            let test = self.as_test(cond_raw);
            // Deopt re-executes the branch, which expects its condition back
            // on the stack
            self.stack.push(cond_raw);
            let cp = self.checkpoint(offset);
            self.stack.pop();
            // checkpoint() moved us to the surviving branch; re-emit there
            self.emit(
                Tag::Assume { not: !observed_true, reason: DeoptReason::DeadBranchReached },
                vec![test, cp],
            );
            // Explain the deopt on the cold side
            if let Value::Instr(cp_id) = cp {
                let deopt_bb = self.code.bb(self.code.instr(cp_id).bb).next1;
                if let Some(deopt_bb) = deopt_bb {
                    let reason = self.code.insert_at(
                        deopt_bb,
                        0,
                        Tag::RecordDeoptReason { reason: DeoptReason::DeadBranchReached },
                        vec![cond_raw],
                    );
                    let _ = reason;
                }
            }

            // BrTrue jumps when the condition is true
            let hot_bi = match (instr.opcode, observed_true) {
                (Opcode::BrTrue, true) | (Opcode::BrFalse, false) => target_bi,
                _ => fall_bi,
            };
            let stack = std::mem::take(&mut self.stack);
            let from = self.cur;
            self.code.bb_mut(from).next0 = Some(entries[hot_bi].bb);
            deliver(self.code, &mut entries[hot_bi], from, stack)
                .map_err(|_| LiftError::StackDepthMismatch { offset })?;
            return Ok(true);
        }

        let test = self.as_test(cond_raw);
        // Branch: next0 is taken when the test is true
        let (on_true, on_false) = match instr.opcode {
            Opcode::BrTrue => (target_bi, fall_bi),
            _ => (fall_bi, target_bi),
        };
        self.emit(Tag::Branch, vec![test]);
        let from = self.cur;
        self.code.bb_mut(from).next0 = Some(entries[on_true].bb);
        self.code.bb_mut(from).next1 = Some(entries[on_false].bb);
        let stack = std::mem::take(&mut self.stack);
        deliver(self.code, &mut entries[on_true], from, stack.clone())
            .map_err(|_| LiftError::StackDepthMismatch { offset })?;
        deliver(self.code, &mut entries[on_false], from, stack)
            .map_err(|_| LiftError::StackDepthMismatch { offset })?;
        Ok(true)
    }
}

/// Deliver an incoming stack to a block, seeding or extending its phis.
fn deliver(
    code: &mut Code,
    entry: &mut BlockEntry,
    from: BBId,
    stack: Vec<Value>,
) -> Result<(), ()> {
    match &entry.stack {
        None => {
            if entry.is_merge {
                // Each slot becomes a phi seeded with this edge
                let mut phi_stack = Vec::with_capacity(stack.len());
                for v in &stack {
                    let phi = code.insert_at(
                        entry.bb,
                        entry.phis.len(),
                        Tag::Phi { inputs: vec![from] },
                        vec![*v],
                    );
                    code.update_type_and_effects(phi);
                    entry.phis.push(phi);
                    phi_stack.push(Value::Instr(phi));
                }
                entry.stack = Some(phi_stack);
            } else {
                entry.stack = Some(stack);
            }
            Ok(())
        }
        Some(existing) => {
            if existing.len() != stack.len() {
                return Err(());
            }
            if entry.is_merge {
                for (phi, v) in entry.phis.clone().into_iter().zip(stack) {
                    if let Tag::Phi { inputs } = &mut code.instr_mut(phi).tag {
                        inputs.push(from);
                    }
                    code.instr_mut(phi).args.push(v);
                    code.update_type_and_effects(phi);
                }
                Ok(())
            } else {
                // A second edge into a non-merge block: the prescan was wrong
                Err(())
            }
        }
    }
}

/// Offsets that start a basic block.
fn block_starts(instrs: &[DecodedInstr]) -> rustc_hash::FxHashSet<usize> {
    let mut starts = rustc_hash::FxHashSet::default();
    if let Some(first) = instrs.first() {
        starts.insert(first.offset);
    }
    for instr in instrs {
        match instr.opcode {
            Opcode::Br => {
                if let Some(t) = instr.jump_target() {
                    starts.insert(t);
                }
                starts.insert(instr.next_offset());
            }
            Opcode::BrTrue | Opcode::BrFalse => {
                if let Some(t) = instr.jump_target() {
                    starts.insert(t);
                }
                starts.insert(instr.next_offset());
            }
            Opcode::Ret | Opcode::NonLocalRet | Opcode::Deopt => {
                starts.insert(instr.next_offset());
            }
            _ => {}
        }
    }
    starts.retain(|o| instrs.iter().any(|i| i.offset == *o));
    starts
}

/// Incoming edge count per block, for merge detection.
fn incoming_edges(
    instrs: &[DecodedInstr],
    block_of: &FxHashMap<usize, usize>,
    sorted: &[usize],
) -> Vec<usize> {
    let mut incoming = vec![0usize; sorted.len()];
    // The prologue edge into the first block
    if !incoming.is_empty() {
        incoming[0] += 1;
    }
    for instr in instrs {
        match instr.opcode {
            Opcode::Br => {
                if let Some(bi) = instr.jump_target().and_then(|t| block_of.get(&t)) {
                    incoming[*bi] += 1;
                }
            }
            Opcode::BrTrue | Opcode::BrFalse => {
                if let Some(bi) = instr.jump_target().and_then(|t| block_of.get(&t)) {
                    incoming[*bi] += 1;
                }
                if let Some(bi) = block_of.get(&instr.next_offset()) {
                    incoming[*bi] += 1;
                }
            }
            Opcode::Ret | Opcode::NonLocalRet | Opcode::Deopt => {}
            _ => {
                // Fallthrough into a block boundary
                if let Some(bi) = block_of.get(&instr.next_offset()) {
                    incoming[*bi] += 1;
                }
            }
        }
    }
    incoming
}

fn binop_tag(op: Opcode) -> Tag {
    match op {
        Opcode::Add => Tag::Add,
        Opcode::Sub => Tag::Sub,
        Opcode::Mul => Tag::Mul,
        Opcode::Div => Tag::Div,
        Opcode::IDiv => Tag::IDiv,
        Opcode::Mod => Tag::Mod,
        Opcode::Pow => Tag::Pow,
        Opcode::Lt => Tag::Lt,
        Opcode::Lte => Tag::Lte,
        Opcode::Gt => Tag::Gt,
        Opcode::Gte => Tag::Gte,
        Opcode::Eq => Tag::Eq,
        Opcode::Neq => Tag::Neq,
        Opcode::LAnd => Tag::LAnd,
        Opcode::LOr => Tag::LOr,
        _ => Tag::Colon,
    }
}

/// Type of a pooled constant.
fn const_type(v: &BcValue) -> PirType {
    let mut t = PirType::from_sexp(v.sexp_kind()).not_object().no_attribs();
    if v.is_scalar() {
        t = t.scalar();
    }
    if !v.any_na() {
        t = t.not_na();
    }
    t
}
