//! IR construction helper.
//!
//! Tracks the "current" block during lifting and guarantees the entry block
//! never gains predecessors: construction starts in a fresh body block that
//! the empty entry header jumps to.

use tarn_bytecode::context::Context;
use tarn_bytecode::module::Formals;

use super::bb::BBId;
use super::code::Code;
use super::tag::Tag;
use super::ty::PirType;
use super::value::Value;

/// Builder over one code unit.
pub struct Builder<'a> {
    pub code: &'a mut Code,
    pub current: BBId,
    /// The environment of the code being built: the function's own `MkEnv`,
    /// or the `LdFunctionEnv` placeholder inside a promise
    pub env: Value,
    /// Argument values, in formal order (function bodies only)
    pub args: Vec<Value>,
}

impl<'a> Builder<'a> {
    /// Builder for a closure body: emits one `LdArg` per formal, typed from
    /// the compilation context, and the function's own environment literal.
    pub fn function(code: &'a mut Code, formals: &Formals, ctx: &Context) -> Builder<'a> {
        let entry = code.entry;
        let body = code.new_bb();
        code.bb_mut(entry).next0 = Some(body);

        let mut args = Vec::with_capacity(formals.num_args());
        for i in 0..formals.num_args() {
            let arg = code.push(body, Tag::LdArg { index: i }, vec![]);
            code.instr_mut(arg).ty = PirType::arg_from_context(ctx, i);
            args.push(Value::Instr(arg));
        }
        let mut mkenv_args = args.clone();
        mkenv_args.push(Value::BaseEnv);
        let env = code.push(
            body,
            Tag::MkEnv { names: formals.names.clone(), stub: false },
            mkenv_args,
        );

        Builder { code, current: body, env: Value::Instr(env), args }
    }

    /// Builder for a promise body: the environment is a placeholder replaced
    /// with the caller's environment at inline time.
    pub fn promise(code: &'a mut Code) -> Builder<'a> {
        let entry = code.entry;
        let body = code.new_bb();
        code.bb_mut(entry).next0 = Some(body);
        let env = code.push(body, Tag::LdFunctionEnv, vec![]);
        Builder { code, current: body, env: Value::Instr(env), args: Vec::new() }
    }

    /// Append an instruction to the current block.
    pub fn add(&mut self, tag: Tag, args: Vec<Value>) -> Value {
        let id = self.code.push(self.current, tag, args);
        Value::Instr(id)
    }

    pub fn create_bb(&mut self) -> BBId {
        self.code.new_bb()
    }

    /// Whether the current block already ends the control flow.
    pub fn terminated(&self) -> bool {
        let bb = self.code.bb(self.current);
        if !bb.is_exit() {
            return true;
        }
        bb.last()
            .map(|last| self.code.instr(last).tag.is_exit())
            .unwrap_or(false)
    }

    /// End the current block with an unconditional edge.
    pub fn jump(&mut self, target: BBId) {
        self.code.bb_mut(self.current).next0 = Some(target);
        self.code.bb_mut(self.current).next1 = None;
    }

    /// End the current block with a two-way branch on a test value.
    pub fn branch(&mut self, cond: Value, on_true: BBId, on_false: BBId) {
        self.add(Tag::Branch, vec![cond]);
        self.code.bb_mut(self.current).next0 = Some(on_true);
        self.code.bb_mut(self.current).next1 = Some(on_false);
    }

    /// Switch emission to another block.
    pub fn seek(&mut self, bb: BBId) {
        self.current = bb;
    }
}
