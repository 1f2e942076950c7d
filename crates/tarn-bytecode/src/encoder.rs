//! Bytecode encoder.
//!
//! `BcBuilder` emits opcodes with their operands, manages forward-reference
//! labels for jumps, and collects the side tables into a finished `BcCode`.
//! Used by the optimizer's back end and by tests constructing baseline
//! inputs.

use crate::feedback::FeedbackSlot;
use crate::module::{BcCode, CallSite, DeoptMetadata, PoolIdx, SrcIdx};
use crate::opcode::Opcode;
use crate::symbols::Symbol;
use crate::value::{Builtin, SexpKind};

/// A jump label. Bind it with `bind` once its target is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Builder for a single `BcCode`.
#[derive(Debug, Default)]
pub struct BcBuilder {
    buffer: Vec<u8>,
    srcs: Vec<(u32, SrcIdx)>,
    call_sites: Vec<CallSite>,
    name_lists: Vec<Vec<Symbol>>,
    feedback: Vec<FeedbackSlot>,
    deopts: Vec<DeoptMetadata>,
    num_locals: u16,
    /// label → bound target offset
    labels: Vec<Option<usize>>,
    /// (patch site of the i32 operand, instruction offset, label)
    patches: Vec<(usize, usize, Label)>,
}

impl BcBuilder {
    pub fn new() -> BcBuilder {
        BcBuilder::default()
    }

    /// Current offset, i.e. the pc of the next emitted instruction.
    pub fn pc(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// Record the source index for instructions emitted from here on.
    pub fn set_src(&mut self, src: SrcIdx) {
        let pc = self.pc();
        if let Some(last) = self.srcs.last_mut() {
            if last.0 == pc {
                last.1 = src;
                return;
            }
        }
        self.srcs.push((pc, src));
    }

    // ===== Raw emission =====

    pub fn op(&mut self, opcode: Opcode) {
        debug_assert_eq!(opcode.size(), 1, "operand-carrying opcode {opcode} needs a typed emitter");
        self.buffer.push(opcode as u8);
    }

    fn op_u8(&mut self, opcode: Opcode, v: u8) {
        self.buffer.push(opcode as u8);
        self.buffer.push(v);
    }

    fn op_u16(&mut self, opcode: Opcode, v: u16) {
        self.buffer.push(opcode as u8);
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    fn op_u32(&mut self, opcode: Opcode, v: u32) {
        self.buffer.push(opcode as u8);
        self.buffer.extend_from_slice(&v.to_le_bytes());
    }

    // ===== Typed emitters =====

    pub fn push_const(&mut self, idx: PoolIdx) {
        self.op_u32(Opcode::Push, idx.0);
    }

    pub fn ld_var(&mut self, name: Symbol) {
        self.op_u32(Opcode::LdVar, name.0);
    }

    pub fn ld_var_no_force(&mut self, name: Symbol) {
        self.op_u32(Opcode::LdVarNoForce, name.0);
    }

    pub fn ld_var_super(&mut self, name: Symbol) {
        self.op_u32(Opcode::LdVarSuper, name.0);
    }

    pub fn st_var(&mut self, name: Symbol) {
        self.op_u32(Opcode::StVar, name.0);
    }

    pub fn st_var_super(&mut self, name: Symbol) {
        self.op_u32(Opcode::StVarSuper, name.0);
    }

    pub fn ld_fun(&mut self, name: Symbol) {
        self.op_u32(Opcode::LdFun, name.0);
    }

    pub fn missing(&mut self, name: Symbol) {
        self.op_u32(Opcode::Missing, name.0);
    }

    pub fn pick(&mut self, n: u16) {
        self.op_u16(Opcode::Pick, n);
    }

    pub fn ld_loc(&mut self, slot: u16) {
        self.num_locals = self.num_locals.max(slot + 1);
        self.op_u16(Opcode::LdLoc, slot);
    }

    pub fn st_loc(&mut self, slot: u16) {
        self.num_locals = self.num_locals.max(slot + 1);
        self.op_u16(Opcode::StLoc, slot);
    }

    pub fn ld_arg(&mut self, index: u16) {
        self.op_u16(Opcode::LdArg, index);
    }

    pub fn mk_promise(&mut self, prom: u16) {
        self.op_u16(Opcode::MkPromise, prom);
    }

    pub fn mk_eager_promise(&mut self, prom: u16) {
        self.op_u16(Opcode::MkEagerPromise, prom);
    }

    pub fn mk_closure(&mut self, fun: u16) {
        self.op_u16(Opcode::MkClosure, fun);
    }

    pub fn mk_env(&mut self, names: Vec<Symbol>) {
        let idx = self.name_lists.len() as u16;
        self.name_lists.push(names);
        self.op_u16(Opcode::MkEnv, idx);
    }

    pub fn call(&mut self, site: CallSite) {
        let idx = self.call_sites.len() as u16;
        let named = site.has_names();
        self.call_sites.push(site);
        self.op_u16(if named { Opcode::NamedCall } else { Opcode::Call }, idx);
    }

    pub fn call_builtin(&mut self, builtin: Builtin, nargs: u16) {
        self.buffer.push(Opcode::CallBuiltin as u8);
        self.buffer.extend_from_slice(&(builtin as u16).to_le_bytes());
        self.buffer.extend_from_slice(&nargs.to_le_bytes());
    }

    pub fn is(&mut self, kind: SexpKind) {
        self.op_u8(Opcode::Is, kind as u8);
    }

    // ===== Feedback slots =====

    pub fn record_test(&mut self, slot: FeedbackSlot) -> u16 {
        let idx = self.add_feedback(slot);
        self.op_u16(Opcode::RecordTest, idx);
        idx
    }

    pub fn record_type(&mut self, slot: FeedbackSlot) -> u16 {
        let idx = self.add_feedback(slot);
        self.op_u16(Opcode::RecordType, idx);
        idx
    }

    pub fn record_call(&mut self, slot: FeedbackSlot) -> u16 {
        let idx = self.add_feedback(slot);
        self.op_u16(Opcode::RecordCall, idx);
        idx
    }

    fn add_feedback(&mut self, slot: FeedbackSlot) -> u16 {
        let idx = self.feedback.len() as u16;
        self.feedback.push(slot);
        idx
    }

    // ===== Deopt =====

    pub fn deopt(&mut self, meta: DeoptMetadata) {
        let idx = self.deopts.len() as u16;
        self.deopts.push(meta);
        self.op_u16(Opcode::Deopt, idx);
    }

    // ===== Labels and jumps =====

    pub fn label(&mut self) -> Label {
        let l = Label(self.labels.len());
        self.labels.push(None);
        l
    }

    /// Bind a label to the current pc.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.buffer.len());
    }

    pub fn br(&mut self, label: Label) {
        self.jump(Opcode::Br, label);
    }

    pub fn br_true(&mut self, label: Label) {
        self.jump(Opcode::BrTrue, label);
    }

    pub fn br_false(&mut self, label: Label) {
        self.jump(Opcode::BrFalse, label);
    }

    fn jump(&mut self, opcode: Opcode, label: Label) {
        let instr_offset = self.buffer.len();
        self.buffer.push(opcode as u8);
        let patch_site = self.buffer.len();
        self.buffer.extend_from_slice(&0i32.to_le_bytes());
        self.patches.push((patch_site, instr_offset, label));
    }

    /// Finish the code object, resolving all jumps. Returns None if a label
    /// was never bound.
    pub fn finish(mut self) -> Option<BcCode> {
        for (patch_site, instr_offset, label) in &self.patches {
            let target = self.labels[label.0]?;
            let rel = (target as i64 - *instr_offset as i64) as i32;
            self.buffer[*patch_site..*patch_site + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Some(BcCode {
            code: self.buffer,
            srcs: self.srcs,
            call_sites: self.call_sites,
            name_lists: self.name_lists,
            feedback: self.feedback,
            deopts: self.deopts,
            num_locals: self.num_locals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{decode, Operands};

    #[test]
    fn test_emit_and_decode() {
        let mut b = BcBuilder::new();
        b.push_const(PoolIdx(3));
        b.op(Opcode::Force);
        b.op(Opcode::Ret);
        let code = b.finish().unwrap();

        let instrs = decode(&code.code).unwrap();
        assert_eq!(instrs.len(), 3);
        assert_eq!(instrs[0].operands, Operands::U32(3));
        assert_eq!(instrs[2].opcode, Opcode::Ret);
    }

    #[test]
    fn test_forward_label() {
        let mut b = BcBuilder::new();
        let end = b.label();
        b.op(Opcode::Nop);
        b.br(end);
        b.op(Opcode::Nop);
        b.bind(end);
        b.op(Opcode::Ret);
        let code = b.finish().unwrap();

        let instrs = decode(&code.code).unwrap();
        // Br is at offset 1, targets the Ret at offset 7
        assert_eq!(instrs[1].jump_target(), Some(7));
    }

    #[test]
    fn test_backward_label() {
        let mut b = BcBuilder::new();
        let top = b.label();
        b.bind(top);
        b.op(Opcode::Nop);
        b.br(top);
        let code = b.finish().unwrap();

        let instrs = decode(&code.code).unwrap();
        assert_eq!(instrs[1].jump_target(), Some(0));
    }

    #[test]
    fn test_unbound_label_fails() {
        let mut b = BcBuilder::new();
        let l = b.label();
        b.br(l);
        assert!(b.finish().is_none());
    }

    #[test]
    fn test_locals_tracked() {
        let mut b = BcBuilder::new();
        b.st_loc(4);
        b.ld_loc(4);
        let code = b.finish().unwrap();
        assert_eq!(code.num_locals, 5);
    }
}
