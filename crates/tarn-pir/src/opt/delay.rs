//! Instruction and environment sinking.
//!
//! `DelayEnv` pushes `MkEnv` down toward its first use so traces that never
//! need the environment never build it; `DelayInstr` does the same for pure
//! instructions with local uses. Nothing is ever sunk into a loop: that
//! would re-execute it per iteration.

use rustc_hash::FxHashSet;

use super::{Pass, PassCtx};
use crate::cfg::{find_loops, DominanceGraph, CFG};
use crate::ir::bb::BBId;
use crate::ir::code::Code;
use crate::ir::tag::Tag;
use crate::ir::value::InstrId;
use crate::ir::version::ClosureVersion;

fn loop_headers(code: &Code, cfg: &CFG, dom: &DominanceGraph) -> FxHashSet<BBId> {
    find_loops(code, cfg, dom).into_iter().map(|l| l.header).collect()
}

/// Try to sink one instruction toward its uses. Returns true on movement.
fn sink(code: &mut Code, id: InstrId, dom: &DominanceGraph, headers: &FxHashSet<BBId>) -> bool {
    let uses = code.uses_of(id);
    if uses.is_empty() {
        return false;
    }
    let bb = code.instr(id).bb;
    let my_pos = code.bb(bb).instrs.iter().position(|i| *i == id).unwrap();

    // All uses in the same block: move directly before the first
    if uses.iter().all(|u| code.instr(*u).bb == bb) {
        let first = uses
            .iter()
            .filter_map(|u| code.bb(bb).instrs.iter().position(|i| i == u))
            .min()
            .unwrap();
        if first > my_pos + 1 {
            code.move_instr(id, bb, first - 1);
            return true;
        }
        return false;
    }

    // All uses dominated by one successor: sink into it, unless it is a
    // loop header or the use is a phi input flowing in from our side
    let block = code.bb(bb);
    if !block.is_branch() {
        return false;
    }
    for succ in [block.next0, block.next1].into_iter().flatten() {
        if headers.contains(&succ) {
            continue;
        }
        let all_in = uses.iter().all(|u| {
            let ub = code.instr(*u).bb;
            !code.instr(*u).is_phi() && dom.dominates(succ, ub)
        });
        if all_in {
            let leading_phis = code
                .bb(succ)
                .instrs
                .iter()
                .take_while(|i| code.instr(**i).is_phi())
                .count();
            code.move_instr(id, succ, leading_phis);
            return true;
        }
    }
    false
}

pub struct DelayEnv;

impl Pass for DelayEnv {
    fn name(&self) -> &'static str {
        "delay-env"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let cfg = CFG::new(code);
        let dom = DominanceGraph::new(code, &cfg);
        let headers = loop_headers(code, &cfg, &dom);

        let mut envs: Vec<InstrId> = Vec::new();
        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                if matches!(code.instr(*id).tag, Tag::MkEnv { .. }) {
                    envs.push(*id);
                }
            }
        });

        let mut changed = false;
        for env in envs {
            changed |= sink(code, env, &dom, &headers);
        }
        changed
    }
}

pub struct DelayInstr;

impl Pass for DelayInstr {
    fn name(&self) -> &'static str {
        "delay-instr"
    }

    fn run(&self, version: &mut ClosureVersion, _ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let cfg = CFG::new(code);
        let dom = DominanceGraph::new(code, &cfg);
        let headers = loop_headers(code, &cfg, &dom);

        let mut candidates: Vec<InstrId> = Vec::new();
        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                let instr = code.instr(*id);
                if instr.effects.is_empty()
                    && instr.produces_result()
                    && !matches!(
                        instr.tag,
                        Tag::Phi { .. } | Tag::LdArg { .. } | Tag::Checkpoint | Tag::MkEnv { .. }
                            | Tag::FrameState { .. }
                    )
                {
                    candidates.push(*id);
                }
            }
        });

        let mut changed = false;
        for id in candidates {
            changed |= sink(code, id, &dom, &headers);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use crate::ir::ty::PirType;
    use crate::ir::value::Value;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::module::{Formals, FunId};
    use tarn_bytecode::Symbol;

    fn run(pass: &dyn Pass, version: &mut ClosureVersion) -> bool {
        let module = crate::ir::module::Module::new();
        let functions = Vec::new();
        let mut pool = tarn_bytecode::ConstPool::new();
        let config = crate::config::CompilerConfig::default();
        let host = crate::host::NativeHost;
        let mut requests = Vec::new();
        let mut ctx = PassCtx {
            module: &module,
            functions: &functions,
            pool: &mut pool,
            host: &host,
            config: &config,
            requests: &mut requests,
        };
        pass.run(version, &mut ctx)
    }

    #[test]
    fn test_env_sinks_into_using_branch() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let c = b.add(Tag::LdArg { index: 0 }, vec![]);
        b.code.instr_mut(c.as_instr().unwrap()).ty = PirType::test();
        let uses_env = b.create_bb();
        let no_env = b.create_bb();
        b.branch(c, uses_env, no_env);
        b.seek(uses_env);
        let ld = b.add(Tag::LdVar { name: Symbol(5) }, vec![env]);
        b.add(Tag::Return, vec![ld]);
        b.seek(no_env);
        b.add(Tag::Return, vec![Value::Nil]);

        assert!(run(&DelayEnv, &mut v));
        assert_eq!(crate::ir::verify::verify_code(&v.code), Ok(()));
        let mkenv = env.as_instr().unwrap();
        assert_eq!(v.code.instr(mkenv).bb, uses_env);
    }

    #[test]
    fn test_pure_instr_sinks_to_use() {
        let mut v = ClosureVersion::new(FunId(0), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let x = b.add(Tag::LdArg { index: 0 }, vec![]);
        b.code.instr_mut(x.as_instr().unwrap()).ty = PirType::int().scalar().not_object();
        let len = b.add(Tag::Length, vec![x]);
        b.add(Tag::Visible, vec![]);
        b.add(Tag::Visible, vec![]);
        b.add(Tag::Return, vec![len]);

        assert!(run(&DelayInstr, &mut v));
        // Length now sits directly before the return
        let bb = v.code.instr(len.as_instr().unwrap()).bb;
        let instrs = &v.code.bb(bb).instrs;
        let len_pos = instrs.iter().position(|i| Value::Instr(*i) == len).unwrap();
        assert!(matches!(v.code.instr(instrs[len_pos + 1]).tag, Tag::Return));
    }
}
