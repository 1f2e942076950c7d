//! Closure inlining.
//!
//! Deliberately simple: a positional call to a statically visible closure
//! (`MkFunCls`) is replaced by a clone of the callee's compiled body. The
//! clone's lexical environment uses are rewired to the `MkFunCls`
//! environment, argument loads become the actual argument values, and
//! referenced promises are copied into the caller's pool. Loads and forces
//! left behind are repaired by the scope-resolution and force-dominance
//! passes that follow.

use rustc_hash::FxHashMap;

use super::match_call_args::{known_callee, static_call_ctx};
use super::{Pass, PassCtx};
use crate::ir::code::Code;
use crate::ir::tag::Tag;
use crate::ir::value::{InstrId, PromiseId, Value};
use crate::ir::version::ClosureVersion;
use crate::visitor::Visitor;

pub struct Inline;

/// Whether a compiled body can be transplanted: no deopt machinery that
/// would need its frames re-chained into the caller.
fn inlinable(code: &Code) -> bool {
    Visitor::check(code, |bb| {
        code.bb(bb).instrs.iter().all(|id| {
            !matches!(
                code.instr(*id).tag,
                Tag::Checkpoint
                    | Tag::Assume { .. }
                    | Tag::Deopt
                    | Tag::ScheduledDeopt { .. }
                    | Tag::FrameState { .. }
                    | Tag::NonLocalReturn
                    | Tag::LdFunctionEnv
            )
        })
    })
}

impl Pass for Inline {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool {
        let mut changed = false;
        loop {
            let Some(site) = find_site(version, ctx) else { break };
            inline_at(version, ctx, site);
            changed = true;
        }
        changed
    }
}

struct Site {
    call: InstrId,
    cls_env: Value,
    args: Vec<Value>,
    target: crate::ir::closure::ClosureId,
    target_version: crate::ir::closure::VersionIdx,
}

fn find_site(version: &ClosureVersion, ctx: &mut PassCtx) -> Option<Site> {
    let code = &version.code;
    let mut found = None;
    Visitor::check(code, |bb| {
        for id in &code.bb(bb).instrs {
            let instr = code.instr(*id);
            let Tag::Call { nargs, .. } = instr.tag else { continue };
            let Some(callee) = instr.callee() else { continue };
            let Some(fun) = known_callee(code, &callee) else { continue };
            if fun == version.fun {
                // No self-inlining
                continue;
            }
            let formals = &ctx.functions[fun.0 as usize].formals;
            if formals.has_dots() || formals.num_args() != nargs {
                continue;
            }
            let args = instr.call_args().to_vec();
            let call_ctx = static_call_ctx(code, &args);

            let Some(cls) = ctx.module.closure_for_fun(fun) else {
                ctx.requests.push(crate::frontend::CompileRequest { fun, ctx: call_ctx });
                continue;
            };
            let dispatch = &ctx.module.closure(cls).dispatch;
            let Some(vidx) = dispatch.find_compatible_version(&call_ctx) else {
                ctx.requests.push(crate::frontend::CompileRequest { fun, ctx: call_ctx });
                continue;
            };
            let Some(target) = dispatch.version(vidx) else { continue };
            if !inlinable(&target.code)
                || target.code.instr_count() > ctx.config.max_inline_size
            {
                continue;
            }

            let Value::Instr(mk) = callee.followed(code) else { continue };
            let cls_env = code.instr(mk).env().unwrap_or(Value::BaseEnv);
            found = Some(Site { call: *id, cls_env, args, target: cls, target_version: vidx });
            return false;
        }
        true
    });
    found
}

fn inline_at(version: &mut ClosureVersion, ctx: &mut PassCtx, site: Site) {
    let target =
        ctx.module.closure(site.target).dispatch.version(site.target_version).unwrap();
    let target_code = target.code.clone();

    let ClosureVersion { code, promises, .. } = version;

    let bb = code.instr(site.call).bb;
    let pos = code.bb(bb).instrs.iter().position(|i| *i == site.call).unwrap();
    let tail = code.split(bb, pos);

    let map = code.clone_from(&target_code);

    // Copy the promises the clone references into the caller's pool
    let mut prom_map: FxHashMap<PromiseId, PromiseId> = FxHashMap::default();
    let cloned: Vec<InstrId> = map.instrs.values().copied().collect();
    for id in &cloned {
        if let Tag::MkArg { prom } = code.instr(*id).tag {
            let new = *prom_map.entry(prom).or_insert_with(|| {
                let p = target.promise(prom).unwrap();
                promises.create(p.bc, p.code.clone())
            });
            if let Tag::MkArg { prom } = &mut code.instr_mut(*id).tag {
                *prom = new;
            }
        }
    }

    // The clone's lexical environment is the closure's environment; its
    // argument loads are the call's arguments
    for id in &cloned {
        let instr = code.instr_mut(*id);
        for arg in instr.args.iter_mut() {
            if *arg == Value::BaseEnv {
                *arg = site.cls_env;
            }
        }
    }
    for id in &cloned {
        if let Tag::LdArg { index } = code.instr(*id).tag {
            let replacement = site.args.get(index).copied().unwrap_or(Value::Missing);
            code.replace_uses_with(*id, replacement);
            code.remove_instr(*id);
        }
    }

    code.bb_mut(bb).next0 = Some(map.entry);
    let result = code.inline_returns(map.entry, tail);
    code.replace_uses_with(site.call, result);
    let cpos = code.bb(tail).instrs.iter().position(|i| *i == site.call).unwrap();
    code.remove_at(tail, cpos);
}
