//! Context refinement for static calls.
//!
//! As other passes sharpen argument types, a static call may satisfy more
//! assumptions than the version it currently targets. Record the sharper
//! context on the call and ask the driver for a matching version; the
//! dispatch table picks the best compiled one at install time.

use super::match_call_args::static_call_ctx;
use super::{Pass, PassCtx};
use crate::frontend::CompileRequest;
use crate::ir::tag::Tag;
use crate::ir::value::InstrId;
use crate::ir::version::ClosureVersion;

pub struct OptimizeContexts;

impl Pass for OptimizeContexts {
    fn name(&self) -> &'static str {
        "optimize-contexts"
    }

    fn run(&self, version: &mut ClosureVersion, ctx: &mut PassCtx) -> bool {
        let code = &mut version.code;
        let mut sharpened: Vec<(InstrId, tarn_bytecode::Context)> = Vec::new();

        crate::visitor::Visitor::run(code, |bb| {
            for id in &code.bb(bb).instrs {
                let instr = code.instr(*id);
                let Tag::StaticCall { ctx: call_ctx, .. } = &instr.tag else { continue };
                let inferred = static_call_ctx(code, instr.call_args());
                let merged = call_ctx.union(&inferred);
                if merged != *call_ctx {
                    sharpened.push((*id, merged));
                }
            }
        });

        let changed = !sharpened.is_empty();
        for (id, merged) in sharpened {
            if let Tag::StaticCall { fun, ctx: call_ctx, .. } = &mut code.instr_mut(id).tag {
                *call_ctx = merged;
                ctx.requests.push(CompileRequest { fun: *fun, ctx: merged });
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::Builder;
    use crate::ir::ty::PirType;
    use tarn_bytecode::context::Context;
    use tarn_bytecode::module::{Formals, FunId};

    #[test]
    fn test_static_call_context_sharpens() {
        let module = crate::ir::module::Module::new();
        let functions = vec![tarn_bytecode::BcFunction::default()];
        let mut pool = tarn_bytecode::ConstPool::new();
        let config = crate::config::CompilerConfig::default();
        let host = crate::host::NativeHost;
        let mut requests = Vec::new();

        let mut v = ClosureVersion::new(FunId(1), Context::minimal());
        let mut b = Builder::function(&mut v.code, &Formals::default(), &Context::minimal());
        let env = b.env;
        let x = b.add(Tag::LdArg { index: 0 }, vec![]);
        b.code.instr_mut(x.as_instr().unwrap()).ty =
            PirType::int().scalar().not_object().no_attribs();
        let call = b.add(
            Tag::StaticCall {
                fun: FunId(0),
                ctx: Context::minimal(),
                nargs: 1,
                has_fs: false,
            },
            vec![x, env],
        );
        b.add(Tag::Return, vec![call]);

        let mut pctx = PassCtx {
            module: &module,
            functions: &functions,
            pool: &mut pool,
            host: &host,
            config: &config,
            requests: &mut requests,
        };
        assert!(OptimizeContexts.run(&mut v, &mut pctx));
        assert_eq!(pctx.requests.len(), 1);
        assert!(pctx.requests[0].ctx.is_eager(0));
        assert!(pctx.requests[0].ctx.is_simple_int(0));

        // Idempotent on the second run
        assert!(!OptimizeContexts.run(&mut v, &mut pctx));
    }
}
