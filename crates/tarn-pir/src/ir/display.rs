//! Pretty-printing for PIR.
//!
//! Dump format, one instruction per line:
//! `%7: int$' = add %3 %4 elided`

use std::fmt;

use super::code::Code;
use super::instr::Instr;
use super::tag::Tag;
use super::value::InstrId;
use super::version::ClosureVersion;
use crate::visitor::BreadthFirstVisitor;

struct InstrLine<'a> {
    id: InstrId,
    instr: &'a Instr,
}

impl fmt::Display for InstrLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = self.instr;
        if i.produces_result() {
            write!(f, "%{}: {} = {}", self.id.0, i.ty, i.tag.name())?;
        } else {
            write!(f, "{}", i.tag.name())?;
        }
        match &i.tag {
            Tag::LdConst { idx } => write!(f, " @{}", idx.0)?,
            Tag::LdArg { index } => write!(f, " {}", index)?,
            Tag::LdVar { name }
            | Tag::LdVarSuper { name }
            | Tag::LdFun { name }
            | Tag::StVar { name }
            | Tag::StVarSuper { name }
            | Tag::Missing { name } => write!(f, " {}", name)?,
            Tag::MkEnv { names, stub } => {
                if *stub {
                    write!(f, " (stub)")?;
                }
                write!(f, " [{} bindings]", names.len())?;
            }
            Tag::MkArg { prom } => write!(f, " prom({})", prom.0)?,
            Tag::MkFunCls { fun } => write!(f, " fun({})", fun.0)?,
            Tag::StaticCall { fun, ctx, .. } => write!(f, " fun({}) {}", fun.0, ctx)?,
            Tag::CallBuiltin { builtin, .. } | Tag::CallSafeBuiltin { builtin, .. } => {
                write!(f, " {}", builtin.name())?
            }
            Tag::Assume { not, .. } => {
                if *not {
                    write!(f, " !")?;
                }
            }
            Tag::FrameState { pc, in_promise, .. } => {
                write!(f, " pc={}{}", pc, if *in_promise { " (prom)" } else { "" })?
            }
            Tag::IsKind { kind } => write!(f, " {:?}", kind)?,
            Tag::TypeTest { test } => write!(f, " {:?}", test)?,
            _ => {}
        }
        for arg in &i.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut result = Ok(());
        BreadthFirstVisitor::run(self, |bb| {
            if result.is_err() {
                return;
            }
            result = (|| {
                let block = self.bb(bb);
                write!(f, "  {}", bb)?;
                match (block.next0, block.next1) {
                    (Some(a), Some(b)) => writeln!(f, " -> {} | {}", a, b)?,
                    (Some(a), None) => writeln!(f, " -> {}", a)?,
                    _ => writeln!(f)?,
                }
                for id in &block.instrs {
                    writeln!(f, "    {}", InstrLine { id: *id, instr: self.instr(*id) })?;
                }
                Ok(())
            })();
        });
        result
    }
}

impl fmt::Display for ClosureVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "version of fun({}) under {} {{", self.fun.0, self.ctx)?;
        write!(f, "{}", self.code)?;
        for id in self.promise_ids() {
            if let Some(p) = self.promise(id) {
                writeln!(f, "  prom {}:", id.0)?;
                write!(f, "{}", p.code)?;
            }
        }
        writeln!(f, "}}")
    }
}
