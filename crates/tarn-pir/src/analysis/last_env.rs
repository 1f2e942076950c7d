//! Last-environment analysis.
//!
//! The lowered bytecode has a single "current environment" slot. This
//! analysis tracks which environment value is in that slot at each point so
//! the emitter can skip redundant `SetEnv` sequences.

use super::framework::{AbstractRes, AbstractState, Analysis, FixedPoint};
use crate::ir::code::Code;
use crate::ir::value::{InstrId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LastEnv(pub Option<Value>);

impl AbstractState for LastEnv {
    fn merge(&mut self, other: &Self) -> AbstractRes {
        if self.0.is_some() && self.0 != other.0 {
            self.0 = None;
            AbstractRes::Updated
        } else {
            AbstractRes::None
        }
    }
}

pub struct LastEnvAnalysis;

impl Analysis for LastEnvAnalysis {
    type State = LastEnv;

    fn init(&self, _code: &Code) -> LastEnv {
        LastEnv(None)
    }

    fn apply(&self, state: &mut LastEnv, code: &Code, id: InstrId) {
        let instr = code.instr(id);
        if let Some(env) = instr.env() {
            if env != Value::ElidedEnv {
                state.0 = Some(env);
            }
        }
    }

    fn segment_after(&self, _code: &Code, _id: InstrId) -> bool {
        false
    }
}

pub struct LastEnvAt {
    fp: FixedPoint<LastEnvAnalysis>,
}

impl LastEnvAt {
    pub fn compute(code: &Code) -> LastEnvAt {
        LastEnvAt { fp: FixedPoint::run(LastEnvAnalysis, code) }
    }

    /// The environment already in the slot before `id`, if statically known.
    pub fn before(&self, code: &Code, id: InstrId) -> Option<Value> {
        self.fp.before(code, id).0
    }
}
