//! Back end: PIR → baseline bytecode.
//!
//! Stages: speculation lowering (assumes become branches into shared deopt
//! blocks, deopts collect their frame lists), CSSA conversion (phi inputs
//! become copies on the incoming edges), slot allocation over liveness, and
//! emission through the bytecode builder with a peephole at the end.

pub mod alloc;
pub mod cssa;
pub mod emit;
pub mod lower;

use thiserror::Error;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tarn_bytecode::module::{BcCode, ConstPool};

use crate::config::CompilerConfig;
use crate::ir::version::ClosureVersion;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LowerError {
    #[error("cannot lower instruction {0} to baseline bytecode")]
    Unsupported(&'static str),
    #[error("slot allocation ran out of local slots")]
    TooManySlots,
    #[error("emitted code failed stack balance verification in block {0}")]
    StackImbalance(u32),
    #[error("jump target resolution failed")]
    BadLabels,
}

/// Lower an optimized version to executable baseline bytecode. The version
/// itself is left untouched; lowering works on a copy.
pub fn lower(
    version: &ClosureVersion,
    pool: &mut ConstPool,
    config: &CompilerConfig,
) -> Result<BcCode, LowerError> {
    let mut code = version.code.clone();

    let mut rng = config
        .deopt_chaos
        .then(|| StdRng::seed_from_u64(config.deopt_chaos_seed));
    lower::lower_speculation(&mut code, config, &mut rng);
    cssa::convert(&mut code);
    code.gc();

    let allocation = alloc::allocate(&code)?;
    emit::emit(&code, &allocation, pool, config)
}
