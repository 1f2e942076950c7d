//! Per-instruction effect sets.
//!
//! Effects control what the optimizer may do with an instruction: effectful
//! instructions cannot be dead-code eliminated, pure ones can move across
//! effect-free spans, and several analyses widen their state when an
//! instruction can run arbitrary user code.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Effects: u16 {
        /// Reads bindings from an environment
        const READS_ENV         = 1 << 0;
        /// Writes bindings into an environment
        const WRITES_ENV        = 1 << 1;
        /// Makes an environment visible to unknown code
        const LEAKS_ENV         = 1 << 2;
        /// May run arbitrary user code (forces, calls)
        const EXECUTES_CODE     = 1 << 3;
        /// May trigger deoptimization
        const TRIGGERS_DEOPT    = 1 << 4;
        /// Changes the visibility flag
        const VISIBILITY        = 1 << 5;
        /// May emit a warning
        const WARN              = 1 << 6;
        /// May signal an error
        const ERROR             = 1 << 7;
        /// May inspect frames or environments reflectively
        const REFLECTION        = 1 << 8;
        /// Result is only valid while the guarding assumptions hold
        const DEPENDS_ON_ASSUME = 1 << 9;
    }
}

impl Effects {
    /// Everything a generic call can do.
    pub fn any_call() -> Effects {
        Effects::READS_ENV
            | Effects::WRITES_ENV
            | Effects::LEAKS_ENV
            | Effects::EXECUTES_CODE
            | Effects::VISIBILITY
            | Effects::WARN
            | Effects::ERROR
            | Effects::REFLECTION
    }

    /// Whether removing this instruction would be observable.
    pub fn observable(&self) -> bool {
        // Reading an environment is not observable by itself
        !(*self - Effects::READS_ENV - Effects::DEPENDS_ON_ASSUME).is_empty()
    }

    /// Whether the instruction can invalidate scope analysis facts about
    /// reachable environments.
    pub fn taints_env(&self) -> bool {
        self.intersects(Effects::EXECUTES_CODE | Effects::REFLECTION)
    }

    pub fn set_flags(&mut self, e: Effects) {
        *self |= e;
    }

    pub fn reset_flags(&mut self, e: Effects) {
        *self -= e;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observable() {
        assert!(!Effects::empty().observable());
        assert!(!Effects::READS_ENV.observable());
        assert!(Effects::WRITES_ENV.observable());
        assert!((Effects::READS_ENV | Effects::ERROR).observable());
    }

    #[test]
    fn test_set_reset() {
        let mut e = Effects::empty();
        e.set_flags(Effects::WARN | Effects::ERROR);
        assert!(e.contains(Effects::WARN));
        e.reset_flags(Effects::WARN);
        assert!(!e.contains(Effects::WARN));
        assert!(e.contains(Effects::ERROR));
    }

    #[test]
    fn test_taints() {
        assert!(Effects::any_call().taints_env());
        assert!(!(Effects::READS_ENV | Effects::WRITES_ENV).taints_env());
    }
}
