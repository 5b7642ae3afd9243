//! Explicit codec configuration, passed to the operations that need it.

/// How nonconforming cards are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verify {
    /// Parse lazily and never check conformance.
    #[default]
    Ignore,
    /// Any nonconformance is an error.
    Exception,
    /// Repair what can be repaired and log a warning for each repair.
    Fix,
    /// Repair what can be repaired without logging.
    SilentFix,
}

impl Verify {
    pub fn fixes(self) -> bool {
        matches!(self, Verify::Fix | Verify::SilentFix)
    }
}

/// How deferred payloads are brought into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Materialize {
    /// Seek and read into an owned buffer.
    #[default]
    Sequential,
    /// Map the backing file into the address space.
    Mapped,
}

/// Settings threaded through header parsing, schema lookups and file access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub verify: Verify,
    /// Match column and extension names exactly instead of ignoring case.
    pub case_sensitive_names: bool,
    /// Accept a header that reaches end-of-input without an `END` card.
    pub tolerate_missing_end: bool,
    pub materialize: Materialize,
    /// Recover unsigned integers from pseudo-unsigned `BZERO` on read.
    pub scale_unsigned: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verify: Verify::Ignore,
            case_sensitive_names: false,
            tolerate_missing_end: false,
            materialize: Materialize::Sequential,
            scale_unsigned: true,
        }
    }
}

impl Config {
    pub fn with_verify(mut self, verify: Verify) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_case_sensitive_names(mut self, yes: bool) -> Self {
        self.case_sensitive_names = yes;
        self
    }

    pub fn with_tolerate_missing_end(mut self, yes: bool) -> Self {
        self.tolerate_missing_end = yes;
        self
    }

    pub fn with_materialize(mut self, materialize: Materialize) -> Self {
        self.materialize = materialize;
        self
    }

    pub fn with_scale_unsigned(mut self, yes: bool) -> Self {
        self.scale_unsigned = yes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.verify, Verify::Ignore);
        assert!(!cfg.case_sensitive_names);
        assert!(!cfg.tolerate_missing_end);
        assert_eq!(cfg.materialize, Materialize::Sequential);
        assert!(cfg.scale_unsigned);
    }

    #[test]
    fn builder_chain() {
        let cfg = Config::default()
            .with_verify(Verify::Fix)
            .with_case_sensitive_names(true)
            .with_materialize(Materialize::Mapped);
        assert!(cfg.verify.fixes());
        assert!(cfg.case_sensitive_names);
        assert_eq!(cfg.materialize, Materialize::Mapped);
    }

    #[test]
    fn only_fix_modes_fix() {
        assert!(!Verify::Ignore.fixes());
        assert!(!Verify::Exception.fixes());
        assert!(Verify::SilentFix.fixes());
    }
}
