//! Temporary names for a single compile call.

/// Monotonic name source threaded through one compilation.
///
/// Independent compiles each own their context, so compilation itself holds
/// no shared mutable state.
#[derive(Debug, Default)]
pub struct NamingContext {
    next: u64,
}

impl NamingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next name with the given prefix, e.g. `__stage0`, `__stage1`.
    pub fn next_name(&mut self, prefix: &str) -> String {
        let name = format!("__{prefix}{}", self.next);
        self.next += 1;
        name
    }

    pub fn next_stage_name(&mut self) -> String {
        self.next_name("stage")
    }

    /// Name derived from the content it labels; stable across processes.
    pub fn content_name(prefix: &str, content: &str) -> String {
        format!("{prefix}{:x}", md5::compute(content.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_never_repeat_within_a_context() {
        let mut naming = NamingContext::new();
        let a = naming.next_stage_name();
        let b = naming.next_stage_name();
        let c = naming.next_name("udf");
        assert_eq!(a, "__stage0");
        assert_eq!(b, "__stage1");
        assert_eq!(c, "__udf2");
    }

    #[test]
    fn content_names_are_deterministic() {
        let a = NamingContext::content_name("tt", "SELECT 1");
        let b = NamingContext::content_name("tt", "SELECT 1");
        let c = NamingContext::content_name("tt", "SELECT 2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 2 + 32);
    }
}
