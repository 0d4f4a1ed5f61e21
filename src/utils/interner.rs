//! Global String Interner
//!
//! Maps define names and values to integer symbols so that define sets can be
//! compared and hashed without touching string data.

use std::sync::LazyLock;

use lasso::{Spur, ThreadedRodeo};

static INTERNER: LazyLock<ThreadedRodeo> = LazyLock::new(ThreadedRodeo::new);

/// Compact integer identifier for an interned string.
pub type Symbol = Spur;

/// Interns a string, returning the existing symbol when already present.
#[inline]
pub fn intern(s: &str) -> Symbol {
    INTERNER.get_or_intern(s)
}

/// Looks up a symbol without allocating.
#[inline]
pub fn get(s: &str) -> Option<Symbol> {
    INTERNER.get(s)
}

/// Resolves a symbol back into its string.
#[inline]
pub fn resolve(sym: Symbol) -> &'static str {
    INTERNER.resolve(&sym)
}

/// Interns the define names generated by program parameters so the hot path
/// only performs lookups.
pub fn preload_common_defines() {
    let common = [
        "USE_MAP",
        "USE_ALPHA_TEST",
        "USE_VERTEX_COLORS",
        "USE_TRANSMISSION",
        "USE_SHADOWMAP",
        "SHADOWMAP_TYPE_PCF",
        "SHADOWMAP_TYPE_VSM",
        "DOUBLE_SIDED",
        "FLIP_SIDED",
        "PREMULTIPLIED_ALPHA",
        "TONE_MAPPING",
        "1",
    ];

    for name in common {
        intern(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_and_resolve() {
        let s1 = intern("hello");
        let s2 = intern("hello");
        let s3 = intern("world");

        assert_eq!(s1, s2);
        assert_ne!(s1, s3);
        assert_eq!(resolve(s1), "hello");
        assert_eq!(resolve(s3), "world");
    }

    #[test]
    fn get_does_not_intern() {
        let _ = intern("existing");

        assert!(get("existing").is_some());
        assert!(get("never_interned_symbol").is_none());
    }
}
