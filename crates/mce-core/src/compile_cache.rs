//! Process-wide compiled-code cache (C2).
//!
//! Keyed by a SHA-256 digest of `(source_text, artifact_id, mode)` so that
//! re-evaluating an unchanged artifact body never recompiles it. Eviction is
//! LRU; capacity defaults to 10,000 entries and is overridable via the
//! `MCE_COMPILE_CACHE_SIZE` environment variable, following the same
//! env-tunable-singleton convention the original bytecode cache used.
//!
//! Generic over the stored code-object type so it can be unit-tested without
//! a live RustPython interpreter; [`PyVm`](crate::vm::PyVm) instantiates it
//! with `rustpython_vm::PyRef<rustpython_vm::builtins::PyCode>`.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};

const DEFAULT_CAPACITY: usize = 10_000;
const SIZE_ENV_VAR: &str = "MCE_COMPILE_CACHE_SIZE";

/// Compilation mode, mirrored on Python's own `exec`/`eval` distinction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileMode {
    Exec,
    Eval,
}

impl CompileMode {
    fn tag(self) -> u8 {
        match self {
            CompileMode::Exec => 0,
            CompileMode::Eval => 1,
        }
    }
}

pub struct CompileCache<C> {
    inner: Mutex<LruCache<[u8; 32], C>>,
}

impl<C: Clone> CompileCache<C> {
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Sized from `MCE_COMPILE_CACHE_SIZE`, or the default capacity if
    /// unset/unparseable.
    pub fn from_env() -> Self {
        let capacity = std::env::var(SIZE_ENV_VAR)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CAPACITY);
        Self::with_capacity(capacity)
    }

    fn key(source: &str, artifact_id: &str, mode: CompileMode) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(artifact_id.as_bytes());
        hasher.update([mode.tag()]);
        hasher.finalize().into()
    }

    /// Returns the cached code object for `(source, artifact_id, mode)`, or
    /// compiles it with `compile_fn`, caches, and returns the result.
    pub fn get_or_compile<E>(
        &self,
        source: &str,
        artifact_id: &str,
        mode: CompileMode,
        compile_fn: impl FnOnce() -> Result<C, E>,
    ) -> Result<C, E> {
        let key = Self::key(source, artifact_id, mode);
        {
            let mut guard = self.inner.lock().expect("compile cache mutex poisoned");
            if let Some(code) = guard.get(&key) {
                return Ok(code.clone());
            }
        }
        let code = compile_fn()?;
        let mut guard = self.inner.lock().expect("compile cache mutex poisoned");
        guard.put(key, code.clone());
        Ok(code)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("compile cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().expect("compile cache mutex poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_source_and_id_hits_cache() {
        let cache: CompileCache<u32> = CompileCache::with_capacity(8);
        let mut calls = 0;
        cache
            .get_or_compile::<()>("x = 1", "a", CompileMode::Exec, || {
                calls += 1;
                Ok(1)
            })
            .unwrap();
        cache
            .get_or_compile::<()>("x = 1", "a", CompileMode::Exec, || {
                calls += 1;
                Ok(1)
            })
            .unwrap();
        assert_eq!(calls, 1);
    }

    #[test]
    fn different_artifact_id_misses_cache() {
        let cache: CompileCache<u32> = CompileCache::with_capacity(8);
        let mut calls = 0;
        cache
            .get_or_compile::<()>("x = 1", "a", CompileMode::Exec, || {
                calls += 1;
                Ok(1)
            })
            .unwrap();
        cache
            .get_or_compile::<()>("x = 1", "b", CompileMode::Exec, || {
                calls += 1;
                Ok(2)
            })
            .unwrap();
        assert_eq!(calls, 2);
    }

    #[test]
    fn exec_and_eval_modes_are_distinct_keys() {
        let cache: CompileCache<u32> = CompileCache::with_capacity(8);
        let mut calls = 0;
        cache
            .get_or_compile::<()>("x", "a", CompileMode::Exec, || {
                calls += 1;
                Ok(1)
            })
            .unwrap();
        cache
            .get_or_compile::<()>("x", "a", CompileMode::Eval, || {
                calls += 1;
                Ok(1)
            })
            .unwrap();
        assert_eq!(calls, 2);
    }
}
