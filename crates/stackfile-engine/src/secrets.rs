//! Secret reference expansion
//!
//! String leaves containing a `ref+<scheme>://...` token are resolved by an
//! external [`Evaluator`]. The evaluator is always injected;
//! [`CachingEvaluator`] wraps one so that each distinct leaf is resolved at
//! most once per instance, and every batch of new leaves costs a single call.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stackfile_engine::{CachingEvaluator, Evaluator};
//! # fn backend() -> Arc<dyn Evaluator> { unimplemented!() }
//!
//! let evaluator = CachingEvaluator::new(backend());
//! let mut values = serde_json::Map::new();
//! values.insert("password".into(), "ref+vault://secret/db#/password".into());
//! let resolved = evaluator.eval(&values).unwrap();
//! ```

use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde_json::Value as JsonValue;
use stackfile_core::Map;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, Result};

static REF_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ref\+[a-zA-Z0-9_-]+://").expect("static regex"));

/// Resolves reference tokens inside a structure
pub trait Evaluator: Send + Sync {
    /// Return `input` with every reference token replaced by its value
    fn eval(&self, input: &Map) -> Result<Map>;
}

/// Whether any string leaf contains a secret reference
pub fn contains_refs(value: &JsonValue) -> bool {
    match value {
        JsonValue::String(s) => REF_PATTERN.is_match(s),
        JsonValue::Array(items) => items.iter().any(contains_refs),
        JsonValue::Object(map) => map.values().any(contains_refs),
        _ => false,
    }
}

/// Resolution of one leaf, shared by every caller that asked for it
type Slot = Arc<OnceCell<std::result::Result<JsonValue, String>>>;

/// Evaluator with a per-reference result cache
#[derive(Clone)]
pub struct CachingEvaluator {
    inner: Arc<dyn Evaluator>,
    cache: Arc<Mutex<HashMap<String, Slot>>>,
}

impl CachingEvaluator {
    pub fn new(inner: Arc<dyn Evaluator>) -> Self {
        Self {
            inner,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cached_len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Slot>>> {
        self.cache.lock().map_err(|_| EngineError::Secrets {
            message: "reference cache lock poisoned".to_string(),
        })
    }
}

impl std::fmt::Debug for CachingEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingEvaluator")
            .field("cached", &self.cached_len().ok())
            .finish()
    }
}

impl Evaluator for CachingEvaluator {
    fn eval(&self, input: &Map) -> Result<Map> {
        let root = JsonValue::Object(input.clone());
        let mut tokens = BTreeSet::new();
        collect_refs(&root, &mut tokens);
        if tokens.is_empty() {
            return Ok(input.clone());
        }

        // Claim the slots nobody asked for yet. The lock is released before
        // the backend runs; callers needing a claimed slot wait on it.
        let mut claimed = Map::new();
        let mut slots: HashMap<String, Slot> = HashMap::new();
        {
            let mut cache = self.lock()?;
            for token in &tokens {
                let slot = cache
                    .entry(token.clone())
                    .or_insert_with(|| {
                        claimed.insert(token.clone(), JsonValue::String(token.clone()));
                        Arc::new(OnceCell::new())
                    })
                    .clone();
                slots.insert(token.clone(), slot);
            }
        }

        if !claimed.is_empty() {
            tracing::debug!(count = claimed.len(), "evaluating secret references");
            let resolved = self.inner.eval(&claimed);
            for token in claimed.keys() {
                let value = match &resolved {
                    Ok(map) => map
                        .get(token)
                        .cloned()
                        .ok_or_else(|| format!("evaluator returned no value for {}", token)),
                    Err(e) => Err(e.to_string()),
                };
                if let Some(slot) = slots.get(token) {
                    let _ = slot.set(value);
                }
            }
        }

        let mut values = HashMap::with_capacity(slots.len());
        for (token, slot) in slots {
            let value = slot
                .wait()
                .clone()
                .map_err(|message| EngineError::Secrets { message })?;
            values.insert(token, value);
        }

        match replace_refs(root, &values) {
            JsonValue::Object(map) => Ok(map),
            _ => Ok(input.clone()),
        }
    }
}

fn collect_refs(value: &JsonValue, tokens: &mut BTreeSet<String>) {
    match value {
        JsonValue::String(s) if REF_PATTERN.is_match(s) => {
            tokens.insert(s.clone());
        }
        JsonValue::Array(items) => items.iter().for_each(|i| collect_refs(i, tokens)),
        JsonValue::Object(map) => map.values().for_each(|v| collect_refs(v, tokens)),
        _ => {}
    }
}

fn replace_refs(value: JsonValue, cache: &HashMap<String, JsonValue>) -> JsonValue {
    match value {
        JsonValue::String(s) => match cache.get(&s) {
            Some(resolved) => resolved.clone(),
            None => JsonValue::String(s),
        },
        JsonValue::Array(items) => {
            JsonValue::Array(items.into_iter().map(|i| replace_refs(i, cache)).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter()
                .map(|(k, v)| (k, replace_refs(v, cache)))
                .collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEvaluator {
        calls: AtomicUsize,
        tokens: AtomicUsize,
    }

    impl Evaluator for CountingEvaluator {
        fn eval(&self, input: &Map) -> Result<Map> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens.fetch_add(input.len(), Ordering::SeqCst);
            Ok(input
                .iter()
                .map(|(k, _)| (k.clone(), JsonValue::String(format!("resolved:{}", k))))
                .collect())
        }
    }

    fn map(value: JsonValue) -> Map {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_contains_refs() {
        assert!(contains_refs(&json!({"a": ["x", "ref+vault://p#/k"]})));
        assert!(contains_refs(&json!({"a": "prefix ref+vault://p"})));
        assert!(contains_refs(&json!({"dsn": "postgres://u:ref+vault://db#/pw@host"})));
        assert!(!contains_refs(&json!({"a": "ref+://no-scheme"})));
        assert!(!contains_refs(&json!({"a": 1})));
    }

    #[test]
    fn test_expands_nested_refs() {
        let backend = Arc::new(CountingEvaluator::default());
        let evaluator = CachingEvaluator::new(backend.clone());

        let out = evaluator
            .eval(&map(json!({"db": {"password": "ref+vault://db#/pw"}, "plain": "x"})))
            .unwrap();

        assert_eq!(
            JsonValue::Object(out),
            json!({"db": {"password": "resolved:ref+vault://db#/pw"}, "plain": "x"})
        );
    }

    #[test]
    fn test_each_reference_evaluated_once() {
        let backend = Arc::new(CountingEvaluator::default());
        let evaluator = CachingEvaluator::new(backend.clone());
        let input = map(json!({"a": "ref+awssm://one", "b": ["ref+awssm://one", "ref+awssm://two"]}));

        evaluator.eval(&input).unwrap();
        evaluator.eval(&input).unwrap();
        evaluator.eval(&map(json!({"c": "ref+awssm://two"}))).unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.tokens.load(Ordering::SeqCst), 2);
        assert_eq!(evaluator.cached_len().unwrap(), 2);
    }

    #[test]
    fn test_no_refs_skips_backend() {
        let backend = Arc::new(CountingEvaluator::default());
        let evaluator = CachingEvaluator::new(backend.clone());
        evaluator.eval(&map(json!({"a": "b"}))).unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_separate_instances_do_not_share_cache() {
        let backend = Arc::new(CountingEvaluator::default());
        let input = map(json!({"a": "ref+vault://x"}));

        CachingEvaluator::new(backend.clone()).eval(&input).unwrap();
        CachingEvaluator::new(backend.clone()).eval(&input).unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_embedded_reference_resolves_whole_leaf() {
        let backend = Arc::new(CountingEvaluator::default());
        let evaluator = CachingEvaluator::new(backend.clone());

        let out = evaluator
            .eval(&map(json!({"dsn": "postgres://u:ref+vault://db#/pw@host"})))
            .unwrap();

        assert_eq!(out["dsn"], json!("resolved:postgres://u:ref+vault://db#/pw@host"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    /// Backend that stays busy long enough for callers to overlap
    #[derive(Default)]
    struct SlowEvaluator {
        calls: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Evaluator for SlowEvaluator {
        fn eval(&self, input: &Map) -> Result<Map> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(100));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(input.iter().map(|(k, _)| (k.clone(), json!("ok"))).collect())
        }
    }

    #[test]
    fn test_distinct_references_resolve_concurrently() {
        let backend = Arc::new(SlowEvaluator::default());
        let evaluator = CachingEvaluator::new(backend.clone());

        std::thread::scope(|scope| {
            for token in ["ref+vault://a", "ref+vault://b"] {
                let evaluator = evaluator.clone();
                scope.spawn(move || evaluator.eval(&map(json!({ "k": token }))).unwrap());
            }
        });

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(backend.peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_callers_share_one_resolution() {
        let backend = Arc::new(SlowEvaluator::default());
        let evaluator = CachingEvaluator::new(backend.clone());

        let outputs: Vec<Map> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let evaluator = evaluator.clone();
                    scope.spawn(move || evaluator.eval(&map(json!({"k": "ref+vault://same"}))).unwrap())
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(outputs.iter().all(|o| o["k"] == json!("ok")));
    }

    #[test]
    fn test_backend_failure_reaches_every_caller() {
        struct Failing;
        impl Evaluator for Failing {
            fn eval(&self, _: &Map) -> Result<Map> {
                Err(EngineError::Secrets {
                    message: "vault unreachable".into(),
                })
            }
        }

        let evaluator = CachingEvaluator::new(Arc::new(Failing));
        let input = map(json!({"k": "ref+vault://x"}));
        assert!(evaluator.eval(&input).unwrap_err().to_string().contains("vault unreachable"));
        assert!(evaluator.eval(&input).unwrap_err().to_string().contains("vault unreachable"));
    }
}
