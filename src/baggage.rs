//! Name/value pairs propagated alongside the trace context.
//!
//! Two logically disjoint namespaces flow with a span context: the
//! OpenTracing namespace, injected as one `ot-baggage-<key>` header per
//! item, and the W3C namespace, encoded into a single `baggage` header. The
//! W3C namespace enforces the limits of the W3C baggage specification: at
//! most 64 pairs and 8192 bytes of encoded content.

use std::collections::HashMap;

const MAX_W3C_PAIRS: usize = 64;
const MAX_W3C_CONTENT_LEN: usize = 8192;

/// Selects which of the two baggage mappings an operation addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BaggageNamespace {
    /// Items injected with the `ot-baggage-` header prefix.
    OpenTracing,
    /// Items encoded into the single W3C `baggage` header.
    W3c,
}

/// Dual-namespace baggage container.
#[derive(Clone, Debug, Default)]
pub(crate) struct Baggage {
    opentracing: HashMap<String, String>,
    w3c: HashMap<String, String>,
}

impl Baggage {
    pub(crate) fn new() -> Self {
        Baggage::default()
    }

    pub(crate) fn get(&self, ns: BaggageNamespace, key: &str) -> Option<&str> {
        self.map(ns).get(key).map(String::as_str)
    }

    /// Inserts a pair, returning the previous value. A W3C insert that would
    /// exceed the namespace limits is discarded.
    pub(crate) fn set(
        &mut self,
        ns: BaggageNamespace,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        let (key, value) = (key.into(), value.into());
        if ns == BaggageNamespace::W3c && !self.fits_w3c(&key, &value) {
            return None;
        }
        self.map_mut(ns).insert(key, value)
    }

    pub(crate) fn remove(&mut self, ns: BaggageNamespace, key: &str) -> Option<String> {
        self.map_mut(ns).remove(key)
    }

    pub(crate) fn clear(&mut self, ns: BaggageNamespace) {
        self.map_mut(ns).clear();
    }

    pub(crate) fn len(&self, ns: BaggageNamespace) -> usize {
        self.map(ns).len()
    }

    /// Visits every pair in the namespace until the callback returns `false`.
    /// Iteration order is unspecified.
    pub(crate) fn visit<F>(&self, ns: BaggageNamespace, mut f: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        for (k, v) in self.map(ns) {
            if !f(k, v) {
                break;
            }
        }
    }

    fn fits_w3c(&self, key: &str, value: &str) -> bool {
        let existing = self.w3c.contains_key(key);
        if !existing && self.w3c.len() >= MAX_W3C_PAIRS {
            return false;
        }
        let replaced = self
            .w3c
            .get(key)
            .map(|v| key.len() + v.len() + 1)
            .unwrap_or(0);
        let current: usize = self
            .w3c
            .iter()
            .map(|(k, v)| k.len() + v.len() + 1)
            .sum::<usize>()
            - replaced;
        current + key.len() + value.len() + 1 <= MAX_W3C_CONTENT_LEN
    }

    fn map(&self, ns: BaggageNamespace) -> &HashMap<String, String> {
        match ns {
            BaggageNamespace::OpenTracing => &self.opentracing,
            BaggageNamespace::W3c => &self.w3c,
        }
    }

    fn map_mut(&mut self, ns: BaggageNamespace) -> &mut HashMap<String, String> {
        match ns {
            BaggageNamespace::OpenTracing => &mut self.opentracing,
            BaggageNamespace::W3c => &mut self.w3c,
        }
    }
}
