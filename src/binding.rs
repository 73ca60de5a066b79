//! Key identity resolution.
//!
//! [`KeyMap`] maps `(source, code)` pairs to [`LogicalKey`]s. It is built from the
//! configuration at startup, handed to each pipeline behind an `Arc`, and replaced
//! wholesale on reload; there is no ambient global mapping.
//!
//! # Invariants
//! - a code is bound to at most one key per source
//! - a key is bound to at most one code per source
//!
//! Edits go through [`KeyMap::bind`], which performs a reverse scan of the source's
//! bindings first. Conflicts are never auto-resolved: an unconfirmed edit is rejected
//! and leaves the table untouched.

use crate::event::{Code, SourceKind};
use crate::key::{self, LogicalKey};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, warn};

/// `(source, code) → key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalBinding {
    pub source: SourceKind,
    pub code: Code,
    pub key: LogicalKey,
}

impl PhysicalBinding {
    pub fn new(source: SourceKind, code: Code, key: LogicalKey) -> Self {
        Self { source, code, key }
    }
}

impl fmt::Display for PhysicalBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} -> {}", self.source, self.code, self.key)
    }
}

/// An existing binding that stands in the way of a requested one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// The requested code already resolves to another key.
    CodeInUse(PhysicalBinding),
    /// The requested key is already reachable through another code of the same source.
    KeyInUse(PhysicalBinding),
}

impl Conflict {
    pub fn existing(&self) -> &PhysicalBinding {
        match self {
            Conflict::CodeInUse(b) | Conflict::KeyInUse(b) => b,
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::CodeInUse(b) => write!(f, "code {} is already assigned to {}", b.code, b.key),
            Conflict::KeyInUse(b) => write!(f, "{} is already bound to code {}", b.key, b.code),
        }
    }
}

/// Non-blocking remarks about a committed binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingWarning {
    /// The code carries the name of a system key but is bound to a different key,
    /// so the physical button labelled with that name no longer triggers it.
    AliasesReservedKey { code: Code, key: LogicalKey },
}

impl fmt::Display for BindingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindingWarning::AliasesReservedKey { code, key } => {
                write!(f, "{code} is a system key name but is bound to {key}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("binding {requested} needs confirmation: {}", join(conflicts))]
    Conflict {
        requested: PhysicalBinding,
        conflicts: Vec<Conflict>,
    },
}

fn join(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result of a successful [`KeyMap::bind`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Committed {
    /// Bindings removed to make room (only non-empty for confirmed edits).
    pub replaced: Vec<PhysicalBinding>,
    pub warnings: Vec<BindingWarning>,
}

/// Binding table owned by the resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyMap {
    sources: HashMap<SourceKind, BTreeMap<Code, LogicalKey>>,
}

impl KeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from configuration. Any conflict between entries is an error,
    /// since nobody is around to confirm it at load time.
    pub fn from_bindings(
        bindings: impl IntoIterator<Item = PhysicalBinding>,
    ) -> Result<Self, BindingError> {
        let mut map = KeyMap::new();
        for binding in bindings {
            let committed = map.bind(binding, false)?;
            for warning in committed.warnings {
                warn!(%warning, "binding aliases a system key");
            }
        }
        Ok(map)
    }

    /// Resolves a code to its logical key. Unbound codes yield `None`.
    pub fn resolve(&self, source: SourceKind, code: &Code) -> Option<&LogicalKey> {
        self.sources.get(&source)?.get(code)
    }

    /// Reverse scan of `source` for anything the requested binding would collide with.
    pub fn conflicts(&self, requested: &PhysicalBinding) -> Vec<Conflict> {
        let Some(table) = self.sources.get(&requested.source) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (code, key) in table {
            let existing = || PhysicalBinding::new(requested.source, code.clone(), key.clone());
            if *code == requested.code && *key != requested.key {
                out.push(Conflict::CodeInUse(existing()));
            } else if *code != requested.code && *key == requested.key {
                out.push(Conflict::KeyInUse(existing()));
            }
        }
        out
    }

    /// Commit a binding.
    ///
    /// Without `confirmed`, any conflict rejects the edit and the previous bindings
    /// stay intact. With `confirmed`, conflicting bindings are removed first and
    /// returned in [`Committed::replaced`].
    pub fn bind(
        &mut self,
        binding: PhysicalBinding,
        confirmed: bool,
    ) -> Result<Committed, BindingError> {
        let conflicts = self.conflicts(&binding);
        if !conflicts.is_empty() && !confirmed {
            return Err(BindingError::Conflict {
                requested: binding,
                conflicts,
            });
        }

        let mut committed = Committed::default();
        let code_name = binding.code.to_string();
        if key::is_reserved_name(&code_name) && code_name != binding.key.as_str() {
            committed.warnings.push(BindingWarning::AliasesReservedKey {
                code: binding.code.clone(),
                key: binding.key.clone(),
            });
        }

        let table = self.sources.entry(binding.source).or_default();
        for conflict in conflicts {
            let old = conflict.existing();
            table.remove(&old.code);
            debug!(replaced = %old, "binding overwritten");
            committed.replaced.push(old.clone());
        }
        table.insert(binding.code, binding.key);
        Ok(committed)
    }

    /// Remove the binding for `code`, returning the key it pointed to.
    pub fn unbind(&mut self, source: SourceKind, code: &Code) -> Option<LogicalKey> {
        self.sources.get_mut(&source)?.remove(code)
    }

    /// All bindings of one source, ordered by code.
    pub fn bindings(&self, source: SourceKind) -> impl Iterator<Item = PhysicalBinding> + '_ {
        self.sources
            .get(&source)
            .into_iter()
            .flat_map(move |t| {
                t.iter()
                    .map(move |(c, k)| PhysicalBinding::new(source, c.clone(), k.clone()))
            })
    }

    /// Codes bound for `source`.
    pub fn codes(&self, source: SourceKind) -> impl Iterator<Item = &Code> + '_ {
        self.sources.get(&source).into_iter().flat_map(|t| t.keys())
    }

    pub fn len(&self) -> usize {
        self.sources.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Required navigation keys that no source can produce.
    pub fn missing_required(&self) -> Vec<&'static str> {
        key::REQUIRED_KEYS
            .into_iter()
            .filter(|name| {
                !self
                    .sources
                    .values()
                    .any(|t| t.values().any(|k| k.as_str() == *name))
            })
            .collect()
    }
}
