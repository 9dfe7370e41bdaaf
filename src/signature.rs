//! Signature versions derived from stored revisions
//!
//! Every revision of a function is an immutable snapshot. A new signature
//! version starts only where the parameter shape actually changes; body-only
//! edits collapse into the version already in effect.

use crate::function_def::{FunctionDefinition, FunctionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameter shape of a function from `effective_from` onward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureVersion {
    pub function: FunctionId,
    pub param_count: usize,
    pub required_count: usize,
    pub effective_from: DateTime<Utc>,
}

impl SignatureVersion {
    fn from_definition(def: &FunctionDefinition) -> Self {
        Self {
            function: def.id.clone(),
            param_count: def.param_count(),
            required_count: def.required_count(),
            effective_from: def.revised_at,
        }
    }

    fn same_shape(&self, other: &SignatureVersion) -> bool {
        self.param_count == other.param_count && self.required_count == other.required_count
    }

    /// Whether `count` arguments satisfy this signature
    pub fn accepts(&self, count: usize) -> bool {
        count >= self.required_count && count <= self.param_count
    }
}

/// Per-function version sequences, strictly increasing by `effective_from`
#[derive(Debug, Clone, Default)]
pub struct SignatureHistory {
    versions: BTreeMap<FunctionId, Vec<SignatureVersion>>,
}

impl SignatureHistory {
    /// Derive version sequences from every known revision
    ///
    /// Two revisions with the same timestamp resolve to the later one in
    /// input order.
    pub fn from_definitions<'a, I>(definitions: I) -> Self
    where
        I: IntoIterator<Item = &'a FunctionDefinition>,
    {
        let mut grouped: BTreeMap<FunctionId, Vec<&FunctionDefinition>> = BTreeMap::new();
        for def in definitions {
            grouped.entry(def.id.clone()).or_default().push(def);
        }

        let mut versions = BTreeMap::new();
        for (id, mut revisions) in grouped {
            // stable: input order survives among equal timestamps
            revisions.sort_by_key(|d| d.revised_at);

            let mut seq: Vec<SignatureVersion> = Vec::new();
            for def in revisions {
                let version = SignatureVersion::from_definition(def);
                if seq
                    .last()
                    .is_some_and(|last| last.effective_from == version.effective_from)
                {
                    seq.pop();
                }
                match seq.last() {
                    Some(last) if last.same_shape(&version) => {}
                    _ => seq.push(version),
                }
            }
            versions.insert(id, seq);
        }

        Self { versions }
    }

    pub fn versions(&self, function: &FunctionId) -> &[SignatureVersion] {
        self.versions.get(function).map_or(&[], Vec::as_slice)
    }

    /// Index of the version in effect at `now`
    fn current_index(&self, function: &FunctionId, now: DateTime<Utc>) -> Option<usize> {
        let seq = self.versions(function);
        let in_effect = seq.partition_point(|v| v.effective_from <= now);
        in_effect.checked_sub(1)
    }

    /// Version with the greatest `effective_from <= now`
    pub fn current(&self, function: &FunctionId, now: DateTime<Utc>) -> Option<&SignatureVersion> {
        let idx = self.current_index(function, now)?;
        self.versions(function).get(idx)
    }

    /// Version immediately before the current one
    pub fn previous(
        &self,
        function: &FunctionId,
        now: DateTime<Utc>,
    ) -> Option<&SignatureVersion> {
        let idx = self.current_index(function, now)?;
        self.versions(function).get(idx.checked_sub(1)?)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionId> {
        self.versions.keys()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

/// Latest revision of each function in effect at `now`
///
/// Functions whose every revision lies in the future are left out. Output is
/// ordered by identity.
pub fn current_definitions<'a, I>(definitions: I, now: DateTime<Utc>) -> Vec<&'a FunctionDefinition>
where
    I: IntoIterator<Item = &'a FunctionDefinition>,
{
    let mut latest: BTreeMap<&FunctionId, &FunctionDefinition> = BTreeMap::new();
    for def in definitions {
        if def.revised_at > now {
            continue;
        }
        match latest.get(&def.id) {
            Some(existing) if existing.revised_at > def.revised_at => {}
            _ => {
                latest.insert(&def.id, def);
            }
        }
    }
    latest.into_values().collect()
}
