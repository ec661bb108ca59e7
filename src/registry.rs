// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Parameter registry
//!
//! An ordered collection of [`Parameter`] descriptors acting as the schema of
//! a configuration record. Declaration order is also the order of the
//! persisted document and of diagnostic listings.

use std::collections::HashMap;

use log::{debug, warn};

use crate::error::ParamError;
use crate::param::{ApplyOutcome, Capability, Document, Parameter};

/// Per-descriptor result of a bulk document load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// `(id, outcome)` in registry order
    pub outcomes: Vec<(&'static str, ApplyOutcome)>,
}

impl LoadReport {
    /// Whether at least one field was written
    pub fn any_updated(&self) -> bool {
        self.outcomes.iter().any(|(_, o)| o.is_updated())
    }

    /// Ids whose value was written
    pub fn updated(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ids_with(|o| o.is_updated())
    }

    /// Ids whose value was refused (out of range or wrong type)
    pub fn rejected(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ids_with(|o| o.is_rejected())
    }

    /// Outcome recorded for `id`
    pub fn outcome(&self, id: &str) -> Option<ApplyOutcome> {
        self.outcomes
            .iter()
            .find(|(pid, _)| *pid == id)
            .map(|(_, o)| *o)
    }

    fn ids_with(
        &self,
        pred: impl Fn(&ApplyOutcome) -> bool + 'static,
    ) -> impl Iterator<Item = &'static str> + '_ {
        self.outcomes
            .iter()
            .filter(move |(_, o)| pred(o))
            .map(|(id, _)| *id)
    }
}

/// Ordered, id-unique collection of descriptors for record type `C`
pub struct Registry<C> {
    params: Vec<Parameter<C>>,
    index: HashMap<&'static str, usize>,
}

impl<C> Registry<C> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            params: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Append a descriptor after checking its id and its schema
    pub fn push(&mut self, param: Parameter<C>) -> Result<(), ParamError> {
        if self.index.contains_key(param.id()) {
            return Err(ParamError::DuplicateId(param.id().to_string()));
        }
        param.check_schema()?;
        self.index.insert(param.id(), self.params.len());
        self.params.push(param);
        Ok(())
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Descriptors in declaration order
    pub fn iter(&self) -> impl Iterator<Item = &Parameter<C>> {
        self.params.iter()
    }

    /// Look up a descriptor by id
    pub fn get(&self, id: &str) -> Option<&Parameter<C>> {
        self.index.get(id).map(|&i| &self.params[i])
    }

    /// Look up a descriptor by id, failing with [`ParamError::Unknown`]
    pub fn require(&self, id: &str) -> Result<&Parameter<C>, ParamError> {
        self.get(id)
            .ok_or_else(|| ParamError::Unknown(id.to_string()))
    }

    /// Write every descriptor's default, in order
    pub fn fill_defaults(&self, record: &mut C) {
        for param in &self.params {
            param.default_into(record);
        }
    }

    /// Check every field of `record` against its bounds
    pub fn validate(&self, record: &C) -> Result<(), ParamError> {
        self.params.iter().try_for_each(|p| p.check_value(record))
    }

    /// `(label, text)` pairs for diagnostics
    pub fn render_all(&self, record: &C) -> Vec<(&'static str, String)> {
        self.params
            .iter()
            .map(|p| (p.label(), p.render(record)))
            .collect()
    }

    /// Offer `document` to every descriptor; failures do not stop the others
    pub fn load_from_document(
        &self,
        record: &mut C,
        document: &Document,
        use_default_if_absent: bool,
    ) -> LoadReport {
        self.load_selected(record, document, use_default_if_absent, |_| true)
    }

    /// Like [`Self::load_from_document`] restricted to descriptors matching `filter`
    pub fn load_selected(
        &self,
        record: &mut C,
        document: &Document,
        use_default_if_absent: bool,
        filter: impl Fn(&Parameter<C>) -> bool,
    ) -> LoadReport {
        let mut report = LoadReport::default();
        for param in self.params.iter().filter(|&p| filter(p)) {
            let outcome = param.decode_and_apply(record, document, use_default_if_absent);
            match outcome {
                ApplyOutcome::OutOfRange | ApplyOutcome::WrongType => {
                    warn!("Skipping {}: {:?}", param.id(), outcome)
                }
                ApplyOutcome::Updated => debug!("Set {} = {}", param.id(), param.render(record)),
                _ => {}
            }
            report.outcomes.push((param.id(), outcome));
        }
        report
    }

    /// Encode every descriptor into a fresh document, in order
    pub fn save_to_document(&self, record: &C) -> Document {
        let mut document = Document::new();
        for param in &self.params {
            param.encode(record, &mut document);
        }
        document
    }

    /// Descriptors carrying `capability`
    pub fn select_by_capability(
        &self,
        capability: Capability,
    ) -> impl Iterator<Item = &Parameter<C>> {
        self.params
            .iter()
            .filter(move |p| p.capability() == capability)
    }

    /// Descriptors the synchronization channel may change
    pub fn remotely_settable(&self) -> impl Iterator<Item = &Parameter<C>> {
        self.params.iter().filter(|p| p.capability().is_remote())
    }

    /// Copy every field carrying `capability` from `from` into `to`
    pub fn merge_capability(&self, capability: Capability, from: &C, to: &mut C) {
        for param in self.select_by_capability(capability) {
            param.copy_value(from, to);
        }
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> std::fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.params.iter()).finish()
    }
}
