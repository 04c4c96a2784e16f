// Copyright (c) 2026 Robert L. Snyder, Sierra Vista, AZ
// Licensed under the MIT License. See LICENSE file in the project root for details.

//! Parts of the song structure.
//!
//! A Part is a contiguous range of bars played by one rhythm. Parts are
//! referenced by their [`PartId`] handle; the container owns the values.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::leadsheet::SectionId;
use crate::rhythm::{Rhythm, TimeSignature};

static NEXT_PART_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle of a part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartId(u64);

impl PartId {
    /// Allocate a new unique id
    pub fn next() -> Self {
        PartId(NEXT_PART_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get raw value
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PartId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// A bar range bound to one rhythm
///
/// `Clone` keeps the id so that snapshots compare equal to the live part;
/// use [`Part::duplicate`] or the `clone_*` methods to get a new part.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    id: PartId,
    rhythm: Arc<Rhythm>,
    /// Maintained by the container
    start_bar: usize,
    nb_bars: usize,
    name: String,
    parent_section: Option<SectionId>,
    /// Rhythm parameter name -> value
    param_values: BTreeMap<String, String>,
    properties: BTreeMap<String, String>,
}

impl Part {
    /// Create a part; parameters get the rhythm's default values
    pub fn new(
        rhythm: Arc<Rhythm>,
        start_bar: usize,
        nb_bars: usize,
        name: impl Into<String>,
        parent_section: Option<SectionId>,
    ) -> Self {
        let param_values = rhythm
            .parameters()
            .iter()
            .map(|p| (p.name().to_string(), p.default_value().to_string()))
            .collect();
        Self {
            id: PartId::next(),
            rhythm,
            start_bar,
            nb_bars,
            name: name.into(),
            parent_section,
            param_values,
            properties: BTreeMap::new(),
        }
    }

    /// Get id
    pub fn id(&self) -> PartId {
        self.id
    }

    /// Get rhythm
    pub fn rhythm(&self) -> &Arc<Rhythm> {
        &self.rhythm
    }

    /// Get time signature of the rhythm
    pub fn time_signature(&self) -> TimeSignature {
        self.rhythm.time_signature()
    }

    /// Get start bar
    pub fn start_bar(&self) -> usize {
        self.start_bar
    }

    /// Get number of bars
    pub fn nb_bars(&self) -> usize {
        self.nb_bars
    }

    /// Get first bar after the part
    pub fn end_bar(&self) -> usize {
        self.start_bar + self.nb_bars
    }

    /// Get name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get originating lead sheet section
    pub fn parent_section(&self) -> Option<SectionId> {
        self.parent_section
    }

    /// Get a rhythm parameter value
    pub fn param_value(&self, parameter: &str) -> Option<&str> {
        self.param_values.get(parameter).map(String::as_str)
    }

    /// Get all rhythm parameter values
    pub fn param_values(&self) -> &BTreeMap<String, String> {
        &self.param_values
    }

    /// Get a client property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Set a client property
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Builder: set a client property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_property(key, value);
        self
    }

    /// Builder: set the start bar used as insertion position
    pub fn with_start_bar(mut self, start_bar: usize) -> Self {
        self.start_bar = start_bar;
        self
    }

    /// Same part content with a new id
    pub fn duplicate(&self) -> Self {
        Self {
            id: PartId::next(),
            ..self.clone()
        }
    }

    /// New part at the same position using another rhythm.
    ///
    /// Parameter values are kept when the target rhythm has a parameter with
    /// the same name accepting the value.
    pub fn clone_for_rhythm(&self, rhythm: Arc<Rhythm>) -> Self {
        let mut part = Part::new(
            rhythm,
            self.start_bar,
            self.nb_bars,
            self.name.clone(),
            self.parent_section,
        );
        for (name, value) in &self.param_values {
            let accepted = part
                .rhythm
                .parameter(name)
                .map(|p| p.accepts(value))
                .unwrap_or(false);
            if accepted {
                part.param_values.insert(name.clone(), value.clone());
            }
        }
        part.properties = self.properties.clone();
        part
    }

    /// New part with the same content bound to another section
    pub fn clone_for_section(&self, parent_section: Option<SectionId>) -> Self {
        Self {
            id: PartId::next(),
            parent_section,
            ..self.clone()
        }
    }

    pub(crate) fn set_start_bar(&mut self, start_bar: usize) {
        self.start_bar = start_bar;
    }

    pub(crate) fn set_nb_bars(&mut self, nb_bars: usize) {
        self.nb_bars = nb_bars;
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub(crate) fn set_param_value(&mut self, parameter: &str, value: &str) {
        self.param_values.insert(parameter.to_string(), value.to_string());
    }
}
