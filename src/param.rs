// SolarMon - Solar charge controller telemetry
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Configuration parameter descriptors
//!
//! A [`Parameter`] binds a stable identifier and a human label to exactly one
//! field of a configuration record `C`. It owns everything needed to handle
//! that field uniformly:
//! - default value and bounds
//! - text codec (local portal, diagnostics)
//! - structured codec (configuration file, broker payloads)
//! - capability tag and restart flag
//!
//! Field access goes through a plain getter/setter pair of function pointers,
//! so a descriptor never needs to know the record layout.

use std::fmt;

use log::info;
use serde_json::{Map, Number, Value};

use crate::error::ParamError;

/// Structured document keyed by parameter identifier
pub type Document = Map<String, Value>;

/// Result of offering a value to a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApplyOutcome {
    /// Value equals the current one, record untouched
    Unchanged,
    /// Value written
    Updated,
    /// Value outside the declared bounds, record untouched
    OutOfRange,
    /// Value cannot be interpreted for this kind, record untouched
    WrongType,
    /// Key absent from the document and no default requested
    NotPresent,
}

impl ApplyOutcome {
    /// Whether the record was written
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated)
    }

    /// Whether the value was refused
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::OutOfRange | Self::WrongType)
    }
}

/// Which external channel may change a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Capability {
    /// Local portal and configuration file only
    #[default]
    Local,
    /// Remotely settable, applied directly to the live record
    Remote,
    /// Remotely settable and affects broker connectivity (tested before commit)
    Broker,
}

impl Capability {
    /// Whether the synchronization channel may change this parameter
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote | Self::Broker)
    }
}

/// Kind-specific payload of a descriptor
pub enum ParamKind<C> {
    /// Unsigned integer field (u8, u16, u32 widened to u64)
    Unsigned {
        get: fn(&C) -> u64,
        set: fn(&mut C, u64),
        default: u64,
        min: u64,
        max: u64,
        allow_zero: bool,
    },
    /// Signed integer field (i8, i16, i32 widened to i64)
    Signed {
        get: fn(&C) -> i64,
        set: fn(&mut C, i64),
        default: i64,
        min: i64,
        max: i64,
        allow_zero: bool,
    },
    /// Floating point field rendered with a fixed number of decimals
    Float {
        get: fn(&C) -> f32,
        set: fn(&mut C, f32),
        default: f32,
        min: f32,
        max: f32,
        allow_zero: bool,
        decimals: usize,
    },
    /// Boolean flag
    Boolean {
        get: fn(&C) -> bool,
        set: fn(&mut C, bool),
        default: bool,
    },
    /// Bounded string, truncated at the declared maximum length
    Text {
        get: fn(&C) -> &str,
        set: fn(&mut C, String),
        default: &'static str,
    },
    /// Enumeration stored by ordinal, rendered by label
    Enumeration {
        get: fn(&C) -> u16,
        set: fn(&mut C, u16),
        default: u16,
        min: u16,
        max: u16,
        labels: &'static [&'static str],
    },
}

impl<C> ParamKind<C> {
    /// Short kind name used by diagnostics and the local portal
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unsigned { .. } => "unsigned",
            Self::Signed { .. } => "signed",
            Self::Float { .. } => "float",
            Self::Boolean { .. } => "boolean",
            Self::Text { .. } => "string",
            Self::Enumeration { .. } => "enum",
        }
    }
}

/// Descriptor of one configuration field
pub struct Parameter<C> {
    id: &'static str,
    label: &'static str,
    max_len: usize,
    capability: Capability,
    restart_required: bool,
    kind: ParamKind<C>,
}

fn admits<T: PartialOrd + Default>(value: T, min: T, max: T, allow_zero: bool) -> bool {
    (value >= min && value <= max) || (allow_zero && value == T::default())
}

fn truncate_at(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn float_value(value: f32, decimals: usize) -> Value {
    // Round through the declared format so 0.1 is stored as 0.1, not 0.100000001
    let rounded = format!("{:.*}", decimals, value)
        .parse::<f64>()
        .unwrap_or(value as f64);
    Number::from_f64(rounded)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl<C> Parameter<C> {
    fn new(id: &'static str, label: &'static str, max_len: usize, kind: ParamKind<C>) -> Self {
        Self {
            id,
            label,
            max_len,
            capability: Capability::Local,
            restart_required: false,
            kind,
        }
    }

    /// Unsigned integer parameter bounded by `[min, max]`
    pub fn unsigned(
        id: &'static str,
        label: &'static str,
        get: fn(&C) -> u64,
        set: fn(&mut C, u64),
        default: u64,
        min: u64,
        max: u64,
    ) -> Self {
        let max_len = min.to_string().len().max(max.to_string().len());
        Self::new(
            id,
            label,
            max_len,
            ParamKind::Unsigned {
                get,
                set,
                default,
                min,
                max,
                allow_zero: false,
            },
        )
    }

    /// Signed integer parameter bounded by `[min, max]`
    pub fn signed(
        id: &'static str,
        label: &'static str,
        get: fn(&C) -> i64,
        set: fn(&mut C, i64),
        default: i64,
        min: i64,
        max: i64,
    ) -> Self {
        let max_len = min.to_string().len().max(max.to_string().len());
        Self::new(
            id,
            label,
            max_len,
            ParamKind::Signed {
                get,
                set,
                default,
                min,
                max,
                allow_zero: false,
            },
        )
    }

    /// Floating point parameter rendered with `decimals` fraction digits
    #[allow(clippy::too_many_arguments)]
    pub fn float(
        id: &'static str,
        label: &'static str,
        get: fn(&C) -> f32,
        set: fn(&mut C, f32),
        default: f32,
        min: f32,
        max: f32,
        decimals: usize,
    ) -> Self {
        let max_len = format!("{:.*}", decimals, min)
            .len()
            .max(format!("{:.*}", decimals, max).len());
        Self::new(
            id,
            label,
            max_len,
            ParamKind::Float {
                get,
                set,
                default,
                min,
                max,
                allow_zero: false,
                decimals,
            },
        )
    }

    /// Boolean parameter
    pub fn boolean(
        id: &'static str,
        label: &'static str,
        get: fn(&C) -> bool,
        set: fn(&mut C, bool),
        default: bool,
    ) -> Self {
        Self::new(id, label, 5, ParamKind::Boolean { get, set, default })
    }

    /// String parameter holding at most `max_len` bytes
    pub fn text(
        id: &'static str,
        label: &'static str,
        get: fn(&C) -> &str,
        set: fn(&mut C, String),
        default: &'static str,
        max_len: usize,
    ) -> Self {
        Self::new(id, label, max_len, ParamKind::Text { get, set, default })
    }

    /// Enumeration parameter over `labels[min..=max]`
    #[allow(clippy::too_many_arguments)]
    pub fn enumeration(
        id: &'static str,
        label: &'static str,
        get: fn(&C) -> u16,
        set: fn(&mut C, u16),
        default: u16,
        labels: &'static [&'static str],
        min: u16,
        max: u16,
    ) -> Self {
        let max_len = labels.iter().map(|l| l.len()).max().unwrap_or(0);
        Self::new(
            id,
            label,
            max_len,
            ParamKind::Enumeration {
                get,
                set,
                default,
                min,
                max,
                labels,
            },
        )
    }

    /// Set the capability tag
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    /// Mark the parameter as needing a restart to take effect
    pub fn restart_required(mut self) -> Self {
        self.restart_required = true;
        self
    }

    /// Permit zero as a value outside the declared bounds (numeric kinds only)
    pub fn allow_zero(mut self) -> Self {
        match &mut self.kind {
            ParamKind::Unsigned { allow_zero, .. }
            | ParamKind::Signed { allow_zero, .. }
            | ParamKind::Float { allow_zero, .. } => *allow_zero = true,
            _ => {}
        }
        self
    }

    /// Stable identifier, used as file and wire key
    pub fn id(&self) -> &'static str {
        self.id
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Maximum length of the rendered text form
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Capability tag
    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Whether a change only takes effect after a restart
    pub fn is_restart_required(&self) -> bool {
        self.restart_required
    }

    /// Kind-specific payload
    pub fn kind(&self) -> &ParamKind<C> {
        &self.kind
    }

    /// Whether zero is accepted outside the bounds
    pub fn can_be_zero(&self) -> bool {
        match self.kind {
            ParamKind::Unsigned { allow_zero, .. }
            | ParamKind::Signed { allow_zero, .. }
            | ParamKind::Float { allow_zero, .. } => allow_zero,
            _ => false,
        }
    }

    /// Label table of an enumeration parameter
    pub fn enum_labels(&self) -> Option<&'static [&'static str]> {
        match self.kind {
            ParamKind::Enumeration { labels, .. } => Some(labels),
            _ => None,
        }
    }

    /// Rendered lower bound, `None` for kinds without bounds
    pub fn min_text(&self) -> Option<String> {
        match self.kind {
            ParamKind::Unsigned { min, .. } => Some(min.to_string()),
            ParamKind::Signed { min, .. } => Some(min.to_string()),
            ParamKind::Float { min, decimals, .. } => Some(format!("{:.*}", decimals, min)),
            ParamKind::Enumeration { min, labels, .. } => {
                labels.get(min as usize).map(|l| l.to_string())
            }
            _ => None,
        }
    }

    /// Rendered upper bound, `None` for kinds without bounds
    pub fn max_text(&self) -> Option<String> {
        match self.kind {
            ParamKind::Unsigned { max, .. } => Some(max.to_string()),
            ParamKind::Signed { max, .. } => Some(max.to_string()),
            ParamKind::Float { max, decimals, .. } => Some(format!("{:.*}", decimals, max)),
            ParamKind::Enumeration { max, labels, .. } => {
                labels.get(max as usize).map(|l| l.to_string())
            }
            _ => None,
        }
    }

    /// Check that the declared default is admitted by the declared bounds
    pub fn check_schema(&self) -> Result<(), ParamError> {
        let out_of_bounds = |min: String, max: String| ParamError::DefaultOutOfBounds {
            id: self.id.to_string(),
            min,
            max,
        };
        match self.kind {
            ParamKind::Unsigned {
                default,
                min,
                max,
                allow_zero,
                ..
            } if !admits(default, min, max, allow_zero) => {
                Err(out_of_bounds(min.to_string(), max.to_string()))
            }
            ParamKind::Signed {
                default,
                min,
                max,
                allow_zero,
                ..
            } if !admits(default, min, max, allow_zero) => {
                Err(out_of_bounds(min.to_string(), max.to_string()))
            }
            ParamKind::Float {
                default,
                min,
                max,
                allow_zero,
                ..
            } if !admits(default, min, max, allow_zero) => {
                Err(out_of_bounds(min.to_string(), max.to_string()))
            }
            ParamKind::Enumeration {
                default,
                min,
                max,
                labels,
                ..
            } => {
                if labels.len() <= max as usize {
                    return Err(ParamError::MissingLabels {
                        id: self.id.to_string(),
                        labels: labels.len(),
                        needed: max as usize + 1,
                    });
                }
                if !admits(default, min, max, false) {
                    return Err(out_of_bounds(min.to_string(), max.to_string()));
                }
                Ok(())
            }
            ParamKind::Text { default, .. } if default.len() > self.max_len => {
                Err(ParamError::DefaultTooLong {
                    id: self.id.to_string(),
                    len: default.len(),
                    max: self.max_len,
                })
            }
            _ => Ok(()),
        }
    }

    /// Check that the record's current value satisfies the bounds
    pub fn check_value(&self, record: &C) -> Result<(), ParamError> {
        let valid = match self.kind {
            ParamKind::Unsigned {
                get,
                min,
                max,
                allow_zero,
                ..
            } => admits(get(record), min, max, allow_zero),
            ParamKind::Signed {
                get,
                min,
                max,
                allow_zero,
                ..
            } => admits(get(record), min, max, allow_zero),
            ParamKind::Float {
                get,
                min,
                max,
                allow_zero,
                ..
            } => admits(get(record), min, max, allow_zero),
            ParamKind::Enumeration { get, min, max, .. } => admits(get(record), min, max, false),
            ParamKind::Text { get, .. } => get(record).len() <= self.max_len,
            ParamKind::Boolean { .. } => true,
        };
        if valid {
            Ok(())
        } else {
            Err(ParamError::Invalid {
                id: self.id.to_string(),
                value: self.render(record),
            })
        }
    }

    /// Unconditionally write the default into the record
    pub fn default_into(&self, record: &mut C) {
        match self.kind {
            ParamKind::Unsigned { set, default, .. } => set(record, default),
            ParamKind::Signed { set, default, .. } => set(record, default),
            ParamKind::Float { set, default, .. } => set(record, default),
            ParamKind::Boolean { set, default, .. } => set(record, default),
            ParamKind::Text { set, default, .. } => {
                set(record, truncate_at(default, self.max_len).to_string())
            }
            ParamKind::Enumeration { set, default, .. } => set(record, default),
        }
    }

    /// Copy this parameter's field from one record to another
    pub fn copy_value(&self, from: &C, to: &mut C) {
        match self.kind {
            ParamKind::Unsigned { get, set, .. } => set(to, get(from)),
            ParamKind::Signed { get, set, .. } => set(to, get(from)),
            ParamKind::Float { get, set, .. } => set(to, get(from)),
            ParamKind::Boolean { get, set, .. } => set(to, get(from)),
            ParamKind::Text { get, set, .. } => set(to, get(from).to_string()),
            ParamKind::Enumeration { get, set, .. } => set(to, get(from)),
        }
    }

    /// Whether two records hold the same value for this parameter
    pub fn same_value(&self, a: &C, b: &C) -> bool {
        match self.kind {
            ParamKind::Unsigned { get, .. } => get(a) == get(b),
            ParamKind::Signed { get, .. } => get(a) == get(b),
            ParamKind::Float { get, .. } => get(a) == get(b),
            ParamKind::Boolean { get, .. } => get(a) == get(b),
            ParamKind::Text { get, .. } => get(a) == get(b),
            ParamKind::Enumeration { get, .. } => get(a) == get(b),
        }
    }

    /// Canonical text form, never longer than [`Self::max_len`]
    pub fn render(&self, record: &C) -> String {
        let text = match self.kind {
            ParamKind::Unsigned { get, .. } => get(record).to_string(),
            ParamKind::Signed { get, .. } => get(record).to_string(),
            ParamKind::Float { get, decimals, .. } => format!("{:.*}", decimals, get(record)),
            ParamKind::Boolean { get, .. } => String::from(if get(record) { "true" } else { "false" }),
            ParamKind::Text { get, .. } => get(record).to_string(),
            ParamKind::Enumeration { get, labels, .. } => labels
                .get(get(record) as usize)
                .map(|l| l.to_string())
                .unwrap_or_else(|| get(record).to_string()),
        };
        truncate_at(&text, self.max_len).to_string()
    }

    /// Selection index of the current value: `value - min`
    pub fn ordinal(&self, record: &C) -> Result<u64, ParamError> {
        match self.kind {
            ParamKind::Unsigned { get, min, .. } => Ok(get(record).saturating_sub(min)),
            ParamKind::Signed { get, min, .. } => Ok(get(record).saturating_sub(min).max(0) as u64),
            ParamKind::Float { get, min, .. } => Ok((get(record) - min).max(0.0) as u64),
            ParamKind::Boolean { get, .. } => Ok(get(record) as u64),
            ParamKind::Enumeration { get, min, .. } => Ok(get(record).saturating_sub(min) as u64),
            ParamKind::Text { .. } => Err(ParamError::NoOrdinal(self.id.to_string())),
        }
    }

    fn log_out_of_range(&self, value: &dyn fmt::Display) {
        info!(
            "Ignoring value {} for {} outside range [{}, {}]",
            value,
            self.id,
            self.min_text().unwrap_or_default(),
            self.max_text().unwrap_or_default()
        );
    }

    fn apply_unsigned(&self, record: &mut C, value: u64) -> ApplyOutcome {
        let ParamKind::Unsigned {
            get,
            set,
            min,
            max,
            allow_zero,
            ..
        } = self.kind
        else {
            return ApplyOutcome::WrongType;
        };
        if !admits(value, min, max, allow_zero) {
            self.log_out_of_range(&value);
            return ApplyOutcome::OutOfRange;
        }
        if get(record) == value {
            return ApplyOutcome::Unchanged;
        }
        set(record, value);
        ApplyOutcome::Updated
    }

    fn apply_signed(&self, record: &mut C, value: i64) -> ApplyOutcome {
        let ParamKind::Signed {
            get,
            set,
            min,
            max,
            allow_zero,
            ..
        } = self.kind
        else {
            return ApplyOutcome::WrongType;
        };
        if !admits(value, min, max, allow_zero) {
            self.log_out_of_range(&value);
            return ApplyOutcome::OutOfRange;
        }
        if get(record) == value {
            return ApplyOutcome::Unchanged;
        }
        set(record, value);
        ApplyOutcome::Updated
    }

    fn apply_float(&self, record: &mut C, value: f32) -> ApplyOutcome {
        let ParamKind::Float {
            get,
            set,
            min,
            max,
            allow_zero,
            ..
        } = self.kind
        else {
            return ApplyOutcome::WrongType;
        };
        if !admits(value, min, max, allow_zero) {
            self.log_out_of_range(&value);
            return ApplyOutcome::OutOfRange;
        }
        if get(record) == value {
            return ApplyOutcome::Unchanged;
        }
        set(record, value);
        ApplyOutcome::Updated
    }

    fn apply_ordinal(&self, record: &mut C, value: u64) -> ApplyOutcome {
        let ParamKind::Enumeration {
            get, set, min, max, ..
        } = self.kind
        else {
            return ApplyOutcome::WrongType;
        };
        if value < min as u64 || value > max as u64 {
            self.log_out_of_range(&value);
            return ApplyOutcome::OutOfRange;
        }
        let value = value as u16;
        if get(record) == value {
            return ApplyOutcome::Unchanged;
        }
        set(record, value);
        ApplyOutcome::Updated
    }

    fn apply_text(&self, record: &mut C, value: &str) -> ApplyOutcome {
        let ParamKind::Text { get, set, .. } = self.kind else {
            return ApplyOutcome::WrongType;
        };
        let value = truncate_at(value, self.max_len);
        if get(record) == value {
            return ApplyOutcome::Unchanged;
        }
        set(record, value.to_string());
        ApplyOutcome::Updated
    }

    fn apply_label(&self, record: &mut C, text: &str) -> ApplyOutcome {
        let ParamKind::Enumeration {
            min, max, labels, ..
        } = self.kind
        else {
            return ApplyOutcome::WrongType;
        };
        let candidates = move || {
            (min..=max).filter_map(move |i| labels.get(i as usize).map(|label| (i, *label)))
        };
        let matched = candidates()
            .find(|(_, label)| *label == text)
            .or_else(|| candidates().find(|(_, label)| text.starts_with(label)));
        if let Some((ordinal, _)) = matched {
            return self.apply_ordinal(record, ordinal as u64);
        }
        match text.trim().parse::<u64>() {
            Ok(ordinal) => self.apply_ordinal(record, ordinal),
            Err(_) => ApplyOutcome::WrongType,
        }
    }

    /// Parse a text value and apply it to the record
    pub fn parse_and_apply(&self, record: &mut C, text: &str) -> ApplyOutcome {
        match self.kind {
            ParamKind::Unsigned { .. } => match text.trim().parse::<u64>() {
                Ok(value) => self.apply_unsigned(record, value),
                Err(_) => ApplyOutcome::WrongType,
            },
            ParamKind::Signed { .. } => match text.trim().parse::<i64>() {
                Ok(value) => self.apply_signed(record, value),
                Err(_) => ApplyOutcome::WrongType,
            },
            ParamKind::Float { .. } => match text.trim().parse::<f32>() {
                Ok(value) => self.apply_float(record, value),
                Err(_) => ApplyOutcome::WrongType,
            },
            ParamKind::Boolean { get, set, .. } => {
                let value = text.starts_with("true") || text.starts_with("on");
                if get(record) == value {
                    return ApplyOutcome::Unchanged;
                }
                set(record, value);
                ApplyOutcome::Updated
            }
            ParamKind::Text { .. } => self.apply_text(record, text),
            ParamKind::Enumeration { .. } => self.apply_label(record, text),
        }
    }

    /// Apply the value stored under this parameter's id in `document`
    ///
    /// An absent key writes the default (reported as `Updated`) when
    /// `use_default_if_absent` is set, otherwise it yields `NotPresent`.
    pub fn decode_and_apply(
        &self,
        record: &mut C,
        document: &Document,
        use_default_if_absent: bool,
    ) -> ApplyOutcome {
        let Some(value) = document.get(self.id) else {
            if use_default_if_absent {
                self.default_into(record);
                return ApplyOutcome::Updated;
            }
            return ApplyOutcome::NotPresent;
        };
        match self.kind {
            ParamKind::Unsigned { .. } => match value.as_u64() {
                Some(v) => self.apply_unsigned(record, v),
                None => ApplyOutcome::WrongType,
            },
            ParamKind::Signed { .. } => match value.as_i64() {
                Some(v) => self.apply_signed(record, v),
                None => ApplyOutcome::WrongType,
            },
            ParamKind::Float { .. } => match value.as_f64() {
                Some(v) => self.apply_float(record, v as f32),
                None => ApplyOutcome::WrongType,
            },
            ParamKind::Boolean { get, set, .. } => match value.as_bool() {
                Some(v) if get(record) == v => ApplyOutcome::Unchanged,
                Some(v) => {
                    set(record, v);
                    ApplyOutcome::Updated
                }
                None => ApplyOutcome::WrongType,
            },
            ParamKind::Text { .. } => match value.as_str() {
                Some(v) => self.apply_text(record, v),
                None => ApplyOutcome::WrongType,
            },
            ParamKind::Enumeration { .. } => match value {
                Value::Number(n) => match n.as_u64() {
                    Some(v) => self.apply_ordinal(record, v),
                    None => ApplyOutcome::WrongType,
                },
                Value::String(label) => self.apply_label(record, label),
                _ => ApplyOutcome::WrongType,
            },
        }
    }

    /// Structured value of the field (number, bool or string)
    pub fn to_value(&self, record: &C) -> Value {
        match self.kind {
            ParamKind::Unsigned { get, .. } => Value::from(get(record)),
            ParamKind::Signed { get, .. } => Value::from(get(record)),
            ParamKind::Float { get, decimals, .. } => float_value(get(record), decimals),
            ParamKind::Boolean { get, .. } => Value::Bool(get(record)),
            ParamKind::Text { get, .. } => Value::String(get(record).to_string()),
            ParamKind::Enumeration { get, .. } => Value::from(get(record)),
        }
    }

    /// Write the field into `document` under this parameter's id
    pub fn encode(&self, record: &C, document: &mut Document) {
        document.insert(self.id.to_string(), self.to_value(record));
    }
}

impl<C> fmt::Debug for Parameter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("capability", &self.capability)
            .field("restart_required", &self.restart_required)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Rec {
        port: u16,
        interval: u32,
        offset: i16,
        volts: f32,
        flag: bool,
        name: String,
        mode: u16,
    }

    type P = Parameter<Rec>;

    const MODES: &[&str] = &["off", "eco", "full"];

    fn port() -> Parameter<Rec> {
        P::unsigned(
            "port",
            "Port",
            |r| r.port.into(),
            |r, v| r.port = v as u16,
            1883,
            1,
            u16::MAX.into(),
        )
    }

    fn interval() -> Parameter<Rec> {
        P::unsigned(
            "interval",
            "Interval",
            |r| r.interval.into(),
            |r, v| r.interval = v as u32,
            300,
            10,
            u32::MAX.into(),
        )
        .allow_zero()
    }

    fn offset() -> Parameter<Rec> {
        P::signed(
            "offset",
            "Offset",
            |r| r.offset.into(),
            |r, v| r.offset = v as i16,
            0,
            -100,
            100,
        )
    }

    fn volts() -> Parameter<Rec> {
        P::float("volts", "Volts", |r| r.volts, |r, v| r.volts = v, 11.5, 9.0, 16.0, 2)
    }

    fn flag() -> Parameter<Rec> {
        P::boolean("flag", "Flag", |r| r.flag, |r, v| r.flag = v, false)
    }

    fn name() -> Parameter<Rec> {
        P::text("name", "Name", |r| r.name.as_str(), |r, v| r.name = v, "solar", 8)
    }

    fn mode() -> Parameter<Rec> {
        P::enumeration("mode", "Mode", |r| r.mode, |r, v| r.mode = v, 1, MODES, 0, 2)
    }

    #[test]
    fn test_default_into_and_render() {
        let mut rec = Rec::default();
        for p in [port(), interval(), offset(), volts(), flag(), name(), mode()] {
            p.default_into(&mut rec);
        }
        assert_eq!(port().render(&rec), "1883");
        assert_eq!(volts().render(&rec), "11.50");
        assert_eq!(flag().render(&rec), "false");
        assert_eq!(name().render(&rec), "solar");
        assert_eq!(mode().render(&rec), "eco");
    }

    #[test]
    fn test_parse_unchanged_leaves_record() {
        let mut rec = Rec::default();
        port().default_into(&mut rec);
        let before = rec.clone();
        assert_eq!(port().parse_and_apply(&mut rec, "1883"), ApplyOutcome::Unchanged);
        assert_eq!(rec, before);
    }

    #[test]
    fn test_parse_out_of_range_and_wrong_type() {
        let mut rec = Rec::default();
        offset().default_into(&mut rec);
        assert_eq!(offset().parse_and_apply(&mut rec, "101"), ApplyOutcome::OutOfRange);
        assert_eq!(offset().parse_and_apply(&mut rec, "-101"), ApplyOutcome::OutOfRange);
        assert_eq!(offset().parse_and_apply(&mut rec, "abc"), ApplyOutcome::WrongType);
        assert_eq!(rec.offset, 0);
        assert_eq!(offset().parse_and_apply(&mut rec, "-42"), ApplyOutcome::Updated);
        assert_eq!(rec.offset, -42);
    }

    #[test]
    fn test_zero_escape() {
        let mut rec = Rec::default();
        interval().default_into(&mut rec);
        assert_eq!(interval().parse_and_apply(&mut rec, "5"), ApplyOutcome::OutOfRange);
        assert_eq!(interval().parse_and_apply(&mut rec, "0"), ApplyOutcome::Updated);
        assert_eq!(rec.interval, 0);
        assert!(interval().check_value(&rec).is_ok());
        assert_eq!(port().parse_and_apply(&mut rec, "0"), ApplyOutcome::OutOfRange);
    }

    #[test]
    fn test_boolean_text() {
        let mut rec = Rec::default();
        assert_eq!(flag().parse_and_apply(&mut rec, "on"), ApplyOutcome::Updated);
        assert!(rec.flag);
        assert_eq!(flag().parse_and_apply(&mut rec, "true"), ApplyOutcome::Unchanged);
        assert_eq!(flag().parse_and_apply(&mut rec, "yes"), ApplyOutcome::Updated);
        assert!(!rec.flag);
        assert_eq!(flag().parse_and_apply(&mut rec, "TRUE"), ApplyOutcome::Unchanged);
    }

    #[test]
    fn test_text_truncates() {
        let mut rec = Rec::default();
        assert_eq!(
            name().parse_and_apply(&mut rec, "solarmonitor"),
            ApplyOutcome::Updated
        );
        assert_eq!(rec.name, "solarmon");
        assert_eq!(
            name().parse_and_apply(&mut rec, "solarmonitor-2"),
            ApplyOutcome::Unchanged
        );
        assert!(name().ordinal(&rec).is_err());
    }

    #[test]
    fn test_enum_label_precedence() {
        let mut rec = Rec::default();
        assert_eq!(mode().parse_and_apply(&mut rec, "full"), ApplyOutcome::Updated);
        assert_eq!(rec.mode, 2);
        assert_eq!(mode().parse_and_apply(&mut rec, "economy"), ApplyOutcome::Updated);
        assert_eq!(rec.mode, 1);
        assert_eq!(mode().parse_and_apply(&mut rec, "0"), ApplyOutcome::Updated);
        assert_eq!(rec.mode, 0);
        assert_eq!(mode().parse_and_apply(&mut rec, "3"), ApplyOutcome::OutOfRange);
        assert_eq!(mode().parse_and_apply(&mut rec, "Full"), ApplyOutcome::WrongType);
        assert_eq!(mode().ordinal(&rec).unwrap(), 0);
    }

    #[test]
    fn test_decode_document() {
        let mut rec = Rec::default();
        let doc = json!({ "port": 8883, "flag": "yes", "volts": 12.25, "mode": "full" });
        let doc = doc.as_object().unwrap();

        assert_eq!(port().decode_and_apply(&mut rec, doc, false), ApplyOutcome::Updated);
        assert_eq!(rec.port, 8883);
        assert_eq!(flag().decode_and_apply(&mut rec, doc, false), ApplyOutcome::WrongType);
        assert_eq!(volts().decode_and_apply(&mut rec, doc, false), ApplyOutcome::Updated);
        assert_relative_eq!(rec.volts, 12.25);
        assert_eq!(mode().decode_and_apply(&mut rec, doc, false), ApplyOutcome::Updated);
        assert_eq!(rec.mode, 2);
        assert_eq!(name().decode_and_apply(&mut rec, doc, false), ApplyOutcome::NotPresent);
        assert_eq!(name().decode_and_apply(&mut rec, doc, true), ApplyOutcome::Updated);
        assert_eq!(rec.name, "solar");
    }

    #[test]
    fn test_decode_rejects_out_of_range_and_negative() {
        let mut rec = Rec::default();
        port().default_into(&mut rec);
        let doc = json!({ "port": 70000 });
        assert_eq!(
            port().decode_and_apply(&mut rec, doc.as_object().unwrap(), false),
            ApplyOutcome::OutOfRange
        );
        let doc = json!({ "port": -1 });
        assert_eq!(
            port().decode_and_apply(&mut rec, doc.as_object().unwrap(), false),
            ApplyOutcome::WrongType
        );
        assert_eq!(rec.port, 1883);
    }

    #[test]
    fn test_encode_uses_structured_types() {
        let mut rec = Rec::default();
        for p in [port(), volts(), flag(), name(), mode()] {
            p.default_into(&mut rec);
        }
        let mut doc = Document::new();
        for p in [port(), volts(), flag(), name(), mode()] {
            p.encode(&rec, &mut doc);
        }
        assert_eq!(doc["port"], json!(1883));
        assert_eq!(doc["volts"], json!(11.5));
        assert_eq!(doc["flag"], json!(false));
        assert_eq!(doc["name"], json!("solar"));
        assert_eq!(doc["mode"], json!(1));
    }

    #[test]
    fn test_float_encode_rounds_to_format() {
        let mut rec = Rec::default();
        assert_eq!(volts().parse_and_apply(&mut rec, "12.1"), ApplyOutcome::Updated);
        assert_eq!(volts().to_value(&rec), json!(12.1));
    }

    #[test]
    fn test_check_schema() {
        assert!(port().check_schema().is_ok());
        let bad = P::unsigned("p", "P", |r| r.port.into(), |r, v| r.port = v as u16, 0, 1, 10);
        assert!(matches!(bad.check_schema(), Err(ParamError::DefaultOutOfBounds { .. })));
        assert!(bad.allow_zero().check_schema().is_ok());
        let short = P::enumeration("m", "M", |r| r.mode, |r, v| r.mode = v, 0, MODES, 0, 3);
        assert!(matches!(short.check_schema(), Err(ParamError::MissingLabels { .. })));
    }

    #[test]
    fn test_render_respects_max_len() {
        let mut rec = Rec::default();
        rec.name = "a-much-longer-name".to_string();
        assert!(name().render(&rec).len() <= name().max_len());
        rec.interval = u32::MAX;
        assert!(interval().render(&rec).len() <= interval().max_len());
    }
}
