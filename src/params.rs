//! Query parameter lists.
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    Error, Result, SqlState,
    postgres::{Oid, PgFormat, UNSPECIFIED, frontend::BindValue},
};

/// The declared parameter type OIDs, shared between the caller's list and
/// the pending-describe records so a ParameterDescription resolves types in
/// both places.
pub(crate) type SharedOids = Arc<Mutex<Vec<Oid>>>;

/// An ordered collection of parameter slots.
///
/// Every slot must be set (or explicitly set to null) before execution;
/// describe-only runs are exempt. A declared OID of zero leaves the type
/// for the backend to infer.
pub struct ParameterList {
    values: Vec<ParamValue>,
    oids: SharedOids,
}

#[derive(Debug, Clone, Default)]
pub(crate) enum ParamValue {
    #[default]
    Unset,
    Null,
    Text(Bytes),
    Binary(Bytes),
}

impl ParameterList {
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![ParamValue::Unset; len],
            oids: Arc::new(Mutex::new(vec![UNSPECIFIED; len])),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn oids(&self) -> MutexGuard<'_, Vec<Oid>> {
        self.oids.lock().expect("parameter oids poisoned")
    }

    fn slot(&mut self, index: usize) -> Result<(&mut ParamValue, MutexGuard<'_, Vec<Oid>>)> {
        let len = self.values.len();
        let Some(value) = self.values.get_mut(index) else {
            return Err(Error::driver(
                SqlState::InvalidParameterValue,
                format!("parameter index {index} out of range, expected 0..{len}"),
            ));
        };
        Ok((value, self.oids.lock().expect("parameter oids poisoned")))
    }

    /// Set a slot to a text-format value.
    pub fn set_text(&mut self, index: usize, value: impl Into<Bytes>, oid: Oid) -> Result<()> {
        let (slot, mut oids) = self.slot(index)?;
        *slot = ParamValue::Text(value.into());
        oids[index] = oid;
        Ok(())
    }

    /// Set a slot to a binary-format value.
    pub fn set_binary(&mut self, index: usize, value: impl Into<Bytes>, oid: Oid) -> Result<()> {
        let (slot, mut oids) = self.slot(index)?;
        *slot = ParamValue::Binary(value.into());
        oids[index] = oid;
        Ok(())
    }

    /// Declare a slot null.
    pub fn set_null(&mut self, index: usize, oid: Oid) -> Result<()> {
        let (slot, mut oids) = self.slot(index)?;
        *slot = ParamValue::Null;
        oids[index] = oid;
        Ok(())
    }

    /// The declared (or resolved) type OID of every slot.
    pub fn type_oids(&self) -> Vec<Oid> {
        self.oids().clone()
    }

    /// Fail unless every slot was set or declared null.
    pub(crate) fn check_all_set(&self) -> Result<()> {
        for (i, value) in self.values.iter().enumerate() {
            if matches!(value, ParamValue::Unset) {
                return Err(Error::driver(
                    SqlState::InvalidParameterValue,
                    format!("no value specified for parameter {}", i + 1),
                ));
            }
        }
        Ok(())
    }

    /// A window of `len` slots starting at `offset`, sharing this list's
    /// OID vector so type resolution is visible to the caller.
    pub(crate) fn window(&self, offset: usize, len: usize) -> Result<BoundParams> {
        if offset + len > self.values.len() {
            return Err(Error::driver(
                SqlState::InvalidParameterValue,
                format!(
                    "parameter list has {} slots, statement expects {}..{}",
                    self.values.len(),
                    offset,
                    offset + len,
                ),
            ));
        }
        Ok(BoundParams {
            values: self.values[offset..offset + len].to_vec(),
            oids: self.oids.clone(),
            offset,
        })
    }

    pub(crate) fn all(&self) -> BoundParams {
        BoundParams {
            values: self.values.clone(),
            oids: self.oids.clone(),
            offset: 0,
        }
    }
}

impl std::fmt::Debug for ParameterList {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ParameterList")
            .field("values", &self.values)
            .field("oids", &*self.oids())
            .finish()
    }
}

/// One statement's view of a parameter list: a value snapshot plus a window
/// into the shared OID vector.
///
/// Values are `Bytes`, so the snapshot is reference-counted, not copied.
#[derive(Clone)]
pub(crate) struct BoundParams {
    values: Vec<ParamValue>,
    oids: SharedOids,
    offset: usize,
}

impl BoundParams {
    /// An empty view for parameterless statements.
    pub fn none() -> Self {
        Self {
            values: Vec::new(),
            oids: Arc::new(Mutex::new(Vec::new())),
            offset: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    fn oids(&self) -> MutexGuard<'_, Vec<Oid>> {
        self.oids.lock().expect("parameter oids poisoned")
    }

    /// The OIDs of this window.
    pub fn type_oids(&self) -> Vec<Oid> {
        self.oids()[self.offset..self.offset + self.values.len()].to_vec()
    }

    pub fn has_unresolved_types(&self) -> bool {
        self.type_oids().iter().any(|oid| *oid == UNSPECIFIED)
    }

    /// Record backend-described types, in window order.
    pub fn resolve_types(&self, resolved: &[Oid]) {
        let mut oids = self.oids();
        for (i, oid) in resolved.iter().enumerate().take(self.values.len()) {
            oids[self.offset + i] = *oid;
        }
    }

    /// Adopt statement types for slots the caller left unspecified. Never
    /// overwrites user-supplied type information.
    pub fn adopt_unspecified(&self, statement_oids: &[Oid]) {
        let mut oids = self.oids();
        for (i, oid) in statement_oids.iter().enumerate().take(self.values.len()) {
            if oids[self.offset + i] == UNSPECIFIED {
                oids[self.offset + i] = *oid;
            }
        }
    }

    /// Wire values for Bind or FunctionCall, in slot order.
    pub fn bind_values(&self) -> Vec<BindValue<'_>> {
        self.values
            .iter()
            .map(|value| match value {
                ParamValue::Unset | ParamValue::Null => None,
                ParamValue::Text(b) | ParamValue::Binary(b) => Some(&b[..]),
            })
            .collect()
    }

    /// Per-slot transfer formats, in slot order.
    pub fn formats(&self) -> Vec<PgFormat> {
        self.values
            .iter()
            .map(|value| match value {
                ParamValue::Binary(_) => PgFormat::Binary,
                _ => PgFormat::Text,
            })
            .collect()
    }
}
