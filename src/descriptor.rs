use std::str::FromStr;

use anyhow::{Context, Result};
use jdescriptor::{MethodDescriptor, TypeDescriptor};

/// Operand-stack footprint of a call, counted in stack slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct CallShape {
    pub(crate) param_slots: usize,
    pub(crate) return_slots: usize,
}

/// Parse a method descriptor into its stack footprint.
pub(crate) fn call_shape(descriptor: &str) -> Result<CallShape> {
    let parsed = MethodDescriptor::from_str(descriptor)
        .with_context(|| format!("parse call descriptor {descriptor}"))?;
    Ok(CallShape {
        param_slots: parsed.parameter_types().iter().map(type_slots).sum(),
        return_slots: type_slots(parsed.return_type()),
    })
}

fn type_slots(ty: &TypeDescriptor) -> usize {
    match ty {
        TypeDescriptor::Void => 0,
        TypeDescriptor::Long | TypeDescriptor::Double => 2,
        _ => 1,
    }
}

/// Stack slots taken by a value of the given field descriptor.
pub(crate) fn field_slots(descriptor: &str) -> usize {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

/// Return-type part of a method descriptor, e.g. `I` for `(J)I`.
pub(crate) fn return_descriptor(descriptor: &str) -> Option<&str> {
    let (_, ret) = descriptor.rsplit_once(')')?;
    if ret.is_empty() { None } else { Some(ret) }
}

/// Parameter list of a method descriptor without the parentheses.
pub(crate) fn parameters_descriptor(descriptor: &str) -> Option<&str> {
    let rest = descriptor.strip_prefix('(')?;
    let (params, _) = rest.split_once(')')?;
    Some(params)
}
