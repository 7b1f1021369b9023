use std::collections::BTreeMap;
use std::fmt;

use crate::ir::{ConstantValue, FieldRef};

/// Where a stack value came from, as far as the simulation can tell.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Provenance {
    Unknown,
    Local(u16),
    Field(FieldOrigin),
}

/// Field read that produced a stack value.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct FieldOrigin {
    pub(crate) field: FieldRef,
    pub(crate) is_static: bool,
    /// Provenance of the object the field was read from, for instance fields.
    pub(crate) receiver: Option<Box<Provenance>>,
}

/// Semantic placeholder for one operand-stack slot.
///
/// Long and double values take two slots: a continuation slot below the
/// slot carrying the value, so `peek(0)` always sees a whole value.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct StackItem {
    constant: Option<ConstantValue>,
    provenance: Provenance,
    allocation: Option<u32>,
    continuation: bool,
}

impl StackItem {
    pub(crate) fn unknown() -> Self {
        Self {
            constant: None,
            provenance: Provenance::Unknown,
            allocation: None,
            continuation: false,
        }
    }

    pub(crate) fn continuation() -> Self {
        Self {
            continuation: true,
            ..Self::unknown()
        }
    }

    pub(crate) fn constant(value: ConstantValue) -> Self {
        Self {
            constant: Some(value),
            ..Self::unknown()
        }
    }

    pub(crate) fn local(index: u16) -> Self {
        Self {
            provenance: Provenance::Local(index),
            ..Self::unknown()
        }
    }

    pub(crate) fn field(origin: FieldOrigin) -> Self {
        Self {
            provenance: Provenance::Field(origin),
            ..Self::unknown()
        }
    }

    /// Object pushed by `new` at `offset`, not yet passed to its constructor.
    pub(crate) fn fresh(offset: u32) -> Self {
        Self {
            allocation: Some(offset),
            ..Self::unknown()
        }
    }

    pub(crate) fn constant_value(&self) -> Option<&ConstantValue> {
        self.constant.as_ref()
    }

    pub(crate) fn string_constant(&self) -> Option<&str> {
        self.constant_value().and_then(ConstantValue::as_string)
    }

    pub(crate) fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    pub(crate) fn local_index(&self) -> Option<u16> {
        match self.provenance {
            Provenance::Local(index) => Some(index),
            _ => None,
        }
    }

    pub(crate) fn field_origin(&self) -> Option<&FieldOrigin> {
        match &self.provenance {
            Provenance::Field(origin) => Some(origin),
            _ => None,
        }
    }

    pub(crate) fn allocation(&self) -> Option<u32> {
        self.allocation
    }

    /// Join of two predecessors' values for the same slot.
    pub(crate) fn merge(&self, other: &StackItem) -> StackItem {
        if self == other {
            return self.clone();
        }
        StackItem {
            continuation: self.continuation && other.continuation,
            ..StackItem::unknown()
        }
    }
}

/// Internal inconsistency between an instruction's stack effect and the simulated stack.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum StackFault {
    Underflow {
        needed: usize,
        depth: usize,
    },
    Overflow {
        limit: usize,
    },
    MergeDepthMismatch {
        target: u32,
        incoming: usize,
        recorded: usize,
    },
    Descriptor(String),
    UnsupportedOpcode(u8),
}

impl fmt::Display for StackFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackFault::Underflow { needed, depth } => {
                write!(f, "stack underflow: needed {needed} slots with depth {depth}")
            }
            StackFault::Overflow { limit } => write!(f, "stack overflow beyond max_stack {limit}"),
            StackFault::MergeDepthMismatch {
                target,
                incoming,
                recorded,
            } => write!(
                f,
                "stack depth mismatch at offset {target}: incoming {incoming}, recorded {recorded}"
            ),
            StackFault::Descriptor(message) => write!(f, "unusable descriptor: {message}"),
            StackFault::UnsupportedOpcode(opcode) => {
                write!(f, "unsupported opcode 0x{opcode:02x}")
            }
        }
    }
}

impl std::error::Error for StackFault {}

/// Abstract operand stack for one method pass, plus the states recorded for
/// forward branch targets that have not been reached yet.
#[derive(Clone, Debug, Default)]
pub(crate) struct SymbolicStack {
    items: Vec<StackItem>,
    limit: Option<usize>,
    jump_entries: BTreeMap<u32, Vec<StackItem>>,
}

impl SymbolicStack {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            items: Vec::new(),
            limit,
            jump_entries: BTreeMap::new(),
        }
    }

    pub(crate) fn depth(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item `depth` slots below the top; `peek(0)` is the top.
    pub(crate) fn peek(&self, depth: usize) -> Option<&StackItem> {
        let len = self.items.len();
        if depth >= len {
            return None;
        }
        self.items.get(len - 1 - depth)
    }

    pub(crate) fn push(&mut self, item: StackItem) -> Result<(), StackFault> {
        if let Some(limit) = self.limit {
            if self.items.len() >= limit {
                return Err(StackFault::Overflow { limit });
            }
        }
        self.items.push(item);
        Ok(())
    }

    /// Push a value taking `slots` slots (1 or 2).
    pub(crate) fn push_value(&mut self, item: StackItem, slots: usize) -> Result<(), StackFault> {
        if slots == 2 {
            self.push(StackItem::continuation())?;
        }
        self.push(item)
    }

    /// Pop `count` slots, returned top first.
    pub(crate) fn pop(&mut self, count: usize) -> Result<Vec<StackItem>, StackFault> {
        self.ensure_depth(count)?;
        let split = self.items.len() - count;
        let mut popped = self.items.split_off(split);
        popped.reverse();
        Ok(popped)
    }

    pub(crate) fn pop_one(&mut self) -> Result<StackItem, StackFault> {
        self.ensure_depth(1)?;
        self.items
            .pop()
            .ok_or(StackFault::Underflow { needed: 1, depth: 0 })
    }

    /// Copy the top `copy` slots and insert them `under` slots further down.
    pub(crate) fn dup(&mut self, copy: usize, under: usize) -> Result<(), StackFault> {
        self.ensure_depth(copy + under)?;
        let len = self.items.len();
        let copied: Vec<StackItem> = self.items[len - copy..].to_vec();
        if let Some(limit) = self.limit {
            if len + copy > limit {
                return Err(StackFault::Overflow { limit });
            }
        }
        let at = len - copy - under;
        self.items.splice(at..at, copied);
        Ok(())
    }

    pub(crate) fn swap(&mut self) -> Result<(), StackFault> {
        self.ensure_depth(2)?;
        let len = self.items.len();
        self.items.swap(len - 1, len - 2);
        Ok(())
    }

    /// Replace every slot holding the allocation made at `offset`.
    pub(crate) fn replace_allocation(&mut self, offset: u32, item: &StackItem) {
        for slot in &mut self.items {
            if slot.allocation == Some(offset) {
                *slot = item.clone();
            }
        }
    }

    /// Keep the depth and wide-value layout but drop everything known about
    /// the values. Used at loop heads, whose back-edge states are not known
    /// on arrival.
    pub(crate) fn forget_slots(&mut self) {
        for slot in &mut self.items {
            *slot = if slot.continuation {
                StackItem::continuation()
            } else {
                StackItem::unknown()
            };
        }
    }

    /// Record the current stack as one predecessor state of `target`.
    pub(crate) fn record_jump(&mut self, target: u32) -> Result<(), StackFault> {
        match self.jump_entries.get_mut(&target) {
            Some(recorded) => {
                *recorded = merge_slots(target, &self.items, recorded)?;
            }
            None => {
                self.jump_entries.insert(target, self.items.clone());
            }
        }
        Ok(())
    }

    /// Establish the stack on arrival at `offset`.
    ///
    /// Recorded jump states are merged with the fall-through state when the
    /// previous instruction can fall through, and replace it otherwise. An
    /// exception handler entry starts with the caught exception only.
    pub(crate) fn arrive(
        &mut self,
        offset: u32,
        falls_through: bool,
        is_handler: bool,
    ) -> Result<(), StackFault> {
        let recorded = self.jump_entries.remove(&offset);
        if is_handler {
            self.items.clear();
            return self.push(StackItem::unknown());
        }
        match (recorded, falls_through) {
            (Some(recorded), true) => {
                self.items = merge_slots(offset, &self.items, &recorded)?;
            }
            (Some(recorded), false) => self.items = recorded,
            (None, true) => {}
            (None, false) => self.items.clear(),
        }
        Ok(())
    }

    fn ensure_depth(&self, needed: usize) -> Result<(), StackFault> {
        if self.items.len() < needed {
            return Err(StackFault::Underflow {
                needed,
                depth: self.items.len(),
            });
        }
        Ok(())
    }
}

fn merge_slots(
    target: u32,
    incoming: &[StackItem],
    recorded: &[StackItem],
) -> Result<Vec<StackItem>, StackFault> {
    if incoming.len() != recorded.len() {
        return Err(StackFault::MergeDepthMismatch {
            target,
            incoming: incoming.len(),
            recorded: recorded.len(),
        });
    }
    Ok(incoming
        .iter()
        .zip(recorded)
        .map(|(left, right)| left.merge(right))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string(value: &str) -> StackItem {
        StackItem::constant(ConstantValue::String(value.to_string()))
    }

    #[test]
    fn pop_returns_top_first() {
        let mut stack = SymbolicStack::new(None);
        stack.push(StackItem::local(1)).expect("push");
        stack.push(string("a")).expect("push");
        let popped = stack.pop(2).expect("pop");
        assert_eq!(popped[0].string_constant(), Some("a"));
        assert_eq!(popped[1].local_index(), Some(1));
        assert!(stack.is_empty());
    }

    #[test]
    fn pop_beyond_depth_is_underflow() {
        let mut stack = SymbolicStack::new(None);
        stack.push(StackItem::unknown()).expect("push");
        assert_eq!(
            stack.pop(2).unwrap_err(),
            StackFault::Underflow {
                needed: 2,
                depth: 1
            }
        );
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn push_beyond_limit_is_overflow() {
        let mut stack = SymbolicStack::new(Some(1));
        stack.push(StackItem::unknown()).expect("push");
        assert_eq!(
            stack.push(StackItem::unknown()).unwrap_err(),
            StackFault::Overflow { limit: 1 }
        );
    }

    #[test]
    fn wide_values_keep_value_on_top() {
        let mut stack = SymbolicStack::new(None);
        stack
            .push_value(StackItem::constant(ConstantValue::Long(7)), 2)
            .expect("push");
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.peek(0).and_then(|item| item.constant_value()), Some(&ConstantValue::Long(7)));
        assert_eq!(stack.peek(1), Some(&StackItem::continuation()));
    }

    #[test]
    fn dup_x1_inserts_copy_below_second() {
        let mut stack = SymbolicStack::new(None);
        stack.push(StackItem::local(1)).expect("push");
        stack.push(StackItem::local(2)).expect("push");
        stack.dup(1, 1).expect("dup_x1");
        let order: Vec<Option<u16>> = (0..3)
            .map(|depth| stack.peek(depth).and_then(StackItem::local_index))
            .collect();
        assert_eq!(order, vec![Some(2), Some(1), Some(2)]);
    }

    #[test]
    fn merge_degrades_mismatched_slots_to_unknown() {
        let mut stack = SymbolicStack::new(None);
        stack.push(StackItem::local(0)).expect("push");
        stack.push(string("left")).expect("push");
        stack.record_jump(20).expect("record");

        stack.pop(1).expect("pop");
        stack.push(string("right")).expect("push");
        stack.arrive(20, true, false).expect("arrive");

        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.peek(0), Some(&StackItem::unknown()));
        assert_eq!(stack.peek(1).and_then(StackItem::local_index), Some(0));
    }

    #[test]
    fn merge_with_different_depth_is_a_fault() {
        let mut stack = SymbolicStack::new(None);
        stack.record_jump(8).expect("record");
        stack.push(StackItem::unknown()).expect("push");
        assert_eq!(
            stack.arrive(8, true, false).unwrap_err(),
            StackFault::MergeDepthMismatch {
                target: 8,
                incoming: 1,
                recorded: 0
            }
        );
    }

    #[test]
    fn arrival_after_unconditional_jump_takes_recorded_state() {
        let mut stack = SymbolicStack::new(None);
        stack.push(string("kept")).expect("push");
        stack.record_jump(12).expect("record");
        stack.push(StackItem::unknown()).expect("push");

        stack.arrive(12, false, false).expect("arrive");
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.peek(0).and_then(StackItem::string_constant), Some("kept"));

        stack.arrive(16, false, false).expect("arrive");
        assert!(stack.is_empty());
    }

    #[test]
    fn handler_entry_holds_only_the_exception() {
        let mut stack = SymbolicStack::new(None);
        stack.push(string("x")).expect("push");
        stack.push(string("y")).expect("push");
        stack.arrive(30, false, true).expect("arrive");
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.peek(0), Some(&StackItem::unknown()));
    }

    #[test]
    fn forgetting_slots_keeps_depth_and_wide_layout() {
        let mut stack = SymbolicStack::new(None);
        stack.push(StackItem::local(1)).expect("push");
        stack
            .push_value(StackItem::constant(ConstantValue::Long(7)), 2)
            .expect("push wide");
        stack.forget_slots();
        assert_eq!(stack.depth(), 3);
        assert_eq!(stack.peek(0), Some(&StackItem::unknown()));
        assert_eq!(stack.peek(1), Some(&StackItem::continuation()));
        assert_eq!(stack.peek(2), Some(&StackItem::unknown()));
    }

    #[test]
    fn constructor_replaces_every_copy_of_allocation() {
        let mut stack = SymbolicStack::new(None);
        stack.push(StackItem::fresh(3)).expect("push");
        stack.dup(1, 0).expect("dup");
        stack.replace_allocation(3, &StackItem::unknown());
        assert_eq!(stack.peek(0).and_then(StackItem::allocation), None);
        assert_eq!(stack.peek(1).and_then(StackItem::allocation), None);
    }
}
