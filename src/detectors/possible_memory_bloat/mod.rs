use std::collections::BTreeMap;

use anyhow::Result;

use crate::descriptor::call_shape;
use crate::detectors::{
    Detector, DetectorMetadata, DetectorPass, RuleMetadata, Step, method_location,
};
use crate::finding::{Finding, FindingLocation, Priority, Subject};
use crate::ir::{Class, FieldRef, Method};
use crate::opcodes::{self, OpcodeSet};

const POSSIBLE_MEMORY_BLOAT: RuleMetadata = RuleMetadata {
    id: "PMB_POSSIBLE_MEMORY_BLOAT",
    name: "Possible memory bloat",
    description: "Static collection or buffer only grows; nothing in the class ever shrinks it",
    priority: Priority::Normal,
};

const RULES: &[RuleMetadata] = &[POSSIBLE_MEMORY_BLOAT];

const BLOATABLE_DESCRIPTORS: &[&str] = &[
    "Ljava/util/ArrayList;",
    "Ljava/util/Collection;",
    "Ljava/util/HashMap;",
    "Ljava/util/HashSet;",
    "Ljava/util/Hashtable;",
    "Ljava/util/IdentityHashMap;",
    "Ljava/util/LinkedHashMap;",
    "Ljava/util/LinkedList;",
    "Ljava/util/List;",
    "Ljava/util/Map;",
    "Ljava/util/Set;",
    "Ljava/util/SortedSet;",
    "Ljava/util/SortedMap;",
    "Ljava/util/Stack;",
    "Ljava/util/Queue;",
    "Ljava/lang/StringBuffer;",
    "Ljava/lang/StringBuilder;",
    "Ljava/util/TreeMap;",
    "Ljava/util/TreeSet;",
    "Ljava/util/Vector;",
];

const SHRINKING_METHODS: &[&str] = &[
    "clear",
    "delete",
    "deleteCharAt",
    "pop",
    "remove",
    "removeAll",
    "removeAllElements",
    "removeElementAt",
    "removeRange",
    "setLength",
];

const GROWING_METHODS: &[&str] = &[
    "add",
    "addAll",
    "addElement",
    "addFirst",
    "addLast",
    "append",
    "insertElementAt",
    "put",
];

/// Detector for static collections that are filled but never emptied.
#[derive(Default)]
pub(crate) struct PossibleMemoryBloatDetector;

crate::register_detector!(PossibleMemoryBloatDetector);

impl Detector for PossibleMemoryBloatDetector {
    fn metadata(&self) -> DetectorMetadata {
        DetectorMetadata {
            id: "PMB",
            name: "Possible memory bloat",
            rules: RULES,
        }
    }

    fn prescreen(&self, method: &Method, opcodes: &OpcodeSet) -> bool {
        !method.is_constructor()
            && !method.is_class_initializer()
            && opcodes.contains_any(&[opcodes::INVOKEVIRTUAL, opcodes::INVOKEINTERFACE])
    }

    fn start_class<'a>(&'a self, class: &'a Class) -> Option<Box<dyn DetectorPass + 'a>> {
        let fields: BTreeMap<FieldRef, Option<FindingLocation>> = class
            .fields
            .iter()
            .filter(|field| {
                field.access.is_static && BLOATABLE_DESCRIPTORS.contains(&field.descriptor.as_str())
            })
            .map(|field| {
                let key = FieldRef {
                    owner: class.name.clone(),
                    name: field.name.clone(),
                    descriptor: field.descriptor.clone(),
                };
                (key, None)
            })
            .collect();
        if fields.is_empty() {
            return None;
        }
        Some(Box::new(PossibleMemoryBloatPass {
            fields,
            changes: Vec::new(),
        }))
    }
}

/// Size change observed on a tracked field in the current method.
enum Change {
    Grow(FieldRef, FindingLocation),
    Shrink(FieldRef),
}

struct PossibleMemoryBloatPass {
    /// Fields still suspected to grow without bound, with the first growing
    /// call seen so far.
    fields: BTreeMap<FieldRef, Option<FindingLocation>>,
    /// Changes of the current method, applied once it is fully analyzed.
    changes: Vec<Change>,
}

impl DetectorPass for PossibleMemoryBloatPass {
    fn on_method_enter(&mut self, _method: &Method) {
        self.changes.clear();
    }

    fn on_instruction(&mut self, step: &Step<'_>, _findings: &mut Vec<Finding>) -> Result<()> {
        if !matches!(
            step.opcode(),
            opcodes::INVOKEVIRTUAL | opcodes::INVOKEINTERFACE
        ) {
            return Ok(());
        }
        let Some(call) = step.instruction.call() else {
            return Ok(());
        };
        let growing = GROWING_METHODS.contains(&call.name.as_str());
        let shrinking = SHRINKING_METHODS.contains(&call.name.as_str());
        if !growing && !shrinking {
            return Ok(());
        }
        let shape = call_shape(&call.descriptor)?;
        let Some(origin) = step
            .stack
            .peek(shape.param_slots)
            .and_then(|receiver| receiver.field_origin())
        else {
            return Ok(());
        };
        if !origin.is_static || !self.fields.contains_key(&origin.field) {
            return Ok(());
        }
        let field = origin.field.clone();
        if shrinking {
            self.changes.push(Change::Shrink(field));
        } else {
            let location = method_location(step.class, step.method, step.offset());
            self.changes.push(Change::Grow(field, location));
        }
        Ok(())
    }

    fn on_method_exit(&mut self, _method: &Method) {
        for change in self.changes.drain(..) {
            match change {
                Change::Shrink(field) => {
                    self.fields.remove(&field);
                }
                Change::Grow(field, location) => {
                    if let Some(first @ None) = self.fields.get_mut(&field) {
                        *first = Some(location);
                    }
                }
            }
        }
    }

    fn on_method_abandoned(&mut self, _method: &Method) {
        self.changes.clear();
    }

    fn on_class_exit(&mut self, findings: &mut Vec<Finding>) {
        for (field, location) in std::mem::take(&mut self.fields) {
            let Some(location) = location else {
                continue;
            };
            findings.push(Finding {
                rule_id: POSSIBLE_MEMORY_BLOAT.id,
                priority: POSSIBLE_MEMORY_BLOAT.priority,
                location,
                subject: Some(Subject::Field {
                    owner: field.owner,
                    name: field.name,
                    descriptor: field.descriptor,
                }),
            });
        }
    }
}
