use anyhow::Result;

use crate::dataflow::opcode_semantics::StackEffect;
use crate::dataflow::stack::SymbolicStack;
use crate::finding::{Finding, FindingLocation, Priority, Subject};
use crate::ir::{Class, Instruction, Method};
use crate::opcodes::OpcodeSet;

// Detector modules are auto-discovered by build.rs, do not edit manually.
include!(concat!(env!("OUT_DIR"), "/detector_modules.rs"));

/// One rule a detector may report.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RuleMetadata {
    pub(crate) id: &'static str,
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) priority: Priority,
}

/// Metadata describing a detector and the rules it reports.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DetectorMetadata {
    pub(crate) id: &'static str,
    pub(crate) name: &'static str,
    pub(crate) rules: &'static [RuleMetadata],
}

/// Immutable detector registered in the catalog.
///
/// Everything that changes while a class is analyzed lives in the
/// [`DetectorPass`] returned by [`Detector::start_class`], so one detector
/// instance can serve any number of classes concurrently.
pub(crate) trait Detector: Send + Sync {
    fn metadata(&self) -> DetectorMetadata;

    /// Cheap rejection test over the opcodes a method uses. Returning `true`
    /// for a method that cannot match only costs time.
    fn prescreen(&self, _method: &Method, _opcodes: &OpcodeSet) -> bool {
        true
    }

    /// Begin analyzing `class`; `None` skips the class entirely.
    fn start_class<'a>(&'a self, class: &'a Class) -> Option<Box<dyn DetectorPass + 'a>>;
}

/// Mutable state of one detector over one class.
pub(crate) trait DetectorPass {
    fn on_method_enter(&mut self, _method: &Method) {}

    /// Transition on one instruction. `step.stack` is the stack just before
    /// the instruction executes.
    fn on_instruction(&mut self, step: &Step<'_>, findings: &mut Vec<Finding>) -> Result<()>;

    /// Method completed without faults.
    fn on_method_exit(&mut self, _method: &Method) {}

    /// Method analysis was abandoned; drop anything it contributed.
    fn on_method_abandoned(&mut self, _method: &Method) {}

    fn on_class_exit(&mut self, _findings: &mut Vec<Finding>) {}
}

/// Instruction offered to detectors together with the simulated stack.
pub(crate) struct Step<'a> {
    pub(crate) class: &'a Class,
    pub(crate) method: &'a Method,
    pub(crate) instruction: &'a Instruction,
    pub(crate) stack: &'a SymbolicStack,
    pub(crate) effect: StackEffect,
}

impl Step<'_> {
    pub(crate) fn opcode(&self) -> u8 {
        self.instruction.opcode
    }

    pub(crate) fn offset(&self) -> u32 {
        self.instruction.offset
    }

    /// Finding for `rule` at the current instruction.
    pub(crate) fn finding(&self, rule: &RuleMetadata, subject: Option<Subject>) -> Finding {
        Finding {
            rule_id: rule.id,
            priority: rule.priority,
            location: method_location(self.class, self.method, self.instruction.offset),
            subject,
        }
    }
}

/// Location of `offset` inside `method`.
pub(crate) fn method_location(class: &Class, method: &Method, offset: u32) -> FindingLocation {
    FindingLocation {
        class_name: class.name.clone(),
        method_name: method.name.clone(),
        method_descriptor: method.descriptor.clone(),
        offset,
        line: method.line_for_offset(offset),
        artifact_uri: class.artifact_uri.clone(),
    }
}

/// Wrapper struct for detector factory functions to enable inventory collection.
pub(crate) struct DetectorFactory(pub fn() -> Box<dyn Detector>);

inventory::collect!(DetectorFactory);

/// Macro to register a detector implementation.
///
/// Usage: `register_detector!(DetectorName);`
#[macro_export]
macro_rules! register_detector {
    ($detector_type:ty) => {
        inventory::submit! {
            $crate::detectors::DetectorFactory(|| Box::new(<$detector_type>::default()))
        }
    };
}

/// Returns every registered detector, ordered by id.
pub(crate) fn all_detectors() -> Vec<Box<dyn Detector>> {
    let mut detectors: Vec<Box<dyn Detector>> = inventory::iter::<DetectorFactory>
        .into_iter()
        .map(|factory| (factory.0)())
        .collect();
    detectors.sort_by(|a, b| a.metadata().id.cmp(b.metadata().id));
    detectors
}
