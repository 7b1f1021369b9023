use std::collections::BTreeSet;

use anyhow::Result;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::dataflow::opcode_semantics::{apply, stack_effect};
use crate::dataflow::stack::{StackFault, SymbolicStack};
use crate::detectors::{Detector, DetectorPass, Step, all_detectors};
use crate::finding::{AnalysisDiagnostic, Finding, sort_findings};
use crate::ir::{Class, Method};
use crate::opcodes;
use crate::telemetry::{debug_stack_enabled, with_span};

/// Analysis engine that runs the detector catalog over decoded classes.
pub(crate) struct Engine {
    detectors: Vec<Box<dyn Detector>>,
}

/// Findings plus the internal diagnostics collected while producing them.
#[derive(Debug, Default)]
pub(crate) struct EngineOutput {
    pub(crate) findings: Vec<Finding>,
    pub(crate) diagnostics: Vec<AnalysisDiagnostic>,
}

impl EngineOutput {
    fn extend(&mut self, other: EngineOutput) {
        self.findings.extend(other.findings);
        self.diagnostics.extend(other.diagnostics);
    }
}

/// Detector pass that is live for the current class.
struct ClassPass<'a> {
    detector: &'a dyn Detector,
    pass: Box<dyn DetectorPass + 'a>,
}

/// Per-method view of a class pass; findings stay buffered until the method completes.
struct MethodPass<'p, 'a> {
    entry: &'p mut ClassPass<'a>,
    findings: Vec<Finding>,
    failed: bool,
}

impl Engine {
    pub(crate) fn new() -> Self {
        Self {
            detectors: all_detectors(),
        }
    }

    /// Engine restricted to the named detectors; an unknown id is an error.
    pub(crate) fn with_detector_ids(ids: &[String]) -> Result<Self> {
        let mut detectors = all_detectors();
        if ids.is_empty() {
            return Ok(Self { detectors });
        }
        for id in ids {
            if !detectors.iter().any(|detector| detector.metadata().id == id) {
                let known: Vec<&str> = detectors
                    .iter()
                    .map(|detector| detector.metadata().id)
                    .collect();
                anyhow::bail!("unknown detector id: {id} (known: {})", known.join(", "));
            }
        }
        detectors.retain(|detector| ids.iter().any(|id| id == detector.metadata().id));
        Ok(Self { detectors })
    }

    #[cfg(test)]
    pub(crate) fn from_detectors(mut detectors: Vec<Box<dyn Detector>>) -> Self {
        detectors.sort_by(|a, b| a.metadata().id.cmp(b.metadata().id));
        Self { detectors }
    }

    pub(crate) fn detectors(&self) -> &[Box<dyn Detector>] {
        &self.detectors
    }

    /// Analyze classes independently in parallel; output is sorted.
    pub(crate) fn analyze(&self, classes: &[Class]) -> EngineOutput {
        let per_class: Vec<EngineOutput> = classes
            .par_iter()
            .map(|class| self.analyze_class(class))
            .collect();
        let mut output = EngineOutput::default();
        for class_output in per_class {
            output.extend(class_output);
        }
        sort_findings(&mut output.findings);
        output
    }

    pub(crate) fn analyze_class(&self, class: &Class) -> EngineOutput {
        with_span("class", &class.name, || {
            let mut output = EngineOutput::default();
            let mut passes: Vec<ClassPass<'_>> = self
                .detectors
                .iter()
                .filter_map(|detector| {
                    detector.start_class(class).map(|pass| ClassPass {
                        detector: detector.as_ref(),
                        pass,
                    })
                })
                .collect();
            if passes.is_empty() {
                return output;
            }
            for method in class.methods.iter().filter(|method| method.has_body()) {
                analyze_method(class, method, &mut passes, &mut output);
            }
            for entry in &mut passes {
                entry.pass.on_class_exit(&mut output.findings);
            }
            output
        })
    }
}

fn analyze_method(
    class: &Class,
    method: &Method,
    passes: &mut [ClassPass<'_>],
    output: &mut EngineOutput,
) {
    let opcodes = method.opcode_set();
    let mut active: Vec<MethodPass<'_, '_>> = passes
        .iter_mut()
        .filter(|entry| entry.detector.prescreen(method, &opcodes))
        .map(|entry| MethodPass {
            entry,
            findings: Vec::new(),
            failed: false,
        })
        .collect();
    if active.is_empty() {
        return;
    }
    for method_pass in &mut active {
        method_pass.entry.pass.on_method_enter(method);
    }

    match simulate(class, method, &mut active, &mut output.diagnostics) {
        Ok(()) => {
            for method_pass in active.into_iter().filter(|p| !p.failed) {
                method_pass.entry.pass.on_method_exit(method);
                output.findings.extend(method_pass.findings);
            }
        }
        Err((offset, fault)) => {
            warn!(
                class = %class.name,
                method = %format_args!("{}{}", method.name, method.descriptor),
                offset,
                "abandoning method: {fault}"
            );
            output.diagnostics.push(AnalysisDiagnostic {
                class_name: class.name.clone(),
                method: Some(format!("{}{}", method.name, method.descriptor)),
                detector: None,
                offset: Some(offset),
                message: fault.to_string(),
            });
            for method_pass in active.into_iter().filter(|p| !p.failed) {
                method_pass.entry.pass.on_method_abandoned(method);
            }
        }
    }
}

/// Walk the instruction stream once, offering each instruction to every
/// live detector pass before applying its effect to the stack.
fn simulate(
    class: &Class,
    method: &Method,
    active: &mut [MethodPass<'_, '_>],
    diagnostics: &mut Vec<AnalysisDiagnostic>,
) -> Result<(), (u32, StackFault)> {
    let trace = debug_stack_enabled();
    let mut stack = SymbolicStack::new(method.max_stack.map(usize::from));
    let mut previous_falls_through = true;
    let loop_heads: BTreeSet<u32> = method
        .instructions
        .iter()
        .flat_map(|inst| {
            inst.jump_targets()
                .into_iter()
                .filter(move |target| *target <= inst.offset)
        })
        .collect();

    for inst in &method.instructions {
        let at = |fault: StackFault| (inst.offset, fault);
        let is_handler = method.handler_offsets.contains(&inst.offset);
        stack
            .arrive(inst.offset, previous_falls_through, is_handler)
            .map_err(at)?;
        if loop_heads.contains(&inst.offset) && !is_handler {
            stack.forget_slots();
        }
        let effect = stack_effect(inst).map_err(at)?;
        if trace {
            debug!(
                method = %method.name,
                offset = inst.offset,
                opcode = format_args!("0x{:02x}", inst.opcode),
                depth = stack.depth(),
                top = ?stack.peek(0),
                "stack before instruction"
            );
        }

        let step = Step {
            class,
            method,
            instruction: inst,
            stack: &stack,
            effect,
        };
        for method_pass in active.iter_mut().filter(|p| !p.failed) {
            if let Err(err) = method_pass
                .entry
                .pass
                .on_instruction(&step, &mut method_pass.findings)
            {
                let detector = method_pass.entry.detector.metadata().id;
                warn!(
                    class = %class.name,
                    method = %method.name,
                    detector,
                    offset = inst.offset,
                    "detector disabled for method: {err:#}"
                );
                diagnostics.push(AnalysisDiagnostic {
                    class_name: class.name.clone(),
                    method: Some(format!("{}{}", method.name, method.descriptor)),
                    detector: Some(detector),
                    offset: Some(inst.offset),
                    message: format!("{err:#}"),
                });
                method_pass.failed = true;
                method_pass.findings.clear();
                method_pass.entry.pass.on_method_abandoned(method);
            }
        }

        let depth_before = stack.depth();
        apply(&mut stack, inst).map_err(at)?;
        debug_assert_eq!(
            stack.depth() + effect.pops,
            depth_before + effect.pushes,
            "stack effect mismatch at offset {}",
            inst.offset
        );
        for target in inst.jump_targets() {
            // Back-edge targets were widened on arrival.
            if target > inst.offset {
                stack.record_jump(target).map_err(at)?;
            }
        }
        previous_falls_through = opcodes::falls_through(inst.opcode);
    }
    Ok(())
}
