use anyhow::Result;

use crate::descriptor::call_shape;
use crate::detectors::{Detector, DetectorMetadata, DetectorPass, RuleMetadata, Step};
use crate::finding::{Finding, Priority};
use crate::ir::{Class, Method};
use crate::opcodes::{self, OpcodeSet};

const SIDE_EFFECT_CONSTRUCTOR: RuleMetadata = RuleMetadata {
    id: "SEC_SIDE_EFFECT_CONSTRUCTOR",
    name: "Side effect constructor",
    description: "Object is constructed and immediately discarded; the constructor is only used for its side effects",
    priority: Priority::Normal,
};

const RULES: &[RuleMetadata] = &[SIDE_EFFECT_CONSTRUCTOR];

/// Object constructed at `offset` and still sitting on top of a stack of
/// `depth` slots.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Candidate {
    offset: u32,
    depth: usize,
}

/// What happens to a pending candidate at one instruction.
#[derive(Debug, Eq, PartialEq)]
enum Outcome {
    Pending(Candidate),
    Discarded(Candidate),
    Consumed,
}

fn follow(candidate: Candidate, step: &Step<'_>) -> Outcome {
    let depth = step.stack.depth();
    let on_top = depth == candidate.depth;
    match step.opcode() {
        opcodes::POP | opcodes::RETURN if on_top => Outcome::Discarded(candidate),
        _ if depth.saturating_sub(step.effect.pops) < candidate.depth => {
            Outcome::Consumed
        }
        _ => Outcome::Pending(candidate),
    }
}

/// Effect of a constructor call on a freshly allocated object.
enum Construction {
    /// The surviving copy stays on the stack and must be followed.
    Kept(Candidate),
    /// No copy survives the call.
    Dropped,
}

fn construction(step: &Step<'_>) -> Result<Option<Construction>> {
    if step.opcode() != opcodes::INVOKESPECIAL {
        return Ok(None);
    }
    let Some(call) = step.instruction.call() else {
        return Ok(None);
    };
    if call.name != "<init>" {
        return Ok(None);
    }
    let shape = call_shape(&call.descriptor)?;
    let Some(allocation) = step
        .stack
        .peek(shape.param_slots)
        .and_then(|receiver| receiver.allocation())
    else {
        return Ok(None);
    };
    let depth = step.stack.depth();
    let copy_below = step
        .stack
        .peek(shape.param_slots + 1)
        .and_then(|item| item.allocation())
        == Some(allocation);
    if copy_below {
        return Ok(Some(Construction::Kept(Candidate {
            offset: step.offset(),
            depth: depth - shape.param_slots - 1,
        })));
    }
    let copied_elsewhere = (0..depth)
        .filter(|slot| *slot != shape.param_slots)
        .filter_map(|slot| step.stack.peek(slot))
        .any(|item| item.allocation() == Some(allocation));
    if copied_elsewhere {
        Ok(None)
    } else {
        Ok(Some(Construction::Dropped))
    }
}

/// Detector for `new Foo(...)` whose result is never used.
#[derive(Default)]
pub(crate) struct SideEffectConstructorDetector;

crate::register_detector!(SideEffectConstructorDetector);

impl Detector for SideEffectConstructorDetector {
    fn metadata(&self) -> DetectorMetadata {
        DetectorMetadata {
            id: "SEC",
            name: "Side effect constructor",
            rules: RULES,
        }
    }

    fn prescreen(&self, _method: &Method, opcodes: &OpcodeSet) -> bool {
        opcodes.contains(opcodes::NEW) && opcodes.contains(opcodes::INVOKESPECIAL)
    }

    fn start_class<'a>(&'a self, _class: &'a Class) -> Option<Box<dyn DetectorPass + 'a>> {
        Some(Box::new(SideEffectConstructorPass { pending: None }))
    }
}

struct SideEffectConstructorPass {
    pending: Option<Candidate>,
}

impl DetectorPass for SideEffectConstructorPass {
    fn on_method_enter(&mut self, _method: &Method) {
        self.pending = None;
    }

    fn on_instruction(&mut self, step: &Step<'_>, findings: &mut Vec<Finding>) -> Result<()> {
        if let Some(candidate) = self.pending.take() {
            match follow(candidate, step) {
                Outcome::Pending(candidate) => self.pending = Some(candidate),
                Outcome::Discarded(candidate) => findings.push(discarded_at(step, candidate.offset)),
                Outcome::Consumed => {}
            }
        }
        match construction(step)? {
            Some(Construction::Kept(candidate)) => self.pending = Some(candidate),
            Some(Construction::Dropped) => findings.push(discarded_at(step, step.offset())),
            None => {}
        }
        Ok(())
    }
}

fn discarded_at(step: &Step<'_>, offset: u32) -> Finding {
    let mut finding = step.finding(&SIDE_EFFECT_CONSTRUCTOR, None);
    finding.location.offset = offset;
    finding.location.line = step.method.line_for_offset(offset);
    finding
}
