use anyhow::Result;

use crate::detectors::{Detector, DetectorMetadata, DetectorPass, RuleMetadata, Step};
use crate::finding::{Finding, Priority};
use crate::ir::{Class, Method};
use crate::opcodes::{self, OpcodeSet};

const LITERAL_STRING_COMPARISON: RuleMetadata = RuleMetadata {
    id: "LSC_LITERAL_STRING_COMPARISON",
    name: "Literal string comparison",
    description: "String comparison called on a variable with a literal argument; calling it on the literal is null-safe",
    priority: Priority::Low,
};

const RULES: &[RuleMetadata] = &[LITERAL_STRING_COMPARISON];

/// String methods whose single argument is compared against the receiver.
const COMPARISONS: &[(&str, &str)] = &[
    ("equals", "(Ljava/lang/Object;)Z"),
    ("compareTo", "(Ljava/lang/String;)I"),
    ("equalsIgnoreCase", "(Ljava/lang/String;)Z"),
];

/// Detector for `s.equals("literal")` where `"literal".equals(s)` avoids a
/// null dereference.
#[derive(Default)]
pub(crate) struct LiteralStringComparisonDetector;

crate::register_detector!(LiteralStringComparisonDetector);

impl Detector for LiteralStringComparisonDetector {
    fn metadata(&self) -> DetectorMetadata {
        DetectorMetadata {
            id: "LSC",
            name: "Literal string comparison",
            rules: RULES,
        }
    }

    fn prescreen(&self, _method: &Method, opcodes: &OpcodeSet) -> bool {
        opcodes.contains_any(&[opcodes::LDC, opcodes::LDC_W])
    }

    fn start_class<'a>(&'a self, _class: &'a Class) -> Option<Box<dyn DetectorPass + 'a>> {
        Some(Box::new(LiteralStringComparisonPass))
    }
}

struct LiteralStringComparisonPass;

impl DetectorPass for LiteralStringComparisonPass {
    fn on_instruction(&mut self, step: &Step<'_>, findings: &mut Vec<Finding>) -> Result<()> {
        if step.opcode() != opcodes::INVOKEVIRTUAL {
            return Ok(());
        }
        let Some(call) = step.instruction.call() else {
            return Ok(());
        };
        if call.owner != "java/lang/String" || !is_comparison(&call.name, &call.descriptor) {
            return Ok(());
        }
        let argument_is_literal = step
            .stack
            .peek(0)
            .and_then(|item| item.string_constant())
            .is_some();
        if argument_is_literal {
            findings.push(step.finding(&LITERAL_STRING_COMPARISON, None));
        }
        Ok(())
    }
}

fn is_comparison(name: &str, descriptor: &str) -> bool {
    COMPARISONS
        .iter()
        .any(|(candidate, signature)| *candidate == name && *signature == descriptor)
}
