use anyhow::Result;

use crate::descriptor::{parameters_descriptor, return_descriptor};
use crate::detectors::{Detector, DetectorMetadata, DetectorPass, RuleMetadata, Step};
use crate::finding::{Finding, Priority, Subject};
use crate::ir::{Class, FieldRef, Method};
use crate::opcodes::{self, OpcodeSet};

const SUSPICIOUS_GETTER_SETTER_USE: RuleMetadata = RuleMetadata {
    id: "SGSU_SUSPICIOUS_GETTER_SETTER_USE",
    name: "Suspicious getter/setter use",
    description: "Bean property is set to the value just read from the same property of the same bean",
    priority: Priority::Normal,
};

const RULES: &[RuleMetadata] = &[SUSPICIOUS_GETTER_SETTER_USE];

/// Reference to the bean: a local variable, optionally followed by one
/// instance field read from it.
#[derive(Clone, Debug, Eq, PartialEq)]
struct BeanRef {
    local: u16,
    field: Option<FieldRef>,
}

impl BeanRef {
    fn subject(&self) -> Subject {
        match &self.field {
            Some(field) => Subject::Field {
                owner: field.owner.clone(),
                name: field.name.clone(),
                descriptor: field.descriptor.clone(),
            },
            None => Subject::Local { index: self.local },
        }
    }
}

/// Progress through `bean.setX(bean.getX())`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
enum State {
    #[default]
    Nothing,
    /// A reference load. `second` is set once the first reference went
    /// through a field and a second local was loaded.
    Aload { first: BeanRef, second: Option<u16> },
    /// First reference read a field off the loaded local.
    Getfield { first: BeanRef },
    /// The same bean reference is on the stack twice.
    DualLoads { bean: BeanRef },
    /// `getX()` was called on the upper copy.
    GetterCall {
        bean: BeanRef,
        property: String,
        value_type: String,
    },
}

fn transition(state: State, step: &Step<'_>) -> (State, Option<Subject>) {
    let reset = || (start(step), None);
    match state {
        State::Nothing => reset(),
        State::Aload { first, second } => {
            let opcode = step.opcode();
            if let Some(second) = second {
                let same_bean = opcode == opcodes::GETFIELD
                    && second == first.local
                    && step.instruction.field().is_some()
                    && step.instruction.field() == first.field.as_ref();
                if same_bean {
                    (State::DualLoads { bean: first }, None)
                } else {
                    reset()
                }
            } else if opcodes::is_aload(opcode) {
                if step.instruction.local_index() == Some(first.local) {
                    (State::DualLoads { bean: first }, None)
                } else {
                    reset()
                }
            } else if opcode == opcodes::GETFIELD {
                match step.instruction.field() {
                    Some(field) => (
                        State::Getfield {
                            first: BeanRef {
                                local: first.local,
                                field: Some(field.clone()),
                            },
                        },
                        None,
                    ),
                    None => reset(),
                }
            } else {
                reset()
            }
        }
        State::Getfield { first } => {
            if opcodes::is_aload(step.opcode()) {
                match step.instruction.local_index() {
                    Some(local) => (
                        State::Aload {
                            first,
                            second: Some(local),
                        },
                        None,
                    ),
                    None => reset(),
                }
            } else {
                reset()
            }
        }
        State::DualLoads { bean } => match getter(step) {
            Some((property, value_type)) => (
                State::GetterCall {
                    bean,
                    property,
                    value_type,
                },
                None,
            ),
            None => reset(),
        },
        State::GetterCall {
            bean,
            property,
            value_type,
        } => {
            if is_setter(step, &property, &value_type) {
                (State::Nothing, Some(bean.subject()))
            } else {
                reset()
            }
        }
    }
}

/// State entered by `step` with no prior context.
fn start(step: &Step<'_>) -> State {
    if !opcodes::is_aload(step.opcode()) {
        return State::Nothing;
    }
    match step.instruction.local_index() {
        Some(local) => State::Aload {
            first: BeanRef { local, field: None },
            second: None,
        },
        None => State::Nothing,
    }
}

/// Property name and value type of a `getX()` call.
fn getter(step: &Step<'_>) -> Option<(String, String)> {
    if step.opcode() != opcodes::INVOKEVIRTUAL {
        return None;
    }
    let call = step.instruction.call()?;
    let property = call.name.strip_prefix("get")?;
    if parameters_descriptor(&call.descriptor) != Some("") {
        return None;
    }
    let value_type = return_descriptor(&call.descriptor)?;
    if value_type == "V" {
        return None;
    }
    Some((property.to_string(), value_type.to_string()))
}

fn is_setter(step: &Step<'_>, property: &str, value_type: &str) -> bool {
    if step.opcode() != opcodes::INVOKEVIRTUAL {
        return false;
    }
    let Some(call) = step.instruction.call() else {
        return false;
    };
    call.name.strip_prefix("set") == Some(property)
        && parameters_descriptor(&call.descriptor) == Some(value_type)
        && return_descriptor(&call.descriptor) == Some("V")
}

/// Detector for `bean.setX(bean.getX())`.
#[derive(Default)]
pub(crate) struct SuspiciousGetterSetterUseDetector;

crate::register_detector!(SuspiciousGetterSetterUseDetector);

impl Detector for SuspiciousGetterSetterUseDetector {
    fn metadata(&self) -> DetectorMetadata {
        DetectorMetadata {
            id: "SGSU",
            name: "Suspicious getter/setter use",
            rules: RULES,
        }
    }

    fn prescreen(&self, _method: &Method, opcodes: &OpcodeSet) -> bool {
        opcodes.contains(opcodes::INVOKEVIRTUAL)
    }

    fn start_class<'a>(&'a self, _class: &'a Class) -> Option<Box<dyn DetectorPass + 'a>> {
        Some(Box::new(SuspiciousGetterSetterUsePass::default()))
    }
}

#[derive(Default)]
struct SuspiciousGetterSetterUsePass {
    state: State,
}

impl DetectorPass for SuspiciousGetterSetterUsePass {
    fn on_method_enter(&mut self, _method: &Method) {
        self.state = State::Nothing;
    }

    fn on_instruction(&mut self, step: &Step<'_>, findings: &mut Vec<Finding>) -> Result<()> {
        let (next, subject) = transition(std::mem::take(&mut self.state), step);
        if let Some(subject) = subject {
            findings.push(step.finding(&SUSPICIOUS_GETTER_SETTER_USE, Some(subject)));
        }
        self.state = next;
        Ok(())
    }
}
