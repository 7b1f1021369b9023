use std::collections::BTreeSet;

use anyhow::Result;

use crate::detectors::{Detector, DetectorMetadata, DetectorPass, RuleMetadata, Step};
use crate::finding::{Finding, Priority};
use crate::ir::{Class, InstructionKind, Method};
use crate::opcodes::{self, OpcodeSet};

const AUTOBOXING_CTOR: RuleMetadata = RuleMetadata {
    id: "NAB_NEEDLESS_AUTOBOXING_CTOR",
    name: "Needless autoboxing via constructor",
    description: "Primitive value extracted from a box is passed straight to the same box type's constructor",
    priority: Priority::Normal,
};

const AUTOBOXING_VALUEOF: RuleMetadata = RuleMetadata {
    id: "NAB_NEEDLESS_AUTOBOXING_VALUEOF",
    name: "Needless autoboxing via valueOf",
    description: "Primitive value extracted from a box is passed straight to the same box type's valueOf",
    priority: Priority::Normal,
};

const BOX_TO_UNBOX: RuleMetadata = RuleMetadata {
    id: "NAB_NEEDLESS_BOX_TO_UNBOX",
    name: "Needless box to unbox",
    description: "Primitive value is boxed only to be unboxed again",
    priority: Priority::Normal,
};

const BOX_TO_CAST: RuleMetadata = RuleMetadata {
    id: "NAB_NEEDLESS_BOX_TO_CAST",
    name: "Needless box to cast",
    description: "Primitive value is boxed only to be converted to another primitive; a cast is enough",
    priority: Priority::Normal,
};

const BOXING_PARSE: RuleMetadata = RuleMetadata {
    id: "NAB_NEEDLESS_BOXING_PARSE",
    name: "Needless boxing of parsed string",
    description: "valueOf(String) is immediately unboxed; use the parse method instead",
    priority: Priority::Normal,
};

const BOXING_VALUEOF: RuleMetadata = RuleMetadata {
    id: "NAB_NEEDLESS_BOXING_VALUEOF",
    name: "Needless parse before valueOf",
    description: "Parsed primitive is immediately boxed with valueOf; use valueOf(String) instead",
    priority: Priority::Normal,
};

const BOXING_STRING_CTOR: RuleMetadata = RuleMetadata {
    id: "NAB_NEEDLESS_BOXING_STRING_CTOR",
    name: "Needless parse before constructor",
    description: "Parsed primitive is immediately passed to the box constructor; use valueOf(String) instead",
    priority: Priority::Normal,
};

const BOOLEAN_CONSTANT_CONVERSION: RuleMetadata = RuleMetadata {
    id: "NAB_NEEDLESS_BOOLEAN_CONSTANT_CONVERSION",
    name: "Needless boolean constant conversion",
    description: "Boolean constant converted between primitive and boxed form; use Boolean.TRUE/FALSE or true/false directly",
    priority: Priority::Normal,
};

const RULES: &[RuleMetadata] = &[
    AUTOBOXING_CTOR,
    AUTOBOXING_VALUEOF,
    BOX_TO_UNBOX,
    BOX_TO_CAST,
    BOXING_PARSE,
    BOXING_VALUEOF,
    BOXING_STRING_CTOR,
    BOOLEAN_CONSTANT_CONVERSION,
];

const BOOLEAN: &str = "java/lang/Boolean";

/// First class-file major version with `Boolean.valueOf(String)` (Java 5).
const JAVA_5_MAJOR: u16 = 49;

/// Method signatures that box, unbox and parse one primitive wrapper type.
#[derive(Debug, Eq, PartialEq)]
struct BoxType {
    class_name: &'static str,
    unbox: (&'static str, &'static str),
    ctor: &'static str,
    value_of: &'static str,
    parse: Option<(&'static str, &'static str)>,
}

const BOX_TYPES: &[BoxType] = &[
    BoxType {
        class_name: BOOLEAN,
        unbox: ("booleanValue", "()Z"),
        ctor: "(Z)V",
        value_of: "(Z)Ljava/lang/Boolean;",
        parse: Some(("parseBoolean", "(Ljava/lang/String;)Z")),
    },
    BoxType {
        class_name: "java/lang/Character",
        unbox: ("charValue", "()C"),
        ctor: "(C)V",
        value_of: "(C)Ljava/lang/Character;",
        parse: None,
    },
    BoxType {
        class_name: "java/lang/Byte",
        unbox: ("byteValue", "()B"),
        ctor: "(B)V",
        value_of: "(B)Ljava/lang/Byte;",
        parse: Some(("parseByte", "(Ljava/lang/String;)B")),
    },
    BoxType {
        class_name: "java/lang/Short",
        unbox: ("shortValue", "()S"),
        ctor: "(S)V",
        value_of: "(S)Ljava/lang/Short;",
        parse: Some(("parseShort", "(Ljava/lang/String;)S")),
    },
    BoxType {
        class_name: "java/lang/Integer",
        unbox: ("intValue", "()I"),
        ctor: "(I)V",
        value_of: "(I)Ljava/lang/Integer;",
        parse: Some(("parseInt", "(Ljava/lang/String;)I")),
    },
    BoxType {
        class_name: "java/lang/Long",
        unbox: ("longValue", "()J"),
        ctor: "(J)V",
        value_of: "(J)Ljava/lang/Long;",
        parse: Some(("parseLong", "(Ljava/lang/String;)J")),
    },
    BoxType {
        class_name: "java/lang/Float",
        unbox: ("floatValue", "()F"),
        ctor: "(F)V",
        value_of: "(F)Ljava/lang/Float;",
        parse: Some(("parseFloat", "(Ljava/lang/String;)F")),
    },
    BoxType {
        class_name: "java/lang/Double",
        unbox: ("doubleValue", "()D"),
        ctor: "(D)V",
        value_of: "(D)Ljava/lang/Double;",
        parse: Some(("parseDouble", "(Ljava/lang/String;)D")),
    },
];

fn box_type(class_name: &str) -> Option<&'static BoxType> {
    BOX_TYPES.iter().find(|box_type| box_type.class_name == class_name)
}

/// What the previous instruction left on top of the stack, as far as
/// boxing is concerned.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Nothing,
    /// `xxxValue()` unboxed a wrapper.
    Unboxed(&'static BoxType),
    /// `parseXxx(String)` produced a primitive.
    Parsed(&'static BoxType),
    /// The wrapper constructor boxed a primitive.
    BoxedByCtor(&'static BoxType),
    /// `valueOf(primitive)` boxed a primitive.
    BoxedFromPrimitive(&'static BoxType),
    /// `valueOf(String)` parsed into a wrapper.
    BoxedFromString(&'static BoxType),
    /// `iconst_0` or `iconst_1`.
    BooleanLiteral,
    /// `Boolean.TRUE` or `Boolean.FALSE`.
    BooleanConstant,
}

/// Outcome of feeding one instruction to the state machine.
struct Transition {
    state: State,
    rule: Option<&'static RuleMetadata>,
    /// Join point of a conditional expression whose arms must not be chained.
    ternary_target: Option<u32>,
}

impl Transition {
    fn to(state: State) -> Self {
        Self {
            state,
            rule: None,
            ternary_target: None,
        }
    }

    fn report(rule: &'static RuleMetadata) -> Self {
        Self {
            state: State::Nothing,
            rule: Some(rule),
            ternary_target: None,
        }
    }
}

fn transition(state: State, step: &Step<'_>) -> Transition {
    match state {
        State::Nothing => start(step),
        State::Unboxed(boxed) => {
            if calls(step, opcodes::INVOKESPECIAL, boxed.class_name, "<init>", boxed.ctor) {
                Transition::report(&AUTOBOXING_CTOR)
            } else if calls(step, opcodes::INVOKESTATIC, boxed.class_name, "valueOf", boxed.value_of) {
                Transition::report(&AUTOBOXING_VALUEOF)
            } else {
                Transition::to(State::Nothing)
            }
        }
        State::BoxedByCtor(boxed) | State::BoxedFromPrimitive(boxed) => {
            let (name, descriptor) = boxed.unbox;
            if calls(step, opcodes::INVOKEVIRTUAL, boxed.class_name, name, descriptor) {
                return Transition::report(&BOX_TO_UNBOX);
            }
            let converts = step.opcode() == opcodes::INVOKEVIRTUAL
                && step.instruction.call().is_some_and(|call| {
                    call.owner == boxed.class_name
                        && call.descriptor.starts_with("()")
                        && call.name.ends_with("Value")
                });
            if converts {
                Transition::report(&BOX_TO_CAST)
            } else {
                Transition::to(State::Nothing)
            }
        }
        State::BoxedFromString(boxed) => {
            let (name, descriptor) = boxed.unbox;
            if calls(step, opcodes::INVOKEVIRTUAL, boxed.class_name, name, descriptor) {
                Transition::report(&BOXING_PARSE)
            } else {
                Transition::to(State::Nothing)
            }
        }
        State::Parsed(boxed) => {
            let Some(call) = step.instruction.call() else {
                return Transition::to(State::Nothing);
            };
            if call.owner != boxed.class_name {
                return Transition::to(State::Nothing);
            }
            match step.opcode() {
                opcodes::INVOKESTATIC if call.name == "valueOf" => {
                    Transition::report(&BOXING_VALUEOF)
                }
                opcodes::INVOKESPECIAL if call.name == "<init>" => {
                    Transition::report(&BOXING_STRING_CTOR)
                }
                _ => Transition::to(State::Nothing),
            }
        }
        State::BooleanLiteral => {
            let matched = calls(
                step,
                opcodes::INVOKESTATIC,
                BOOLEAN,
                "valueOf",
                "(Z)Ljava/lang/Boolean;",
            );
            restart(step, matched)
        }
        State::BooleanConstant => {
            let matched = calls(step, opcodes::INVOKEVIRTUAL, BOOLEAN, "booleanValue", "()Z");
            restart(step, matched)
        }
    }
}

/// Leave a constant-tracking state: the instruction may itself start a
/// new sequence, so it is fed again from [`State::Nothing`].
fn restart(step: &Step<'_>, matched: bool) -> Transition {
    let mut next = start(step);
    if matched {
        next.rule = Some(&BOOLEAN_CONSTANT_CONVERSION);
    }
    next
}

fn start(step: &Step<'_>) -> Transition {
    match step.opcode() {
        opcodes::INVOKEVIRTUAL => match boxed_call(step) {
            Some((boxed, name, descriptor)) if boxed.unbox == (name, descriptor) => {
                Transition::to(State::Unboxed(boxed))
            }
            _ => Transition::to(State::Nothing),
        },
        opcodes::INVOKESTATIC => match boxed_call(step) {
            Some((boxed, "valueOf", descriptor)) => {
                if descriptor.starts_with("(Ljava/lang/String;)") {
                    let supported = boxed.class_name != BOOLEAN
                        || step.class.major_version >= JAVA_5_MAJOR;
                    if supported {
                        return Transition::to(State::BoxedFromString(boxed));
                    }
                } else if !descriptor.starts_with("(Ljava/lang/String;") {
                    return Transition::to(State::BoxedFromPrimitive(boxed));
                }
                Transition::to(State::Nothing)
            }
            Some((boxed, name, descriptor)) if boxed.parse == Some((name, descriptor)) => {
                Transition::to(State::Parsed(boxed))
            }
            _ => Transition::to(State::Nothing),
        },
        opcodes::INVOKESPECIAL => match boxed_call(step) {
            Some((boxed, "<init>", descriptor)) if boxed.ctor == descriptor => {
                Transition::to(State::BoxedByCtor(boxed))
            }
            _ => Transition::to(State::Nothing),
        },
        opcodes::ICONST_0 | opcodes::ICONST_1 => Transition::to(State::BooleanLiteral),
        opcodes::GETSTATIC => {
            let is_constant = step.instruction.field().is_some_and(|field| {
                field.owner == BOOLEAN && matches!(field.name.as_str(), "TRUE" | "FALSE")
            });
            if is_constant {
                Transition::to(State::BooleanConstant)
            } else {
                Transition::to(State::Nothing)
            }
        }
        opcodes::GOTO | opcodes::GOTO_W if !step.stack.is_empty() => {
            let ternary_target = match step.instruction.kind {
                InstructionKind::Branch(target) => Some(target),
                _ => None,
            };
            Transition {
                ternary_target,
                ..Transition::to(State::Nothing)
            }
        }
        _ => Transition::to(State::Nothing),
    }
}

/// Wrapper type, name and descriptor of a call on a primitive wrapper.
fn boxed_call<'s>(step: &'s Step<'_>) -> Option<(&'static BoxType, &'s str, &'s str)> {
    let call = step.instruction.call()?;
    let boxed = box_type(&call.owner)?;
    Some((boxed, call.name.as_str(), call.descriptor.as_str()))
}

fn calls(step: &Step<'_>, opcode: u8, owner: &str, name: &str, descriptor: &str) -> bool {
    step.opcode() == opcode
        && step.instruction.call().is_some_and(|call| {
            call.owner == owner && call.name == name && call.descriptor == descriptor
        })
}

/// Detector for primitive values that are boxed and unboxed back to back.
#[derive(Default)]
pub(crate) struct NeedlessAutoboxingDetector;

crate::register_detector!(NeedlessAutoboxingDetector);

impl Detector for NeedlessAutoboxingDetector {
    fn metadata(&self) -> DetectorMetadata {
        DetectorMetadata {
            id: "NAB",
            name: "Needless autoboxing",
            rules: RULES,
        }
    }

    fn prescreen(&self, _method: &Method, opcodes: &OpcodeSet) -> bool {
        opcodes.contains_any(&[
            opcodes::INVOKEVIRTUAL,
            opcodes::INVOKESTATIC,
            opcodes::INVOKESPECIAL,
        ])
    }

    fn start_class<'a>(&'a self, _class: &'a Class) -> Option<Box<dyn DetectorPass + 'a>> {
        Some(Box::new(NeedlessAutoboxingPass {
            state: State::Nothing,
            ternary_targets: BTreeSet::new(),
        }))
    }
}

struct NeedlessAutoboxingPass {
    state: State,
    ternary_targets: BTreeSet<u32>,
}

impl DetectorPass for NeedlessAutoboxingPass {
    fn on_method_enter(&mut self, _method: &Method) {
        self.state = State::Nothing;
        self.ternary_targets.clear();
    }

    fn on_instruction(&mut self, step: &Step<'_>, findings: &mut Vec<Finding>) -> Result<()> {
        if self.ternary_targets.remove(&step.offset()) {
            self.state = State::Nothing;
            return Ok(());
        }
        let next = transition(self.state, step);
        if let Some(rule) = next.rule {
            findings.push(step.finding(rule, None));
        }
        if let Some(target) = next.ternary_target {
            self.ternary_targets.insert(target);
        }
        self.state = next.state;
        Ok(())
    }
}
