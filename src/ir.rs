use crate::opcodes::OpcodeSet;

/// Intermediate representation for a decoded JVM class.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) major_version: u16,
    pub(crate) fields: Vec<Field>,
    pub(crate) methods: Vec<Method>,
    pub(crate) artifact_uri: Option<String>,
}

/// Declared field of a class.
#[derive(Clone, Debug)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: FieldAccess,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FieldAccess {
    pub(crate) is_static: bool,
}

/// Intermediate representation for a method and its decoded instruction stream.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) max_stack: Option<u16>,
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) line_numbers: Vec<LineNumber>,
    pub(crate) handler_offsets: Vec<u32>,
}

/// Line number table entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct LineNumber {
    pub(crate) start_pc: u32,
    pub(crate) line: u32,
}

impl Method {
    pub(crate) fn has_body(&self) -> bool {
        !self.instructions.is_empty()
    }

    pub(crate) fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub(crate) fn is_class_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    /// Opcode-presence summary used by detector prescreens.
    pub(crate) fn opcode_set(&self) -> OpcodeSet {
        self.instructions.iter().map(|inst| inst.opcode).collect()
    }

    pub(crate) fn line_for_offset(&self, offset: u32) -> Option<u32> {
        let mut line = None;
        for entry in &self.line_numbers {
            if entry.start_pc > offset {
                break;
            }
            line = Some(entry.line);
        }
        line
    }
}

/// Bytecode instruction with its resolved operands.
#[derive(Clone, Debug)]
pub(crate) struct Instruction {
    pub(crate) offset: u32,
    pub(crate) opcode: u8,
    pub(crate) kind: InstructionKind,
}

/// Operand shapes an instruction may carry once the constant pool is resolved.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum InstructionKind {
    Invoke(CallSite),
    InvokeDynamic { name: String, descriptor: String },
    Field(FieldRef),
    Constant(ConstantValue),
    Local(u16),
    Branch(u32),
    Switch { default: u32, targets: Vec<u32> },
    TypeRef(String),
    MultiANewArray { class_name: String, dimensions: u8 },
    Other,
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
}

/// Invocation opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

impl CallKind {
    pub(crate) fn has_receiver(self) -> bool {
        !matches!(self, CallKind::Static)
    }
}

/// Resolved field reference operand of get/put instructions.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct FieldRef {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
}

/// Literal value a constant-load instruction pushes.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ConstantValue {
    Null,
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Class(String),
    /// Constant-pool entry the decoder could not turn into a literal.
    Opaque,
}

impl ConstantValue {
    pub(crate) fn as_string(&self) -> Option<&str> {
        match self {
            ConstantValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl Instruction {
    pub(crate) fn call(&self) -> Option<&CallSite> {
        match &self.kind {
            InstructionKind::Invoke(call) => Some(call),
            _ => None,
        }
    }

    pub(crate) fn field(&self) -> Option<&FieldRef> {
        match &self.kind {
            InstructionKind::Field(field) => Some(field),
            _ => None,
        }
    }

    pub(crate) fn constant(&self) -> Option<&ConstantValue> {
        match &self.kind {
            InstructionKind::Constant(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn local_index(&self) -> Option<u16> {
        match &self.kind {
            InstructionKind::Local(index) => Some(*index),
            _ => None,
        }
    }

    /// Every offset control may transfer to other than the next instruction.
    pub(crate) fn jump_targets(&self) -> Vec<u32> {
        match &self.kind {
            InstructionKind::Branch(target) => vec![*target],
            InstructionKind::Switch { default, targets } => {
                let mut all = Vec::with_capacity(targets.len() + 1);
                all.push(*default);
                all.extend(targets.iter().copied());
                all
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes;

    fn method_with_lines(lines: Vec<LineNumber>) -> Method {
        Method {
            name: "methodX".to_string(),
            descriptor: "()V".to_string(),
            max_stack: None,
            instructions: vec![
                Instruction {
                    offset: 0,
                    opcode: opcodes::NOP,
                    kind: InstructionKind::Other,
                },
                Instruction {
                    offset: 4,
                    opcode: opcodes::RETURN,
                    kind: InstructionKind::Other,
                },
            ],
            line_numbers: lines,
            handler_offsets: Vec::new(),
        }
    }

    #[test]
    fn line_for_offset_picks_enclosing_entry() {
        let method = method_with_lines(vec![
            LineNumber {
                start_pc: 0,
                line: 10,
            },
            LineNumber {
                start_pc: 4,
                line: 12,
            },
        ]);
        assert_eq!(method.line_for_offset(0), Some(10));
        assert_eq!(method.line_for_offset(3), Some(10));
        assert_eq!(method.line_for_offset(4), Some(12));
    }

    #[test]
    fn switch_targets_include_default() {
        let inst = Instruction {
            offset: 0,
            opcode: opcodes::TABLESWITCH,
            kind: InstructionKind::Switch {
                default: 40,
                targets: vec![20, 30],
            },
        };
        assert_eq!(inst.jump_targets(), vec![40, 20, 30]);
    }
}
