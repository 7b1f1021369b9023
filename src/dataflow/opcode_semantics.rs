use crate::dataflow::stack::{FieldOrigin, StackFault, StackItem, SymbolicStack};
use crate::descriptor::{call_shape, field_slots};
use crate::ir::{CallKind, ConstantValue, Instruction, InstructionKind};
use crate::opcodes;

/// Operand-stack slots an instruction consumes and produces.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct StackEffect {
    pub(crate) pops: usize,
    pub(crate) pushes: usize,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Effect {
    Noop,
    PushConstant { slots: usize },
    LoadLocal { slots: usize },
    Pop(usize),
    PopAndPush { pops: usize, pushes: usize },
    Dup { copy: usize, under: usize },
    Swap,
    GetStatic,
    GetField,
    PutStatic,
    PutField,
    Invoke,
    InvokeDynamic,
    New,
    CheckCast,
    MultiANewArray,
}

fn decode(opcode: u8) -> Option<Effect> {
    let effect = match opcode {
        opcodes::NOP | opcodes::IINC | opcodes::GOTO | opcodes::GOTO_W | opcodes::RET => {
            Effect::Noop
        }
        opcodes::RETURN => Effect::Noop,
        opcodes::ACONST_NULL..=opcodes::ICONST_5
        | opcodes::FCONST_0..=opcodes::FCONST_2
        | opcodes::BIPUSH
        | opcodes::SIPUSH
        | opcodes::LDC
        | opcodes::LDC_W => Effect::PushConstant { slots: 1 },
        opcodes::LCONST_0 | opcodes::LCONST_1 | opcodes::DCONST_0 | opcodes::DCONST_1 => {
            Effect::PushConstant { slots: 2 }
        }
        opcodes::LDC2_W => Effect::PushConstant { slots: 2 },
        opcodes::ILOAD | opcodes::FLOAD | opcodes::ALOAD => Effect::LoadLocal { slots: 1 },
        opcodes::LLOAD | opcodes::DLOAD => Effect::LoadLocal { slots: 2 },
        opcodes::ILOAD_0..=opcodes::ILOAD_3
        | opcodes::FLOAD_0..=opcodes::FLOAD_3
        | opcodes::ALOAD_0..=opcodes::ALOAD_3 => Effect::LoadLocal { slots: 1 },
        opcodes::LLOAD_0..=opcodes::LLOAD_3 | opcodes::DLOAD_0..=opcodes::DLOAD_3 => {
            Effect::LoadLocal { slots: 2 }
        }
        opcodes::IALOAD
        | opcodes::FALOAD
        | opcodes::AALOAD
        | opcodes::BALOAD
        | opcodes::CALOAD
        | opcodes::SALOAD => Effect::PopAndPush { pops: 2, pushes: 1 },
        opcodes::LALOAD | opcodes::DALOAD => Effect::PopAndPush { pops: 2, pushes: 2 },
        opcodes::ISTORE | opcodes::FSTORE | opcodes::ASTORE => Effect::Pop(1),
        opcodes::LSTORE | opcodes::DSTORE => Effect::Pop(2),
        opcodes::ISTORE_0..=opcodes::ISTORE_3
        | opcodes::FSTORE_0..=opcodes::FSTORE_3
        | opcodes::ASTORE_0..=opcodes::ASTORE_3 => Effect::Pop(1),
        opcodes::LSTORE_0..=opcodes::LSTORE_3 | opcodes::DSTORE_0..=opcodes::DSTORE_3 => {
            Effect::Pop(2)
        }
        opcodes::IASTORE
        | opcodes::FASTORE
        | opcodes::AASTORE
        | opcodes::BASTORE
        | opcodes::CASTORE
        | opcodes::SASTORE => Effect::Pop(3),
        opcodes::LASTORE | opcodes::DASTORE => Effect::Pop(4),
        opcodes::POP => Effect::Pop(1),
        opcodes::POP2 => Effect::Pop(2),
        opcodes::DUP => Effect::Dup { copy: 1, under: 0 },
        opcodes::DUP_X1 => Effect::Dup { copy: 1, under: 1 },
        opcodes::DUP_X2 => Effect::Dup { copy: 1, under: 2 },
        opcodes::DUP2 => Effect::Dup { copy: 2, under: 0 },
        opcodes::DUP2_X1 => Effect::Dup { copy: 2, under: 1 },
        opcodes::DUP2_X2 => Effect::Dup { copy: 2, under: 2 },
        opcodes::SWAP => Effect::Swap,
        // add, sub, mul, div and rem cycle through int, long, float, double.
        opcodes::IADD..=0x73 => {
            if (opcode - opcodes::IADD) % 2 == 1 {
                Effect::PopAndPush { pops: 4, pushes: 2 }
            } else {
                Effect::PopAndPush { pops: 2, pushes: 1 }
            }
        }
        opcodes::INEG | opcodes::FNEG => Effect::PopAndPush { pops: 1, pushes: 1 },
        opcodes::LNEG | opcodes::DNEG => Effect::PopAndPush { pops: 2, pushes: 2 },
        opcodes::ISHL | opcodes::ISHR | opcodes::IUSHR => Effect::PopAndPush { pops: 2, pushes: 1 },
        opcodes::LSHL | opcodes::LSHR | opcodes::LUSHR => Effect::PopAndPush { pops: 3, pushes: 2 },
        opcodes::IAND..=opcodes::LXOR => {
            if (opcode - opcodes::IAND) % 2 == 1 {
                Effect::PopAndPush { pops: 4, pushes: 2 }
            } else {
                Effect::PopAndPush { pops: 2, pushes: 1 }
            }
        }
        opcodes::I2F | opcodes::F2I | opcodes::I2B | opcodes::I2C | opcodes::I2S => {
            Effect::PopAndPush { pops: 1, pushes: 1 }
        }
        opcodes::I2L | opcodes::I2D | opcodes::F2L | opcodes::F2D => {
            Effect::PopAndPush { pops: 1, pushes: 2 }
        }
        opcodes::L2I | opcodes::L2F | opcodes::D2I | opcodes::D2F => {
            Effect::PopAndPush { pops: 2, pushes: 1 }
        }
        opcodes::L2D | opcodes::D2L => Effect::PopAndPush { pops: 2, pushes: 2 },
        opcodes::LCMP | opcodes::DCMPL | opcodes::DCMPG => Effect::PopAndPush { pops: 4, pushes: 1 },
        opcodes::FCMPL | opcodes::FCMPG => Effect::PopAndPush { pops: 2, pushes: 1 },
        opcodes::IFEQ..=opcodes::IFLE | opcodes::IFNULL | opcodes::IFNONNULL => Effect::Pop(1),
        opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE => Effect::Pop(2),
        opcodes::JSR | opcodes::JSR_W => Effect::PopAndPush { pops: 0, pushes: 1 },
        opcodes::TABLESWITCH | opcodes::LOOKUPSWITCH => Effect::Pop(1),
        opcodes::IRETURN | opcodes::FRETURN | opcodes::ARETURN => Effect::Pop(1),
        opcodes::LRETURN | opcodes::DRETURN => Effect::Pop(2),
        opcodes::GETSTATIC => Effect::GetStatic,
        opcodes::PUTSTATIC => Effect::PutStatic,
        opcodes::GETFIELD => Effect::GetField,
        opcodes::PUTFIELD => Effect::PutField,
        opcodes::INVOKEVIRTUAL
        | opcodes::INVOKESPECIAL
        | opcodes::INVOKESTATIC
        | opcodes::INVOKEINTERFACE => Effect::Invoke,
        opcodes::INVOKEDYNAMIC => Effect::InvokeDynamic,
        opcodes::NEW => Effect::New,
        opcodes::NEWARRAY | opcodes::ANEWARRAY | opcodes::ARRAYLENGTH | opcodes::INSTANCEOF => {
            Effect::PopAndPush { pops: 1, pushes: 1 }
        }
        opcodes::ATHROW | opcodes::MONITORENTER | opcodes::MONITOREXIT => Effect::Pop(1),
        opcodes::CHECKCAST => Effect::CheckCast,
        opcodes::MULTIANEWARRAY => Effect::MultiANewArray,
        _ => return None,
    };
    Some(effect)
}

/// Slots popped and pushed by `inst`, derived from its opcode and resolved operand.
pub(crate) fn stack_effect(inst: &Instruction) -> Result<StackEffect, StackFault> {
    let effect = decode(inst.opcode).ok_or(StackFault::UnsupportedOpcode(inst.opcode))?;
    let (pops, pushes) = match effect {
        Effect::Noop => (0, 0),
        Effect::PushConstant { slots } | Effect::LoadLocal { slots } => (0, slots),
        Effect::Pop(count) => (count, 0),
        Effect::PopAndPush { pops, pushes } => (pops, pushes),
        Effect::Dup { copy, under } => (copy + under, copy * 2 + under),
        Effect::Swap => (2, 2),
        Effect::GetStatic => (0, field_width(inst)?),
        Effect::GetField => (1, field_width(inst)?),
        Effect::PutStatic => (field_width(inst)?, 0),
        Effect::PutField => (1 + field_width(inst)?, 0),
        Effect::Invoke => {
            let call = inst
                .call()
                .ok_or_else(|| missing_operand(inst, "call site"))?;
            let shape = call_shape(&call.descriptor)
                .map_err(|err| StackFault::Descriptor(format!("{err:#}")))?;
            let receiver = usize::from(call.kind.has_receiver());
            (shape.param_slots + receiver, shape.return_slots)
        }
        Effect::InvokeDynamic => {
            let InstructionKind::InvokeDynamic { descriptor, .. } = &inst.kind else {
                return Err(missing_operand(inst, "dynamic call site"));
            };
            let shape = call_shape(descriptor)
                .map_err(|err| StackFault::Descriptor(format!("{err:#}")))?;
            (shape.param_slots, shape.return_slots)
        }
        Effect::New => (0, 1),
        Effect::CheckCast => (1, 1),
        Effect::MultiANewArray => {
            let InstructionKind::MultiANewArray { dimensions, .. } = &inst.kind else {
                return Err(missing_operand(inst, "array dimensions"));
            };
            (usize::from(*dimensions), 1)
        }
    };
    Ok(StackEffect { pops, pushes })
}

/// Apply `inst` to `stack`, carrying constants, local and field provenance,
/// and fresh allocations through the instructions that preserve them.
pub(crate) fn apply(stack: &mut SymbolicStack, inst: &Instruction) -> Result<(), StackFault> {
    let effect = decode(inst.opcode).ok_or(StackFault::UnsupportedOpcode(inst.opcode))?;
    let shape = stack_effect(inst)?;
    match effect {
        Effect::Noop => {}
        Effect::PushConstant { slots } => {
            let value = inst
                .constant()
                .cloned()
                .or_else(|| implicit_constant(inst.opcode))
                .unwrap_or(ConstantValue::Opaque);
            stack.push_value(StackItem::constant(value), slots)?;
        }
        Effect::LoadLocal { slots } => {
            let item = inst
                .local_index()
                .or_else(|| opcodes::implicit_local_index(inst.opcode))
                .map(StackItem::local)
                .unwrap_or_else(StackItem::unknown);
            stack.push_value(item, slots)?;
        }
        Effect::Dup { copy, under } => stack.dup(copy, under)?,
        Effect::Swap => stack.swap()?,
        Effect::GetStatic | Effect::GetField => {
            let receiver = if effect == Effect::GetField {
                Some(Box::new(stack.pop_one()?.provenance().clone()))
            } else {
                None
            };
            let field = inst
                .field()
                .cloned()
                .ok_or_else(|| missing_operand(inst, "field reference"))?;
            let origin = FieldOrigin {
                field,
                is_static: receiver.is_none(),
                receiver,
            };
            stack.push_value(StackItem::field(origin), shape.pushes)?;
        }
        Effect::Invoke => {
            let call = inst
                .call()
                .ok_or_else(|| missing_operand(inst, "call site"))?;
            let popped = stack.pop(shape.pops)?;
            if call.kind == CallKind::Special && call.name == "<init>" {
                if let Some(offset) = popped.last().and_then(StackItem::allocation) {
                    stack.replace_allocation(offset, &StackItem::unknown());
                }
            }
            push_unknown(stack, shape.pushes)?;
        }
        Effect::New => stack.push(StackItem::fresh(inst.offset))?,
        Effect::CheckCast => {
            if stack.is_empty() {
                return Err(StackFault::Underflow {
                    needed: 1,
                    depth: 0,
                });
            }
        }
        Effect::Pop(_)
        | Effect::PopAndPush { .. }
        | Effect::PutStatic
        | Effect::PutField
        | Effect::InvokeDynamic
        | Effect::MultiANewArray => {
            stack.pop(shape.pops)?;
            push_unknown(stack, shape.pushes)?;
        }
    }
    Ok(())
}

fn push_unknown(stack: &mut SymbolicStack, slots: usize) -> Result<(), StackFault> {
    match slots {
        0 => Ok(()),
        slots => stack.push_value(StackItem::unknown(), slots),
    }
}

fn field_width(inst: &Instruction) -> Result<usize, StackFault> {
    inst.field()
        .map(|field| field_slots(&field.descriptor))
        .ok_or_else(|| missing_operand(inst, "field reference"))
}

fn missing_operand(inst: &Instruction, what: &str) -> StackFault {
    StackFault::Descriptor(format!(
        "opcode 0x{:02x} at offset {} has no {what}",
        inst.opcode, inst.offset
    ))
}

/// Value pushed by the constant-load opcodes that carry it in the opcode itself.
pub(crate) fn implicit_constant(opcode: u8) -> Option<ConstantValue> {
    let value = match opcode {
        opcodes::ACONST_NULL => ConstantValue::Null,
        opcodes::ICONST_M1..=opcodes::ICONST_5 => {
            ConstantValue::Int(i32::from(opcode) - i32::from(opcodes::ICONST_0))
        }
        opcodes::LCONST_0 | opcodes::LCONST_1 => {
            ConstantValue::Long(i64::from(opcode - opcodes::LCONST_0))
        }
        opcodes::FCONST_0..=opcodes::FCONST_2 => {
            ConstantValue::Float(f32::from(opcode - opcodes::FCONST_0))
        }
        opcodes::DCONST_0 | opcodes::DCONST_1 => {
            ConstantValue::Double(f64::from(opcode - opcodes::DCONST_0))
        }
        _ => return None,
    };
    Some(value)
}
