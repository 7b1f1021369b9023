use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use jclassfile::fields::FieldFlags;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::dataflow::opcode_semantics::implicit_constant;
use crate::ir::{
    CallKind, CallSite, Class, ConstantValue, Field, FieldAccess, FieldRef, Instruction,
    InstructionKind, LineNumber, Method,
};
use crate::opcodes;

/// Classes decoded from every input, in deterministic order.
pub(crate) struct ScanOutput {
    pub(crate) classes: Vec<Class>,
    pub(crate) class_count: usize,
    pub(crate) skipped: Vec<String>,
}

pub(crate) fn scan_inputs(inputs: &[PathBuf]) -> Result<ScanOutput> {
    let mut output = ScanOutput {
        classes: Vec::new(),
        class_count: 0,
        skipped: Vec::new(),
    };
    for input in inputs {
        scan_path(input, true, &mut output)?;
    }
    Ok(output)
}

fn scan_path(path: &Path, strict: bool, output: &mut ScanOutput) -> Result<()> {
    if path.is_dir() {
        return scan_dir(path, output);
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "class" if strict => scan_class_file(path, output),
        "class" => {
            if let Err(err) = scan_class_file(path, output) {
                warn!(path = %path.display(), "skipping undecodable class: {err:#}");
                output.skipped.push(path.display().to_string());
            }
            Ok(())
        }
        "jar" => scan_jar_file(path, output),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                Ok(())
            }
        }
    }
}

fn scan_dir(path: &Path, output: &mut ScanOutput) -> Result<()> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
    {
        let entry =
            entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
        entries.push(entry.path());
    }

    entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));

    for entry in entries {
        if entry.is_dir() {
            scan_dir(&entry, output)?;
        } else {
            scan_path(&entry, false, output)?;
        }
    }

    Ok(())
}

fn scan_class_file(path: &Path, output: &mut ScanOutput) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let class = parse_class_bytes(&data, Some(path_to_uri(path)))
        .with_context(|| format!("failed to parse {}", path.display()))?;
    debug!(class = %class.name, path = %path.display(), "decoded class file");
    output.class_count += 1;
    output.classes.push(class);
    Ok(())
}

fn scan_jar_file(path: &Path, output: &mut ScanOutput) -> Result<()> {
    let file =
        fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    let jar_uri = path_to_uri(path);

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class")
            && !name.ends_with("module-info.class")
            && !name.starts_with("META-INF/versions/")
        {
            entry_names.push(name);
        }
    }

    entry_names.sort();

    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let uri = format!("jar:{jar_uri}!/{name}");
        match parse_class_bytes(&data, Some(uri)) {
            Ok(class) => {
                output.class_count += 1;
                output.classes.push(class);
            }
            Err(err) => {
                warn!(jar = %path.display(), entry = %name, "skipping undecodable class: {err:#}");
                output.skipped.push(format!("{}:{}", path.display(), name));
            }
        }
    }

    Ok(())
}

fn path_to_uri(path: &Path) -> String {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(path)
    };
    format!("file://{}", absolute.to_string_lossy())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Decode one class file into the instruction-stream representation.
pub(crate) fn parse_class_bytes(data: &[u8], artifact_uri: Option<String>) -> Result<Class> {
    let major_version = read_major_version(data)?;
    let class_file = class_file::parse(data).context("failed to parse class file bytes")?;
    let constant_pool = class_file.constant_pool();
    let name =
        resolve_class_name(constant_pool, class_file.this_class()).context("resolve class name")?;
    let fields = parse_fields(constant_pool, class_file.fields()).context("parse fields")?;
    let methods =
        parse_methods(constant_pool, class_file.methods()).context("parse method bytecode")?;

    Ok(Class {
        name,
        major_version,
        fields,
        methods,
        artifact_uri,
    })
}

fn read_major_version(data: &[u8]) -> Result<u16> {
    let magic = read_u32(data, 0).context("class file header")?;
    if magic != 0xCAFEBABE {
        anyhow::bail!("invalid class file magic");
    }
    read_u16(data, 6).context("class file version")
}

fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}

fn parse_fields(
    constant_pool: &[ConstantPool],
    fields: &[jclassfile::fields::FieldInfo],
) -> Result<Vec<Field>> {
    let mut parsed = Vec::new();
    for field in fields {
        let name = resolve_utf8(constant_pool, field.name_index()).context("resolve field name")?;
        let descriptor = resolve_utf8(constant_pool, field.descriptor_index())
            .context("resolve field descriptor")?;
        let access = FieldAccess {
            is_static: field.access_flags().contains(FieldFlags::ACC_STATIC),
        };
        parsed.push(Field {
            name,
            descriptor,
            access,
        });
    }
    Ok(parsed)
}

fn parse_methods(
    constant_pool: &[ConstantPool],
    methods: &[jclassfile::methods::MethodInfo],
) -> Result<Vec<Method>> {
    let mut parsed = Vec::new();
    for method in methods {
        let name =
            resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
        let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
            .context("resolve method descriptor")?;
        let code = method
            .attributes()
            .iter()
            .find_map(|attribute| match attribute {
                jclassfile::attributes::Attribute::Code {
                    max_stack,
                    code,
                    exception_table,
                    attributes,
                    ..
                } => Some((*max_stack, code, exception_table, attributes)),
                _ => None,
            });
        let Some((max_stack, code, exception_table, code_attributes)) = code else {
            parsed.push(Method {
                name,
                descriptor,
                max_stack: None,
                instructions: Vec::new(),
                line_numbers: Vec::new(),
                handler_offsets: Vec::new(),
            });
            continue;
        };
        let instructions = parse_bytecode(code, constant_pool)
            .with_context(|| format!("parse bytecode of {name}{descriptor}"))?;
        let mut handler_offsets: Vec<u32> = exception_table
            .iter()
            .map(|entry| entry.handler_pc() as u32)
            .collect();
        handler_offsets.sort_unstable();
        handler_offsets.dedup();
        parsed.push(Method {
            name,
            descriptor,
            max_stack: Some(max_stack),
            instructions,
            line_numbers: parse_line_numbers(code_attributes),
            handler_offsets,
        });
    }
    Ok(parsed)
}

fn parse_line_numbers(attributes: &[jclassfile::attributes::Attribute]) -> Vec<LineNumber> {
    let mut entries = Vec::new();
    for attribute in attributes {
        let jclassfile::attributes::Attribute::LineNumberTable { line_number_table } = attribute
        else {
            continue;
        };
        for record in line_number_table {
            entries.push(LineNumber {
                start_pc: record.start_pc() as u32,
                line: record.line_number() as u32,
            });
        }
    }
    entries.sort_by_key(|entry| entry.start_pc);
    entries
}

pub(crate) fn parse_bytecode(code: &[u8], constant_pool: &[ConstantPool]) -> Result<Vec<Instruction>> {
    let mut instructions = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let start_offset = offset as u32;
        let length = opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {}", offset);
        }
        let (opcode, kind) = match opcode {
            opcodes::INVOKEVIRTUAL
            | opcodes::INVOKESPECIAL
            | opcodes::INVOKESTATIC
            | opcodes::INVOKEINTERFACE => {
                let method_index = read_u16(code, offset + 1)?;
                let (owner, name, descriptor) = resolve_member_ref(constant_pool, method_index)
                    .context("resolve method ref")?;
                let call_kind = match opcode {
                    opcodes::INVOKESPECIAL => CallKind::Special,
                    opcodes::INVOKESTATIC => CallKind::Static,
                    opcodes::INVOKEINTERFACE => CallKind::Interface,
                    _ => CallKind::Virtual,
                };
                let call = CallSite {
                    owner,
                    name,
                    descriptor,
                    kind: call_kind,
                };
                (opcode, InstructionKind::Invoke(call))
            }
            opcodes::INVOKEDYNAMIC => {
                let index = read_u16(code, offset + 1)?;
                let (name, descriptor) = resolve_dynamic(constant_pool, index)
                    .context("resolve invokedynamic")?;
                (opcode, InstructionKind::InvokeDynamic { name, descriptor })
            }
            opcodes::GETSTATIC | opcodes::PUTSTATIC | opcodes::GETFIELD | opcodes::PUTFIELD => {
                let index = read_u16(code, offset + 1)?;
                let (owner, name, descriptor) =
                    resolve_member_ref(constant_pool, index).context("resolve field ref")?;
                (
                    opcode,
                    InstructionKind::Field(FieldRef {
                        owner,
                        name,
                        descriptor,
                    }),
                )
            }
            opcodes::BIPUSH => {
                let value = code.get(offset + 1).copied().context("bipush operand")? as i8;
                (
                    opcode,
                    InstructionKind::Constant(ConstantValue::Int(i32::from(value))),
                )
            }
            opcodes::SIPUSH => {
                let value = read_u16(code, offset + 1)? as i16;
                (
                    opcode,
                    InstructionKind::Constant(ConstantValue::Int(i32::from(value))),
                )
            }
            opcodes::LDC => {
                let index = code.get(offset + 1).copied().context("ldc index")? as u16;
                (
                    opcode,
                    InstructionKind::Constant(resolve_constant(constant_pool, index)?),
                )
            }
            opcodes::LDC_W | opcodes::LDC2_W => {
                let index = read_u16(code, offset + 1)?;
                (
                    opcode,
                    InstructionKind::Constant(resolve_constant(constant_pool, index)?),
                )
            }
            opcodes::ACONST_NULL..=opcodes::DCONST_1 => match implicit_constant(opcode) {
                Some(value) => (opcode, InstructionKind::Constant(value)),
                None => (opcode, InstructionKind::Other),
            },
            opcodes::ILOAD..=opcodes::ALOAD
            | opcodes::ISTORE..=opcodes::ASTORE
            | opcodes::IINC
            | opcodes::RET => {
                let index = code.get(offset + 1).copied().context("local index")?;
                (opcode, InstructionKind::Local(u16::from(index)))
            }
            opcodes::WIDE => {
                let inner = code.get(offset + 1).copied().context("missing wide opcode")?;
                let index = read_u16(code, offset + 2)?;
                (inner, InstructionKind::Local(index))
            }
            opcodes::IFEQ..=opcodes::JSR | opcodes::IFNULL | opcodes::IFNONNULL => {
                let delta = read_u16(code, offset + 1)? as i16;
                (opcode, InstructionKind::Branch(branch_target(offset, i32::from(delta))?))
            }
            opcodes::GOTO_W | opcodes::JSR_W => {
                let delta = read_i32(code, offset + 1)?;
                (opcode, InstructionKind::Branch(branch_target(offset, delta)?))
            }
            opcodes::TABLESWITCH => (opcode, tableswitch_targets(code, offset)?),
            opcodes::LOOKUPSWITCH => (opcode, lookupswitch_targets(code, offset)?),
            opcodes::NEW | opcodes::ANEWARRAY | opcodes::CHECKCAST | opcodes::INSTANCEOF => {
                let index = read_u16(code, offset + 1)?;
                let class_name =
                    resolve_class_name(constant_pool, index).context("resolve type operand")?;
                (opcode, InstructionKind::TypeRef(class_name))
            }
            opcodes::MULTIANEWARRAY => {
                let index = read_u16(code, offset + 1)?;
                let class_name =
                    resolve_class_name(constant_pool, index).context("resolve array type")?;
                let dimensions = code.get(offset + 3).copied().context("array dimensions")?;
                (
                    opcode,
                    InstructionKind::MultiANewArray {
                        class_name,
                        dimensions,
                    },
                )
            }
            _ => match opcodes::implicit_local_index(opcode) {
                Some(index) => (opcode, InstructionKind::Local(index)),
                None => (opcode, InstructionKind::Other),
            },
        };

        instructions.push(Instruction {
            offset: start_offset,
            opcode,
            kind,
        });
        offset += length;
    }
    Ok(instructions)
}

/// Owner, name and descriptor of a field or method reference.
fn resolve_member_ref(
    constant_pool: &[ConstantPool],
    index: u16,
) -> Result<(String, String, String)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing member ref entry")?;
    let (class_index, name_and_type_index) = match entry {
        ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        }
        | ConstantPool::InterfaceMethodref {
            class_index,
            name_and_type_index,
        }
        | ConstantPool::Fieldref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        _ => anyhow::bail!("unexpected member ref entry"),
    };
    let owner = resolve_class_name(constant_pool, class_index).context("resolve owner")?;
    let (name, descriptor) = resolve_name_and_type(constant_pool, name_and_type_index)?;
    Ok((owner, name, descriptor))
}

fn resolve_dynamic(constant_pool: &[ConstantPool], index: u16) -> Result<(String, String)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing invokedynamic entry")?;
    match entry {
        ConstantPool::InvokeDynamic {
            name_and_type_index,
            ..
        } => resolve_name_and_type(constant_pool, *name_and_type_index),
        _ => anyhow::bail!("unexpected invokedynamic entry"),
    }
}

fn resolve_name_and_type(constant_pool: &[ConstantPool], index: u16) -> Result<(String, String)> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing name and type entry")?;
    match entry {
        ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } => {
            let name = resolve_utf8(constant_pool, *name_index).context("resolve member name")?;
            let descriptor = resolve_utf8(constant_pool, *descriptor_index)
                .context("resolve member descriptor")?;
            Ok((name, descriptor))
        }
        _ => anyhow::bail!("unexpected name and type entry"),
    }
}

/// Literal loaded by `ldc`; kinds without a literal form stay opaque.
fn resolve_constant(constant_pool: &[ConstantPool], index: u16) -> Result<ConstantValue> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing constant pool entry")?;
    let value = match entry {
        ConstantPool::String { string_index } => {
            ConstantValue::String(resolve_utf8(constant_pool, *string_index)?)
        }
        ConstantPool::Integer { value } => ConstantValue::Int(*value),
        ConstantPool::Float { value } => ConstantValue::Float(*value),
        ConstantPool::Long { value } => ConstantValue::Long(*value),
        ConstantPool::Double { value } => ConstantValue::Double(*value),
        ConstantPool::Class { name_index } => {
            ConstantValue::Class(resolve_utf8(constant_pool, *name_index)?)
        }
        _ => ConstantValue::Opaque,
    };
    Ok(value)
}

fn branch_target(offset: usize, delta: i32) -> Result<u32> {
    let target = offset as i64 + i64::from(delta);
    u32::try_from(target).with_context(|| format!("branch target {target} out of range"))
}

fn tableswitch_targets(code: &[u8], offset: usize) -> Result<InstructionKind> {
    let base = offset + 1 + padding(offset);
    let default = branch_target(offset, read_i32(code, base)?)?;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    let mut targets = Vec::with_capacity(count.max(0) as usize);
    for entry in 0..count.max(0) as usize {
        let delta = read_i32(code, base + 12 + entry * 4)?;
        targets.push(branch_target(offset, delta)?);
    }
    Ok(InstructionKind::Switch { default, targets })
}

fn lookupswitch_targets(code: &[u8], offset: usize) -> Result<InstructionKind> {
    let base = offset + 1 + padding(offset);
    let default = branch_target(offset, read_i32(code, base)?)?;
    let npairs = read_i32(code, base + 4)?;
    let mut targets = Vec::with_capacity(npairs.max(0) as usize);
    for pair in 0..npairs.max(0) as usize {
        let delta = read_i32(code, base + 8 + pair * 8 + 4)?;
        targets.push(branch_target(offset, delta)?);
    }
    Ok(InstructionKind::Switch { default, targets })
}

pub(crate) fn opcode_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code[offset];
    let length = match opcode {
        0x00..=0x0f => 1,
        opcodes::BIPUSH => 2,
        opcodes::SIPUSH => 3,
        opcodes::LDC => 2,
        opcodes::LDC_W | opcodes::LDC2_W => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        opcodes::IINC => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        opcodes::RET => 2,
        opcodes::TABLESWITCH => tableswitch_length(code, offset)?,
        opcodes::LOOKUPSWITCH => lookupswitch_length(code, offset)?,
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
        opcodes::NEW => 3,
        opcodes::NEWARRAY => 2,
        opcodes::ANEWARRAY => 3,
        opcodes::ARRAYLENGTH | opcodes::ATHROW => 1,
        opcodes::CHECKCAST | opcodes::INSTANCEOF => 3,
        opcodes::MONITORENTER | opcodes::MONITOREXIT => 1,
        opcodes::WIDE => wide_length(code, offset)?,
        opcodes::MULTIANEWARRAY => 4,
        opcodes::IFNULL | opcodes::IFNONNULL => 3,
        opcodes::GOTO_W | opcodes::JSR_W => 5,
        0xca | 0xfe | 0xff => 1,
        _ => anyhow::bail!("unsupported opcode 0x{:02x}", opcode),
    };
    Ok(length)
}

fn tableswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = high
        .checked_sub(low)
        .and_then(|v| v.checked_add(1))
        .context("invalid tableswitch range")?;
    if count < 0 {
        anyhow::bail!("invalid tableswitch range");
    }
    Ok(1 + padding + 12 + (count as usize) * 4)
}

fn lookupswitch_length(code: &[u8], offset: usize) -> Result<usize> {
    let padding = padding(offset);
    let base = offset + 1 + padding;
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        anyhow::bail!("invalid lookupswitch pairs");
    }
    Ok(1 + padding + 8 + (npairs as usize) * 8)
}

fn wide_length(code: &[u8], offset: usize) -> Result<usize> {
    let opcode = code
        .get(offset + 1)
        .copied()
        .context("missing wide opcode")?;
    if opcode == opcodes::IINC { Ok(6) } else { Ok(4) }
}

pub(crate) fn padding(offset: usize) -> usize {
    (4 - ((offset + 1) % 4)) % 4
}

pub(crate) fn read_u16(code: &[u8], offset: usize) -> Result<u16> {
    let slice = code
        .get(offset..offset + 2)
        .context("bytecode u16 out of bounds")?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

pub(crate) fn read_u32(code: &[u8], offset: usize) -> Result<u32> {
    let slice = code
        .get(offset..offset + 4)
        .context("bytecode u32 out of bounds")?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i32(code: &[u8], offset: usize) -> Result<i32> {
    let value = read_u32(code, offset)?;
    Ok(i32::from_be_bytes(value.to_be_bytes()))
}
