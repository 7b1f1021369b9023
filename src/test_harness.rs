use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::dataflow::opcode_semantics::{apply, stack_effect};
use crate::dataflow::stack::{StackItem, SymbolicStack};
use crate::detectors::{DetectorPass, Step};
use crate::engine::{Engine, EngineOutput};
use crate::finding::Finding;
use crate::ir::{
    CallKind, CallSite, Class, ConstantValue, Field, FieldAccess, FieldRef, Instruction,
    InstructionKind, LineNumber, Method,
};
use crate::opcodes;
use crate::scan::scan_inputs;

/// Assembles a method body instruction by instruction, tracking offsets the
/// way the class-file encoding lays them out.
pub(crate) struct MethodBuilder {
    name: String,
    descriptor: String,
    max_stack: Option<u16>,
    instructions: Vec<Instruction>,
    next_offset: u32,
    labels: BTreeMap<String, u32>,
    fixups: Vec<(usize, String)>,
    line_numbers: Vec<LineNumber>,
    handler_labels: Vec<String>,
}

impl MethodBuilder {
    pub(crate) fn new(name: &str, descriptor: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            max_stack: None,
            instructions: Vec::new(),
            next_offset: 0,
            labels: BTreeMap::new(),
            fixups: Vec::new(),
            line_numbers: Vec::new(),
            handler_labels: Vec::new(),
        }
    }

    pub(crate) fn max_stack(mut self, max_stack: u16) -> Self {
        self.max_stack = Some(max_stack);
        self
    }

    fn emit(mut self, opcode: u8, kind: InstructionKind, length: u32) -> Self {
        self.instructions.push(Instruction {
            offset: self.next_offset,
            opcode,
            kind,
        });
        self.next_offset += length;
        self
    }

    /// Single-byte instruction without operands.
    pub(crate) fn op(self, opcode: u8) -> Self {
        let kind = match opcodes::implicit_local_index(opcode) {
            Some(index) => InstructionKind::Local(index),
            None => InstructionKind::Other,
        };
        self.emit(opcode, kind, 1)
    }

    pub(crate) fn aload(self, index: u16) -> Self {
        match index {
            0..=3 => self.emit(
                opcodes::ALOAD_0 + index as u8,
                InstructionKind::Local(index),
                1,
            ),
            _ => self.emit(opcodes::ALOAD, InstructionKind::Local(index), 2),
        }
    }

    pub(crate) fn astore(self, index: u16) -> Self {
        match index {
            0..=3 => self.emit(
                opcodes::ASTORE_0 + index as u8,
                InstructionKind::Local(index),
                1,
            ),
            _ => self.emit(opcodes::ASTORE, InstructionKind::Local(index), 2),
        }
    }

    pub(crate) fn iload(self, index: u16) -> Self {
        match index {
            0..=3 => self.emit(
                opcodes::ILOAD_0 + index as u8,
                InstructionKind::Local(index),
                1,
            ),
            _ => self.emit(opcodes::ILOAD, InstructionKind::Local(index), 2),
        }
    }

    pub(crate) fn iconst(self, value: i32) -> Self {
        match value {
            -1..=5 => self.emit(
                (i32::from(opcodes::ICONST_0) + value) as u8,
                InstructionKind::Constant(ConstantValue::Int(value)),
                1,
            ),
            _ => self.emit(
                opcodes::BIPUSH,
                InstructionKind::Constant(ConstantValue::Int(value)),
                2,
            ),
        }
    }

    pub(crate) fn ldc_string(self, value: &str) -> Self {
        self.emit(
            opcodes::LDC,
            InstructionKind::Constant(ConstantValue::String(value.to_string())),
            2,
        )
    }

    pub(crate) fn invoke(self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Self {
        let kind = match opcode {
            opcodes::INVOKESPECIAL => CallKind::Special,
            opcodes::INVOKESTATIC => CallKind::Static,
            opcodes::INVOKEINTERFACE => CallKind::Interface,
            _ => CallKind::Virtual,
        };
        let length = if opcode == opcodes::INVOKEINTERFACE { 5 } else { 3 };
        self.emit(
            opcode,
            InstructionKind::Invoke(CallSite {
                owner: owner.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
                kind,
            }),
            length,
        )
    }

    pub(crate) fn invokevirtual(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.invoke(opcodes::INVOKEVIRTUAL, owner, name, descriptor)
    }

    pub(crate) fn invokestatic(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.invoke(opcodes::INVOKESTATIC, owner, name, descriptor)
    }

    pub(crate) fn invokespecial(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.invoke(opcodes::INVOKESPECIAL, owner, name, descriptor)
    }

    pub(crate) fn invokeinterface(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.invoke(opcodes::INVOKEINTERFACE, owner, name, descriptor)
    }

    pub(crate) fn field(self, opcode: u8, owner: &str, name: &str, descriptor: &str) -> Self {
        self.emit(
            opcode,
            InstructionKind::Field(FieldRef {
                owner: owner.to_string(),
                name: name.to_string(),
                descriptor: descriptor.to_string(),
            }),
            3,
        )
    }

    pub(crate) fn getstatic(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.field(opcodes::GETSTATIC, owner, name, descriptor)
    }

    pub(crate) fn getfield(self, owner: &str, name: &str, descriptor: &str) -> Self {
        self.field(opcodes::GETFIELD, owner, name, descriptor)
    }

    pub(crate) fn new_object(self, class_name: &str) -> Self {
        self.emit(
            opcodes::NEW,
            InstructionKind::TypeRef(class_name.to_string()),
            3,
        )
    }

    /// Jump to `label`, which may be defined later.
    pub(crate) fn jump(mut self, opcode: u8, label: &str) -> Self {
        self.fixups
            .push((self.instructions.len(), label.to_string()));
        self.emit(opcode, InstructionKind::Branch(0), 3)
    }

    /// Name the offset of the next instruction.
    pub(crate) fn label(mut self, label: &str) -> Self {
        self.labels.insert(label.to_string(), self.next_offset);
        self
    }

    /// Mark the next instruction as an exception-handler entry.
    pub(crate) fn handler(mut self) -> Self {
        let label = format!("handler{}", self.handler_labels.len());
        self.handler_labels.push(label.clone());
        self.label(&label)
    }

    pub(crate) fn line(mut self, line: u32) -> Self {
        self.line_numbers.push(LineNumber {
            start_pc: self.next_offset,
            line,
        });
        self
    }

    pub(crate) fn build(mut self) -> Method {
        for (index, label) in &self.fixups {
            let target = *self
                .labels
                .get(label)
                .unwrap_or_else(|| panic!("undefined label {label}"));
            self.instructions[*index].kind = InstructionKind::Branch(target);
        }
        let handler_offsets = self
            .handler_labels
            .iter()
            .map(|label| self.labels[label])
            .collect();
        Method {
            name: self.name,
            descriptor: self.descriptor,
            max_stack: self.max_stack,
            instructions: self.instructions,
            line_numbers: self.line_numbers,
            handler_offsets,
        }
    }
}

/// Assembles a class for detector tests.
pub(crate) struct ClassBuilder {
    class: Class,
}

impl ClassBuilder {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            class: Class {
                name: name.to_string(),
                major_version: 52,
                fields: Vec::new(),
                methods: Vec::new(),
                artifact_uri: None,
            },
        }
    }

    pub(crate) fn major_version(mut self, major_version: u16) -> Self {
        self.class.major_version = major_version;
        self
    }

    pub(crate) fn static_field(mut self, name: &str, descriptor: &str) -> Self {
        self.class.fields.push(Field {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: FieldAccess { is_static: true },
        });
        self
    }

    pub(crate) fn instance_field(mut self, name: &str, descriptor: &str) -> Self {
        self.class.fields.push(Field {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access: FieldAccess { is_static: false },
        });
        self
    }

    pub(crate) fn method(mut self, method: MethodBuilder) -> Self {
        self.class.methods.push(method.build());
        self
    }

    pub(crate) fn build(self) -> Class {
        self.class
    }
}

/// Run every registered detector over `classes`.
pub(crate) fn analyze_classes(classes: &[Class]) -> EngineOutput {
    Engine::new().analyze(classes)
}

/// Rule ids reported for `classes`, filtered to those starting with `prefix`.
pub(crate) fn reported_rules(classes: &[Class], prefix: &str) -> Vec<&'static str> {
    analyze_classes(classes)
        .findings
        .iter()
        .map(|finding| finding.rule_id)
        .filter(|rule_id| rule_id.starts_with(prefix))
        .collect()
}

/// Feed the straight-line body of `method` to one detector pass the way the
/// engine does, starting from `entry` instead of an empty stack.
pub(crate) fn replay_method<'a>(
    pass: &mut Box<dyn DetectorPass + 'a>,
    class: &Class,
    method: &Method,
    entry: Vec<StackItem>,
) -> Result<Vec<Finding>> {
    let mut stack = SymbolicStack::new(None);
    for item in entry {
        stack.push(item)?;
    }
    pass.on_method_enter(method);
    let mut findings = Vec::new();
    for instruction in &method.instructions {
        let effect = stack_effect(instruction)?;
        let step = Step {
            class,
            method,
            instruction,
            stack: &stack,
            effect,
        };
        pass.on_instruction(&step, &mut findings)?;
        apply(&mut stack, instruction)
            .with_context(|| format!("apply instruction at {}", instruction.offset))?;
    }
    pass.on_method_exit(method);
    Ok(findings)
}

/// Minimal class-file writer for decoder tests.
pub(crate) struct ClassFileBuilder {
    constants: Vec<Vec<u8>>,
    utf8_indexes: BTreeMap<String, u16>,
    this_class: u16,
    super_class: u16,
    fields: Vec<Vec<u8>>,
    methods: Vec<Vec<u8>>,
}

impl ClassFileBuilder {
    pub(crate) fn new(name: &str) -> Self {
        let mut builder = Self {
            constants: Vec::new(),
            utf8_indexes: BTreeMap::new(),
            this_class: 0,
            super_class: 0,
            fields: Vec::new(),
            methods: Vec::new(),
        };
        builder.this_class = builder.class(name);
        builder.super_class = builder.class("java/lang/Object");
        builder
    }

    fn push_constant(&mut self, bytes: Vec<u8>) -> u16 {
        self.constants.push(bytes);
        self.constants.len() as u16
    }

    pub(crate) fn utf8(&mut self, value: &str) -> u16 {
        if let Some(index) = self.utf8_indexes.get(value) {
            return *index;
        }
        let mut bytes = vec![1];
        bytes.extend_from_slice(&(value.len() as u16).to_be_bytes());
        bytes.extend_from_slice(value.as_bytes());
        let index = self.push_constant(bytes);
        self.utf8_indexes.insert(value.to_string(), index);
        index
    }

    pub(crate) fn class(&mut self, name: &str) -> u16 {
        let name_index = self.utf8(name);
        let mut bytes = vec![7];
        bytes.extend_from_slice(&name_index.to_be_bytes());
        self.push_constant(bytes)
    }

    pub(crate) fn string(&mut self, value: &str) -> u16 {
        let value_index = self.utf8(value);
        let mut bytes = vec![8];
        bytes.extend_from_slice(&value_index.to_be_bytes());
        self.push_constant(bytes)
    }

    fn name_and_type(&mut self, name: &str, descriptor: &str) -> u16 {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut bytes = vec![12];
        bytes.extend_from_slice(&name_index.to_be_bytes());
        bytes.extend_from_slice(&descriptor_index.to_be_bytes());
        self.push_constant(bytes)
    }

    pub(crate) fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> u16 {
        let class_index = self.class(owner);
        let nat_index = self.name_and_type(name, descriptor);
        let mut bytes = vec![10];
        bytes.extend_from_slice(&class_index.to_be_bytes());
        bytes.extend_from_slice(&nat_index.to_be_bytes());
        self.push_constant(bytes)
    }

    pub(crate) fn static_field(&mut self, name: &str, descriptor: &str) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0x0008u16.to_be_bytes());
        bytes.extend_from_slice(&name_index.to_be_bytes());
        bytes.extend_from_slice(&descriptor_index.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        self.fields.push(bytes);
    }

    /// Add a method with a `Code` attribute and a line-number table.
    pub(crate) fn method(
        &mut self,
        name: &str,
        descriptor: &str,
        is_static: bool,
        max_stack: u16,
        code: Vec<u8>,
        lines: &[(u16, u16)],
    ) {
        let name_index = self.utf8(name);
        let descriptor_index = self.utf8(descriptor);
        let code_name = self.utf8("Code");
        let lines_name = self.utf8("LineNumberTable");

        let mut line_table = Vec::new();
        line_table.extend_from_slice(&(lines.len() as u16).to_be_bytes());
        for (start_pc, line) in lines {
            line_table.extend_from_slice(&start_pc.to_be_bytes());
            line_table.extend_from_slice(&line.to_be_bytes());
        }

        let mut code_attr = Vec::new();
        code_attr.extend_from_slice(&max_stack.to_be_bytes());
        code_attr.extend_from_slice(&4u16.to_be_bytes());
        code_attr.extend_from_slice(&(code.len() as u32).to_be_bytes());
        code_attr.extend_from_slice(&code);
        code_attr.extend_from_slice(&0u16.to_be_bytes());
        code_attr.extend_from_slice(&1u16.to_be_bytes());
        code_attr.extend_from_slice(&lines_name.to_be_bytes());
        code_attr.extend_from_slice(&(line_table.len() as u32).to_be_bytes());
        code_attr.extend_from_slice(&line_table);

        let access: u16 = if is_static { 0x0009 } else { 0x0001 };
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&access.to_be_bytes());
        bytes.extend_from_slice(&name_index.to_be_bytes());
        bytes.extend_from_slice(&descriptor_index.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&code_name.to_be_bytes());
        bytes.extend_from_slice(&(code_attr.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&code_attr);
        self.methods.push(bytes);
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xCAFEBABEu32.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&52u16.to_be_bytes());
        bytes.extend_from_slice(&(self.constants.len() as u16 + 1).to_be_bytes());
        for constant in &self.constants {
            bytes.extend_from_slice(constant);
        }
        bytes.extend_from_slice(&0x0021u16.to_be_bytes());
        bytes.extend_from_slice(&self.this_class.to_be_bytes());
        bytes.extend_from_slice(&self.super_class.to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(&(self.fields.len() as u16).to_be_bytes());
        for field in &self.fields {
            bytes.extend_from_slice(field);
        }
        bytes.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            bytes.extend_from_slice(method);
        }
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes
    }
}

/// Source file definition for compilation.
pub(crate) struct SourceFile {
    pub(crate) path: String,
    pub(crate) contents: String,
}

/// Test harness that compiles Java sources with `javac` and runs analysis.
pub(crate) struct JvmTestHarness {
    javac: PathBuf,
}

impl JvmTestHarness {
    pub(crate) fn new() -> Result<Self> {
        Ok(Self {
            javac: javac_path()?,
        })
    }

    /// Harness when a JDK is available; tests skip themselves otherwise.
    pub(crate) fn available() -> Option<Self> {
        Self::new().ok()
    }

    pub(crate) fn compile(&self, sources: &[SourceFile]) -> Result<(TempDir, PathBuf)> {
        let temp_dir = tempfile::tempdir().context("create temp dir")?;
        let src_dir = temp_dir.path().join("src");
        let classes_dir = temp_dir.path().join("classes");
        fs::create_dir_all(&src_dir).context("create src dir")?;
        fs::create_dir_all(&classes_dir).context("create classes dir")?;

        let mut source_paths = Vec::new();
        for source in sources {
            let path = src_dir.join(&source.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("create source parent dir")?;
            }
            fs::write(&path, source.contents.as_bytes()).context("write source file")?;
            source_paths.push(path);
        }

        let mut command = Command::new(&self.javac);
        command.arg("-nowarn").arg("-d").arg(&classes_dir);
        command.args(&source_paths);
        run_command(command, "javac")?;

        Ok((temp_dir, classes_dir))
    }

    pub(crate) fn analyze(&self, classes_dir: &Path) -> Result<EngineOutput> {
        let scan = scan_inputs(&[classes_dir.to_path_buf()]).context("scan classes")?;
        Ok(Engine::new().analyze(&scan.classes))
    }

    pub(crate) fn compile_and_analyze(&self, sources: &[SourceFile]) -> Result<EngineOutput> {
        let (_temp_dir, classes_dir) = self.compile(sources)?;
        self.analyze(&classes_dir)
    }
}

fn javac_path() -> Result<PathBuf> {
    let java_home = std::env::var("JAVA_HOME").context("JAVA_HOME not set")?;
    let mut path = PathBuf::from(java_home);
    path.push("bin");
    path.push("javac");
    if cfg!(windows) {
        path.set_extension("exe");
    }
    if !path.exists() {
        anyhow::bail!("javac not found at {}", path.display());
    }
    Ok(path)
}

fn run_command(mut command: Command, label: &str) -> Result<()> {
    let output = command.output().with_context(|| format!("run {label}"))?;
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("{label} failed: stdout={stdout} stderr={stderr}");
    }
    Ok(())
}
