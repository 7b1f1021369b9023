//! Symbolic operand-stack simulation shared by every detector.

pub(crate) mod opcode_semantics;
pub(crate) mod stack;
