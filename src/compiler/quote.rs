//! Rebuilding quoted data at run time.
use super::{method::MethodBuilder, CompileError};
use crate::{
    classfile::{
        insn::{Loadable, Op, TypeOp},
        Insn,
    },
    runtime::{self, KEYWORD, OBJECT, SYMBOL},
    value::Value,
};

/// Emits code leaving `datum` on the stack, as a runtime object.
pub fn emit(m: &mut MethodBuilder, datum: &Value) -> Result<(), CompileError> {
    match datum {
        Value::Nil => m.emit(Insn::Op(Op::AconstNull)),
        Value::Int(n) => {
            m.emit(Insn::PushLong(*n));
            m.emit(runtime::box_long());
        }
        Value::Str(text) => m.emit(Insn::Ldc(Loadable::String(text.to_string()))),
        Value::Symbol(sym) => m.emit_all(runtime::construct_named(SYMBOL, sym.name())),
        Value::Keyword(kw) => m.emit_all(runtime::construct_named(KEYWORD, kw.name())),
        Value::Seq(seq) if seq.is_empty() => m.emit(runtime::empty_seq()),
        Value::Seq(seq) => {
            let len = i32::try_from(seq.len())
                .map_err(|_| CompileError::syntax("quote", "list too long"))?;
            m.emit(Insn::PushInt(len));
            m.emit(Insn::Type(TypeOp::ANewArray, OBJECT.into()));
            for (i, item) in seq.iter().enumerate() {
                m.emit(Insn::Op(Op::Dup));
                m.emit(Insn::PushInt(i as i32));
                emit(m, item)?;
                m.emit(Insn::Op(Op::Aastore));
            }
            m.emit(Insn::PushInt(0));
            m.emit(runtime::array_seq());
        }
        Value::Function(_) | Value::Macro(_) => {
            return Err(CompileError::Unquotable(datum.type_name()))
        }
    }
    Ok(())
}
