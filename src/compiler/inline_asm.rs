//! The `asm` escape: literal instructions written as keywords and lists.
//!
//! ```text
//! (asm :aconst_null
//!      (:ifnull done)
//!      (unescape (f x))
//!      (:invokestatic "lamina/lang/Rt" "hash" "(Ljava/lang/Object;)I")
//!      (:label done))
//! ```
use std::collections::{HashMap, HashSet};

use super::{method::MethodBuilder, CompileError, Ctx, Unit};
use crate::{
    classfile::{
        insn::{FieldOp, InvokeOp, Jump, Loadable, LocalKind, MemberRef, Op, TypeOp},
        Insn, Label,
    },
    value::{Keyword, Seq, Symbol, Value},
};

fn malformed(insn: &Keyword, message: impl Into<String>) -> CompileError {
    CompileError::syntax("asm", format!("{insn}: {}", message.into()))
}

/// Operands of one list-form instruction, consumed front to back.
struct Operands<'a> {
    insn: &'a Keyword,
    items: std::vec::IntoIter<Value>,
}

impl Operands<'_> {
    fn next(&mut self, what: &str) -> Result<Value, CompileError> {
        self.items
            .next()
            .ok_or_else(|| malformed(self.insn, format!("missing {what}")))
    }

    fn int(&mut self) -> Result<i64, CompileError> {
        let value = self.next("integer operand")?;
        value
            .as_int()
            .ok_or_else(|| malformed(self.insn, format!("expected an integer, found {value}")))
    }

    fn ranged<T: TryFrom<i64>>(&mut self) -> Result<T, CompileError> {
        let value = self.int()?;
        T::try_from(value).map_err(|_| malformed(self.insn, format!("{value} is out of range")))
    }

    fn string(&mut self) -> Result<String, CompileError> {
        let value = self.next("string operand")?;
        value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| malformed(self.insn, format!("expected a string, found {value}")))
    }

    fn symbol(&mut self) -> Result<Symbol, CompileError> {
        let value = self.next("label")?;
        value
            .as_symbol()
            .cloned()
            .ok_or_else(|| malformed(self.insn, format!("expected a label name, found {value}")))
    }

    fn member(&mut self) -> Result<MemberRef, CompileError> {
        Ok(MemberRef::new(self.string()?, self.string()?, self.string()?))
    }

    fn finish(mut self) -> Result<(), CompileError> {
        match self.items.next() {
            Some(extra) => Err(malformed(self.insn, format!("unexpected operand {extra}"))),
            None => Ok(()),
        }
    }
}

/// Labels named inside one `asm` form.
#[derive(Default)]
struct Labels {
    names: HashMap<Symbol, Label>,
    // names some branch of the form refers to, wherever it sits
    branched_to: HashSet<Symbol>,
}

impl Labels {
    /// Collects the label operands of every instruction in `items`, so a
    /// label only reached by a later backward branch is still placed.
    fn scan(items: &Seq) -> Self {
        let mut branched_to = HashSet::new();
        for item in items {
            let Value::Seq(list) = item else { continue };
            match list.first() {
                Some(Value::Keyword(kw)) if kw.name() != "label" => {}
                _ => continue,
            }
            // only label operands are written as symbols
            for operand in &list.rest() {
                if let Value::Symbol(name) = operand {
                    branched_to.insert(name.clone());
                }
            }
        }
        Self {
            names: HashMap::new(),
            branched_to,
        }
    }

    fn get(&mut self, m: &mut MethodBuilder, name: Symbol) -> Label {
        *self.names.entry(name).or_insert_with(|| m.label())
    }

    fn place(&mut self, m: &mut MethodBuilder, name: Symbol) {
        let branched_to = self.branched_to.contains(&name);
        let label = self.get(m, name);
        if branched_to {
            m.bind_targeted(label);
        } else {
            m.bind(label);
        }
    }
}

impl Unit<'_> {
    pub(super) fn asm(
        &mut self,
        m: &mut MethodBuilder,
        ctx: Ctx,
        items: &Seq,
    ) -> Result<(), CompileError> {
        let mut labels = Labels::scan(items);
        for item in items {
            match item {
                Value::Keyword(kw) => {
                    let op = Op::from_mnemonic(kw.name())
                        .ok_or_else(|| CompileError::UnknownInstruction(kw.to_string()))?;
                    m.emit(Insn::Op(op));
                }
                Value::Seq(list) => match list.first() {
                    Some(Value::Symbol(head)) if head.name() == "unescape" => {
                        let [expr] = &list.rest().to_vec()[..] else {
                            return Err(CompileError::syntax(
                                "unescape",
                                "expected exactly one expression",
                            ));
                        };
                        self.expr(m, ctx.non_tail(), expr)?;
                    }
                    Some(Value::Keyword(kw)) => {
                        let operands = Operands {
                            insn: kw,
                            items: list.rest().to_vec().into_iter(),
                        };
                        instruction(m, &mut labels, operands)?;
                    }
                    _ => return Err(CompileError::UnknownInstruction(item.to_string())),
                },
                other => return Err(CompileError::UnknownInstruction(other.to_string())),
            }
        }
        Ok(())
    }
}

fn instruction(
    m: &mut MethodBuilder,
    labels: &mut Labels,
    mut ops: Operands<'_>,
) -> Result<(), CompileError> {
    let keyword = ops.insn;
    let name = keyword.name();
    let insn = if name == "label" {
        let label = ops.symbol()?;
        ops.finish()?;
        labels.place(m, label);
        return Ok(());
    } else if let Some(jump) = Jump::from_mnemonic(name) {
        Insn::Jump(jump, labels.get(m, ops.symbol()?))
    } else if let Some((kind, load)) = LocalKind::from_mnemonic(name) {
        let slot = ops.ranged()?;
        if load {
            Insn::Load(kind, slot)
        } else {
            Insn::Store(kind, slot)
        }
    } else if let Some(op) = TypeOp::from_mnemonic(name) {
        Insn::Type(op, ops.string()?)
    } else if let Some(op) = FieldOp::from_mnemonic(name) {
        Insn::Field(op, ops.member()?)
    } else if let Some(op) = InvokeOp::from_mnemonic(name) {
        Insn::Invoke(op, ops.member()?)
    } else if let Some(op) = Op::from_mnemonic(name) {
        Insn::Op(op)
    } else {
        match name {
            "iconst" | "push" => Insn::PushInt(ops.ranged()?),
            "bipush" => Insn::PushInt(ops.ranged::<i8>()?.into()),
            "sipush" => Insn::PushInt(ops.ranged::<i16>()?.into()),
            "lconst" | "lpush" => Insn::PushLong(ops.int()?),
            "ldc2_w" => Insn::Ldc(Loadable::Long(ops.int()?)),
            "ldc" | "ldc_w" => match ops.next("constant")? {
                Value::Int(n) => Insn::Ldc(Loadable::Int(
                    i32::try_from(n).map_err(|_| malformed(ops.insn, format!("{n} is out of range")))?,
                )),
                Value::Str(text) => Insn::Ldc(Loadable::String(text.to_string())),
                other => return Err(malformed(ops.insn, format!("cannot load {other}"))),
            },
            "tableswitch" => {
                let low = ops.ranged()?;
                let default = labels.get(m, ops.symbol()?);
                let mut targets = Vec::new();
                while let Some(target) = ops.items.next() {
                    let Value::Symbol(target) = target else {
                        return Err(malformed(ops.insn, format!("expected a label, found {target}")));
                    };
                    targets.push(labels.get(m, target));
                }
                Insn::TableSwitch {
                    low,
                    default,
                    targets,
                }
            }
            _ => return Err(CompileError::UnknownInstruction(ops.insn.to_string())),
        }
    };
    ops.finish()?;
    m.emit(insn);
    Ok(())
}
