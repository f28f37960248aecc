//! Two-pass assembly of symbolic instructions into a `Code` body.
//!
//! Pass one walks the instructions in order, choosing each encoding and
//! simulating the typed operand stack and locals. Every label ends up with a
//! snapshot of the state expected there, which is what the stack map is made
//! of. Pass two writes the bytes, now that every label has an offset.
use std::collections::HashMap;

use super::{
    descriptor::{field_type, method_type, DescriptorError, VType},
    frames::{compress, Frame, StackMapFrame},
    insn::{FieldOp, InvokeOp, Loadable, LocalKind, Op, TypeOp},
    pool::{Constant, ConstantPool, PoolError},
    Insn, Label, WriteBytes,
};
use crate::runtime;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AssembleError {
    #[error("label {0} is targeted but never bound")]
    UnboundLabel(Label),
    #[error("label {0} is bound twice")]
    DuplicateLabel(Label),
    #[error("stack height mismatch at {label}: expected {expected} slots, found {found}")]
    StackMismatch {
        label: Label,
        expected: usize,
        found: usize,
    },
    #[error("incompatible stack contents meet at {0}")]
    IncompatibleStack(Label),
    #[error("locals at a branch to {0} do not match the frame there")]
    IncompatibleLocals(Label),
    #[error("stack underflow at offset {offset} ({insn})")]
    StackUnderflow { offset: u32, insn: String },
    #[error("wrong operand type at offset {offset}: expected {expected}, found {found}")]
    WrongType {
        offset: u32,
        expected: &'static str,
        found: VType,
    },
    #[error("local {slot} is read at offset {offset} before being set")]
    UninitializedLocal { slot: u16, offset: u32 },
    #[error("unreachable instruction at index {0}")]
    DeadCode(usize),
    #[error("control falls off the end of the method")]
    FallsOffEnd,
    #[error("branch from offset {site} to {target} does not fit in 16 bits")]
    BranchOutOfRange { site: u32, target: u32 },
    #[error("method body of {0} bytes exceeds the 65535 byte limit")]
    CodeTooLarge(u32),
    #[error("method needs more than 65535 stack or local slots")]
    TooManySlots,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// An assembled method body.
#[derive(Debug, Clone, PartialEq)]
pub struct Code {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytes: Vec<u8>,
    pub frames: Vec<StackMapFrame>,
}

#[derive(Debug, Clone)]
struct Bound {
    offset: u32,
    // position among label bindings, to order labels sharing an offset
    seq: usize,
    frame: Frame,
}

#[derive(Debug, Default)]
struct LabelState {
    // merged from forward branches seen so far
    expected: Option<Frame>,
    bound: Option<Bound>,
    targeted: bool,
}

/// Assembles `code` as a method of `class` entered with `initial`.
///
/// Constants are interned into `pool` as encountered.
pub fn assemble(
    pool: &mut ConstantPool,
    class: &str,
    initial: &Frame,
    code: &[Insn],
) -> Result<Code, AssembleError> {
    let mut pass = Pass {
        pool,
        class,
        labels: HashMap::new(),
        max_stack: initial.stack_slots(),
        max_locals: initial.locals.len(),
        bindings: 0,
    };
    let length = pass.simulate(initial, code)?;
    let frames = pass.frames();
    let bytes = pass.encode(code, length)?;

    let code = Code {
        max_stack: u16::try_from(pass.max_stack).map_err(|_| AssembleError::TooManySlots)?,
        max_locals: u16::try_from(pass.max_locals).map_err(|_| AssembleError::TooManySlots)?,
        frames: compress(initial, &frames),
        bytes,
    };
    log::trace!(
        "assembled {} bytes for {class}: max_stack {}, max_locals {}, {} frames",
        code.bytes.len(),
        code.max_stack,
        code.max_locals,
        code.frames.len()
    );
    Ok(code)
}

struct Pass<'a> {
    pool: &'a mut ConstantPool,
    class: &'a str,
    labels: HashMap<Label, LabelState>,
    max_stack: usize,
    max_locals: usize,
    bindings: usize,
}

fn local_size(slot: u16) -> u32 {
    match slot {
        0..=3 => 1,
        4..=255 => 2,
        _ => 4,
    }
}

fn kind_matches(kind: LocalKind, ty: &VType) -> bool {
    match kind {
        LocalKind::Int => *ty == VType::Integer,
        LocalKind::Long => *ty == VType::Long,
        LocalKind::Reference => ty.is_reference(),
    }
}

fn kind_name(kind: LocalKind) -> &'static str {
    match kind {
        LocalKind::Int => "int",
        LocalKind::Long => "long",
        LocalKind::Reference => "reference",
    }
}

fn array_of(class: &str) -> String {
    if class.starts_with('[') {
        format!("[{class}")
    } else {
        format!("[L{class};")
    }
}

fn merge(label: Label, incoming: &Frame, existing: &Frame) -> Result<Frame, AssembleError> {
    if incoming.stack.len() != existing.stack.len() {
        return Err(AssembleError::StackMismatch {
            label,
            expected: existing.stack_slots(),
            found: incoming.stack_slots(),
        });
    }
    let stack = incoming
        .stack
        .iter()
        .zip(&existing.stack)
        .map(|(a, b)| a.merge(b))
        .collect::<Option<Vec<_>>>()
        .ok_or(AssembleError::IncompatibleStack(label))?;

    let len = incoming.locals.len().max(existing.locals.len());
    let locals = (0..len)
        .map(|slot| {
            let a = incoming.locals.get(slot).unwrap_or(&VType::Top);
            let b = existing.locals.get(slot).unwrap_or(&VType::Top);
            a.merge(b).unwrap_or(VType::Top)
        })
        .collect();
    Ok(Frame { locals, stack })
}

impl Pass<'_> {
    fn ldc_constant(loadable: &Loadable) -> Constant {
        match loadable {
            Loadable::Int(value) => Constant::Integer(*value),
            Loadable::Long(value) => Constant::Long(*value),
            Loadable::String(text) => Constant::String(text.clone()),
            Loadable::Class(name) => Constant::Class(name.clone()),
        }
    }

    fn size(&mut self, insn: &Insn, offset: u32) -> Result<u32, AssembleError> {
        Ok(match insn {
            Insn::Label(_) => 0,
            Insn::Op(_) => 1,
            Insn::PushInt(-1..=5) => 1,
            Insn::PushInt(-128..=127) => 2,
            Insn::PushInt(-32768..=32767) => 3,
            Insn::PushInt(value) => self.size(&Insn::Ldc(Loadable::Int(*value)), offset)?,
            Insn::PushLong(0 | 1) => 1,
            Insn::PushLong(_) | Insn::Ldc(Loadable::Long(_)) => 3,
            Insn::Ldc(loadable) => {
                if self.pool.insert(&Self::ldc_constant(loadable))? <= 255 {
                    2
                } else {
                    3
                }
            }
            Insn::Load(_, slot) | Insn::Store(_, slot) => local_size(*slot),
            Insn::Type(..) | Insn::Field(..) | Insn::Jump(..) => 3,
            Insn::Invoke(InvokeOp::Interface, _) | Insn::InvokeDynamic(_) => 5,
            Insn::Invoke(..) => 3,
            Insn::TableSwitch { targets, .. } => {
                let padding = (4 - (offset + 1) % 4) % 4;
                1 + padding + 12 + 4 * targets.len() as u32
            }
        })
    }

    fn simulate(&mut self, initial: &Frame, code: &[Insn]) -> Result<u32, AssembleError> {
        let mut offset = 0u32;
        let mut current = Some(initial.clone());

        for (index, insn) in code.iter().enumerate() {
            if let Insn::Label(label) = insn {
                self.bind(*label, offset, &mut current)
                    .ok_or(AssembleError::DeadCode(index))??;
                continue;
            }
            let Some(frame) = current.as_mut() else {
                return Err(AssembleError::DeadCode(index));
            };

            let size = self.size(insn, offset)?;
            self.step(insn, offset, frame)?;
            if insn.is_terminal() {
                current = None;
            }
            offset += size;
            if offset > u32::from(u16::MAX) {
                return Err(AssembleError::CodeTooLarge(offset));
            }
        }

        if current.is_some() {
            return Err(AssembleError::FallsOffEnd);
        }
        let mut unbound: Vec<_> = self
            .labels
            .iter()
            .filter(|(_, state)| state.bound.is_none())
            .map(|(label, _)| *label)
            .collect();
        unbound.sort();
        if let Some(label) = unbound.first() {
            return Err(AssembleError::UnboundLabel(*label));
        }
        Ok(offset)
    }

    /// Binds `label` here, merging the fallthrough state with every forward
    /// branch. `None` when nothing reaches the label.
    fn bind(
        &mut self,
        label: Label,
        offset: u32,
        current: &mut Option<Frame>,
    ) -> Option<Result<(), AssembleError>> {
        let seq = self.bindings;
        self.bindings += 1;
        let state = self.labels.entry(label).or_default();
        if state.bound.is_some() {
            return Some(Err(AssembleError::DuplicateLabel(label)));
        }

        let frame = match (current.take(), state.expected.take()) {
            (Some(fallthrough), Some(expected)) => match merge(label, &fallthrough, &expected) {
                Ok(frame) => frame,
                Err(err) => return Some(Err(err)),
            },
            (Some(frame), None) | (None, Some(frame)) => frame,
            (None, None) => return None,
        };
        state.bound = Some(Bound {
            offset,
            seq,
            frame: frame.clone(),
        });
        *current = Some(frame);
        Some(Ok(()))
    }

    fn branch(&mut self, label: Label, frame: &Frame) -> Result<(), AssembleError> {
        let state = self.labels.entry(label).or_default();
        state.targeted = true;

        if let Some(bound) = &state.bound {
            // backward: the frame there is final, we must fit into it
            let snapshot = &bound.frame;
            if snapshot.stack.len() != frame.stack.len() {
                return Err(AssembleError::StackMismatch {
                    label,
                    expected: snapshot.stack_slots(),
                    found: frame.stack_slots(),
                });
            }
            if !frame
                .stack
                .iter()
                .zip(&snapshot.stack)
                .all(|(a, b)| a.is_assignable_to(b))
            {
                return Err(AssembleError::IncompatibleStack(label));
            }
            let locals_fit = snapshot.locals.iter().enumerate().all(|(slot, expected)| {
                frame
                    .locals
                    .get(slot)
                    .unwrap_or(&VType::Top)
                    .is_assignable_to(expected)
            });
            if !locals_fit {
                return Err(AssembleError::IncompatibleLocals(label));
            }
            return Ok(());
        }

        state.expected = Some(match state.expected.take() {
            Some(existing) => merge(label, frame, &existing)?,
            None => frame.clone(),
        });
        Ok(())
    }

    fn push(&mut self, frame: &mut Frame, ty: VType) {
        frame.stack.push(ty);
        self.max_stack = self.max_stack.max(frame.stack_slots());
    }

    fn set_local(&mut self, frame: &mut Frame, slot: u16, ty: VType) {
        let slot = usize::from(slot);
        let width = ty.slots();
        if frame.locals.len() < slot + width {
            frame.locals.resize(slot + width, VType::Top);
        }
        // overwriting the upper half of a long kills the whole long
        if slot > 0 && frame.locals[slot - 1].is_wide() {
            frame.locals[slot - 1] = VType::Top;
        }
        if width == 2 {
            frame.locals[slot + 1] = VType::Top;
        }
        frame.locals[slot] = ty;
        self.max_locals = self.max_locals.max(slot + width);
    }

    fn step(&mut self, insn: &Insn, offset: u32, frame: &mut Frame) -> Result<(), AssembleError> {
        let underflow = || AssembleError::StackUnderflow {
            offset,
            insn: insn.to_string(),
        };
        macro_rules! pop {
            () => {
                frame.stack.pop().ok_or_else(underflow)?
            };
            ($n:expr) => {
                for _ in 0..$n {
                    frame.stack.pop().ok_or_else(underflow)?;
                }
            };
        }

        match insn {
            Insn::Label(_) => {}
            Insn::Op(op) => match op {
                Op::Nop | Op::Return => {}
                Op::AconstNull => self.push(frame, VType::Null),
                Op::Aaload => {
                    pop!(1);
                    let array = pop!();
                    self.push(frame, array.component());
                }
                Op::Aastore => pop!(3),
                Op::Pop => pop!(1),
                Op::Pop2 => {
                    if !pop!().is_wide() {
                        pop!(1);
                    }
                }
                Op::Dup => {
                    let top = pop!();
                    self.push(frame, top.clone());
                    self.push(frame, top);
                }
                Op::DupX1 => {
                    let v1 = pop!();
                    let v2 = pop!();
                    self.push(frame, v1.clone());
                    self.push(frame, v2);
                    self.push(frame, v1);
                }
                Op::Swap => {
                    let v1 = pop!();
                    let v2 = pop!();
                    self.push(frame, v1);
                    self.push(frame, v2);
                }
                Op::Iadd | Op::Isub | Op::Imul | Op::Lcmp => {
                    pop!(2);
                    self.push(frame, VType::Integer);
                }
                Op::Ladd | Op::Lsub | Op::Lmul => {
                    pop!(2);
                    self.push(frame, VType::Long);
                }
                Op::Ineg | Op::L2i | Op::Arraylength => {
                    pop!(1);
                    self.push(frame, VType::Integer);
                }
                Op::Lneg | Op::I2l => {
                    pop!(1);
                    self.push(frame, VType::Long);
                }
                Op::Ireturn | Op::Lreturn | Op::Areturn | Op::Athrow => pop!(1),
            },
            Insn::PushInt(_) | Insn::Ldc(Loadable::Int(_)) => self.push(frame, VType::Integer),
            Insn::PushLong(_) | Insn::Ldc(Loadable::Long(_)) => self.push(frame, VType::Long),
            Insn::Ldc(Loadable::String(_)) => self.push(frame, VType::object(runtime::STRING)),
            Insn::Ldc(Loadable::Class(_)) => self.push(frame, VType::object("java/lang/Class")),
            Insn::Load(kind, slot) => {
                let ty = frame
                    .locals
                    .get(usize::from(*slot))
                    .cloned()
                    .unwrap_or(VType::Top);
                if !kind_matches(*kind, &ty) {
                    return Err(AssembleError::UninitializedLocal {
                        slot: *slot,
                        offset,
                    });
                }
                self.push(frame, ty);
            }
            Insn::Store(kind, slot) => {
                let ty = pop!();
                if !kind_matches(*kind, &ty) {
                    return Err(AssembleError::WrongType {
                        offset,
                        expected: kind_name(*kind),
                        found: ty,
                    });
                }
                self.set_local(frame, *slot, ty);
            }
            Insn::Type(op, class) => match op {
                TypeOp::New => self.push(frame, VType::Uninitialized(offset as u16)),
                TypeOp::ANewArray => {
                    pop!(1);
                    self.push(frame, VType::object(array_of(class)));
                }
                TypeOp::CheckCast => {
                    pop!(1);
                    self.push(frame, VType::object(class.as_str()));
                }
                TypeOp::InstanceOf => {
                    pop!(1);
                    self.push(frame, VType::Integer);
                }
            },
            Insn::Field(op, member) => {
                let ty = field_type(&member.descriptor)?;
                match op {
                    FieldOp::GetStatic => self.push(frame, ty),
                    FieldOp::PutStatic => pop!(1),
                    FieldOp::GetField => {
                        pop!(1);
                        self.push(frame, ty);
                    }
                    FieldOp::PutField => pop!(2),
                }
            }
            Insn::Invoke(op, member) => {
                let (params, ret) = method_type(&member.descriptor)?;
                pop!(params.len());
                if *op != InvokeOp::Static {
                    let receiver = pop!();
                    if *op == InvokeOp::Special && member.name == "<init>" {
                        let initialized = match &receiver {
                            VType::UninitializedThis => VType::object(self.class),
                            VType::Uninitialized(_) => VType::object(member.class.as_str()),
                            found => {
                                return Err(AssembleError::WrongType {
                                    offset,
                                    expected: "uninitialized object",
                                    found: found.clone(),
                                })
                            }
                        };
                        for ty in frame.stack.iter_mut().chain(frame.locals.iter_mut()) {
                            if *ty == receiver {
                                *ty = initialized.clone();
                            }
                        }
                    }
                }
                if let Some(ret) = ret {
                    self.push(frame, ret);
                }
            }
            Insn::InvokeDynamic(site) => {
                let (params, ret) = method_type(&site.descriptor)?;
                pop!(params.len());
                if let Some(ret) = ret {
                    self.push(frame, ret);
                }
            }
            Insn::Jump(jump, label) => {
                pop!(jump.pops());
                self.branch(*label, frame)?;
            }
            Insn::TableSwitch {
                default, targets, ..
            } => {
                pop!(1);
                for label in targets.iter().chain([default]) {
                    self.branch(*label, frame)?;
                }
            }
        }
        Ok(())
    }

    /// Snapshots of every branch target, ordered by offset, one per offset.
    fn frames(&self) -> Vec<(u16, Frame)> {
        let mut bound: Vec<&Bound> = self
            .labels
            .values()
            .filter(|state| state.targeted)
            .filter_map(|state| state.bound.as_ref())
            .collect();
        bound.sort_by_key(|bound| (bound.offset, bound.seq));

        let mut frames: Vec<(u16, Frame)> = Vec::with_capacity(bound.len());
        for bound in bound {
            let offset = bound.offset as u16;
            match frames.last_mut() {
                // the later binding saw every branch to the earlier one
                Some((last, frame)) if *last == offset => *frame = bound.frame.clone(),
                _ => frames.push((offset, bound.frame.clone())),
            }
        }
        frames
    }

    fn offset_of(&self, label: Label) -> Result<u32, AssembleError> {
        self.labels
            .get(&label)
            .and_then(|state| state.bound.as_ref())
            .map(|bound| bound.offset)
            .ok_or(AssembleError::UnboundLabel(label))
    }

    fn relative(&self, site: u32, label: Label) -> Result<i32, AssembleError> {
        let target = self.offset_of(label)?;
        Ok(target as i32 - site as i32)
    }

    fn local(out: &mut Vec<u8>, short: u8, long: u8, slot: u16) {
        match slot {
            0..=3 => out.u1(short + slot as u8),
            4..=255 => {
                out.u1(long);
                out.u1(slot as u8);
            }
            _ => {
                out.u1(0xc4);
                out.u1(long);
                out.u2(slot);
            }
        }
    }

    fn encode(&mut self, code: &[Insn], length: u32) -> Result<Vec<u8>, AssembleError> {
        let mut out = Vec::with_capacity(length as usize);
        for insn in code {
            let site = out.len() as u32;
            match insn {
                Insn::Label(_) => {}
                Insn::Op(op) => out.u1(op.opcode()),
                Insn::PushInt(value @ -1..=5) => out.u1((value + 3) as u8),
                Insn::PushInt(value @ -128..=127) => {
                    out.u1(0x10);
                    out.u1(*value as i8 as u8);
                }
                Insn::PushInt(value @ -32768..=32767) => {
                    out.u1(0x11);
                    out.u2(*value as i16 as u16);
                }
                Insn::PushInt(value) => self.ldc(&mut out, &Loadable::Int(*value))?,
                Insn::PushLong(value @ (0 | 1)) => out.u1(0x09 + *value as u8),
                Insn::PushLong(value) => self.ldc(&mut out, &Loadable::Long(*value))?,
                Insn::Ldc(loadable) => self.ldc(&mut out, loadable)?,
                Insn::Load(kind, slot) => {
                    Self::local(&mut out, kind.short_load_opcode(), kind.load_opcode(), *slot)
                }
                Insn::Store(kind, slot) => {
                    Self::local(&mut out, kind.short_store_opcode(), kind.store_opcode(), *slot)
                }
                Insn::Type(op, class) => {
                    out.u1(op.opcode());
                    out.u2(self.pool.class(class)?);
                }
                Insn::Field(op, member) => {
                    out.u1(op.opcode());
                    out.u2(self.pool.insert(&Constant::FieldRef(member.clone()))?);
                }
                Insn::Invoke(InvokeOp::Interface, member) => {
                    let (params, _) = method_type(&member.descriptor)?;
                    let count = 1 + params.iter().map(VType::slots).sum::<usize>();
                    out.u1(InvokeOp::Interface.opcode());
                    out.u2(self.pool.insert(&Constant::InterfaceMethodRef(member.clone()))?);
                    out.u1(count as u8);
                    out.u1(0);
                }
                Insn::Invoke(op, member) => {
                    out.u1(op.opcode());
                    out.u2(self.pool.insert(&Constant::MethodRef(member.clone()))?);
                }
                Insn::InvokeDynamic(site) => {
                    out.u1(0xba);
                    out.u2(self.pool.insert(&Constant::InvokeDynamic(site.clone()))?);
                    out.u2(0);
                }
                Insn::Jump(jump, label) => {
                    let relative = self.relative(site, *label)?;
                    let relative =
                        i16::try_from(relative).map_err(|_| AssembleError::BranchOutOfRange {
                            site,
                            target: (site as i32 + relative) as u32,
                        })?;
                    out.u1(jump.opcode());
                    out.u2(relative as u16);
                }
                Insn::TableSwitch {
                    low,
                    default,
                    targets,
                } => {
                    out.u1(0xaa);
                    while out.len() % 4 != 0 {
                        out.u1(0);
                    }
                    out.u4(self.relative(site, *default)? as u32);
                    out.u4(*low as u32);
                    out.u4((low + targets.len() as i32 - 1) as u32);
                    for target in targets {
                        out.u4(self.relative(site, *target)? as u32);
                    }
                }
            }
        }
        debug_assert_eq!(out.len() as u32, length);
        Ok(out)
    }

    fn ldc(&mut self, out: &mut Vec<u8>, loadable: &Loadable) -> Result<(), AssembleError> {
        let index = self.pool.insert(&Self::ldc_constant(loadable))?;
        match loadable {
            Loadable::Long(_) => {
                out.u1(0x14);
                out.u2(index);
            }
            _ if index <= 255 => {
                out.u1(0x12);
                out.u1(index as u8);
            }
            _ => {
                out.u1(0x13);
                out.u2(index);
            }
        }
        Ok(())
    }
}
