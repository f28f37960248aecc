//! Stack-map frames: the verifier's view of the stack and locals at branch
//! targets, and their compressed `StackMapTable` encoding.
use super::{
    descriptor::{method_type, DescriptorError, VType},
    pool::{ConstantPool, PoolError},
    WriteBytes,
};

/// Types of the local slots and operand stack at one point in a method.
///
/// Locals are indexed by slot, so a `long` occupies its slot plus a `Top`
/// in the next one. The stack holds one entry per value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub locals: Vec<VType>,
    pub stack: Vec<VType>,
}

impl Frame {
    /// The frame on entry to a method.
    pub fn for_method(
        class: &str,
        descriptor: &str,
        is_static: bool,
        is_constructor: bool,
    ) -> Result<Self, DescriptorError> {
        let (params, _) = method_type(descriptor)?;
        let mut locals = Vec::with_capacity(params.len() + 1);
        if !is_static {
            locals.push(if is_constructor {
                VType::UninitializedThis
            } else {
                VType::object(class)
            });
        }
        for param in params {
            let wide = param.is_wide();
            locals.push(param);
            if wide {
                locals.push(VType::Top);
            }
        }
        Ok(Self {
            locals,
            stack: Vec::new(),
        })
    }

    pub fn stack_slots(&self) -> usize {
        self.stack.iter().map(VType::slots).sum()
    }

    /// Locals in verification-type order: one entry per value, trailing
    /// unusable slots dropped.
    pub fn compact_locals(&self) -> Vec<VType> {
        let mut out = Vec::with_capacity(self.locals.len());
        let mut slot = 0;
        while let Some(ty) = self.locals.get(slot) {
            out.push(ty.clone());
            slot += ty.slots();
        }
        while out.last() == Some(&VType::Top) {
            out.pop();
        }
        out
    }
}

/// One `StackMapTable` entry. `delta` is the encoded `offset_delta`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same { delta: u16 },
    SameLocals1 { delta: u16, stack: VType },
    Chop { delta: u16, count: u8 },
    Append { delta: u16, locals: Vec<VType> },
    Full { delta: u16, locals: Vec<VType>, stack: Vec<VType> },
}

/// Compresses `frames` (at strictly increasing offsets) against the implicit
/// frame of the method entry, picking the smallest encoding for each.
pub fn compress(initial: &Frame, frames: &[(u16, Frame)]) -> Vec<StackMapFrame> {
    let mut out = Vec::with_capacity(frames.len());
    let mut prev_locals = initial.compact_locals();
    let mut prev_offset: Option<u16> = None;

    for (offset, frame) in frames {
        let delta = match prev_offset {
            None => *offset,
            Some(prev) => offset - prev - 1,
        };
        let locals = frame.compact_locals();

        let encoded = if locals == prev_locals && frame.stack.is_empty() {
            StackMapFrame::Same { delta }
        } else if locals == prev_locals && frame.stack.len() == 1 {
            StackMapFrame::SameLocals1 {
                delta,
                stack: frame.stack[0].clone(),
            }
        } else if frame.stack.is_empty()
            && locals.len() < prev_locals.len()
            && prev_locals.len() - locals.len() <= 3
            && prev_locals.starts_with(&locals)
        {
            StackMapFrame::Chop {
                delta,
                count: (prev_locals.len() - locals.len()) as u8,
            }
        } else if frame.stack.is_empty()
            && locals.len() > prev_locals.len()
            && locals.len() - prev_locals.len() <= 3
            && locals.starts_with(&prev_locals)
        {
            StackMapFrame::Append {
                delta,
                locals: locals[prev_locals.len()..].to_vec(),
            }
        } else {
            StackMapFrame::Full {
                delta,
                locals: locals.clone(),
                stack: frame.stack.clone(),
            }
        };

        out.push(encoded);
        prev_locals = locals;
        prev_offset = Some(*offset);
    }
    out
}

/// Undoes [`compress`]: the frame at each offset, with locals indexed by
/// slot again.
pub fn expand(initial: &Frame, table: &[StackMapFrame]) -> Vec<(u16, Frame)> {
    let mut out = Vec::with_capacity(table.len());
    let mut locals = initial.compact_locals();
    let mut prev_offset: Option<u16> = None;

    for entry in table {
        let offset = match prev_offset {
            None => entry.delta(),
            Some(prev) => prev.saturating_add(entry.delta()).saturating_add(1),
        };
        let stack = match entry {
            StackMapFrame::Same { .. } => Vec::new(),
            StackMapFrame::SameLocals1 { stack, .. } => vec![stack.clone()],
            StackMapFrame::Chop { count, .. } => {
                locals.truncate(locals.len().saturating_sub(usize::from(*count)));
                Vec::new()
            }
            StackMapFrame::Append { locals: added, .. } => {
                locals.extend(added.iter().cloned());
                Vec::new()
            }
            StackMapFrame::Full {
                locals: all, stack, ..
            } => {
                locals = all.clone();
                stack.clone()
            }
        };
        let mut by_slot = Vec::with_capacity(locals.len());
        for ty in &locals {
            by_slot.push(ty.clone());
            if ty.is_wide() {
                by_slot.push(VType::Top);
            }
        }
        out.push((
            offset,
            Frame {
                locals: by_slot,
                stack,
            },
        ));
        prev_offset = Some(offset);
    }
    out
}

fn write_type(pool: &mut ConstantPool, ty: &VType, out: &mut Vec<u8>) -> Result<(), PoolError> {
    match ty {
        VType::Top => out.u1(0),
        VType::Integer => out.u1(1),
        VType::Float => out.u1(2),
        VType::Double => out.u1(3),
        VType::Long => out.u1(4),
        VType::Null => out.u1(5),
        VType::UninitializedThis => out.u1(6),
        VType::Object(name) => {
            out.u1(7);
            out.u2(pool.class(name)?);
        }
        VType::Uninitialized(offset) => {
            out.u1(8);
            out.u2(*offset);
        }
    }
    Ok(())
}

impl StackMapFrame {
    pub fn delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { delta }
            | StackMapFrame::SameLocals1 { delta, .. }
            | StackMapFrame::Chop { delta, .. }
            | StackMapFrame::Append { delta, .. }
            | StackMapFrame::Full { delta, .. } => *delta,
        }
    }

    /// The leading `frame_type` byte.
    pub fn frame_type(&self) -> u8 {
        match self {
            StackMapFrame::Same { delta } if *delta <= 63 => *delta as u8,
            StackMapFrame::Same { .. } => 251,
            StackMapFrame::SameLocals1 { delta, .. } if *delta <= 63 => 64 + *delta as u8,
            StackMapFrame::SameLocals1 { .. } => 247,
            StackMapFrame::Chop { count, .. } => 251 - count,
            StackMapFrame::Append { locals, .. } => 251 + locals.len() as u8,
            StackMapFrame::Full { .. } => 255,
        }
    }

    pub fn write(&self, pool: &mut ConstantPool, out: &mut Vec<u8>) -> Result<(), PoolError> {
        let frame_type = self.frame_type();
        out.u1(frame_type);
        // the compact forms carry the delta in the type byte
        if frame_type >= 128 {
            out.u2(self.delta());
        }
        match self {
            StackMapFrame::Same { .. } | StackMapFrame::Chop { .. } => {}
            StackMapFrame::SameLocals1 { stack, .. } => write_type(pool, stack, out)?,
            StackMapFrame::Append { locals, .. } => {
                for local in locals {
                    write_type(pool, local, out)?;
                }
            }
            StackMapFrame::Full { locals, stack, .. } => {
                out.u2(locals.len() as u16);
                for local in locals {
                    write_type(pool, local, out)?;
                }
                out.u2(stack.len() as u16);
                for item in stack {
                    write_type(pool, item, out)?;
                }
            }
        }
        Ok(())
    }
}

/// Body of a `StackMapTable` attribute (without name and length).
pub fn write_table(pool: &mut ConstantPool, frames: &[StackMapFrame]) -> Result<Vec<u8>, PoolError> {
    let mut out = Vec::new();
    out.u2(frames.len() as u16);
    for frame in frames {
        frame.write(pool, &mut out)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;

    fn object() -> VType {
        VType::object("java/lang/Object")
    }

    fn frame(locals: Vec<VType>, stack: Vec<VType>) -> Frame {
        Frame { locals, stack }
    }

    #[test]
    fn entry_frame_from_descriptor() {
        let_assert!(Ok(entry) = Frame::for_method("a/B", "(JLjava/lang/Object;)V", false, false));
        check!(entry.locals == vec![VType::object("a/B"), VType::Long, VType::Top, object()]);
        check!(entry.compact_locals() == vec![VType::object("a/B"), VType::Long, object()]);

        let_assert!(Ok(ctor) = Frame::for_method("a/B", "()V", false, true));
        check!(ctor.locals == vec![VType::UninitializedThis]);
    }

    #[test]
    fn smallest_encodings() {
        let initial = frame(vec![object()], vec![]);
        let frames = [
            (0, frame(vec![object()], vec![])),
            (5, frame(vec![object()], vec![object()])),
            (200, frame(vec![object()], vec![])),
            (210, frame(vec![object(), VType::Integer, VType::Long, VType::Top], vec![])),
            (220, frame(vec![object()], vec![])),
            (230, frame(vec![], vec![VType::Integer, VType::Integer])),
        ];
        let compressed = compress(&initial, &frames);
        check!(
            compressed
                == vec![
                    StackMapFrame::Same { delta: 0 },
                    StackMapFrame::SameLocals1 { delta: 4, stack: object() },
                    StackMapFrame::Same { delta: 194 },
                    StackMapFrame::Append { delta: 9, locals: vec![VType::Integer, VType::Long] },
                    StackMapFrame::Chop { delta: 9, count: 2 },
                    StackMapFrame::Full {
                        delta: 9,
                        locals: vec![],
                        stack: vec![VType::Integer, VType::Integer]
                    },
                ]
        );
        let types: Vec<u8> = compressed.iter().map(StackMapFrame::frame_type).collect();
        check!(types == vec![0, 68, 251, 253, 249, 255]);
        check!(expand(&initial, &compressed) == frames);
    }

    #[test]
    fn extended_same_locals_one_item() {
        let initial = frame(vec![], vec![]);
        let compressed = compress(&initial, &[(100, frame(vec![], vec![VType::Null]))]);
        check!(compressed[0].frame_type() == 247);

        let mut pool = ConstantPool::new();
        let_assert!(Ok(bytes) = write_table(&mut pool, &compressed));
        check!(bytes == vec![0, 1, 247, 0, 100, 5]);
    }

    #[test]
    fn object_types_intern_classes() {
        let mut pool = ConstantPool::new();
        let table = [StackMapFrame::SameLocals1 {
            delta: 3,
            stack: object(),
        }];
        let_assert!(Ok(bytes) = write_table(&mut pool, &table));
        let class = pool.class("java/lang/Object").unwrap();
        check!(bytes == vec![0, 1, 67, 7, 0, class as u8]);
    }
}
