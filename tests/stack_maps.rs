use std::collections::{BTreeMap, BTreeSet};

use assert2::{check, let_assert};
use lamina::{
    classfile::{
        decode::{ClassFile, MethodInfo},
        descriptor::VType,
        emitter::access,
        frames::{expand, Frame},
        insn::LocalKind,
        Insn,
    },
    runtime::OBJECT,
    Compiler, Linker, Reader,
};

const PROGRAMS: &[&str] = &[
    "(define loop (function (n acc) (if (zero? n) acc (recur (- n 1) (+ acc 1)))))",
    "(define f (function ((x) :one) ((x y) :two) ((x y z & more) more)))",
    "(let (a 5 b \"s\") (function () (if a (list a b) b)))",
    "(when (zero? 0) (cond (= 1 2) :a (< 1 2) (quote (1 2))))",
    "(function (x) (let (y (if x x 0)) (function () (recur))))",
    "(asm (:goto start) (:label top) :aconst_null :areturn (:label start) (:goto top))",
];

fn kind(ty: &VType) -> Option<LocalKind> {
    match ty {
        VType::Object(_) | VType::Null | VType::UninitializedThis => Some(LocalKind::Reference),
        VType::Integer => Some(LocalKind::Int),
        VType::Long => Some(LocalKind::Long),
        _ => None,
    }
}

fn stored(kind: LocalKind) -> VType {
    match kind {
        LocalKind::Reference => VType::object(OBJECT),
        LocalKind::Int => VType::Integer,
        LocalKind::Long => VType::Long,
    }
}

/// Walks the instructions in order, taking the declared frame wherever there
/// is one, and checks every load and branch against the locals known there.
fn check_method(class: &ClassFile, method: &MethodInfo) {
    let Some(code) = &method.code else { return };
    let_assert!(
        Ok(initial) = Frame::for_method(
            &class.name,
            &method.descriptor,
            method.access & access::STATIC != 0,
            method.name == "<init>",
        )
    );
    let frames: BTreeMap<u32, Frame> = expand(&initial, &code.stack_map)
        .into_iter()
        .map(|(offset, frame)| (u32::from(offset), frame))
        .collect();

    let starts: BTreeSet<u32> = code.insns.iter().map(|(offset, _)| *offset).collect();
    let targets: BTreeSet<u32> = code
        .insns
        .iter()
        .flat_map(|(_, insn)| insn.targets())
        .map(|label| label.0)
        .collect();
    let framed: BTreeSet<u32> = frames.keys().copied().collect();
    check!(framed == targets, "{}.{}", class.name, method.name);
    check!(framed.is_subset(&starts));

    let mut locals = Some(initial.locals.clone());
    for (offset, insn) in &code.insns {
        if let Some(frame) = frames.get(offset) {
            locals = Some(frame.locals.clone());
        }
        // code after a jump or return is only entered through a frame
        let_assert!(Some(current) = &mut locals, "{}.{} at {offset}", class.name, method.name);

        match insn {
            Insn::Load(want, slot) => {
                let found = current.get(usize::from(*slot)).and_then(kind);
                check!(found == Some(*want), "load at {offset} in {}", method.name);
            }
            Insn::Store(what, slot) => {
                let slot = usize::from(*slot);
                let width = if *what == LocalKind::Long { 2 } else { 1 };
                if current.len() < slot + width {
                    current.resize(slot + width, VType::Top);
                }
                current[slot] = stored(*what);
                if width == 2 {
                    current[slot + 1] = VType::Top;
                }
            }
            _ => {}
        }

        for label in insn.targets() {
            let_assert!(Some(frame) = frames.get(&label.0));
            for (slot, expected) in frame.locals.iter().enumerate() {
                if let Some(expected) = kind(expected) {
                    let found = current.get(slot).and_then(kind);
                    check!(
                        found == Some(expected),
                        "slot {slot} on the branch from {offset} to {}",
                        label.0
                    );
                }
            }
        }
        if insn.is_terminal() {
            locals = None;
        }
    }
}

#[test]
fn frames_sit_at_every_branch_target_and_match_the_locals() {
    let linker = Linker::with_prelude();
    let mut compiler = Compiler::new(&linker);
    for src in PROGRAMS {
        for form in Reader::new(src) {
            let_assert!(Ok(form) = form);
            let_assert!(Ok(unit) = compiler.compile(&form), "{src}");
            for image in &unit.classes {
                let_assert!(Ok(class) = ClassFile::parse(&image.bytes));
                for method in &class.methods {
                    check_method(&class, method);
                }
            }
        }
    }
}

#[test]
fn branching_code_carries_a_table() {
    let linker = Linker::with_prelude();
    let mut compiler = Compiler::new(&linker);
    let_assert!(Some(Ok(form)) = Reader::new("(if (zero? 1) :a :b)").next());
    let_assert!(Ok(unit) = compiler.compile(&form));
    let_assert!(Some(image) = unit.entry_image());
    let_assert!(Ok(class) = ClassFile::parse(&image.bytes));
    let_assert!(Some(run) = class.method("run", "()Ljava/lang/Object;"));
    let_assert!(Some(code) = &run.code);
    // the else branch and the join point
    check!(code.stack_map.len() == 2);
}
