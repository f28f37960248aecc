use std::collections::HashSet;

use crate::classfile::{Insn, Label};

/// Accumulates the instructions of one method body.
///
/// Code that cannot be reached (after a return, throw or `goto`, until a
/// label that some emitted branch targets) is dropped on the floor, so the
/// compiler can emit uniformly and still satisfy the assembler's no dead
/// code rule.
#[derive(Debug, Default)]
pub struct MethodBuilder {
    code: Vec<Insn>,
    next_label: u32,
    reachable: bool,
    targeted: HashSet<Label>,
    loop_label: Option<Label>,
    // parameter slots of a function clause, in declaration order
    recur_slots: Option<Vec<u16>>,
}

impl MethodBuilder {
    pub fn new() -> Self {
        Self {
            reachable: true,
            ..Default::default()
        }
    }

    /// A clause body that `recur` may jump back into.
    pub fn for_clause(param_slots: Vec<u16>) -> Self {
        Self {
            recur_slots: Some(param_slots),
            ..Self::new()
        }
    }

    pub fn label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn emit(&mut self, insn: Insn) {
        if let Insn::Label(label) = insn {
            return self.bind(label);
        }
        if !self.reachable {
            return;
        }
        self.targeted.extend(insn.targets());
        if insn.is_terminal() {
            self.reachable = false;
        }
        self.code.push(insn);
    }

    pub fn emit_all(&mut self, insns: impl IntoIterator<Item = Insn>) {
        for insn in insns {
            self.emit(insn);
        }
    }

    /// Places `label` here, unless nothing could ever get to it.
    pub fn bind(&mut self, label: Label) {
        if self.reachable || self.targeted.contains(&label) {
            self.code.push(Insn::Label(label));
            self.reachable = true;
        }
    }

    /// Places `label` here even though nothing emitted so far branches to
    /// it; a branch emitted later does.
    pub fn bind_targeted(&mut self, label: Label) {
        self.targeted.insert(label);
        self.bind(label);
    }

    pub fn recur_slots(&self) -> Option<&[u16]> {
        self.recur_slots.as_deref()
    }

    /// The label at the very start of the body, created on first use.
    pub fn loop_label(&mut self) -> Label {
        if let Some(label) = self.loop_label {
            return label;
        }
        let label = self.label();
        self.code.insert(0, Insn::Label(label));
        self.loop_label = Some(label);
        label
    }

    pub fn finish(self) -> Vec<Insn> {
        self.code
    }
}
