//! Everything needed to produce (and read back) binary class images without
//! an external bytecode library.
//!
//! [`insn`] is the symbolic instruction set the compiler speaks, [`assembler`]
//! lowers it to bytes against a class's [`pool`], and [`emitter`] lays the
//! results out as a class file.
pub mod assembler;
pub mod decode;
pub mod descriptor;
pub mod emitter;
pub mod frames;
pub mod insn;
pub mod pool;

pub use insn::{Insn, Label};
pub use pool::DynamicSite;

/// Appends big-endian integers to a byte buffer, the only byte order the
/// format knows.
pub(crate) trait WriteBytes {
    fn u1(&mut self, value: u8);
    fn u2(&mut self, value: u16);
    fn u4(&mut self, value: u32);
}

impl WriteBytes for Vec<u8> {
    fn u1(&mut self, value: u8) {
        self.push(value);
    }

    fn u2(&mut self, value: u16) {
        self.extend_from_slice(&value.to_be_bytes());
    }

    fn u4(&mut self, value: u32) {
        self.extend_from_slice(&value.to_be_bytes());
    }
}
