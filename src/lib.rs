pub mod classfile;
pub mod compiler;
pub mod lexer;
pub mod linker;
pub mod reader;
pub mod runtime;
pub mod value;

pub use classfile::emitter::ClassImage;
pub use compiler::{CompileError, CompiledUnit, Compiler, CompilerOptions};
pub use linker::{CallSite, LinkError, Linker};
pub use reader::{ReadError, Reader};
pub use value::{Function, Keyword, Macro, MacroError, Seq, Symbol, Value};
