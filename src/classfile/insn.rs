//! The symbolic instruction set.
//!
//! Instructions name their operands (classes, members, constants, labels)
//! instead of pool indices and offsets; the assembler picks encodings.
use core::fmt;

pub use super::pool::MemberRef;
use super::pool::DynamicSite;

/// A jump target. Labels are plain numbers handed out by whoever builds the
/// instruction list; the decoder reuses them to hold absolute offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

macro_rules! opcodes {
    ($(#[$meta:meta])* pub enum $name:ident { $($variant:ident = $code:literal $mnemonic:literal,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn opcode(self) -> u8 {
                match self {
                    $(Self::$variant => $code,)*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$variant => $mnemonic,)*
                }
            }

            pub fn from_mnemonic(name: &str) -> Option<Self> {
                match name {
                    $($mnemonic => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub fn from_opcode(code: u8) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    /// Instructions without operands.
    pub enum Op {
        Nop = 0x00 "nop",
        AconstNull = 0x01 "aconst_null",
        Aaload = 0x32 "aaload",
        Aastore = 0x53 "aastore",
        Pop = 0x57 "pop",
        Pop2 = 0x58 "pop2",
        Dup = 0x59 "dup",
        DupX1 = 0x5a "dup_x1",
        Swap = 0x5f "swap",
        Iadd = 0x60 "iadd",
        Ladd = 0x61 "ladd",
        Isub = 0x64 "isub",
        Lsub = 0x65 "lsub",
        Imul = 0x68 "imul",
        Lmul = 0x69 "lmul",
        Ineg = 0x74 "ineg",
        Lneg = 0x75 "lneg",
        I2l = 0x85 "i2l",
        L2i = 0x88 "l2i",
        Lcmp = 0x94 "lcmp",
        Ireturn = 0xac "ireturn",
        Lreturn = 0xad "lreturn",
        Areturn = 0xb0 "areturn",
        Return = 0xb1 "return",
        Arraylength = 0xbe "arraylength",
        Athrow = 0xbf "athrow",
    }
}

opcodes! {
    /// Conditional and unconditional branches with a 16-bit offset.
    pub enum Jump {
        Ifeq = 0x99 "ifeq",
        Ifne = 0x9a "ifne",
        Iflt = 0x9b "iflt",
        Ifge = 0x9c "ifge",
        Ifgt = 0x9d "ifgt",
        Ifle = 0x9e "ifle",
        IfIcmpeq = 0x9f "if_icmpeq",
        IfIcmpne = 0xa0 "if_icmpne",
        IfIcmplt = 0xa1 "if_icmplt",
        IfIcmpge = 0xa2 "if_icmpge",
        IfIcmpgt = 0xa3 "if_icmpgt",
        IfIcmple = 0xa4 "if_icmple",
        IfAcmpeq = 0xa5 "if_acmpeq",
        IfAcmpne = 0xa6 "if_acmpne",
        Goto = 0xa7 "goto",
        IfNull = 0xc6 "ifnull",
        IfNonNull = 0xc7 "ifnonnull",
    }
}

opcodes! {
    /// Instructions taking a class operand.
    pub enum TypeOp {
        New = 0xbb "new",
        ANewArray = 0xbd "anewarray",
        CheckCast = 0xc0 "checkcast",
        InstanceOf = 0xc1 "instanceof",
    }
}

opcodes! {
    pub enum FieldOp {
        GetStatic = 0xb2 "getstatic",
        PutStatic = 0xb3 "putstatic",
        GetField = 0xb4 "getfield",
        PutField = 0xb5 "putfield",
    }
}

opcodes! {
    pub enum InvokeOp {
        Virtual = 0xb6 "invokevirtual",
        Special = 0xb7 "invokespecial",
        Static = 0xb8 "invokestatic",
        Interface = 0xb9 "invokeinterface",
    }
}

impl Jump {
    /// Operand-stack entries the branch consumes.
    pub fn pops(self) -> usize {
        match self {
            Jump::Goto => 0,
            Jump::Ifeq
            | Jump::Ifne
            | Jump::Iflt
            | Jump::Ifge
            | Jump::Ifgt
            | Jump::Ifle
            | Jump::IfNull
            | Jump::IfNonNull => 1,
            _ => 2,
        }
    }
}

/// Kind of value moved between a local slot and the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalKind {
    Int,
    Long,
    Reference,
}

impl LocalKind {
    pub(crate) fn load_opcode(self) -> u8 {
        match self {
            LocalKind::Int => 0x15,
            LocalKind::Long => 0x16,
            LocalKind::Reference => 0x19,
        }
    }

    pub(crate) fn store_opcode(self) -> u8 {
        match self {
            LocalKind::Int => 0x36,
            LocalKind::Long => 0x37,
            LocalKind::Reference => 0x3a,
        }
    }

    // first of the four `xload_<n>` / `xstore_<n>` opcodes
    pub(crate) fn short_load_opcode(self) -> u8 {
        match self {
            LocalKind::Int => 0x1a,
            LocalKind::Long => 0x1e,
            LocalKind::Reference => 0x2a,
        }
    }

    pub(crate) fn short_store_opcode(self) -> u8 {
        match self {
            LocalKind::Int => 0x3b,
            LocalKind::Long => 0x3f,
            LocalKind::Reference => 0x4b,
        }
    }

    fn prefix(self) -> char {
        match self {
            LocalKind::Int => 'i',
            LocalKind::Long => 'l',
            LocalKind::Reference => 'a',
        }
    }

    /// Splits `aload`/`istore`/... into kind and direction (`true` for loads).
    pub fn from_mnemonic(name: &str) -> Option<(Self, bool)> {
        let kind = match name.chars().next()? {
            'i' => LocalKind::Int,
            'l' => LocalKind::Long,
            'a' => LocalKind::Reference,
            _ => return None,
        };
        match &name[1..] {
            "load" => Some((kind, true)),
            "store" => Some((kind, false)),
            _ => None,
        }
    }
}

/// Constants pushed by `ldc`/`ldc_w`/`ldc2_w`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Loadable {
    Int(i32),
    Long(i64),
    String(String),
    Class(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Insn {
    /// Binds a label to the position of the next real instruction.
    Label(Label),
    Op(Op),
    /// Pushes an `int`, choosing between `iconst`, `bipush`, `sipush` and `ldc`.
    PushInt(i32),
    /// Pushes a `long`, choosing between `lconst` and `ldc2_w`.
    PushLong(i64),
    Ldc(Loadable),
    Load(LocalKind, u16),
    Store(LocalKind, u16),
    Type(TypeOp, String),
    Field(FieldOp, MemberRef),
    Invoke(InvokeOp, MemberRef),
    InvokeDynamic(DynamicSite),
    Jump(Jump, Label),
    TableSwitch {
        low: i32,
        default: Label,
        targets: Vec<Label>,
    },
}

impl Insn {
    /// Whether control never continues to the next instruction.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Insn::Op(Op::Areturn | Op::Ireturn | Op::Lreturn | Op::Return | Op::Athrow)
                | Insn::Jump(Jump::Goto, _)
                | Insn::TableSwitch { .. }
        )
    }

    pub fn targets(&self) -> Vec<Label> {
        match self {
            Insn::Jump(_, label) => vec![*label],
            Insn::TableSwitch {
                default, targets, ..
            } => {
                let mut all = targets.clone();
                all.push(*default);
                all
            }
            _ => vec![],
        }
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insn::Label(label) => write!(f, "{label}:"),
            Insn::Op(op) => write!(f, "{}", op.mnemonic()),
            Insn::PushInt(value) => write!(f, "push {value}"),
            Insn::PushLong(value) => write!(f, "push {value}L"),
            Insn::Ldc(Loadable::Int(value)) => write!(f, "ldc {value}"),
            Insn::Ldc(Loadable::Long(value)) => write!(f, "ldc2_w {value}L"),
            Insn::Ldc(Loadable::String(text)) => write!(f, "ldc {text:?}"),
            Insn::Ldc(Loadable::Class(name)) => write!(f, "ldc {name}.class"),
            Insn::Load(kind, slot) => write!(f, "{}load {slot}", kind.prefix()),
            Insn::Store(kind, slot) => write!(f, "{}store {slot}", kind.prefix()),
            Insn::Type(op, class) => write!(f, "{} {class}", op.mnemonic()),
            Insn::Field(op, member) => write!(
                f,
                "{} {}.{} {}",
                op.mnemonic(),
                member.class,
                member.name,
                member.descriptor
            ),
            Insn::Invoke(op, member) => write!(
                f,
                "{} {}.{} {}",
                op.mnemonic(),
                member.class,
                member.name,
                member.descriptor
            ),
            Insn::InvokeDynamic(site) => {
                write!(f, "invokedynamic {} {}", site.name, site.descriptor)?;
                for arg in &site.bootstrap.args {
                    match arg {
                        super::pool::Constant::String(text) => write!(f, " {text:?}")?,
                        other => write!(f, " {other:?}")?,
                    }
                }
                Ok(())
            }
            Insn::Jump(jump, label) => write!(f, "{} {label}", jump.mnemonic()),
            Insn::TableSwitch {
                low,
                default,
                targets,
            } => {
                write!(f, "tableswitch {low} [")?;
                for (i, target) in targets.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{target}")?;
                }
                write!(f, "] default {default}")
            }
        }
    }
}
