//! Field and method descriptors, read as verification types.
use core::fmt;

/// A verification type: what the verifier knows about one stack entry or
/// local slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VType {
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,
    UninitializedThis,
    /// A class or array type, by internal name (`java/lang/Object`,
    /// `[Ljava/lang/Object;`).
    Object(String),
    /// The result of a `new` at this bytecode offset, before its constructor ran.
    Uninitialized(u16),
}

impl VType {
    pub fn object(name: impl Into<String>) -> Self {
        Self::Object(name.into())
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, Self::Long | Self::Double)
    }

    pub fn slots(&self) -> usize {
        if self.is_wide() {
            2
        } else {
            1
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Self::Null | Self::UninitializedThis | Self::Object(_) | Self::Uninitialized(_)
        )
    }

    /// Whether a value of type `self` may flow where `target` is expected.
    ///
    /// Without a class hierarchy at hand only the trivial cases hold: equal
    /// types, `null` into any class, any class into `java/lang/Object`, and
    /// anything into `Top`.
    pub fn is_assignable_to(&self, target: &VType) -> bool {
        match (self, target) {
            (_, VType::Top) => true,
            (a, b) if a == b => true,
            (VType::Null, VType::Object(_)) => true,
            (VType::Object(_), VType::Object(name)) => name == crate::runtime::OBJECT,
            _ => false,
        }
    }

    /// The least type both `self` and `other` are assignable to, if the two
    /// can meet on the stack at all.
    pub fn merge(&self, other: &VType) -> Option<VType> {
        match (self, other) {
            (a, b) if a == b => Some(a.clone()),
            (VType::Null, VType::Object(_)) => Some(other.clone()),
            (VType::Object(_), VType::Null) => Some(self.clone()),
            (VType::Object(_), VType::Object(_)) => Some(VType::object(crate::runtime::OBJECT)),
            _ => None,
        }
    }

    /// Element type produced by `aaload` on an array of this type.
    pub fn component(&self) -> VType {
        match self {
            VType::Object(name) => match name.strip_prefix('[') {
                Some(element) => match element.strip_prefix('L') {
                    Some(class) => VType::object(class.trim_end_matches(';')),
                    None => VType::object(element),
                },
                None => VType::object(crate::runtime::OBJECT),
            },
            _ => VType::object(crate::runtime::OBJECT),
        }
    }
}

impl fmt::Display for VType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VType::Top => write!(f, "top"),
            VType::Integer => write!(f, "int"),
            VType::Float => write!(f, "float"),
            VType::Long => write!(f, "long"),
            VType::Double => write!(f, "double"),
            VType::Null => write!(f, "null"),
            VType::UninitializedThis => write!(f, "uninitialized this"),
            VType::Object(name) => write!(f, "{name}"),
            VType::Uninitialized(offset) => write!(f, "uninitialized @{offset}"),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed descriptor `{0}`")]
pub struct DescriptorError(pub Box<str>);

/// Parses one field type, returning it and the unparsed remainder.
fn next_type(desc: &str) -> Option<(VType, &str)> {
    let mut chars = desc.char_indices();
    let (_, first) = chars.next()?;
    let ty = match first {
        'B' | 'C' | 'I' | 'S' | 'Z' => VType::Integer,
        'F' => VType::Float,
        'J' => VType::Long,
        'D' => VType::Double,
        'L' => {
            let end = desc.find(';')?;
            if end == 1 {
                return None;
            }
            return Some((VType::object(&desc[1..end]), &desc[end + 1..]));
        }
        '[' => {
            let dims = desc.len() - desc.trim_start_matches('[').len();
            let (_, rest) = next_type(&desc[dims..])?;
            let consumed = desc.len() - rest.len();
            return Some((VType::object(&desc[..consumed]), rest));
        }
        _ => return None,
    };
    Some((ty, &desc[1..]))
}

pub fn field_type(desc: &str) -> Result<VType, DescriptorError> {
    match next_type(desc) {
        Some((ty, "")) => Ok(ty),
        _ => Err(DescriptorError(Box::from(desc))),
    }
}

/// Parameter types and return type (`None` for `void`) of a method descriptor.
pub fn method_type(desc: &str) -> Result<(Vec<VType>, Option<VType>), DescriptorError> {
    let error = || DescriptorError(Box::from(desc));
    let mut rest = desc.strip_prefix('(').ok_or_else(error)?;
    let mut params = Vec::new();
    while !rest.starts_with(')') {
        let (ty, tail) = next_type(rest).ok_or_else(error)?;
        params.push(ty);
        rest = tail;
    }
    let ret = match &rest[1..] {
        "V" => None,
        ret => Some(field_type(ret).map_err(|_| error())?),
    };
    Ok((params, ret))
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;

    #[test]
    fn fields() {
        check!(field_type("I") == Ok(VType::Integer));
        check!(field_type("Z") == Ok(VType::Integer));
        check!(field_type("J") == Ok(VType::Long));
        check!(field_type("Ljava/lang/Object;") == Ok(VType::object("java/lang/Object")));
        check!(field_type("[[Ljava/lang/Object;") == Ok(VType::object("[[Ljava/lang/Object;")));
        check!(field_type("[J") == Ok(VType::object("[J")));
        check!(field_type("L;").is_err());
        check!(field_type("II").is_err());
        check!(field_type("").is_err());
    }

    #[test]
    fn methods() {
        let_assert!(
            Ok((params, ret)) = method_type("(Ljava/lang/String;IJ[Ljava/lang/Object;)V")
        );
        check!(
            params
                == vec![
                    VType::object("java/lang/String"),
                    VType::Integer,
                    VType::Long,
                    VType::object("[Ljava/lang/Object;"),
                ]
        );
        check!(ret == None);
        check!(method_type("()Ljava/lang/Object;") == Ok((vec![], Some(VType::object("java/lang/Object")))));
        check!(method_type("(I").is_err());
        check!(method_type("I)V").is_err());
    }

    #[test]
    fn merging_and_assignability() {
        let object = VType::object("java/lang/Object");
        let symbol = VType::object("lamina/lang/Symbol");
        check!(VType::Null.merge(&symbol) == Some(symbol.clone()));
        check!(symbol.merge(&VType::object("java/lang/Long")) == Some(object.clone()));
        check!(VType::Integer.merge(&symbol) == None);
        check!(symbol.is_assignable_to(&object));
        check!(!object.is_assignable_to(&symbol));
        check!(VType::Long.is_assignable_to(&VType::Top));
        check!(VType::object("[Ljava/lang/Object;").component() == object);
        check!(VType::object("[[J").component() == VType::object("[J"));
    }
}
