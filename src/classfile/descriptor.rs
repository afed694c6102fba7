//! Method descriptor parsing.
//!
//! Only the subset `( [primitive]* ) primitive` with primitive one of
//! `V I B C S Z` is supported, plus `([Ljava/lang/String;)V` (the `main`
//! signature), which is treated as taking no arguments.

use super::ClassError;

/// A parsed method descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    args: Vec<char>,
    rtype: char,
}

const MAIN_SIGNATURE: &str = "([Ljava/lang/String;)V";

fn is_primitive(c: char) -> bool {
    matches!(c, 'V' | 'I' | 'B' | 'C' | 'S' | 'Z')
}

impl MethodDescriptor {
    pub fn parse(signature: &str) -> Result<Self, ClassError> {
        if signature == MAIN_SIGNATURE {
            return Ok(Self { args: Vec::new(), rtype: 'V' });
        }
        Self::try_parse(signature)
            .ok_or_else(|| ClassError::BadDescriptor(signature.to_string()))
    }

    fn try_parse(signature: &str) -> Option<Self> {
        let inner = signature.strip_prefix('(')?;
        let (params, rest) = inner.split_once(')')?;

        let mut args = Vec::new();
        for c in params.chars() {
            if !is_primitive(c) {
                return None;
            }
            args.push(c);
        }

        let mut rest = rest.chars();
        let rtype = rest.next().filter(|&c| is_primitive(c))?;
        if rest.next().is_some() {
            return None;
        }
        Some(Self { args, rtype })
    }

    pub fn nargs(&self) -> usize {
        self.args.len()
    }

    /// Number of return values: 0 for `V`, otherwise 1.
    pub fn nreturn(&self) -> usize {
        if self.rtype == 'V' {
            0
        } else {
            1
        }
    }

    pub fn arg(&self, i: usize) -> char {
        self.args[i]
    }

    pub fn rtype(&self) -> char {
        self.rtype
    }
}

/// Validate a descriptor used with `print`/`println`: at most one argument,
/// `void` return, and the argument (if any) must be `C` or `I`.
pub fn check_print_descriptor(
    desc: &MethodDescriptor,
    name: &str,
) -> Result<(), ClassError> {
    if desc.nargs() > 1 {
        return Err(ClassError::BadDescriptor(format!(
            "Too many arguments to {}: {}",
            name,
            desc.nargs()
        )));
    }
    if desc.rtype() != 'V' {
        return Err(ClassError::BadDescriptor(format!(
            "Invalid return type for {}: {}",
            name,
            desc.rtype()
        )));
    }
    if desc.nargs() == 1 && !matches!(desc.arg(0), 'C' | 'I') {
        return Err(ClassError::BadDescriptor(format!(
            "Invalid argument type for {}: {}",
            name,
            desc.arg(0)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_basic_descriptors() {
        let desc = MethodDescriptor::parse("(II)I").unwrap();
        assert_eq!(desc.nargs(), 2);
        assert_eq!(desc.nreturn(), 1);
        assert_eq!(desc.arg(0), 'I');
        assert_eq!(desc.rtype(), 'I');

        let desc = MethodDescriptor::parse("()V").unwrap();
        assert_eq!(desc.nargs(), 0);
        assert_eq!(desc.nreturn(), 0);
    }

    #[test]
    fn test_main_signature_special_case() {
        let desc = MethodDescriptor::parse("([Ljava/lang/String;)V").unwrap();
        assert_eq!(desc.nargs(), 0);
        assert_eq!(desc.nreturn(), 0);
    }

    #[test]
    fn test_rejects_objects_and_junk() {
        assert!(MethodDescriptor::parse("(Ljava/lang/Object;)V").is_err());
        assert!(MethodDescriptor::parse("(I)").is_err());
        assert!(MethodDescriptor::parse("II)I").is_err());
        assert!(MethodDescriptor::parse("(I)II").is_err());
        assert!(MethodDescriptor::parse("").is_err());
    }

    #[test]
    fn test_print_descriptor_check() {
        let ok = MethodDescriptor::parse("(I)V").unwrap();
        assert!(check_print_descriptor(&ok, "print()").is_ok());

        let ok = MethodDescriptor::parse("(C)V").unwrap();
        assert!(check_print_descriptor(&ok, "print()").is_ok());

        let bad_ret = MethodDescriptor::parse("(I)I").unwrap();
        assert!(check_print_descriptor(&bad_ret, "print()").is_err());

        let bad_arity = MethodDescriptor::parse("(II)V").unwrap();
        assert!(check_print_descriptor(&bad_arity, "println()").is_err());

        let bad_arg = MethodDescriptor::parse("(Z)V").unwrap();
        assert!(check_print_descriptor(&bad_arg, "print()").is_err());
    }

    proptest! {
        #[test]
        fn prop_valid_descriptors_roundtrip(
            args in proptest::collection::vec(
                proptest::sample::select(vec!['I', 'B', 'C', 'S', 'Z']), 0..8
            ),
            rtype in proptest::sample::select(vec!['V', 'I', 'B', 'C', 'S', 'Z']),
        ) {
            let sig: String =
                format!("({}){}", args.iter().collect::<String>(), rtype);
            let desc = MethodDescriptor::parse(&sig).unwrap();
            prop_assert_eq!(desc.nargs(), args.len());
            prop_assert_eq!(desc.rtype(), rtype);
            prop_assert_eq!(desc.nreturn(), usize::from(rtype != 'V'));
        }

        #[test]
        fn prop_garbage_never_panics(sig in "\\PC*") {
            let _ = MethodDescriptor::parse(&sig);
        }
    }
}
