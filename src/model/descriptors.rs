/* Parsers for JNI-style type, field and method descriptors */

use nom::branch::alt;
use nom::bytes::complete::{is_not, take_while1};
use nom::character::complete::{char, one_of};
use nom::combinator::{all_consuming, recognize};
use nom::multi::{many0, many0_count};
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;

use crate::dex::error::DexError;

/// A parsed `Lcls;.name:type` descriptor. Components borrow from the input.
#[derive(Debug, PartialEq, Eq)]
pub struct FieldDescriptor<'a> {
    pub class: &'a str,
    pub name: &'a str,
    pub ty: &'a str,
}

/// A parsed `Lcls;.name:(args)ret` descriptor.
#[derive(Debug, PartialEq, Eq)]
pub struct MethodDescriptor<'a> {
    pub class: &'a str,
    pub name: &'a str,
    pub args: Vec<&'a str>,
    pub rtype: &'a str,
}

fn class_descriptor(input: &str) -> IResult<&str, &str> {
    recognize(tuple((char('L'), is_not(";"), char(';'))))(input)
}

fn primitive_descriptor(input: &str) -> IResult<&str, &str> {
    recognize(one_of("ZBSCIJFDV"))(input)
}

/// Any single type: primitive, class or array thereof.
pub(crate) fn type_descriptor(input: &str) -> IResult<&str, &str> {
    recognize(pair(many0_count(char('[')), alt((primitive_descriptor, class_descriptor))))(input)
}

fn proto_descriptor(input: &str) -> IResult<&str, (Vec<&str>, &str)> {
    pair(delimited(char('('), many0(type_descriptor), char(')')), type_descriptor)(input)
}

fn member_name(input: &str) -> IResult<&str, &str> {
    take_while1(|c| c != ':' && c != '(')(input)
}

fn field_descriptor(input: &str) -> IResult<&str, FieldDescriptor<'_>> {
    let (rest, (class, name, ty)) =
        tuple((type_descriptor, preceded(char('.'), member_name), preceded(char(':'), type_descriptor)))(input)?;
    Ok((rest, FieldDescriptor { class, name, ty }))
}

fn method_descriptor(input: &str) -> IResult<&str, MethodDescriptor<'_>> {
    let (rest, (class, name, (args, rtype))) =
        tuple((type_descriptor, preceded(char('.'), member_name), preceded(char(':'), proto_descriptor)))(input)?;
    Ok((rest, MethodDescriptor { class, name, args, rtype }))
}

pub fn is_valid_type_descriptor(descriptor: &str) -> bool {
    all_consuming(type_descriptor)(descriptor).is_ok()
}

pub fn parse_proto(descriptor: &str) -> Result<(&str, Vec<&str>), DexError> {
    match all_consuming(proto_descriptor)(descriptor) {
        Ok((_, (args, rtype))) => Ok((rtype, args)),
        Err(_) => fail!("invalid proto descriptor {}", descriptor),
    }
}

pub fn parse_field_descriptor(descriptor: &str) -> Result<FieldDescriptor<'_>, DexError> {
    match all_consuming(field_descriptor)(descriptor) {
        Ok((_, parsed)) => Ok(parsed),
        Err(_) => fail!("invalid field descriptor {}", descriptor),
    }
}

pub fn parse_method_descriptor(descriptor: &str) -> Result<MethodDescriptor<'_>, DexError> {
    match all_consuming(method_descriptor)(descriptor) {
        Ok((_, parsed)) => Ok(parsed),
        Err(_) => fail!("invalid method descriptor {}", descriptor),
    }
}

/// The shorty character of a type: its primitive letter, or `L` for any reference.
pub fn shorty_char(descriptor: &str) -> char {
    match descriptor.chars().next() {
        Some('[') | Some('L') | None => 'L',
        Some(c) => c,
    }
}

/// `com.foo.Bar` -> `Lcom/foo/Bar;`
pub fn java_name_to_internal(name: &str) -> String {
    format!("L{};", name.replace('.', "/"))
}

/// `Lcom/foo/Bar;` -> `com.foo.Bar`. Non-class descriptors are returned as is.
pub fn internal_to_java_name(descriptor: &str) -> String {
    match descriptor.strip_prefix('L').and_then(|d| d.strip_suffix(';')) {
        Some(inner) => inner.replace('/', "."),
        None => descriptor.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_descriptors() {
        let m = parse_method_descriptor("Lcom/foo/Bar;.baz:(I[JLjava/lang/String;)V").unwrap();
        assert_eq!(m.class, "Lcom/foo/Bar;");
        assert_eq!(m.name, "baz");
        assert_eq!(m.args, vec!["I", "[J", "Ljava/lang/String;"]);
        assert_eq!(m.rtype, "V");

        let init = parse_method_descriptor("LA;.<init>:()V").unwrap();
        assert_eq!(init.name, "<init>");
        assert!(init.args.is_empty());

        let clone = parse_method_descriptor("[I.clone:()Ljava/lang/Object;").unwrap();
        assert_eq!(clone.class, "[I");
    }

    #[test]
    fn field_descriptors() {
        let f = parse_field_descriptor("Lcom/foo/Bar;.count:[[I").unwrap();
        assert_eq!(f, FieldDescriptor { class: "Lcom/foo/Bar;", name: "count", ty: "[[I" });
    }

    #[test]
    fn malformed_descriptors_are_rejected() {
        assert!(parse_method_descriptor("Lcom/foo/Bar;.baz:(I").is_err());
        assert!(parse_method_descriptor("Lcom/foo/Bar.baz:()V").is_err());
        assert!(parse_field_descriptor("LA;.f:Q").is_err());
        assert!(parse_proto("(II)VV").is_err());
        assert!(!is_valid_type_descriptor("[L;"));
        assert!(is_valid_type_descriptor("[[Ljava/lang/Object;"));
    }

    #[test]
    fn java_names() {
        assert_eq!(java_name_to_internal("com.basic.Test"), "Lcom/basic/Test;");
        assert_eq!(internal_to_java_name("Lcom/basic/Test;"), "com.basic.Test");
        assert_eq!(internal_to_java_name("I"), "I");
        assert_eq!(shorty_char("[I"), 'L');
        assert_eq!(shorty_char("J"), 'J');
    }
}
