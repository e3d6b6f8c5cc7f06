//! Payload serialization for requests, responses and method arguments.
//!
//! The [`Encode`] and [`Decode`] traits abstract over the serialization format used for payloads
//! on the wire. Blanket implementations over serde use MessagePack with named fields, so
//! argument and result types only need to derive `serde::Serialize` / `serde::Deserialize`.
//!
//! Method arguments travel as a list of separately encoded parameters together with a list of
//! canonical type descriptors (see [`type_descriptor`]). The descriptors identify the method
//! overload on the server, which looks methods up by `name@type1,type2`.

use std::io;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

/// MessagePack encoding of `nil`, decoded when a response carries no result.
pub(crate) const NIL: &[u8] = &[0xc0];

// ---------------------------------------------------------------------------
// CodecError
// ---------------------------------------------------------------------------

/// An error that occurs while encoding or decoding a payload or frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A value could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    /// Bytes could not be deserialized into the expected type.
    #[error("failed to decode payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    /// A frame length exceeded the configured maximum.
    #[error("frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge {
        /// The frame length.
        len: usize,
        /// The configured maximum.
        max: usize,
    },
    /// The number of parameters did not match the method's arity.
    #[error("expected {expected} parameters, got {actual}")]
    Arity {
        /// Number of parameters the method takes.
        expected: usize,
        /// Number of parameters received.
        actual: usize,
    },
    /// An io error on the underlying stream.
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Encode / Decode traits
// ---------------------------------------------------------------------------

/// Serializes a value into a payload.
pub trait Encode {
    /// Encodes `self` into bytes.
    fn encode(&self) -> Result<Bytes, CodecError>;
}

/// Deserializes a value from a payload.
pub trait Decode: Sized {
    /// Decodes a value from bytes.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

impl<T: Serialize + ?Sized> Encode for T {
    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(rmp_serde::to_vec_named(self)?))
    }
}

impl<T: DeserializeOwned> Decode for T {
    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::decode::from_slice(bytes)?)
    }
}

// ---------------------------------------------------------------------------
// Type descriptors
// ---------------------------------------------------------------------------

/// Returns the canonical descriptor of a parameter type.
///
/// Module paths and references are stripped, primitive integers and floats are named by width
/// (`i32` is `int`, `f64` is `double`), and `String` and `str` are both `string`. Generic
/// arguments are canonicalized recursively, so `Vec<alloc::string::String>` becomes
/// `Vec<string>`.
///
/// Client and server compute descriptors with this same function, so a descriptor produced for a
/// runtime argument always matches the descriptor of the declared parameter type.
///
/// ```
/// use courier::codec::type_descriptor;
///
/// assert_eq!(type_descriptor::<String>(), "string");
/// assert_eq!(type_descriptor::<&str>(), "string");
/// assert_eq!(type_descriptor::<i32>(), "int");
/// assert_eq!(type_descriptor::<Vec<i64>>(), "Vec<long>");
/// ```
pub fn type_descriptor<T: ?Sized>() -> String {
    canonicalize(std::any::type_name::<T>())
}

fn canonicalize(type_name: &str) -> String {
    let type_name = type_name.replace("&mut ", "").replace('&', "");
    let mut out = String::with_capacity(type_name.len());
    let mut ident = String::new();
    for c in type_name.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            ident.push(c);
        } else {
            flush_ident(&mut ident, &mut out);
            out.push(c);
        }
    }
    flush_ident(&mut ident, &mut out);
    out
}

fn flush_ident(ident: &mut String, out: &mut String) {
    if ident.is_empty() {
        return;
    }
    let last = ident.rsplit("::").next().unwrap_or(ident.as_str());
    let name = match last {
        "i8" | "u8" => "byte",
        "i16" | "u16" => "short",
        "i32" | "u32" => "int",
        "i64" | "u64" => "long",
        "f32" => "float",
        "f64" => "double",
        "bool" => "boolean",
        "String" | "str" => "string",
        other => other,
    };
    out.push_str(name);
    ident.clear();
}

// ---------------------------------------------------------------------------
// Args / Params
// ---------------------------------------------------------------------------

/// A tuple of arguments that can be sent to a remote method.
///
/// Each element is encoded separately and paired with its [`type_descriptor`].
pub trait Args {
    /// Encodes the arguments into parameter type descriptors and payloads.
    fn into_params(self) -> Result<(Vec<String>, Vec<Bytes>), CodecError>;
}

/// A tuple of parameters a service method accepts.
pub trait Params: Sized + Send + 'static {
    /// Returns the descriptors of the parameter types, in order.
    fn descriptors() -> Vec<String>;

    /// Decodes the parameters from their payloads.
    fn from_params(params: Vec<Bytes>) -> Result<Self, CodecError>;
}

macro_rules! impl_params {
    ($len:expr; $($ty:ident),*) => {
        impl<$($ty: Serialize),*> Args for ($($ty,)*) {
            #[allow(non_snake_case)]
            fn into_params(self) -> Result<(Vec<String>, Vec<Bytes>), CodecError> {
                let ($($ty,)*) = self;
                Ok((
                    vec![$(type_descriptor::<$ty>()),*],
                    vec![$($ty.encode()?),*],
                ))
            }
        }

        impl<$($ty: DeserializeOwned + Send + 'static),*> Params for ($($ty,)*) {
            fn descriptors() -> Vec<String> {
                vec![$(type_descriptor::<$ty>()),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_params(params: Vec<Bytes>) -> Result<Self, CodecError> {
                if params.len() != $len {
                    return Err(CodecError::Arity {
                        expected: $len,
                        actual: params.len(),
                    });
                }
                let mut params = params.into_iter();
                Ok(($(
                    <$ty as Decode>::decode(&params.next().unwrap_or_default())?,
                )*))
            }
        }
    };
}

impl_params!(0;);
impl_params!(1; A);
impl_params!(2; A, B);
impl_params!(3; A, B, C);
impl_params!(4; A, B, C, D);
impl_params!(5; A, B, C, D, E);
impl_params!(6; A, B, C, D, E, F);
impl_params!(7; A, B, C, D, E, F, G);
impl_params!(8; A, B, C, D, E, F, G, H);

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct User {
        name: String,
    }

    #[test]
    fn descriptors_strip_paths_and_name_primitives() {
        assert_eq!(type_descriptor::<String>(), "string");
        assert_eq!(type_descriptor::<str>(), "string");
        assert_eq!(type_descriptor::<&'static str>(), "string");
        assert_eq!(type_descriptor::<i8>(), "byte");
        assert_eq!(type_descriptor::<i16>(), "short");
        assert_eq!(type_descriptor::<u32>(), "int");
        assert_eq!(type_descriptor::<i64>(), "long");
        assert_eq!(type_descriptor::<f32>(), "float");
        assert_eq!(type_descriptor::<f64>(), "double");
        assert_eq!(type_descriptor::<bool>(), "boolean");
        assert_eq!(type_descriptor::<char>(), "char");
        assert_eq!(type_descriptor::<User>(), "User");
        assert_eq!(type_descriptor::<&User>(), "User");
        assert_eq!(type_descriptor::<Vec<String>>(), "Vec<string>");
        assert_eq!(
            type_descriptor::<std::collections::HashMap<String, i32>>(),
            "HashMap<string, int>"
        );
    }

    #[test]
    fn args_match_declared_params() {
        let (types, params) = ("li4", 7i32).into_params().unwrap();
        assert_eq!(types, <(String, i32)>::descriptors());

        let (name, n) = <(String, i32)>::from_params(params).unwrap();
        assert_eq!(name, "li4");
        assert_eq!(n, 7);
    }

    #[test]
    fn params_reject_wrong_arity() {
        let (_, params) = ("a", "b").into_params().unwrap();
        let err = <(String,)>::from_params(params).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Arity {
                expected: 1,
                actual: 2
            }
        ));
    }

    #[test]
    fn unit_args_are_empty() {
        let (types, params) = ().into_params().unwrap();
        assert!(types.is_empty());
        assert!(params.is_empty());
        <()>::from_params(Vec::new()).unwrap();
    }

    #[test]
    fn nil_decodes_to_unit_and_none() {
        <()>::decode(NIL).unwrap();
        assert_eq!(<Option<String>>::decode(NIL).unwrap(), None);
        assert!(String::decode(NIL).is_err());
    }

    #[test]
    fn structs_encode_with_named_fields() {
        let user = User {
            name: "zhang3".to_string(),
        };
        let bytes = user.encode().unwrap();
        assert_eq!(User::decode(&bytes).unwrap(), user);
    }
}
