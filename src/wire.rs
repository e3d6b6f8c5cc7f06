//! Wire types and length-prefixed framing.
//!
//! Every message on a connection is a frame: a 4-byte big-endian unsigned length followed by
//! exactly that many payload bytes. The payload is a MessagePack encoded [`Request`] (client to
//! server) or [`Response`] (server to client). Frames larger than the configured maximum, which
//! defaults to [`MAX_FRAME_LEN`], are a fatal decode error for the connection.

use std::{fmt, marker::PhantomData};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    codec::{CodecError, Decode, Encode},
    error::RemoteError,
};

/// Size of the frame length prefix, in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Default maximum payload size of a single frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Unique identifier correlating a [`Request`] with its [`Response`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(Uuid);

impl RequestId {
    /// Generates a new random request id.
    pub fn generate() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

/// A call of a remote method.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique among the caller's pending requests.
    pub id: RequestId,
    /// Target service name.
    pub service: String,
    /// Target method name.
    pub method: String,
    /// Canonical descriptors of the parameter types.
    pub param_types: Vec<String>,
    /// Separately encoded parameters.
    pub params: Vec<Bytes>,
}

impl Request {
    /// Creates a request with a freshly generated id.
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        param_types: Vec<String>,
        params: Vec<Bytes>,
    ) -> Self {
        Request {
            id: RequestId::generate(),
            service: service.into(),
            method: method.into(),
            param_types,
            params,
        }
    }
}

/// The outcome of a [`Request`].
///
/// A successful response carries a result and no error. A failed response carries an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this response answers.
    pub id: RequestId,
    /// Encoded return value.
    pub result: Option<Bytes>,
    /// Failure captured on the server.
    pub error: Option<RemoteError>,
}

impl Response {
    /// Creates a successful response.
    pub fn ok(id: RequestId, result: Bytes) -> Self {
        Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Creates a failed response.
    pub fn err(id: RequestId, error: RemoteError) -> Self {
        Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Returns `true` if the response carries an error.
    pub fn is_err(&self) -> bool {
        self.error.is_some()
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Encodes messages of type `T` into length-prefixed frames.
///
/// The encoder is typed by direction: a client holds a `FrameEncoder<Request>` and a server a
/// `FrameEncoder<Response>`, so writing the wrong message kind does not compile.
pub struct FrameEncoder<T> {
    max_frame_len: usize,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> FrameEncoder<T> {
    /// Creates an encoder rejecting payloads above `max_frame_len` bytes.
    pub fn new(max_frame_len: usize) -> Self {
        FrameEncoder {
            max_frame_len,
            _marker: PhantomData,
        }
    }

    /// Appends one frame holding `item` to `dst`.
    pub fn encode(&self, item: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = item.encode()?;
        if payload.len() > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }
        dst.reserve(LENGTH_PREFIX_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }

    /// Encodes `item` into a standalone frame.
    pub fn encode_to_bytes(&self, item: &T) -> Result<Bytes, CodecError> {
        let mut dst = BytesMut::new();
        self.encode(item, &mut dst)?;
        Ok(dst.freeze())
    }
}

impl<T> fmt::Debug for FrameEncoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameEncoder")
            .field("max_frame_len", &self.max_frame_len)
            .finish()
    }
}

/// Decodes length-prefixed frames into messages of type `T`.
pub struct FrameDecoder<T> {
    max_frame_len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> FrameDecoder<T> {
    /// Creates a decoder rejecting frames above `max_frame_len` bytes.
    pub fn new(max_frame_len: usize) -> Self {
        FrameDecoder {
            max_frame_len,
            _marker: PhantomData,
        }
    }

    /// Decodes the next complete frame from `src`.
    ///
    /// Returns `Ok(None)` without consuming anything when `src` does not yet hold a whole frame.
    /// A length above the maximum is an error, and the connection must be closed.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if src.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if src.len() < LENGTH_PREFIX_LEN + len {
            src.reserve(LENGTH_PREFIX_LEN + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX_LEN);
        let payload = src.split_to(len);
        T::decode(&payload).map(Some)
    }
}

impl<T> fmt::Debug for FrameDecoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("max_frame_len", &self.max_frame_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteErrorKind;

    fn request() -> Request {
        Request::new(
            "HelloService",
            "hello",
            vec!["string".to_string()],
            vec!["zhang3".encode().unwrap()],
        )
    }

    #[test]
    fn partial_frame_is_not_consumed() {
        let request = request();
        let frame = FrameEncoder::new(MAX_FRAME_LEN)
            .encode_to_bytes(&request)
            .unwrap();
        let decoder = FrameDecoder::<Request>::new(MAX_FRAME_LEN);

        let mut buf = BytesMut::from(&frame[..3]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);

        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), frame.len() - 1);

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(request));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_back_to_back_frames() {
        let encoder = FrameEncoder::new(MAX_FRAME_LEN);
        let first = Response::ok(RequestId::generate(), "hello! li4".encode().unwrap());
        let second = Response::err(
            RequestId::generate(),
            RemoteError::new(RemoteErrorKind::Handler, "boom"),
        );
        let mut buf = BytesMut::new();
        encoder.encode(&first, &mut buf).unwrap();
        encoder.encode(&second, &mut buf).unwrap();

        let decoder = FrameDecoder::<Response>::new(MAX_FRAME_LEN);
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(decoder.decode(&mut buf).unwrap(), Some(second));
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let frame = FrameEncoder::new(MAX_FRAME_LEN)
            .encode_to_bytes(&request())
            .unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - LENGTH_PREFIX_LEN);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let decoder = FrameDecoder::<Request>::new(MAX_FRAME_LEN);
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN as u32 + 1);
        buf.put_slice(&[0; 16]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(CodecError::FrameTooLarge { len, max })
                if len == MAX_FRAME_LEN + 1 && max == MAX_FRAME_LEN
        ));
    }

    #[test]
    fn oversized_payload_is_not_encoded() {
        let encoder = FrameEncoder::new(8);
        let mut buf = BytesMut::new();
        let err = encoder.encode(&request(), &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { max: 8, .. }));
        assert!(buf.is_empty());
    }
}
