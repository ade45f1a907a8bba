use serde::{Deserialize, Serialize};

/// Payload codec selected per call by the request's codec tag.
///
/// The wire envelope (Request/Response records) is always msgpack; the
/// tag only controls the argument/reply payload, so inspection tooling
/// can talk json to a binary service.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CodecKind {
    #[default]
    Msgpack,
    Json,
}

impl CodecKind {
    /// Unknown tags fall back to msgpack, like the empty default tag.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "json" => Self::Json,
            _ => Self::Msgpack,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            Self::Msgpack => "msgpack",
            Self::Json => "json",
        }
    }
}

/// The codec is immutable and cheap to clone; error details go to the
/// log, callers only need the failure itself.
#[derive(Clone, Copy, Default)]
pub struct Codec();

impl Codec {
    #[inline(always)]
    pub fn encode<T: Serialize>(&self, kind: CodecKind, v: &T) -> Result<Vec<u8>, ()> {
        match kind {
            CodecKind::Msgpack => match rmp_serde::encode::to_vec_named(v) {
                Ok(buf) => Ok(buf),
                Err(e) => {
                    error!("msgpack encode error: {:?}", e);
                    Err(())
                }
            },
            CodecKind::Json => match serde_json::to_vec(v) {
                Ok(buf) => Ok(buf),
                Err(e) => {
                    error!("json encode error: {:?}", e);
                    Err(())
                }
            },
        }
    }

    #[inline(always)]
    pub fn decode<'a, T: Deserialize<'a>>(&self, kind: CodecKind, buf: &'a [u8]) -> Result<T, ()> {
        match kind {
            CodecKind::Msgpack => match rmp_serde::decode::from_slice::<T>(buf) {
                Ok(v) => Ok(v),
                Err(e) => {
                    warn!("msgpack decode error: {:?}", e);
                    Err(())
                }
            },
            CodecKind::Json => match serde_json::from_slice::<T>(buf) {
                Ok(v) => Ok(v),
                Err(e) => {
                    warn!("json decode error: {:?}", e);
                    Err(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pair {
        x: i64,
        y: i64,
    }

    #[test]
    fn test_both_kinds() {
        let codec = Codec::default();
        let v = Pair { x: 2, y: 3 };
        for kind in [CodecKind::Msgpack, CodecKind::Json] {
            let buf = codec.encode(kind, &v).expect("encode");
            let back: Pair = codec.decode(kind, &buf).expect("decode");
            assert_eq!(back, v);
        }
    }

    #[test]
    fn test_tag_fallback() {
        assert_eq!(CodecKind::from_tag("json"), CodecKind::Json);
        assert_eq!(CodecKind::from_tag("msgpack"), CodecKind::Msgpack);
        assert_eq!(CodecKind::from_tag(""), CodecKind::Msgpack);
        assert_eq!(CodecKind::from_tag("protobuf"), CodecKind::Msgpack);
    }
}
