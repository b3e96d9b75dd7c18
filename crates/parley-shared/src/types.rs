use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

// BLAKE3 output (32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Digest(#[serde(with = "hex32")] pub [u8; 32]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        parse_hex_32(s).map(Self)
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Content id of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub Digest);

impl MessageId {
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Hash of the conversation key a context is bound to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextKey(pub Digest);

impl ContextKey {
    pub fn from_room_key(key: &[u8]) -> Self {
        Self(Digest::of(key))
    }

    pub fn short(&self) -> String {
        self.0.short()
    }
}

impl std::fmt::Display for ContextKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Fixed-size topic id of a discourse.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DiscourseId(#[serde(with = "hex32")] pub [u8; 32]);

impl DiscourseId {
    pub fn random() -> Self {
        let mut id = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut id);
        Self(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        parse_hex_32(s).map(Self)
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for DiscourseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Opaque identity the transport assigns to a room member.
///
/// Two members are the same iff their numbers are equal. The value is chosen
/// by the transport and is not derived from any key material, so it must not
/// be used for authentication.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub u64);

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "member#{}", self.0)
    }
}

// Public identity of a member as reported by the transport (32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PublicKey(#[serde(with = "hex32")] pub [u8; 32]);

impl PublicKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProtocolError> {
        parse_hex_32(s).map(Self)
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A member handle as handed over by the transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Member {
    pub id: MemberId,
    pub key: Option<PublicKey>,
}

impl Member {
    pub fn new(id: MemberId, key: Option<PublicKey>) -> Self {
        Self { id, key }
    }
}

/// Index key of a tag value. `None` and the empty string both map to the
/// reserved block marker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TagKey(pub Digest);

impl TagKey {
    pub const BLOCK: TagKey = TagKey(Digest::ZERO);

    pub fn of(tag: Option<&str>) -> Self {
        match tag {
            Some(value) if !value.is_empty() => Self(Digest::of(value.as_bytes())),
            _ => Self::BLOCK,
        }
    }

    pub fn is_block(&self) -> bool {
        *self == Self::BLOCK
    }
}

/// Hex strings for human-readable formats, raw bytes otherwise.
mod hex32 {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            bytes.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            super::parse_hex_32(&s).map_err(D::Error::custom)
        } else {
            <[u8; 32]>::deserialize(deserializer)
        }
    }
}

fn parse_hex_32(s: &str) -> Result<[u8; 32], ProtocolError> {
    let bytes = hex::decode(s.trim())?;
    if bytes.len() != 32 {
        return Err(ProtocolError::InvalidLength {
            expected: 32,
            actual: bytes.len(),
        });
    }
    let mut arr = [0u8; 32];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_hex_roundtrip() {
        let digest = Digest::of(b"parley");
        let restored = Digest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(digest, restored);
        assert_eq!(digest.short().len(), 8);
    }

    #[test]
    fn test_hex_wrong_length() {
        assert!(matches!(
            PublicKey::from_hex("abcd"),
            Err(ProtocolError::InvalidLength { expected: 32, actual: 2 })
        ));
    }

    #[test]
    fn test_json_uses_hex() {
        let id = MessageId(Digest([0xab; 32]));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        assert_eq!(serde_json::from_str::<MessageId>(&json).unwrap(), id);
    }

    #[test]
    fn test_bincode_uses_raw_bytes() {
        let key = PublicKey([7; 32]);
        let bytes = bincode::serialize(&key).unwrap();
        assert_eq!(bytes, vec![7u8; 32]);
        assert_eq!(bincode::deserialize::<PublicKey>(&bytes).unwrap(), key);
    }

    #[test]
    fn test_null_and_empty_tag_are_block() {
        assert!(TagKey::of(None).is_block());
        assert!(TagKey::of(Some("")).is_block());
        assert!(!TagKey::of(Some("work")).is_block());
        assert_eq!(TagKey::of(Some("work")), TagKey::of(Some("work")));
    }

    #[test]
    fn test_random_discourse_ids_differ() {
        assert_ne!(DiscourseId::random(), DiscourseId::random());
    }
}
