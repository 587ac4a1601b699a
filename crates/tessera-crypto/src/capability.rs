//! Capabilities: the only handle a client needs to locate, verify, read or
//! update an object
//!
//! Authority only ever narrows:
//! ```text
//! MutableWrite ──► MutableRead ──► MutableVerify
//! ImmutableRead ────────────────► ImmutableVerify
//! ```
//!
//! Text forms (base64url, no padding):
//! ```text
//! tessera:chk:<key>:<descriptor-hash>:<k>:<n>:<size>
//! tessera:chk-verify:<storage-index>:<descriptor-hash>:<k>:<n>:<size>
//! tessera:ssk:<signing-seed>
//! tessera:ssk-ro:<read-key>:<verifying-key>
//! tessera:ssk-verify:<verifying-key>
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tessera_core::{GridError, GridResult, ObjectKind, StorageIndex};

use crate::cipher::ciphertext_len;
use crate::keys::ReadKey;
use crate::signing::{mutable_read_key, mutable_storage_index};

const PREFIX: &str = "tessera";

#[derive(Clone, PartialEq, Eq)]
pub enum Capability {
    ImmutableRead {
        key: ReadKey,
        descriptor_hash: blake3::Hash,
        needed: u8,
        total: u8,
        /// Plaintext length in bytes
        size: u64,
    },
    ImmutableVerify {
        storage_index: StorageIndex,
        descriptor_hash: blake3::Hash,
        needed: u8,
        total: u8,
        size: u64,
    },
    MutableWrite {
        signing_key: SigningKey,
    },
    MutableRead {
        read_key: ReadKey,
        verifying_key: VerifyingKey,
    },
    MutableVerify {
        verifying_key: VerifyingKey,
    },
}

impl Capability {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Capability::ImmutableRead { .. } | Capability::ImmutableVerify { .. } => {
                ObjectKind::Immutable
            }
            _ => ObjectKind::Mutable,
        }
    }

    pub fn storage_index(&self) -> GridResult<StorageIndex> {
        match self {
            Capability::ImmutableRead { key, .. } => key.storage_index(),
            Capability::ImmutableVerify { storage_index, .. } => Ok(*storage_index),
            Capability::MutableWrite { signing_key } => {
                Ok(mutable_storage_index(&signing_key.verifying_key()))
            }
            Capability::MutableRead { verifying_key, .. }
            | Capability::MutableVerify { verifying_key } => {
                Ok(mutable_storage_index(verifying_key))
            }
        }
    }

    /// Write → read. Read caps return themselves; verify caps can't be widened.
    pub fn to_read_cap(&self) -> GridResult<Capability> {
        match self {
            Capability::MutableWrite { signing_key } => Ok(Capability::MutableRead {
                read_key: mutable_read_key(signing_key)?,
                verifying_key: signing_key.verifying_key(),
            }),
            Capability::ImmutableRead { .. } | Capability::MutableRead { .. } => Ok(self.clone()),
            Capability::ImmutableVerify { .. } | Capability::MutableVerify { .. } => Err(
                GridError::InvalidCapability("a verify cap cannot be turned into a read cap".into()),
            ),
        }
    }

    /// Any → verify. The result carries no key material.
    pub fn to_verify_cap(&self) -> GridResult<Capability> {
        Ok(match self {
            Capability::ImmutableRead {
                key,
                descriptor_hash,
                needed,
                total,
                size,
            } => Capability::ImmutableVerify {
                storage_index: key.storage_index()?,
                descriptor_hash: *descriptor_hash,
                needed: *needed,
                total: *total,
                size: *size,
            },
            Capability::ImmutableVerify { .. } | Capability::MutableVerify { .. } => self.clone(),
            Capability::MutableWrite { signing_key } => Capability::MutableVerify {
                verifying_key: signing_key.verifying_key(),
            },
            Capability::MutableRead { verifying_key, .. } => Capability::MutableVerify {
                verifying_key: *verifying_key,
            },
        })
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Capability::MutableWrite { .. })
    }

    pub fn is_verify_only(&self) -> bool {
        matches!(
            self,
            Capability::ImmutableVerify { .. } | Capability::MutableVerify { .. }
        )
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = |bytes: &[u8]| URL_SAFE_NO_PAD.encode(bytes);
        match self {
            Capability::ImmutableRead {
                key,
                descriptor_hash,
                needed,
                total,
                size,
            } => write!(
                f,
                "{PREFIX}:chk:{}:{}:{needed}:{total}:{size}",
                b64(key.as_bytes()),
                b64(descriptor_hash.as_bytes())
            ),
            Capability::ImmutableVerify {
                storage_index,
                descriptor_hash,
                needed,
                total,
                size,
            } => write!(
                f,
                "{PREFIX}:chk-verify:{}:{}:{needed}:{total}:{size}",
                b64(storage_index.as_bytes()),
                b64(descriptor_hash.as_bytes())
            ),
            Capability::MutableWrite { signing_key } => {
                write!(f, "{PREFIX}:ssk:{}", b64(&signing_key.to_bytes()))
            }
            Capability::MutableRead {
                read_key,
                verifying_key,
            } => write!(
                f,
                "{PREFIX}:ssk-ro:{}:{}",
                b64(read_key.as_bytes()),
                b64(verifying_key.as_bytes())
            ),
            Capability::MutableVerify { verifying_key } => {
                write!(f, "{PREFIX}:ssk-verify:{}", b64(verifying_key.as_bytes()))
            }
        }
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Capability::ImmutableRead { .. } => "ImmutableRead",
            Capability::ImmutableVerify { .. } => "ImmutableVerify",
            Capability::MutableWrite { .. } => "MutableWrite",
            Capability::MutableRead { .. } => "MutableRead",
            Capability::MutableVerify { .. } => "MutableVerify",
        };
        let mut d = f.debug_struct(tag);
        if let Ok(si) = self.storage_index() {
            d.field("storage_index", &si);
        }
        d.finish_non_exhaustive()
    }
}

impl FromStr for Capability {
    type Err = GridError;

    fn from_str(s: &str) -> GridResult<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() < 3 || parts[0] != PREFIX {
            return Err(invalid(s, "expected tessera:<kind>:..."));
        }
        let fields = &parts[2..];
        match (parts[1], fields.len()) {
            ("chk", 5) => {
                let (needed, total, size) = immutable_shape(s, &fields[2..])?;
                Ok(Capability::ImmutableRead {
                    key: ReadKey::from_bytes(decode32(fields[0])?),
                    descriptor_hash: blake3::Hash::from(decode32(fields[1])?),
                    needed,
                    total,
                    size,
                })
            }
            ("chk-verify", 5) => {
                let (needed, total, size) = immutable_shape(s, &fields[2..])?;
                Ok(Capability::ImmutableVerify {
                    storage_index: StorageIndex::from_bytes(decode32(fields[0])?),
                    descriptor_hash: blake3::Hash::from(decode32(fields[1])?),
                    needed,
                    total,
                    size,
                })
            }
            ("ssk", 1) => Ok(Capability::MutableWrite {
                signing_key: SigningKey::from_bytes(&decode32(fields[0])?),
            }),
            ("ssk-ro", 2) => Ok(Capability::MutableRead {
                read_key: ReadKey::from_bytes(decode32(fields[0])?),
                verifying_key: verifying_key(fields[1])?,
            }),
            ("ssk-verify", 1) => Ok(Capability::MutableVerify {
                verifying_key: verifying_key(fields[0])?,
            }),
            (kind, n) => Err(invalid(
                s,
                &format!("unknown kind '{kind}' with {n} fields"),
            )),
        }
    }
}

impl Serialize for Capability {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn invalid(s: &str, reason: &str) -> GridError {
    // Never echo the full string: it may hold key material.
    let head: String = s.chars().take(20).collect();
    GridError::InvalidCapability(format!("{reason} (got '{head}…')"))
}

fn decode32(field: &str) -> GridResult<[u8; 32]> {
    let bytes = URL_SAFE_NO_PAD
        .decode(field)
        .map_err(|e| GridError::InvalidCapability(format!("bad base64 field: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        GridError::InvalidCapability(format!("expected 32-byte field, got {}", b.len()))
    })
}

fn verifying_key(field: &str) -> GridResult<VerifyingKey> {
    VerifyingKey::from_bytes(&decode32(field)?)
        .map_err(|e| GridError::InvalidCapability(format!("bad verifying key: {e}")))
}

/// `k:n:size` of an immutable cap. Rejects shapes no upload can produce:
/// k outside 1..=n, or a size whose ciphertext length overflows.
fn immutable_shape(s: &str, fields: &[&str]) -> GridResult<(u8, u8, u64)> {
    let needed: u8 = parse_num(fields[0])?;
    let total: u8 = parse_num(fields[1])?;
    let size: u64 = parse_num(fields[2])?;
    if needed == 0 || needed > total {
        return Err(invalid(s, &format!("impossible encoding {needed}-of-{total}")));
    }
    if ciphertext_len(size).is_none() {
        return Err(invalid(s, &format!("object size {size} is too large")));
    }
    Ok((needed, total, size))
}

fn parse_num<T: FromStr>(field: &str) -> GridResult<T> {
    field
        .parse()
        .map_err(|_| GridError::InvalidCapability(format!("bad numeric field '{field}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derive_convergent_key;
    use crate::signing::generate_signing_key;
    use proptest::prelude::*;
    use tessera_core::EncodingParams;

    fn chk() -> Capability {
        Capability::ImmutableRead {
            key: derive_convergent_key(b"hello", &EncodingParams::default(), None),
            descriptor_hash: blake3::hash(b"descriptor"),
            needed: 3,
            total: 10,
            size: 5,
        }
    }

    #[test]
    fn test_text_roundtrip_all_kinds() {
        let write = Capability::MutableWrite {
            signing_key: generate_signing_key(),
        };
        let caps = vec![
            chk(),
            chk().to_verify_cap().unwrap(),
            write.clone(),
            write.to_read_cap().unwrap(),
            write.to_verify_cap().unwrap(),
        ];
        for cap in caps {
            let text = cap.to_string();
            assert!(text.starts_with("tessera:"));
            assert!(!text.contains('='), "no padding: {text}");
            let parsed: Capability = text.parse().unwrap();
            assert_eq!(parsed, cap);
            assert_eq!(parsed.to_string(), text);
        }
    }

    #[test]
    fn test_storage_index_stable_across_hierarchy() {
        let write = Capability::MutableWrite {
            signing_key: generate_signing_key(),
        };
        let si = write.storage_index().unwrap();
        assert_eq!(write.to_read_cap().unwrap().storage_index().unwrap(), si);
        assert_eq!(write.to_verify_cap().unwrap().storage_index().unwrap(), si);

        let read = chk();
        assert_eq!(
            read.to_verify_cap().unwrap().storage_index().unwrap(),
            read.storage_index().unwrap()
        );
    }

    #[test]
    fn test_verify_caps_hold_no_keys() {
        let read = chk();
        let verify = read.to_verify_cap().unwrap();
        assert!(verify.is_verify_only());
        let Capability::ImmutableRead { key, .. } = &read else {
            unreachable!()
        };
        let key_b64 = URL_SAFE_NO_PAD.encode(key.as_bytes());
        assert!(!verify.to_string().contains(&key_b64));
        assert!(verify.to_read_cap().is_err());
    }

    #[test]
    fn test_read_cap_cannot_write() {
        let write = Capability::MutableWrite {
            signing_key: generate_signing_key(),
        };
        let read = write.to_read_cap().unwrap();
        assert!(!read.is_write());
        let seed = match &write {
            Capability::MutableWrite { signing_key } => URL_SAFE_NO_PAD.encode(signing_key.to_bytes()),
            _ => unreachable!(),
        };
        assert!(!read.to_string().contains(&seed));
        assert_eq!(read.to_read_cap().unwrap(), read);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for s in [
            "",
            "tessera",
            "tahoe:chk:a:b:1:2:3",
            "tessera:chk:short:short:3:10:5",
            "tessera:ssk",
            "tessera:unknown:AAAA",
        ] {
            assert!(
                matches!(s.parse::<Capability>(), Err(GridError::InvalidCapability(_))),
                "{s:?} should be rejected"
            );
        }
        let mut text = chk().to_string();
        text.push_str(":extra");
        assert!(text.parse::<Capability>().is_err());
    }

    #[test]
    fn test_parse_rejects_impossible_shapes() {
        let with_shape = |cap: &Capability, k: &str, n: &str, size: &str| {
            let mut parts: Vec<String> = cap.to_string().split(':').map(String::from).collect();
            parts[4] = k.into();
            parts[5] = n.into();
            parts[6] = size.into();
            parts.join(":")
        };
        let read = chk();
        let verify = read.to_verify_cap().unwrap();
        let max = u64::MAX.to_string();

        for cap in [&read, &verify] {
            for (k, n, size) in [
                ("0", "0", "5"),
                ("0", "4", "5"),
                ("5", "4", "5"),
                ("3", "10", max.as_str()),
            ] {
                let text = with_shape(cap, k, n, size);
                assert!(
                    matches!(text.parse::<Capability>(), Err(GridError::InvalidCapability(_))),
                    "{k}-of-{n} size {size} should be rejected"
                );
            }
            // the largest encryptable size and k = n still parse
            let edge = with_shape(cap, "4", "4", &(u64::MAX - 40).to_string());
            assert!(edge.parse::<Capability>().is_ok());
        }
    }

    #[test]
    fn test_debug_hides_keys() {
        let cap = chk();
        let dbg = format!("{cap:?}");
        assert!(dbg.starts_with("ImmutableRead"));
        assert!(!dbg.contains(&cap.to_string()[12..40]));
    }

    #[test]
    fn test_serde_as_string() {
        let cap = chk();
        let json = serde_json::to_string(&cap).unwrap();
        assert_eq!(json, format!("\"{cap}\""));
        let back: Capability = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cap);
    }

    proptest! {
        #[test]
        fn chk_text_roundtrip(
            key in proptest::array::uniform32(any::<u8>()),
            hash in proptest::array::uniform32(any::<u8>()),
            needed in 1u8..=255,
            size in any::<u64>(),
        ) {
            let cap = Capability::ImmutableRead {
                key: ReadKey::from_bytes(key),
                descriptor_hash: blake3::Hash::from(hash),
                needed,
                total: 255,
                size,
            };
            let parsed: Capability = cap.to_string().parse().unwrap();
            prop_assert_eq!(parsed, cap);
        }
    }
}
