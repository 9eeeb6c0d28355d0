//! Node identity: textual node IDs and the persistent key/certificate pair

use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Prefix every node identifier carries.
pub const NODE_ID_PREFIX: &str = "node-";

/// Hex characters after the prefix (32 hex chars = 128 bits).
pub const NODE_ID_HEX_LEN: usize = 32;

/// Key space width in bits.
pub const NODE_ID_BITS: u32 = 128;

/// RSA modulus size for node keys. 2048 keeps OAEP-wrapped session keys
/// at 256 bytes, well inside the DHT datagram budget.
const NODE_KEY_BITS: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("node ID must start with '{NODE_ID_PREFIX}': {0}")]
    BadPrefix(String),

    #[error("node ID hex part must be {NODE_ID_HEX_LEN} characters: {0}")]
    BadLength(String),

    #[error("invalid hex characters in node ID: {0}")]
    BadHex(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key error: {0}")]
    Key(String),

    #[error("certificate error: {0}")]
    Certificate(String),
}

/// Textual node identifier, `node-<32 lowercase hex>`.
///
/// Parses to a 128-bit unsigned integer for the Kademlia XOR metric.
/// Equality and hashing are by the integer value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    value: u128,
}

impl NodeId {
    /// Parse a textual identifier, validating prefix, length and hex.
    pub fn parse(text: &str) -> Result<Self, IdentityError> {
        let hex_part = text
            .strip_prefix(NODE_ID_PREFIX)
            .ok_or_else(|| IdentityError::BadPrefix(text.to_string()))?;

        if hex_part.len() != NODE_ID_HEX_LEN {
            return Err(IdentityError::BadLength(text.to_string()));
        }

        let value = u128::from_str_radix(hex_part, 16)
            .map_err(|_| IdentityError::BadHex(text.to_string()))?;

        Ok(Self { value })
    }

    /// Build from the raw 128-bit value.
    pub fn from_value(value: u128) -> Self {
        Self { value }
    }

    /// Fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self {
            value: u128::from_be_bytes(bytes),
        }
    }

    /// 128-bit integer form, used by the XOR distance metric.
    pub fn value(&self) -> u128 {
        self.value
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        let full = self.to_string();
        full[..20.min(full.len())].to_string()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{NODE_ID_PREFIX}{:032x}", self.value)
    }
}

impl std::str::FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        NodeId::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// Persistent node identity: `node.key` (PKCS#8 RSA) and `node.crt`
/// (self-signed, Common Name = node ID) under the data directory.
///
/// The same key pair backs direct TLS, DTLS, and the RSA-OAEP key wrap
/// used by gossip sealing.
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub key_pem: String,
    pub cert_pem: String,
    pub private_key: RsaPrivateKey,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

impl NodeIdentity {
    /// Load `node.key`/`node.crt` from the data directory, generating a
    /// fresh identity when either file is missing.
    pub fn load_or_generate(data_dir: &Path) -> Result<Self, IdentityError> {
        std::fs::create_dir_all(data_dir)?;
        let key_path = data_dir.join("node.key");
        let cert_path = data_dir.join("node.crt");

        if key_path.exists() && cert_path.exists() {
            let key_pem = std::fs::read_to_string(&key_path)?;
            let cert_pem = std::fs::read_to_string(&cert_path)?;

            let private_key = RsaPrivateKey::from_pkcs8_pem(&key_pem)
                .map_err(|e| IdentityError::Key(e.to_string()))?;
            let node_id = node_id_from_cert_pem(&cert_pem)?;

            info!("Loaded node identity {} from {:?}", node_id, key_path);
            return Ok(Self {
                node_id,
                key_pem,
                cert_pem,
                private_key,
                key_path,
                cert_path,
            });
        }

        let node_id = NodeId::random();
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, NODE_KEY_BITS)
            .map_err(|e| IdentityError::Key(e.to_string()))?;
        let key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| IdentityError::Key(e.to_string()))?
            .to_string();

        let cert_pem = self_signed_cert_pem(&node_id, &key_pem)?;

        std::fs::write(&key_path, &key_pem)?;
        std::fs::write(&cert_path, &cert_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&key_path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&key_path, perms)?;
        }

        info!("Generated node identity {}, saved to {:?}", node_id, key_path);
        Ok(Self {
            node_id,
            key_pem,
            cert_pem,
            private_key,
            key_path,
            cert_path,
        })
    }
}

/// Issue a self-signed certificate whose Common Name is the node ID.
pub fn self_signed_cert_pem(node_id: &NodeId, key_pem: &str) -> Result<String, IdentityError> {
    let key_pair = rcgen::KeyPair::from_pem(key_pem)
        .map_err(|e| IdentityError::Key(e.to_string()))?;

    let mut params = rcgen::CertificateParams::new(Vec::<String>::new())
        .map_err(|e| IdentityError::Certificate(e.to_string()))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, node_id.to_string());

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| IdentityError::Certificate(e.to_string()))?;

    Ok(cert.pem())
}

/// Extract the node ID from a certificate's Common Name.
pub fn node_id_from_cert_pem(cert_pem: &str) -> Result<NodeId, IdentityError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| IdentityError::Certificate(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| IdentityError::Certificate(e.to_string()))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| IdentityError::Certificate("certificate has no Common Name".into()))?;

    NodeId::parse(cn)
}

/// Extract the node ID from a DER-encoded certificate (DTLS handshakes).
pub fn node_id_from_cert_der(der: &[u8]) -> Result<NodeId, IdentityError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| IdentityError::Certificate(e.to_string()))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or_else(|| IdentityError::Certificate("certificate has no Common Name".into()))?;

    NodeId::parse(cn)
}

/// Extract the RSA public key from a certificate PEM (gossip sealing).
pub fn public_key_from_cert_pem(cert_pem: &str) -> Result<rsa::RsaPublicKey, IdentityError> {
    use rsa::pkcs8::DecodePublicKey;

    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| IdentityError::Certificate(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| IdentityError::Certificate(e.to_string()))?;

    rsa::RsaPublicKey::from_public_key_der(cert.tbs_certificate.subject_pki.raw)
        .map_err(|e| IdentityError::Certificate(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let id = NodeId::parse("node-abcd1234abcd1234abcd1234abcd1234").unwrap();
        assert_eq!(id.value(), 0xabcd1234abcd1234abcd1234abcd1234);
        assert_eq!(id.to_string(), "node-abcd1234abcd1234abcd1234abcd1234");
    }

    #[test]
    fn test_parse_rejects_bad_prefix() {
        assert!(NodeId::parse("peer-abcd1234abcd1234abcd1234abcd1234").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_length() {
        assert!(NodeId::parse("node-abcd1234").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_hex() {
        assert!(NodeId::parse("node-zzzz1234abcd1234abcd1234abcd1234").is_err());
    }

    #[test]
    fn test_zero_padding() {
        let id = NodeId::from_value(1);
        assert_eq!(id.to_string(), "node-00000000000000000000000000000001");
        assert_eq!(NodeId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(NodeId::random(), NodeId::random());
    }

    #[test]
    fn test_generate_and_reload_identity() {
        let dir = std::env::temp_dir().join(format!("meshcore_id_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let ident = NodeIdentity::load_or_generate(&dir).unwrap();
        let reloaded = NodeIdentity::load_or_generate(&dir).unwrap();
        assert_eq!(ident.node_id, reloaded.node_id);

        let from_cert = node_id_from_cert_pem(&ident.cert_pem).unwrap();
        assert_eq!(from_cert, ident.node_id);

        // Cert carries the same RSA key that node.key holds
        let public = public_key_from_cert_pem(&ident.cert_pem).unwrap();
        assert_eq!(public, ident.private_key.to_public_key());

        std::fs::remove_dir_all(&dir).ok();
    }
}
