//! Android key attestation extension parser
//!
//! Parses the key attestation extension (OID 1.3.6.1.4.1.11129.2.1.17) from
//! the leaf certificate into a typed [`KeyDescription`] view.
//!
//! ASN.1 structure:
//! ```asn1
//! KeyDescription ::= SEQUENCE {
//!     attestationVersion         INTEGER,
//!     attestationSecurityLevel   SecurityLevel,
//!     keymasterVersion           INTEGER,
//!     keymasterSecurityLevel     SecurityLevel,
//!     attestationChallenge       OCTET STRING,
//!     uniqueId                   OCTET STRING,
//!     softwareEnforced           AuthorizationList,
//!     teeEnforced                AuthorizationList,
//! }
//! ```
//!
//! Only the authorization tags the policy engine consumes are extracted;
//! unknown tags are skipped.

use der_parser::ber::{BerObject, BerObjectContent};
use der_parser::oid::Oid;
use thiserror::Error;
use x509_parser::prelude::*;

// Android Key Attestation extension OID: 1.3.6.1.4.1.11129.2.1.17
const KEY_ATTESTATION_EXTENSION_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 11129, 2, 1, 17];

// AuthorizationList tags consumed by the policy engine.
const TAG_ALL_APPLICATIONS: u32 = 600;
const TAG_ORIGIN: u32 = 702;
const TAG_ROLLBACK_RESISTANT: u32 = 703;
const TAG_ROOT_OF_TRUST: u32 = 704;
const TAG_OS_VERSION: u32 = 705;
const TAG_OS_PATCH_LEVEL: u32 = 706;
const TAG_ATTESTATION_APPLICATION_ID: u32 = 709;

/// Errors that can occur while parsing the attestation extension.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtensionError {
    /// The leaf certificate could not be parsed
    #[error("leaf certificate could not be parsed")]
    InvalidCertificate,

    /// Key attestation extension not found in the leaf certificate
    #[error("key attestation extension not present")]
    MissingExtension,

    /// Invalid or unparseable attestation extension
    #[error("malformed key attestation extension: {0}")]
    Malformed(String),
}

/// Keymaster security level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// Key material held in non-secure memory
    Software,
    /// Key material held in a trusted execution environment
    TrustedEnvironment,
    /// Key material held in a dedicated hardware security module
    StrongBox,
}

impl TryFrom<i64> for SecurityLevel {
    type Error = ExtensionError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SecurityLevel::Software),
            1 => Ok(SecurityLevel::TrustedEnvironment),
            2 => Ok(SecurityLevel::StrongBox),
            _ => Err(ExtensionError::Malformed(format!(
                "unknown security level: {value}"
            ))),
        }
    }
}

/// Verified boot state from the root of trust
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifiedBootState {
    /// Boot chain verified against the factory key
    Verified,
    /// Boot chain verified against a user-set key
    SelfSigned,
    /// Unverified boot (unlocked bootloader)
    Unverified,
    /// Boot verification failed
    Failed,
}

impl TryFrom<i64> for VerifiedBootState {
    type Error = ExtensionError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(VerifiedBootState::Verified),
            1 => Ok(VerifiedBootState::SelfSigned),
            2 => Ok(VerifiedBootState::Unverified),
            3 => Ok(VerifiedBootState::Failed),
            _ => Err(ExtensionError::Malformed(format!(
                "unknown verified boot state: {value}"
            ))),
        }
    }
}

/// Origin of the attested key material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Generated,
    Derived,
    Imported,
    Other(i64),
}

impl From<i64> for KeyOrigin {
    fn from(value: i64) -> Self {
        match value {
            0 => KeyOrigin::Generated,
            1 => KeyOrigin::Derived,
            2 => KeyOrigin::Imported,
            other => KeyOrigin::Other(other),
        }
    }
}

/// Root of trust information (tag 704)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootOfTrust {
    /// SHA-256 of the verified boot public key, 32 bytes
    pub verified_boot_key: Vec<u8>,
    pub device_locked: bool,
    pub verified_boot_state: VerifiedBootState,
}

/// One entry of the attestation application ID package set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub package_name: String,
    pub version: i64,
}

/// Identity of the app that requested the attestation (tag 709)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttestationApplicationId {
    pub packages: Vec<PackageInfo>,
    pub signature_digests: Vec<Vec<u8>>,
}

/// Authorization list, software- or TEE-enforced
#[derive(Debug, Clone, Default)]
pub struct AuthorizationList {
    pub attestation_application_id: Option<AttestationApplicationId>,
    pub origin: Option<KeyOrigin>,
    pub rollback_resistant: bool,
    pub root_of_trust: Option<RootOfTrust>,
    pub os_version: Option<i64>,
    pub os_patch_level: Option<i64>,
    pub all_applications: bool,
}

/// Typed view of the key attestation extension
#[derive(Debug, Clone)]
pub struct KeyDescription {
    pub attestation_version: i64,
    pub attestation_security_level: SecurityLevel,
    pub keymaster_version: i64,
    pub keymaster_security_level: SecurityLevel,
    pub attestation_challenge: Vec<u8>,
    pub software_enforced: AuthorizationList,
    pub tee_enforced: AuthorizationList,
}

/// Parses the key attestation extension from the leaf certificate.
pub fn parse_key_attestation_extension(leaf_der: &[u8]) -> Result<KeyDescription, ExtensionError> {
    let (_, cert) =
        X509Certificate::from_der(leaf_der).map_err(|_| ExtensionError::InvalidCertificate)?;

    let attestation_oid =
        Oid::from(KEY_ATTESTATION_EXTENSION_OID).expect("invalid key attestation OID constant");

    let attestation_ext = cert
        .extensions()
        .iter()
        .find(|ext| ext.oid == attestation_oid)
        .ok_or(ExtensionError::MissingExtension)?;

    let (_, key_desc_seq) = der_parser::parse_der(attestation_ext.value)
        .map_err(|e| ExtensionError::Malformed(format!("{e:?}")))?;

    parse_key_description(&key_desc_seq)
}

fn parse_key_description(der: &BerObject) -> Result<KeyDescription, ExtensionError> {
    let items = as_sequence(der, "KeyDescription")?;
    if items.len() < 8 {
        return Err(ExtensionError::Malformed(format!(
            "KeyDescription requires 8 fields, got {}",
            items.len()
        )));
    }

    Ok(KeyDescription {
        attestation_version: parse_integer(&items[0])?,
        attestation_security_level: SecurityLevel::try_from(parse_integer(&items[1])?)?,
        keymaster_version: parse_integer(&items[2])?,
        keymaster_security_level: SecurityLevel::try_from(parse_integer(&items[3])?)?,
        attestation_challenge: parse_octet_string(&items[4])?,
        // items[5] is the uniqueId, which this engine does not consume.
        software_enforced: parse_authorization_list(&items[6])?,
        tee_enforced: parse_authorization_list(&items[7])?,
    })
}

fn parse_authorization_list(obj: &BerObject) -> Result<AuthorizationList, ExtensionError> {
    let items = as_sequence(obj, "AuthorizationList")?;

    let mut auth_list = AuthorizationList::default();
    for item in items {
        match item.tag().0 {
            TAG_ALL_APPLICATIONS => auth_list.all_applications = true,
            TAG_ORIGIN => auth_list.origin = Some(KeyOrigin::from(parse_tagged_integer(item)?)),
            TAG_ROLLBACK_RESISTANT => auth_list.rollback_resistant = true,
            TAG_ROOT_OF_TRUST => auth_list.root_of_trust = Some(parse_root_of_trust(item)?),
            TAG_OS_VERSION => auth_list.os_version = Some(parse_tagged_integer(item)?),
            TAG_OS_PATCH_LEVEL => auth_list.os_patch_level = Some(parse_tagged_integer(item)?),
            TAG_ATTESTATION_APPLICATION_ID => {
                auth_list.attestation_application_id =
                    Some(parse_attestation_application_id(item)?);
            }
            // Unknown tag, skip
            _ => {}
        }
    }

    Ok(auth_list)
}

fn parse_root_of_trust(obj: &BerObject) -> Result<RootOfTrust, ExtensionError> {
    let inner = unwrap_tagged(obj)?;
    let items = as_sequence(&inner, "RootOfTrust")?;
    if items.len() < 3 {
        return Err(ExtensionError::Malformed(
            "RootOfTrust requires at least 3 fields".to_string(),
        ));
    }

    Ok(RootOfTrust {
        verified_boot_key: parse_octet_string(&items[0])?,
        device_locked: parse_boolean(&items[1])?,
        verified_boot_state: VerifiedBootState::try_from(parse_integer(&items[2])?)?,
    })
}

fn parse_attestation_application_id(
    obj: &BerObject,
) -> Result<AttestationApplicationId, ExtensionError> {
    // The application ID is DER nested inside a tagged OCTET STRING.
    let wrapped = parse_tagged_octet_string(obj)?;
    let (_, parsed) = der_parser::parse_der(&wrapped)
        .map_err(|e| ExtensionError::Malformed(format!("{e:?}")))?;

    let items = as_sequence(&parsed, "AttestationApplicationId")?;
    if items.len() < 2 {
        return Err(ExtensionError::Malformed(
            "AttestationApplicationId requires 2 fields".to_string(),
        ));
    }

    let mut packages = Vec::new();
    for entry in as_set(&items[0], "package set")? {
        let fields = as_sequence(entry, "AttestationPackageInfo")?;
        if fields.len() < 2 {
            return Err(ExtensionError::Malformed(
                "AttestationPackageInfo requires 2 fields".to_string(),
            ));
        }
        let package_name = String::from_utf8(parse_octet_string(&fields[0])?)
            .map_err(|_| ExtensionError::Malformed("package name is not UTF-8".to_string()))?;
        packages.push(PackageInfo {
            package_name,
            version: parse_integer(&fields[1])?,
        });
    }

    let mut signature_digests = Vec::new();
    for digest in as_set(&items[1], "digest set")? {
        signature_digests.push(parse_octet_string(digest)?);
    }

    Ok(AttestationApplicationId {
        packages,
        signature_digests,
    })
}

/// Unwraps a context-specific EXPLICIT tagged value.
fn unwrap_tagged<'a>(obj: &'a BerObject<'a>) -> Result<BerObject<'a>, ExtensionError> {
    match &obj.content {
        BerObjectContent::Unknown(any) => {
            let (_, inner) = der_parser::parse_der(any.data)
                .map_err(|e| ExtensionError::Malformed(format!("{e:?}")))?;
            Ok(inner)
        }
        _ => Ok(obj.clone()),
    }
}

fn parse_tagged_integer(obj: &BerObject) -> Result<i64, ExtensionError> {
    parse_integer(&unwrap_tagged(obj)?)
}

fn parse_tagged_octet_string(obj: &BerObject) -> Result<Vec<u8>, ExtensionError> {
    parse_octet_string(&unwrap_tagged(obj)?)
}

/// Parses an INTEGER or ENUMERATED using two's complement handling.
fn parse_integer(obj: &BerObject) -> Result<i64, ExtensionError> {
    match &obj.content {
        BerObjectContent::Integer(bytes) => {
            if bytes.is_empty() {
                return Ok(0);
            }
            // ASN.1 INTEGER uses two's complement encoding
            let is_negative = (bytes[0] & 0x80) != 0;
            let mut value: i64 = if is_negative { -1 } else { 0 };
            for &byte in *bytes {
                value = (value << 8) | i64::from(byte);
            }
            Ok(value)
        }
        BerObjectContent::Enum(val) => Ok(*val as i64),
        _ => Err(ExtensionError::Malformed(format!(
            "expected INTEGER, got {:?}",
            obj.content
        ))),
    }
}

fn parse_octet_string(obj: &BerObject) -> Result<Vec<u8>, ExtensionError> {
    match &obj.content {
        BerObjectContent::OctetString(bytes) => Ok(bytes.to_vec()),
        _ => Err(ExtensionError::Malformed(format!(
            "expected OCTET STRING, got {:?}",
            obj.content
        ))),
    }
}

fn parse_boolean(obj: &BerObject) -> Result<bool, ExtensionError> {
    match &obj.content {
        BerObjectContent::Boolean(val) => Ok(*val),
        _ => Err(ExtensionError::Malformed(format!(
            "expected BOOLEAN, got {:?}",
            obj.content
        ))),
    }
}

fn as_sequence<'a>(
    obj: &'a BerObject<'a>,
    context: &str,
) -> Result<&'a Vec<BerObject<'a>>, ExtensionError> {
    match &obj.content {
        BerObjectContent::Sequence(items) => Ok(items),
        _ => Err(ExtensionError::Malformed(format!(
            "expected SEQUENCE for {context}"
        ))),
    }
}

fn as_set<'a>(
    obj: &'a BerObject<'a>,
    context: &str,
) -> Result<&'a Vec<BerObject<'a>>, ExtensionError> {
    match &obj.content {
        BerObjectContent::Set(items) => Ok(items),
        _ => Err(ExtensionError::Malformed(format!(
            "expected SET for {context}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    const LEAF: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/leaf0.der"));
    const TEST_ROOT: &[u8] =
        include_bytes!(concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/test_root.der"));

    #[test]
    fn parses_leaf_extension() {
        let desc = parse_key_attestation_extension(LEAF).expect("parse extension");

        assert_eq!(desc.attestation_version, 3);
        assert_eq!(
            desc.attestation_security_level,
            SecurityLevel::TrustedEnvironment
        );
        assert_eq!(desc.keymaster_version, 4);
        assert_eq!(
            desc.keymaster_security_level,
            SecurityLevel::TrustedEnvironment
        );

        let expected_challenge: [u8; 32] = Sha256::digest(b"attestation-challenge-0").into();
        assert_eq!(desc.attestation_challenge, expected_challenge);

        let app_id = desc
            .software_enforced
            .attestation_application_id
            .expect("application id");
        assert_eq!(app_id.packages.len(), 1);
        assert_eq!(app_id.packages[0].package_name, "co.copperhead.attestation");
        assert_eq!(app_id.packages[0].version, 10);
        assert_eq!(app_id.signature_digests.len(), 1);

        let tee = &desc.tee_enforced;
        assert_eq!(tee.origin, Some(KeyOrigin::Generated));
        assert_eq!(tee.os_version, Some(80000));
        assert_eq!(tee.os_patch_level, Some(201_801));
        assert!(!tee.rollback_resistant);
        assert!(!tee.all_applications);

        let root = tee.root_of_trust.as_ref().expect("root of trust");
        assert!(root.device_locked);
        assert_eq!(root.verified_boot_state, VerifiedBootState::Verified);
        assert_eq!(root.verified_boot_key.len(), 32);
    }

    #[test]
    fn missing_extension_is_reported() {
        assert!(matches!(
            parse_key_attestation_extension(TEST_ROOT),
            Err(ExtensionError::MissingExtension)
        ));
    }

    #[test]
    fn garbage_input_is_an_invalid_certificate() {
        assert!(matches!(
            parse_key_attestation_extension(b"not a certificate"),
            Err(ExtensionError::InvalidCertificate)
        ));
    }

    #[test]
    fn security_level_conversions() {
        assert_eq!(SecurityLevel::try_from(0), Ok(SecurityLevel::Software));
        assert_eq!(
            SecurityLevel::try_from(1),
            Ok(SecurityLevel::TrustedEnvironment)
        );
        assert_eq!(SecurityLevel::try_from(2), Ok(SecurityLevel::StrongBox));
        assert!(SecurityLevel::try_from(3).is_err());
    }

    #[test]
    fn verified_boot_state_conversions() {
        assert_eq!(
            VerifiedBootState::try_from(0),
            Ok(VerifiedBootState::Verified)
        );
        assert_eq!(
            VerifiedBootState::try_from(1),
            Ok(VerifiedBootState::SelfSigned)
        );
        assert_eq!(
            VerifiedBootState::try_from(2),
            Ok(VerifiedBootState::Unverified)
        );
        assert_eq!(VerifiedBootState::try_from(3), Ok(VerifiedBootState::Failed));
        assert!(VerifiedBootState::try_from(4).is_err());
    }

    #[test]
    fn key_origin_conversions() {
        assert_eq!(KeyOrigin::from(0), KeyOrigin::Generated);
        assert_eq!(KeyOrigin::from(2), KeyOrigin::Imported);
        assert_eq!(KeyOrigin::from(7), KeyOrigin::Other(7));
    }
}
