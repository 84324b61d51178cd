//! Device catalog
//!
//! Compiled-in tables mapping verified-boot-key fingerprints (uppercase
//! hex) to device descriptors. Stock OS builds and alternate OS builds live
//! in separate tables; the verified boot state selects which one applies.
//! The tables are deliberately not configurable.

use std::collections::HashMap;
use std::sync::LazyLock;

use super::extension::VerifiedBootState;

/// Which OS family a catalog entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsVariant {
    Stock,
    AltOs,
}

/// Static description of a supported device build.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub display_name: &'static str,
    pub min_attestation_version: i64,
    pub min_keymaster_version: i64,
    pub requires_rollback_resistance: bool,
    pub os_variant: OsVariant,
}

static STOCK_DEVICES: LazyLock<HashMap<&'static str, DeviceDescriptor>> = LazyLock::new(|| {
    HashMap::from([
        (
            "90ADE70CB4B3F688C054636D8F2AAF9A47863306484B62C9572F8CF3C2D315BC",
            DeviceDescriptor {
                display_name: "Pixel 2",
                min_attestation_version: 2,
                min_keymaster_version: 3,
                requires_rollback_resistance: false,
                os_variant: OsVariant::Stock,
            },
        ),
        (
            "E25946576CC515C7EA38C5427F72DFF1C629CC7F11D14984B667E937A95F32A0",
            DeviceDescriptor {
                display_name: "Pixel 2 XL",
                min_attestation_version: 2,
                min_keymaster_version: 3,
                requires_rollback_resistance: false,
                os_variant: OsVariant::Stock,
            },
        ),
        (
            "355FDB18C8B10CD86BD5360E293303854AA5BD5520C3590D21A07053A1D53BD9",
            DeviceDescriptor {
                display_name: "Pixel 3",
                min_attestation_version: 3,
                min_keymaster_version: 4,
                requires_rollback_resistance: true,
                os_variant: OsVariant::Stock,
            },
        ),
    ])
});

static ALT_OS_DEVICES: LazyLock<HashMap<&'static str, DeviceDescriptor>> = LazyLock::new(|| {
    HashMap::from([
        (
            "A0986C9007BA68E170B06BDE8A0AFF721D0371598FDD53D66A4653B3D1AA83E1",
            DeviceDescriptor {
                display_name: "CopperheadOS (Pixel 2)",
                min_attestation_version: 2,
                min_keymaster_version: 3,
                requires_rollback_resistance: false,
                os_variant: OsVariant::AltOs,
            },
        ),
        (
            "03B1B7025C0227E68CFF91D592B19CBEA6D521DA719D425D98425C540E2301FA",
            DeviceDescriptor {
                display_name: "CopperheadOS (Pixel 2 XL)",
                min_attestation_version: 2,
                min_keymaster_version: 3,
                requires_rollback_resistance: false,
                os_variant: OsVariant::AltOs,
            },
        ),
    ])
});

/// Looks up a device by its verified-boot-key fingerprint.
///
/// `Verified` boot consults the stock table, `SelfSigned` the alternate-OS
/// table; other boot states never match.
pub fn lookup(
    state: VerifiedBootState,
    verified_boot_key_hex: &str,
) -> Option<&'static DeviceDescriptor> {
    match state {
        VerifiedBootState::Verified => STOCK_DEVICES.get(verified_boot_key_hex),
        VerifiedBootState::SelfSigned => ALT_OS_DEVICES.get(verified_boot_key_hex),
        VerifiedBootState::Unverified | VerifiedBootState::Failed => None,
    }
}
