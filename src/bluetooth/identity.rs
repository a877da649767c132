//! Device identity formatting
//!
//! A device is keyed by its 48-bit Bluetooth address. The display form is
//! colon separated, the registry key is the same bytes without separators.

/// Mask selecting the 48 address bits of a raw address
pub const ADDRESS_MASK: u64 = 0xffff_ffff_ffff;

fn address_bytes(raw: u64) -> [u8; 6] {
    let be = (raw & ADDRESS_MASK).to_be_bytes();
    [be[2], be[3], be[4], be[5], be[6], be[7]]
}

/// Format an address for display, e.g. `aa:bb:cc:dd:ee:ff`
pub fn format_address(raw: u64) -> String {
    address_bytes(raw)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Format the device identifier used as the registry key, e.g. `aabbccddeeff`
pub fn format_device_id(raw: u64) -> String {
    address_bytes(raw).iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a device identifier produced by [`format_device_id`]
///
/// Colon separated addresses are accepted as well.
pub fn parse_device_id(id: &str) -> Option<u64> {
    let hex: String = id.chars().filter(|c| *c != ':').collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(&hex, 16).ok()
}

/// Convert address bytes (most significant first) into a raw address
pub fn address_from_bytes(bytes: [u8; 6]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_format_address() {
        assert_eq!(format_address(0xaabb_ccdd_eeff), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_address(0x1), "00:00:00:00:00:01");
        // Bits above 48 are not part of the address
        assert_eq!(format_address(0xffff_0000_0000_0001), "00:00:00:00:00:01");
    }

    #[test]
    fn test_format_device_id() {
        assert_eq!(format_device_id(0xaabb_ccdd_eeff), "aabbccddeeff");
        assert_eq!(format_device_id(0), "000000000000");
        assert_eq!(format_device_id(0x0102_0304_0506).len(), 12);
    }

    #[test]
    fn test_device_id_is_injective_on_samples() {
        let samples = [
            0u64,
            1,
            0xff,
            0x100,
            0xffff_ffff_ffff,
            0xffff_ffff_fffe,
            0x8000_0000_0000,
            0x0000_0001_0000,
            0x1234_5678_9abc,
        ];
        let ids: HashSet<String> = samples.iter().map(|a| format_device_id(*a)).collect();
        assert_eq!(ids.len(), samples.len());
        for address in samples {
            assert_eq!(parse_device_id(&format_device_id(address)), Some(address));
        }
    }

    #[test]
    fn test_parse_device_id() {
        assert_eq!(parse_device_id("aabbccddeeff"), Some(0xaabb_ccdd_eeff));
        assert_eq!(parse_device_id("AA:BB:CC:DD:EE:FF"), Some(0xaabb_ccdd_eeff));
        assert_eq!(parse_device_id("doesnotexist"), None);
        assert_eq!(parse_device_id("aabbccddee"), None);
    }

    #[test]
    fn test_address_from_bytes() {
        assert_eq!(address_from_bytes([0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc]), 0x1234_5678_9abc);
    }
}
