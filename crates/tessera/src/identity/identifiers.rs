//! Identifier algorithms: check digits, MAC addresses, random tokens.
//!
//! All randomness comes from the thread-local CSPRNG (`rand::rng()`).

use rand::Rng;

const UPPER_HEX: &[u8] = b"0123456789ABCDEF";
const LOWER_HEX: &[u8] = b"0123456789abcdef";
const ALNUM_UPPER: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Luhn check digit for a string of ASCII digits.
pub fn luhn_check_digit(digits: &str) -> Option<u8> {
    let mut sum = 0u32;
    for (i, c) in digits.chars().rev().enumerate() {
        let mut d = c.to_digit(10)?;
        // The rightmost payload digit sits next to the check digit, so it doubles.
        if i % 2 == 0 {
            d *= 2;
            if d > 9 {
                d -= 9;
            }
        }
        sum += d;
    }
    Some(((10 - (sum % 10)) % 10) as u8)
}

/// Whether a digit string (check digit last) passes the Luhn check.
pub fn luhn_valid(number: &str) -> bool {
    if number.len() < 2 {
        return false;
    }
    let (payload, check) = number.split_at(number.len() - 1);
    match (luhn_check_digit(payload), check.chars().next().and_then(|c| c.to_digit(10))) {
        (Some(expected), Some(actual)) => u32::from(expected) == actual,
        _ => false,
    }
}

/// 15-digit serial: 8-digit type allocation code, 6 random digits, Luhn digit.
pub fn hardware_serial(tac: &str) -> String {
    let mut rng = rand::rng();
    let body: u32 = rng.random_range(0..1_000_000);
    let payload = format!("{tac}{body:06}");
    let check = luhn_check_digit(&payload).unwrap_or(0);
    format!("{payload}{check}")
}

/// Random MAC with the locally-administered bit set and multicast bit cleared.
pub fn random_mac() -> [u8; 6] {
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] = (bytes[0] & 0xFE) | 0x02;
    bytes
}

/// Random public-style 48-bit address (bluetooth). Unicast only.
pub fn random_bluetooth() -> [u8; 6] {
    let mut bytes: [u8; 6] = rand::random();
    bytes[0] &= 0xFE;
    bytes
}

pub fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(text: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut out = [0u8; 6];
    for (slot, part) in out.iter_mut().zip(parts) {
        if part.len() != 2 {
            return None;
        }
        *slot = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

pub fn is_locally_administered(bytes: &[u8; 6]) -> bool {
    bytes[0] & 0x02 != 0
}

pub fn is_multicast(bytes: &[u8; 6]) -> bool {
    bytes[0] & 0x01 != 0
}

/// A MAC a sandbox may carry: parseable, unicast, locally administered.
pub fn is_valid_sandbox_mac(text: &str) -> bool {
    parse_mac(text).is_some_and(|b| is_locally_administered(&b) && !is_multicast(&b))
}

fn random_from(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

/// 16 uppercase hex characters.
pub fn device_id() -> String {
    random_from(UPPER_HEX, 16)
}

/// 16 lowercase hex characters.
pub fn platform_id() -> String {
    random_from(LOWER_HEX, 16)
}

/// 10 uppercase alphanumerics.
pub fn serial_number() -> String {
    random_from(ALNUM_UPPER, 10)
}

/// Build id such as `TQ3A.230805.001`.
pub fn build_id(prefix: &str) -> String {
    let mut rng = rand::rng();
    let date: u32 = rng.random_range(200_101..=241_231);
    let patch: u32 = rng.random_range(1..=30);
    format!("{prefix}.{date:06}.{patch:03}")
}

pub fn is_hex_of_len(text: &str, len: usize) -> bool {
    text.len() == len && text.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_luhn_known_values() {
        // Standard worked example.
        assert_eq!(luhn_check_digit("7992739871"), Some(3));
        assert!(luhn_valid("79927398713"));
        assert!(!luhn_valid("79927398710"));
        // Example IMEI.
        assert!(luhn_valid("490154203237518"));
    }

    #[test]
    fn test_luhn_rejects_non_digits() {
        assert_eq!(luhn_check_digit("12a4"), None);
        assert!(!luhn_valid("1"));
        assert!(!luhn_valid("12x"));
    }

    #[test]
    fn test_hardware_serial_passes_check() {
        for _ in 0..500 {
            let serial = hardware_serial("35291811");
            assert_eq!(serial.len(), 15);
            assert!(serial.starts_with("35291811"));
            assert!(luhn_valid(&serial), "{serial}");
        }
    }

    #[test]
    fn test_mac_bits() {
        for _ in 0..1000 {
            let mac = random_mac();
            assert!(is_locally_administered(&mac));
            assert!(!is_multicast(&mac));
            assert!(is_valid_sandbox_mac(&format_mac(&mac)));
        }
    }

    #[test]
    fn test_mac_parse_roundtrip_and_rejects() {
        let mac = [0x02, 0xAB, 0x00, 0x10, 0xFF, 0x7E];
        assert_eq!(parse_mac(&format_mac(&mac)), Some(mac));
        assert_eq!(parse_mac("02:AB:00:10:FF"), None);
        assert_eq!(parse_mac("02:AB:00:10:FF:GG"), None);
        assert!(!is_valid_sandbox_mac("03:00:00:00:00:01"));
        assert!(!is_valid_sandbox_mac("00:00:00:00:00:01"));
    }

    #[test]
    fn test_token_shapes() {
        assert!(is_hex_of_len(&device_id(), 16));
        assert!(device_id().chars().all(|c| !c.is_ascii_lowercase()));
        assert!(platform_id().chars().all(|c| !c.is_ascii_uppercase()));
        assert_eq!(serial_number().len(), 10);
        let id = build_id("TQ3A");
        assert!(id.starts_with("TQ3A."));
        assert_eq!(id.len(), "TQ3A.230805.001".len());
    }
}
