//! Device identity helpers.
//!
//! Numeric device ids are derived from the backend object path and are
//! only stable within one process session; the persistent id is a
//! fingerprint of the hardware description and survives replug.

/// Extract the numeric index from the trailing segment of an object path.
///
/// `/org/freedesktop/ModemManager1/Modem/4` → 4. Paths whose trailing
/// segment is not an integer (or paths without segments) yield 0.
pub fn path_index(object_path: &str) -> u32 {
    object_path
        .rsplit('/')
        .next()
        .and_then(|seg| seg.parse::<u32>().ok())
        .unwrap_or(0)
}

/// Stable fingerprint of a physical device, independent of the object
/// path the backend assigned in this session.
///
/// FNV-1a over manufacturer, model and firmware version, rendered as a
/// fixed-width hex digest.
pub fn persistent_id(manufacturer: &str, model: &str, version: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for part in [manufacturer, model, version] {
        for byte in part.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        // Separator keeps ("ab","c") distinct from ("a","bc")
        hash ^= u64::from(b'\x1f');
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

/// Decode a UCS-2 (UTF-16BE) hex string into text.
///
/// Some firmware reports operator codes and USSD answers this way: each
/// code unit as four hex digits. Returns `None` for odd-length input,
/// non-hex characters or unpaired surrogates.
pub fn decode_ucs2_hex(input: &str) -> Option<String> {
    if input.len() % 4 != 0 || input.is_empty() {
        return None;
    }
    let mut units = Vec::with_capacity(input.len() / 4);
    let bytes = input.as_bytes();
    for chunk in bytes.chunks(4) {
        let text = std::str::from_utf8(chunk).ok()?;
        units.push(u16::from_str_radix(text, 16).ok()?);
    }
    String::from_utf16(&units).ok()
}

/// Assemble a packed MCC/MNC operator code from a backend-reported string.
///
/// Accepts a 5 or 6 digit decimal string, or its 20/24 hex-digit UCS-2
/// encoding. The result packs MCC into the high half-word and MNC into
/// the low one; any other length or shape yields 0.
pub fn operator_code(raw: &str) -> u32 {
    let decoded;
    let digits = match raw.len() {
        5 | 6 => raw,
        20 | 24 => {
            decoded = match decode_ucs2_hex(raw) {
                Some(text) => text,
                None => return 0,
            };
            if decoded.len() != 5 && decoded.len() != 6 {
                return 0;
            }
            &decoded
        }
        _ => return 0,
    };

    if !digits.is_ascii() {
        return 0;
    }
    let mcc = digits[..3].parse::<u32>().unwrap_or(0);
    let mnc = digits[3..].parse::<u32>().unwrap_or(0);
    ((mcc & 0xffff) << 16) | (mnc & 0xffff)
}

/// Split a packed operator code back into (MCC, MNC).
pub fn split_operator_code(code: u32) -> (u16, u16) {
    ((code >> 16) as u16, (code & 0xffff) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ─── Path index ─────────────────────────────────────────────────

    #[test]
    fn path_index_trailing_integer() {
        assert_eq!(path_index("/org/freedesktop/ModemManager1/Modem/4"), 4);
        assert_eq!(path_index("/ril_0/17"), 17);
    }

    #[test]
    fn path_index_defaults_to_zero() {
        assert_eq!(path_index("/org/ofono/ril_0"), 0);
        assert_eq!(path_index(""), 0);
        assert_eq!(path_index("/"), 0);
    }

    // ─── Persistent id ──────────────────────────────────────────────

    #[test]
    fn persistent_id_is_stable() {
        let a = persistent_id("Huawei", "E173", "11.126.85");
        let b = persistent_id("Huawei", "E173", "11.126.85");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn persistent_id_distinguishes_fields() {
        assert_ne!(
            persistent_id("ZTE", "MF190", "1.0"),
            persistent_id("ZTEM", "F190", "1.0"),
        );
    }

    // ─── Operator codes ─────────────────────────────────────────────

    #[test]
    fn decimal_operator_code_round_trips() {
        let code = operator_code("25001");
        assert_eq!(split_operator_code(code), (250, 1));

        let code = operator_code("310260");
        assert_eq!(split_operator_code(code), (310, 260));
    }

    #[test]
    fn ucs2_operator_code_round_trips() {
        // "25001" encoded as UTF-16BE hex, 20 digits
        let hex = "00320035003000300031";
        assert_eq!(hex.len(), 20);
        let code = operator_code(hex);
        assert_eq!(split_operator_code(code), (250, 1));

        // "310260" encoded as UTF-16BE hex, 24 digits
        let hex = "003300310030003200360030";
        assert_eq!(hex.len(), 24);
        let code = operator_code(hex);
        assert_eq!(split_operator_code(code), (310, 260));
    }

    #[test]
    fn malformed_operator_code_yields_zero() {
        assert_eq!(operator_code(""), 0);
        assert_eq!(operator_code("2500"), 0);
        assert_eq!(operator_code("2500123"), 0);
        // 20 chars but not hex
        assert_eq!(operator_code("zzzzzzzzzzzzzzzzzzzz"), 0);
    }

    #[test]
    fn ucs2_decode_rejects_garbage() {
        assert_eq!(decode_ucs2_hex(""), None);
        assert_eq!(decode_ucs2_hex("123"), None);
        assert_eq!(decode_ucs2_hex("00G1"), None);
        assert_eq!(decode_ucs2_hex("0041004200"), None);
    }

    #[test]
    fn ucs2_decode_text() {
        // "Hi"
        assert_eq!(decode_ucs2_hex("00480069").as_deref(), Some("Hi"));
    }
}
