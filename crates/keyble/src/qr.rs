//! Parses the QR code payload printed on a KEY-BLE card:
//! `M<mac:12 hex>K<cardkey:32 hex><serial:10 alnum>`, per §6.

use keyble_proto::error::ConfigError;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrPayload {
    pub mac: String,
    pub card_key: [u8; 16],
    pub serial: String,
}

fn grammar() -> Regex {
    Regex::new(r"^M([0-9A-Fa-f]{12})K([0-9A-Fa-f]{32})([0-9A-Z]{10})$").expect("static regex is valid")
}

/// Parses `data`, formatting the MAC with colons (`AABBCCDDEEFF` ->
/// `AA:BB:CC:DD:EE:FF`) the way the reference CLI's `ui_pair`/`main` glue
/// does before handing the MAC to the BLE layer.
pub fn parse(data: &str) -> Result<QrPayload, ConfigError> {
    let captures = grammar().captures(data).ok_or(ConfigError::BadQrPayload)?;

    let raw_mac = &captures[1];
    let mac = raw_mac
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap())
        .collect::<Vec<_>>()
        .join(":")
        .to_uppercase();

    let card_key_hex = &captures[2];
    let card_key_bytes = hex::decode(card_key_hex).map_err(|e| ConfigError::BadHex(e.to_string()))?;
    let mut card_key = [0u8; 16];
    card_key.copy_from_slice(&card_key_bytes);

    let serial = captures[3].to_string();

    Ok(QrPayload { mac, card_key, serial })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_payload() {
        let payload = parse("M001234556678K00112233445566778899AABBCCDDEEFFSERIAL1234").unwrap();
        assert_eq!(payload.mac, "00:12:34:55:66:78");
        assert_eq!(payload.card_key, [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
        ]);
        assert_eq!(payload.serial, "SERIAL1234");
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(parse("not a qr code").is_err());
        assert!(parse("M00K00").is_err());
    }

    proptest::proptest! {
        /// Any payload built from the grammar's own shape parses, and the
        /// card key and serial come back out byte-for-byte.
        #[test]
        fn parses_any_well_formed_payload(
            mac_hex in "[0-9A-Fa-f]{12}",
            card_key_hex in "[0-9A-Fa-f]{32}",
            serial in "[0-9A-Z]{10}",
        ) {
            let data = format!("M{mac_hex}K{card_key_hex}{serial}");
            let payload = parse(&data).unwrap();
            proptest::prop_assert_eq!(payload.card_key.to_vec(), hex::decode(&card_key_hex).unwrap());
            proptest::prop_assert_eq!(payload.serial, serial);
            proptest::prop_assert_eq!(payload.mac.replace(':', "").to_uppercase(), mac_hex.to_uppercase());
        }
    }
}
