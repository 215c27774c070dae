//! Property-based tests for the wire codecs.
//!
//! These verify that header and UID decoding are correct for ALL valid
//! inputs, not just specific examples. Uses proptest to generate arbitrary
//! values and verify round-trip properties.

use brickline_proto::{PACKET_HEADER_SIZE, PacketHeader, UidError, base58_to_u32};
use proptest::prelude::*;

const ALPHABET: &[u8; 58] = b"123456789abcdefghijkmnopqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ";

/// Strategy for headers whose fields are within their wire-format ranges.
fn arbitrary_header() -> impl Strategy<Value = PacketHeader> {
    (
        any::<u32>(),
        8u8..=80,
        any::<u8>(),
        0u8..=15,
        any::<bool>(),
        0u8..=3,
    )
        .prop_map(
            |(uid, length, function_id, sequence_number, response_expected, error_code)| {
                PacketHeader { uid, length, function_id, sequence_number, response_expected, error_code }
            },
        )
}

/// Canonical base-58 encoding of a non-zero value.
fn base58_encode(mut value: u64) -> String {
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ALPHABET[(value % 58) as usize]);
        value /= 58;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap()
}

proptest! {
    #[test]
    fn header_round_trip(header in arbitrary_header()) {
        let bytes = header.to_le_bytes();
        prop_assert_eq!(bytes.len(), PACKET_HEADER_SIZE);

        let parsed = PacketHeader::from_le_bytes(&bytes);
        prop_assert_eq!(header, parsed);
    }

    #[test]
    fn header_reserved_bits_stay_zero(header in arbitrary_header()) {
        let bytes = header.to_le_bytes();
        prop_assert_eq!(bytes[6] & 0x07, 0);
        prop_assert_eq!(bytes[7] & 0x3F, 0);
    }

    #[test]
    fn uid_round_trip(value in 1u64..(1 << 32)) {
        // Every canonical encoding of a value below 2^32 decodes back to it.
        prop_assert_eq!(base58_to_u32(&base58_encode(value)), Ok(value as u32));
    }

    #[test]
    fn uid_decode_is_pure(value in 1u64..u64::MAX) {
        let uid = base58_encode(value);
        prop_assert_eq!(base58_to_u32(&uid), base58_to_u32(&uid));
    }

    #[test]
    fn uid_rejects_characters_outside_alphabet(
        prefix in "[2-9]{1,4}",
        bad in prop::char::ranges(vec!['0'..='0', 'I'..='I', 'O'..='O', 'l'..='l', '!'..='/'].into()),
    ) {
        let uid = format!("{prefix}{bad}");
        prop_assert_eq!(base58_to_u32(&uid), Err(UidError::InvalidCharacter(0)));
    }
}
