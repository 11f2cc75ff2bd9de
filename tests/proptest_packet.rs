use proptest::prelude::*;

use dhcplink::DhcpPacket;

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const DHCP_FIXED_HEADER_SIZE: usize = 240;

fn valid_header() -> Vec<u8> {
    let mut packet = vec![0u8; DHCP_FIXED_HEADER_SIZE];
    packet[0] = 1;
    packet[1] = 1;
    packet[2] = 6;
    packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
    packet
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10000))]

    #[test]
    fn parse_never_panics_on_arbitrary_bytes(data: Vec<u8>) {
        let _ = DhcpPacket::parse(&data);
    }

    #[test]
    fn parse_never_panics_on_valid_header_with_random_options(
        options_data in prop::collection::vec(any::<u8>(), 0..512)
    ) {
        let mut packet = valid_header();
        packet.extend_from_slice(&options_data);
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_corrupted_header(
        corrupted_bytes in prop::collection::vec(any::<u8>(), 240..600),
        corruption_indices in prop::collection::vec(0usize..240, 1..10),
        corruption_values in prop::collection::vec(any::<u8>(), 1..10)
    ) {
        let mut packet = corrupted_bytes;
        if packet.len() >= 240 {
            packet[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
        }
        for (index, value) in corruption_indices.iter().zip(corruption_values.iter()) {
            if *index < packet.len() {
                packet[*index] = *value;
            }
        }
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn parse_never_panics_on_random_option_lengths(
        option_code in 1u8..254,
        option_length in any::<u8>(),
        option_data in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let mut packet = valid_header();
        packet.push(option_code);
        packet.push(option_length);
        let actual_len = (option_length as usize).min(option_data.len());
        packet.extend_from_slice(&option_data[..actual_len]);
        packet.push(255);
        let _ = DhcpPacket::parse(&packet);
    }

    #[test]
    fn roundtrip_encode_decode_preserves_data(
        xid in any::<u32>(),
        secs in any::<u16>(),
        flags in any::<u16>(),
        ciaddr in any::<[u8; 4]>(),
        yiaddr in any::<[u8; 4]>(),
        siaddr in any::<[u8; 4]>(),
        giaddr in any::<[u8; 4]>(),
        chaddr in any::<[u8; 16]>(),
    ) {
        let mut packet = valid_header();
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet[8..10].copy_from_slice(&secs.to_be_bytes());
        packet[10..12].copy_from_slice(&flags.to_be_bytes());
        packet[12..16].copy_from_slice(&ciaddr);
        packet[16..20].copy_from_slice(&yiaddr);
        packet[20..24].copy_from_slice(&siaddr);
        packet[24..28].copy_from_slice(&giaddr);
        packet[28..44].copy_from_slice(&chaddr);
        packet.push(255);

        if let Ok(parsed) = DhcpPacket::parse(&packet) {
            let encoded = parsed.encode();
            let reparsed = DhcpPacket::parse(&encoded).unwrap();
            prop_assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn encoded_packets_end_with_terminator(
        xid in any::<u32>()
    ) {
        let mut packet = valid_header();
        packet[4..8].copy_from_slice(&xid.to_be_bytes());
        packet.push(255);

        if let Ok(parsed) = DhcpPacket::parse(&packet) {
            let encoded = parsed.encode();
            prop_assert_eq!(&encoded[encoded.len() - 3..], &[255u8, 0, 0]);
        }
    }

    #[test]
    fn repeated_codes_collapse_into_one_option(
        first in prop::collection::vec(any::<u8>(), 1..64),
        second in prop::collection::vec(any::<u8>(), 1..64),
        third in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        // an option code the client treats as opaque payload
        const CODE: u8 = 77;

        let mut packet = valid_header();
        for chunk in [&first, &second, &third] {
            packet.push(CODE);
            packet.push(chunk.len() as u8);
            packet.extend_from_slice(chunk);
        }
        packet.push(255);

        let parsed = DhcpPacket::parse(&packet).unwrap();
        let merged: Vec<_> = parsed
            .options
            .iter()
            .filter(|option| option.code() == CODE)
            .collect();

        prop_assert_eq!(merged.len(), 1);

        let mut expected = first.clone();
        expected.extend_from_slice(&second);
        expected.extend_from_slice(&third);
        prop_assert_eq!(merged[0], &dhcplink::DhcpOption::Unknown(CODE, expected));
    }

    #[test]
    fn short_packets_always_rejected(
        data in prop::collection::vec(any::<u8>(), 0..240)
    ) {
        let result = DhcpPacket::parse(&data);
        prop_assert!(result.is_err());
    }

    #[test]
    fn bad_magic_cookie_always_rejected(
        cookie in any::<[u8; 4]>()
    ) {
        prop_assume!(cookie != DHCP_MAGIC_COOKIE);

        let mut packet = valid_header();
        packet[236..240].copy_from_slice(&cookie);
        packet.push(255);

        let result = DhcpPacket::parse(&packet);
        prop_assert!(result.is_err());
    }
}
