//! Property tests for summary frame decoding.

use chrono::{TimeZone, Utc};
use oximeter_ble::protocol::{decode_at, Rejection, SummaryPacket, SUMMARY_MARKER};
use proptest::prelude::*;

fn summary_frame() -> impl Strategy<Value = Vec<u8>> {
    (
        any::<[u8; 5]>(),
        proptest::collection::vec(any::<u8>(), 0..16),
    )
        .prop_map(|(body, trailer)| {
            let mut frame = vec![SUMMARY_MARKER];
            frame.extend_from_slice(&body);
            frame.extend_from_slice(&trailer);
            frame
        })
}

proptest! {
    #[test]
    fn short_frames_are_rejected(frame in proptest::collection::vec(any::<u8>(), 0..SummaryPacket::MIN_SIZE)) {
        prop_assert_eq!(
            SummaryPacket::parse(&frame),
            Err(Rejection::TooShort { len: frame.len() })
        );
    }

    #[test]
    fn unknown_markers_are_rejected(
        marker in any::<u8>().prop_filter("not the summary marker", |m| *m != SUMMARY_MARKER),
        rest in proptest::collection::vec(any::<u8>(), 5..32),
    ) {
        let mut frame = vec![marker];
        frame.extend_from_slice(&rest);
        prop_assert_eq!(SummaryPacket::parse(&frame), Err(Rejection::UnknownMarker { marker }));
    }

    #[test]
    fn summary_fields_come_from_fixed_offsets(frame in summary_frame()) {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let reading = decode_at(&frame, at).unwrap();

        prop_assert_eq!(reading.perfusion_index(), Some(frame[1]));
        prop_assert_eq!(reading.finger_detected(), frame[2] != 0);
        prop_assert_eq!(reading.spo2(), frame[4]);
        prop_assert_eq!(reading.pulse_bpm(), frame[5]);
        prop_assert_eq!(reading.raw(), frame.as_slice());
        prop_assert_eq!(reading.timestamp(), at);
    }

    #[test]
    fn decoding_is_deterministic(frame in proptest::collection::vec(any::<u8>(), 0..32)) {
        prop_assert_eq!(SummaryPacket::parse(&frame), SummaryPacket::parse(&frame));

        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let first = decode_at(&frame, at);
        let second = decode_at(&frame, at);
        prop_assert_eq!(first.is_ok(), second.is_ok());
        if let (Ok(a), Ok(b)) = (first, second) {
            prop_assert_eq!(a.csv_line(), b.csv_line());
        }
    }

    #[test]
    fn unused_byte_and_trailer_do_not_matter(frame in summary_frame(), filler in any::<u8>()) {
        let mut altered = frame.clone();
        altered[3] = filler;
        altered.truncate(SummaryPacket::MIN_SIZE);

        prop_assert_eq!(SummaryPacket::parse(&frame), SummaryPacket::parse(&altered));
    }
}
