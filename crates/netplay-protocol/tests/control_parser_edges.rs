use bytes::Bytes;
use netplay_protocol::control::{
    ControlParser, ControlRequest, DISCONNECT_NOTICE, GET_REGISTRATION, RECEIVE_SETTINGS,
    SEND_SAVE,
};

fn save_upload(name: &str, data: &[u8]) -> Vec<u8> {
    let mut bytes = vec![SEND_SAVE];
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes.extend_from_slice(&(data.len() as u32).to_be_bytes());
    bytes.extend_from_slice(data);
    bytes
}

#[test]
fn split_at_every_offset_yields_same_requests() {
    let mut stream = save_upload("eeprom.sav", &[1, 2, 3, 4, 5]);
    stream.push(GET_REGISTRATION);
    stream.push(DISCONNECT_NOTICE);
    stream.extend_from_slice(&0x0000_0002u32.to_be_bytes());

    let expected = vec![
        ControlRequest::SendSave {
            filename: "eeprom.sav".into(),
            data: Bytes::from_static(&[1, 2, 3, 4, 5]),
        },
        ControlRequest::GetRegistration,
        ControlRequest::DisconnectNotice { nonce: 2 },
    ];

    for split in 0..=stream.len() {
        let mut parser = ControlParser::default();
        let mut got = Vec::new();
        for chunk in [&stream[..split], &stream[split..]] {
            parser.feed(chunk);
            while let Some(req) = parser.next_request().expect("valid stream") {
                got.push(req);
            }
        }
        assert_eq!(got, expected, "split at {split}");
        assert!(parser.is_idle());
    }
}

#[test]
fn empty_save_completes_without_payload() {
    let mut parser = ControlParser::default();
    parser.feed(&save_upload("empty", &[]));
    assert_eq!(
        parser.next_request().unwrap(),
        Some(ControlRequest::SendSave {
            filename: "empty".into(),
            data: Bytes::new(),
        })
    );
}

#[test]
fn filename_waits_for_terminator() {
    let mut parser = ControlParser::default();
    parser.feed(&[SEND_SAVE]);
    parser.feed(b"long-name-without-nul");
    assert_eq!(parser.next_request().unwrap(), None);
    assert!(!parser.is_idle());
}

#[test]
fn payloadless_requests_do_not_consume_following_bytes() {
    let mut parser = ControlParser::default();
    parser.feed(&[RECEIVE_SETTINGS, GET_REGISTRATION, 0xff]);
    assert_eq!(
        parser.next_request().unwrap(),
        Some(ControlRequest::ReceiveSettings)
    );
    assert_eq!(
        parser.next_request().unwrap(),
        Some(ControlRequest::GetRegistration)
    );
    assert_eq!(parser.buffered(), 1);
}
