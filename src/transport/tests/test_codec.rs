use crate::transport::stream::{SipCodec, SipCodecItem};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

const INVITE: &str = "INVITE sip:34020000001320000001@3402000000 SIP/2.0\r\nVia: SIP/2.0/TCP 10.0.0.2:5060;branch=z9hG4bK776asdhds\r\nCall-ID: a84b4c76e66710\r\nCSeq: 1 INVITE\r\nContent-Length: 5\r\n\r\nv=0\r\n";
const BYE: &str = "BYE sip:34020000001320000001@3402000000 SIP/2.0\nVia: SIP/2.0/TCP 10.0.0.2:5060;branch=z9hG4bK776asdhdt\nCall-ID: a84b4c76e66710\nCSeq: 2 BYE\nl: 0\n\n";

fn decode_all(codec: &mut SipCodec, buf: &mut BytesMut) -> Vec<SipCodecItem> {
    let mut items = vec![];
    while let Some(item) = codec.decode(buf).expect("decode") {
        items.push(item);
    }
    items
}

#[test]
fn test_codec_frames_any_chunking() {
    let stream = format!("{}{}", INVITE, BYE);
    for chunk in [1, 3, 7, 64, stream.len()] {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::new();
        let mut frames = vec![];
        for part in stream.as_bytes().chunks(chunk) {
            buf.extend_from_slice(part);
            frames.extend(decode_all(&mut codec, &mut buf));
        }
        assert_eq!(
            frames,
            vec![
                SipCodecItem::Frame(INVITE.as_bytes().to_vec().into()),
                SipCodecItem::Frame(BYE.as_bytes().to_vec().into()),
            ],
            "chunk size {}",
            chunk
        );
        assert!(buf.is_empty());
    }
}

#[test]
fn test_codec_keepalive() {
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::from(&b"\r\n\r\n"[..]);
    assert_eq!(
        codec.decode(&mut buf).expect("decode"),
        Some(SipCodecItem::KeepaliveRequest)
    );
    assert!(buf.is_empty());
}

#[test]
fn test_codec_keepalive_split_across_reads() {
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::from(&b"\r\n"[..]);
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    buf.extend_from_slice(b"\r\n");
    assert_eq!(
        codec.decode(&mut buf).expect("decode"),
        Some(SipCodecItem::KeepaliveRequest)
    );

    // a pong followed by more data is still a pong
    let mut buf = BytesMut::from(format!("\r\n{}", BYE).as_bytes());
    assert_eq!(
        codec.decode(&mut buf).expect("decode"),
        Some(SipCodecItem::KeepaliveResponse)
    );
    assert!(matches!(
        codec.decode(&mut buf).expect("decode"),
        Some(SipCodecItem::Frame(_))
    ));
}

#[test]
fn test_codec_partial_body() {
    let mut codec = SipCodec::new();
    let mut buf = BytesMut::from(&INVITE.as_bytes()[..INVITE.len() - 2]);
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    buf.extend_from_slice(&INVITE.as_bytes()[INVITE.len() - 2..]);
    assert!(matches!(
        codec.decode(&mut buf).expect("decode"),
        Some(SipCodecItem::Frame(_))
    ));
}

#[test]
fn test_codec_oversized_body() {
    let mut codec = SipCodec::new();
    let head = "MESSAGE sip:a@b SIP/2.0\r\nContent-Length: 70000\r\n\r\n";
    let mut buf = BytesMut::from(head.as_bytes());
    assert!(codec.decode(&mut buf).is_err());
    assert!(buf.is_empty());
}
