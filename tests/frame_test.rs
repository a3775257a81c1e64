use bytes::BytesMut;
use gatewire::{AppError, ByteOrder, FrameCodec};
use rstest::rstest;
use tokio::io::{duplex, AsyncWriteExt};

#[rstest]
#[case(1, ByteOrder::BigEndian)]
#[case(2, ByteOrder::BigEndian)]
#[case(2, ByteOrder::LittleEndian)]
#[case(4, ByteOrder::BigEndian)]
#[case(4, ByteOrder::LittleEndian)]
#[tokio::test]
async fn test_frames_survive_a_stream(#[case] width: usize, #[case] order: ByteOrder) {
    let codec = FrameCodec::new(width, 1, 200, order);
    let (mut client, mut server) = duplex(64);

    let payloads: Vec<Vec<u8>> = (1..=20u8).map(|n| vec![n; n as usize * 7]).collect();
    let frames: Vec<_> = payloads
        .iter()
        .map(|payload| codec.encode(&[&payload[..]]).unwrap())
        .collect();
    let writer = tokio::spawn(async move {
        for frame in frames {
            client.write_all(&frame).await.unwrap();
        }
        client.shutdown().await.unwrap();
    });

    let mut buffer = BytesMut::new();
    for expected in &payloads {
        let payload = codec.read_frame(&mut server, &mut buffer).await.unwrap().unwrap();
        assert_eq!(&payload[..], &expected[..]);
    }
    assert!(codec.read_frame(&mut server, &mut buffer).await.unwrap().is_none());
    writer.await.unwrap();
}

#[tokio::test]
async fn test_stream_ending_inside_a_frame_is_reset() {
    let codec = FrameCodec::default();
    let (mut client, mut server) = duplex(64);
    client.write_all(b"\x00\x0ahalf").await.unwrap();
    drop(client);

    let mut buffer = BytesMut::new();
    let err = codec.read_frame(&mut server, &mut buffer).await.unwrap_err();
    assert!(matches!(err, AppError::IoError(ref io) if io.kind() == std::io::ErrorKind::ConnectionReset));
}

#[tokio::test]
async fn test_oversized_prefix_rejected_before_payload_arrives() {
    let codec = FrameCodec::new(2, 1, 16, ByteOrder::BigEndian);
    let (mut client, mut server) = duplex(64);
    // only the prefix is sent, the payload never follows
    client.write_all(&[0x00, 0x20]).await.unwrap();

    let mut buffer = BytesMut::new();
    let err = codec.read_frame(&mut server, &mut buffer).await.unwrap_err();
    assert!(matches!(err, AppError::MessageTooLong(32)));
    drop(client);
}

#[tokio::test]
async fn test_zero_length_frame_is_too_short() {
    let codec = FrameCodec::default();
    let (mut client, mut server) = duplex(64);
    client.write_all(&[0x00, 0x00]).await.unwrap();

    let mut buffer = BytesMut::new();
    let err = codec.read_frame(&mut server, &mut buffer).await.unwrap_err();
    assert!(matches!(err, AppError::MessageTooShort(0)));
    drop(client);
}
