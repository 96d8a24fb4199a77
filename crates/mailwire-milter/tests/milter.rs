//! Milter dispatch tests: fragmented input and a loopback MTA session.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use mailwire_codec::{Packet, PacketCodec};
use mailwire_milter::protocol::{
    SMFIC_ABORT, SMFIC_BODYEOB, SMFIC_CONNECT, SMFIC_HEADER, SMFIC_MACRO, SMFIC_MAIL,
    SMFIC_OPTNEG, SMFIC_QUIT, SMFIC_RCPT, SMFIR_ACCEPT, SMFIR_CHGHEADER, SMFIR_CONTINUE,
    SMFIR_REPLYCODE, SMFIR_TEMPFAIL,
};
use mailwire_milter::{
    CachedDirectory, Directory, Group, GroupEntry, MilterHandler, MilterService, Outcome,
    StaticDirectory,
};
use mailwire_server::ServerConfig;
use proptest::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};

fn directory() -> StaticDirectory {
    StaticDirectory::new([
        GroupEntry {
            group: Group::new("staff@example.com")
                .with_display_name("Staff")
                .with_reply_to("help@example.com", "Help Desk"),
            allowed_senders: vec!["*@example.com".into()],
        },
        GroupEntry {
            group: Group::new("all@example.com").with_display_name("Everyone"),
            allowed_senders: Vec::new(),
        },
        GroupEntry {
            group: Group::new("board@example.com"),
            allowed_senders: vec!["ceo@example.com".into()],
        },
    ])
}

fn macro_packet(stage: u8, name: &str, value: &str) -> Packet {
    let mut payload = vec![stage];
    payload.extend_from_slice(name.as_bytes());
    payload.push(0);
    payload.extend_from_slice(value.as_bytes());
    payload.push(0);
    Packet::new(SMFIC_MACRO, payload)
}

fn sender(addr: &str) -> Packet {
    macro_packet(SMFIC_MAIL, "{mail_addr}", addr)
}

fn recipient(addr: &str) -> Packet {
    macro_packet(SMFIC_RCPT, "{rcpt_addr}", addr)
}

/// A full transaction: one sender and two group recipients.
fn transaction() -> Vec<Packet> {
    vec![
        Packet::new(SMFIC_OPTNEG, vec![0u8; 12]),
        Packet::new(SMFIC_CONNECT, &b"mx.example.com\x004\x00\x19192.0.2.7\x00"[..]),
        sender("<Alice@Example.com>"),
        Packet::bare(SMFIC_MAIL),
        recipient("<staff@example.com>"),
        Packet::bare(SMFIC_RCPT),
        recipient("<all@example.com>"),
        Packet::bare(SMFIC_RCPT),
        Packet::new(SMFIC_HEADER, &b"Subject\0hi\0"[..]),
        Packet::bare(SMFIC_BODYEOB),
    ]
}

fn encode(packets: &[Packet]) -> Vec<u8> {
    let mut codec = PacketCodec::default();
    let mut out = BytesMut::new();
    for packet in packets {
        codec.encode(packet.clone(), &mut out).unwrap();
    }
    out.to_vec()
}

/// Decodes `input` in the given chunks and dispatches every packet.
fn dispatch_chunked(input: &[u8], cuts: &[usize]) -> Vec<Outcome> {
    let mut handler = MilterHandler::new(Arc::new(directory()));
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();
    let mut outcomes = Vec::new();
    let mut start = 0;
    for &end in cuts.iter().chain(std::iter::once(&input.len())) {
        buf.extend_from_slice(&input[start..end]);
        start = end;
        while let Some(packet) = codec.decode(&mut buf).unwrap() {
            outcomes.push(handler.handle(&packet));
        }
    }
    assert!(buf.is_empty());
    outcomes
}

proptest! {
    #[test]
    fn prop_fragmentation_does_not_change_dispatch(
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..24)
    ) {
        let input = encode(&transaction());
        let mut cuts: Vec<usize> = cuts.iter().map(|i| i.index(input.len() + 1)).collect();
        cuts.sort_unstable();

        let whole = dispatch_chunked(&input, &[]);
        let chunked = dispatch_chunked(&input, &cuts);
        prop_assert_eq!(whole, chunked);
    }
}

#[test]
fn test_transaction_outcomes() {
    let input = encode(&transaction());
    let outcomes = dispatch_chunked(&input, &[]);
    let commands: Vec<Vec<u8>> = outcomes
        .iter()
        .map(|o| match o {
            Outcome::Reply(r) => r.iter().map(|r| r.command()).collect(),
            Outcome::NoReply => Vec::new(),
            Outcome::Quit => vec![b'!'],
        })
        .collect();
    assert_eq!(
        commands,
        vec![
            vec![SMFIC_OPTNEG],
            vec![SMFIR_CONTINUE],
            vec![],
            vec![SMFIR_CONTINUE],
            vec![],
            vec![SMFIR_CONTINUE],
            vec![],
            vec![SMFIR_CONTINUE],
            vec![SMFIR_ACCEPT],
            vec![SMFIR_CHGHEADER, SMFIR_CHGHEADER, SMFIR_ACCEPT],
        ]
    );
}

fn header_change(packet: &Packet) -> (u32, String, String) {
    let mut payload = packet.payload.clone();
    let index = payload.get_u32();
    let parts: Vec<String> = payload
        .split(|&b| b == 0)
        .map(|p| String::from_utf8_lossy(p).into_owned())
        .collect();
    (index, parts[0].clone(), parts[1].clone())
}

async fn read_packet(stream: &mut TcpStream, codec: &mut PacketCodec, buf: &mut BytesMut) -> Packet {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Some(packet) = codec.decode(buf).unwrap() {
                return packet;
            }
            let n = stream.read_buf(buf).await.unwrap();
            assert!(n > 0, "milter closed the connection");
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_loopback_session() {
    let cached = Arc::new(CachedDirectory::new(directory()));
    let config = ServerConfig::builder("milter", "127.0.0.1:0".parse().unwrap())
        .build()
        .unwrap();
    let server = MilterService::new(Arc::clone(&cached) as Arc<dyn Directory>)
        .bind(config, None)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    let task = tokio::spawn(server.run());

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::new();

    // Outsider posting to a restricted list is refused; the list is not recorded.
    let mut packets = transaction();
    packets[2] = sender("<mallory@evil.test>");
    stream.write_all(&encode(&packets[..5])).await.unwrap();
    stream.write_all(&encode(&[Packet::bare(SMFIC_RCPT)])).await.unwrap();

    assert_eq!(read_packet(&mut stream, &mut codec, &mut buf).await.command, SMFIC_OPTNEG);
    assert_eq!(read_packet(&mut stream, &mut codec, &mut buf).await.command, SMFIR_CONTINUE);
    assert_eq!(read_packet(&mut stream, &mut codec, &mut buf).await.command, SMFIR_CONTINUE);
    let denied = read_packet(&mut stream, &mut codec, &mut buf).await;
    assert_eq!(denied.command, SMFIR_REPLYCODE);
    assert_eq!(
        &denied.payload[..],
        &b"554 5.7.1 Sender is not allowed to email this distribution list: staff@example.com\0"[..]
    );

    // Same connection: abort, then a permitted message through both lists.
    stream.write_all(&encode(&[Packet::bare(SMFIC_ABORT)])).await.unwrap();
    stream.write_all(&encode(&transaction()[2..])).await.unwrap();
    for _ in 0..4 {
        let packet = read_packet(&mut stream, &mut codec, &mut buf).await;
        assert!(
            packet.command == SMFIR_CONTINUE || packet.command == SMFIR_ACCEPT,
            "unexpected {}",
            char::from(packet.command)
        );
    }
    let list = header_change(&read_packet(&mut stream, &mut codec, &mut buf).await);
    assert_eq!(
        list,
        (1, "X-Zimbra-DL".into(), "staff@example.com, all@example.com".into())
    );
    let reply_to = header_change(&read_packet(&mut stream, &mut codec, &mut buf).await);
    assert_eq!(
        reply_to,
        (
            1,
            "Reply-To".into(),
            "Help Desk <help@example.com>, Everyone <all@example.com>".into()
        )
    );
    assert_eq!(read_packet(&mut stream, &mut codec, &mut buf).await.command, SMFIR_ACCEPT);

    // A recipient macro without a sender tempfails.
    stream
        .write_all(&encode(&[recipient("<all@example.com>"), Packet::bare(SMFIC_RCPT)]))
        .await
        .unwrap();
    assert_eq!(read_packet(&mut stream, &mut codec, &mut buf).await.command, SMFIR_TEMPFAIL);

    assert!(cached.cached() > 0);

    stream.write_all(&encode(&[Packet::bare(SMFIC_QUIT)])).await.unwrap();
    let mut rest = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());

    handle.shutdown();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.forced, 0);
}
