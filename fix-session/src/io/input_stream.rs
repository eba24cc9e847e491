//! Adapts a byte stream into decoded messages. Framing and resynchronization
//! after a malformed span are entirely `codec::Codec`'s job; this module
//! only shuttles bytes read from the socket into it and turns whatever
//! comes out into an `InputEvent`.

use async_stream::stream;
use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::warn;

use crate::codec::Codec;

pub(crate) enum InputEvent {
    Message(Box<fix_core::FixMessage>),
    CodecError(fix_core::CodecError),
    IoError(std::io::Error),
    Timeout,
}

struct Disconnect;

async fn read_more(
    source: &mut (impl AsyncRead + Unpin),
    buf: &mut Vec<u8>,
) -> Result<Option<InputEvent>, Disconnect> {
    let mut chunk = vec![0u8; 8192];
    match source.read(&mut chunk).await {
        Ok(0) => Err(Disconnect),
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            Ok(None)
        }
        Err(error) => {
            warn!(%error, "input read error");
            Ok(Some(InputEvent::IoError(error)))
        }
    }
}

pub(crate) fn input_stream(mut source: impl AsyncRead + Unpin) -> impl Stream<Item = InputEvent> {
    stream! {
        let mut codec = Codec::new();
        let mut read_buf = Vec::with_capacity(4096);
        loop {
            loop {
                match codec.get_message() {
                    Ok(Some(msg)) => yield InputEvent::Message(Box::new(msg)),
                    Ok(None) => break,
                    Err(error) => yield InputEvent::CodecError(error),
                }
            }

            match read_more(&mut source, &mut read_buf).await {
                Ok(Some(event)) => {
                    yield event;
                }
                Ok(None) => {
                    codec.append_buffer(&read_buf);
                    read_buf.clear();
                }
                Err(Disconnect) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{pin_mut, StreamExt};
    use fix_core::{FixString, Header, MsgType, UtcTimestamp};
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::codec::encode;

    fn sample_message(seq_num: fix_core::SeqNum) -> Vec<u8> {
        let header = Header {
            begin_string: FixString::try_from("FIX.4.2").unwrap(),
            body_length: 0,
            msg_type: Some(MsgType::Heartbeat),
            msg_seq_num: Some(seq_num),
            sender_comp_id: Some(FixString::try_from("BUYER").unwrap()),
            target_comp_id: Some(FixString::try_from("SELLER").unwrap()),
            sending_time: Some(UtcTimestamp::now()),
            poss_dup_flag: false,
            orig_sending_time: None,
        };
        encode(&header, &[])
    }

    #[tokio::test]
    async fn yields_message_once_frame_arrives_in_pieces() {
        let (mut client, server) = tokio::io::duplex(64);
        let bytes = sample_message(1);

        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(7) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let stream = input_stream(server);
        pin_mut!(stream);
        match stream.next().await.expect("one message expected") {
            InputEvent::Message(msg) => assert_eq!(msg.header.msg_seq_num, Some(1)),
            _ => panic!("expected a decoded message"),
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn yields_both_messages_from_a_single_read() {
        let (mut client, server) = tokio::io::duplex(256);
        let mut bytes = sample_message(1);
        bytes.extend_from_slice(&sample_message(2));
        client.write_all(&bytes).await.unwrap();
        drop(client);

        let stream = input_stream(server);
        pin_mut!(stream);

        let first = stream.next().await.expect("first message expected");
        let second = stream.next().await.expect("second message expected");
        match (first, second) {
            (InputEvent::Message(a), InputEvent::Message(b)) => {
                assert_eq!(a.header.msg_seq_num, Some(1));
                assert_eq!(b.header.msg_seq_num, Some(2));
            }
            _ => panic!("expected two decoded messages"),
        }
    }

    #[tokio::test]
    async fn stream_ends_once_peer_closes_with_no_trailing_bytes() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);

        let stream = input_stream(server);
        pin_mut!(stream);
        assert!(stream.next().await.is_none());
    }
}
