//! A scripted server on the far end of an in-memory pipe.

use {
    crate::{client::Client, config::Config, fcall::*, serialize, utils},
    bytes::buf::{Buf, BufMut},
    futures::sink::SinkExt,
    std::time::Duration,
    tokio::io::{DuplexStream, ReadHalf, WriteHalf},
    tokio_stream::StreamExt,
    tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) struct Peer {
    framedread: FramedRead<ReadHalf<DuplexStream>, LengthDelimitedCodec>,
    framedwrite: FramedWrite<WriteHalf<DuplexStream>, LengthDelimitedCodec>,
}

impl Peer {
    /// Next request written by the client
    pub(crate) async fn recv(&mut self) -> Msg {
        let bytes = tokio::time::timeout(WAIT, self.framedread.next())
            .await
            .expect("client wrote nothing")
            .expect("client hung up")
            .expect("bad frame");
        serialize::read_msg(&mut bytes.reader()).expect("undecodable request")
    }

    pub(crate) async fn reply(&mut self, tag: u16, body: FCall) {
        let mut writer = bytes::BytesMut::with_capacity(256).writer();
        serialize::write_msg(&mut writer, &Msg { tag, body }).expect("encode reply");
        self.framedwrite
            .send(writer.into_inner().freeze())
            .await
            .expect("send reply");
    }

    /// Write `frame` as is, without encoding it
    pub(crate) async fn send_raw(&mut self, frame: Vec<u8>) {
        self.framedwrite
            .send(bytes::Bytes::from(frame))
            .await
            .expect("send frame");
    }

    /// Answer the next request with whatever `f` makes of it
    pub(crate) async fn answer(&mut self, f: impl FnOnce(FCall) -> FCall) -> Msg {
        let req = self.recv().await;
        self.reply(req.tag, f(req.body.clone())).await;
        req
    }
}

/// A client wired to a scripted peer
pub(crate) fn pair(config: Config) -> (Client, Peer) {
    let (client_io, peer_io) = tokio::io::duplex(64 * 1024);
    let client = Client::from_stream(client_io, config);

    let (readhalf, writehalf) = tokio::io::split(peer_io);
    let framing = utils::framing(1 << 20);
    let peer = Peer {
        framedread: framing.new_read(readhalf),
        framedwrite: framing.new_write(writehalf),
    };
    (client, peer)
}

/// Poll `cond` until it holds or `WAIT` runs out
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
