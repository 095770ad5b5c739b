//! The polling conn: a request-driven duplex built from a pair of bounded
//! queues and a closed signal.
//!
//! Short HTTP requests are correlated with the long-lived logical conn: a
//! GET parks on the outbound queue until a packet batch is producible, a
//! POST decodes its body into the inbound queue. Pausing the conn (during a
//! transport upgrade) lets exactly one request drain the outbound queue and
//! rejects the rest until resume.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, mpsc::error::TryRecvError, watch, Mutex, Notify};

use crate::{
    errors::Error,
    packet::Packet,
    payload::{encode_jsonp, encode_xhr, encode_xhr2, Payload},
    transport::ConnInfo,
};

/// The wire form requested by a polling GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Textual length-prefixed frames, binary as base64 (`b64=1`).
    Xhr,
    /// Binary length-prefixed frames (the default).
    Xhr2,
    /// Textual frames wrapped in a `___eio[<n>](...)` callback (`j=<n>`).
    Jsonp(u32),
}

impl WireFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Xhr => "text/plain; charset=UTF-8",
            WireFormat::Xhr2 => "application/octet-stream",
            WireFormat::Jsonp(_) => "text/javascript; charset=UTF-8",
        }
    }

    pub fn encode(&self, packets: &[Packet]) -> Result<Bytes, Error> {
        match self {
            WireFormat::Xhr => Ok(Bytes::from(encode_xhr(packets)?)),
            WireFormat::Xhr2 => encode_xhr2(packets),
            WireFormat::Jsonp(index) => Ok(Bytes::from(encode_jsonp(*index, packets)?)),
        }
    }
}

pub struct PollingConn {
    in_tx: mpsc::Sender<Packet>,
    in_rx: Mutex<mpsc::Receiver<Packet>>,
    out_tx: mpsc::Sender<Packet>,
    out_rx: Mutex<mpsc::Receiver<Packet>>,
    closed: watch::Sender<bool>,
    paused: watch::Sender<bool>,
    /// Set once the single draining request admitted while paused has run.
    pause_drained: AtomicBool,
    /// Signaled every time a request empties the outbound queue.
    drained: Notify,
    peer: ConnInfo,
}

impl PollingConn {
    pub fn new(buffer: usize, peer: ConnInfo) -> Self {
        let (in_tx, in_rx) = mpsc::channel(buffer.max(1));
        let (out_tx, out_rx) = mpsc::channel(buffer.max(1));
        Self {
            in_tx,
            in_rx: Mutex::new(in_rx),
            out_tx,
            out_rx: Mutex::new(out_rx),
            closed: watch::channel(false).0,
            paused: watch::channel(false).0,
            pause_drained: AtomicBool::new(false),
            drained: Notify::new(),
            peer,
        }
    }

    pub fn peer(&self) -> &ConnInfo {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Pop the next inbound packet. While paused the call yields the benign
    /// `ConnPaused` error instead of parking.
    pub(crate) async fn read_packet(&self) -> Result<Packet, Error> {
        let mut rx = self.in_rx.lock().await;
        loop {
            match rx.try_recv() {
                Ok(packet) => return Ok(packet),
                Err(TryRecvError::Disconnected) => return Err(Error::PollingConnClosed),
                Err(TryRecvError::Empty) => {}
            }
            // subscribe before the flag checks so a concurrent close or
            // pause cannot slip between check and park
            let mut closed = self.closed.subscribe();
            let mut paused = self.paused.subscribe();
            if self.is_closed() {
                return Err(Error::PollingConnClosed);
            }
            if self.is_paused() {
                return Err(Error::ConnPaused);
            }
            tokio::select! {
                packet = rx.recv() => return packet.ok_or(Error::PollingConnClosed),
                _ = closed.changed() => return Err(Error::PollingConnClosed),
                _ = paused.changed() => continue,
            }
        }
    }

    /// Push an outbound packet, parking while the queue is full. Packets are
    /// buffered but never lost while the conn is paused.
    pub(crate) async fn write_packet(&self, packet: Packet) -> Result<(), Error> {
        let mut closed = self.closed.subscribe();
        if self.is_closed() {
            return Err(Error::PollingConnClosed);
        }
        tokio::select! {
            res = self.out_tx.send(packet) => res.map_err(|_| Error::PollingConnClosed),
            _ = closed.changed() => Err(Error::PollingConnClosed),
        }
    }

    /// Gate the outbound stream: one in-flight GET may drain the queue once,
    /// further GETs are rejected until [`resume`](Self::resume). Resolves
    /// once the queue is empty so the caller knows every packet committed to
    /// this conn has been handed to the peer.
    pub(crate) async fn pause(&self) -> Result<(), Error> {
        let mut closed = self.closed.subscribe();
        if self.is_closed() {
            return Err(Error::PollingConnClosed);
        }
        self.paused.send_replace(true);
        loop {
            // register for the drain notification before re-checking so a
            // concurrent drain cannot be missed
            let mut drained = std::pin::pin!(self.drained.notified());
            drained.as_mut().enable();
            if self.is_closed() {
                return Err(Error::PollingConnClosed);
            }
            if self.out_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = &mut drained => {}
                _ = closed.changed() => return Err(Error::PollingConnClosed),
            }
        }
    }

    pub(crate) fn resume(&self) {
        self.pause_drained.store(false, Ordering::SeqCst);
        self.paused.send_replace(false);
    }

    /// Signal the closed one-shot. Parked reads, writes and polling requests
    /// unpark with `PollingConnClosed`.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
        self.drained.notify_waiters();
    }

    fn out_empty(&self) -> bool {
        self.out_tx.capacity() == self.out_tx.max_capacity()
    }

    /// Serve a polling GET: park until a batch of outbound packets is
    /// producible and encode it in the requested wire form.
    pub async fn handle_get(&self, format: WireFormat) -> Result<Bytes, Error> {
        let packets = self.poll().await?;
        format.encode(&packets)
    }

    async fn poll(&self) -> Result<Vec<Packet>, Error> {
        if self.is_closed() {
            return Err(Error::PollingConnClosed);
        }
        // a session serves one polling request at a time
        let mut rx = self
            .out_rx
            .try_lock()
            .map_err(|_| Error::MultiplePollingRequests)?;

        let mut closed = self.closed.subscribe();
        let mut paused = self.paused.subscribe();
        if self.is_closed() {
            return Err(Error::PollingConnClosed);
        }
        if self.is_paused() {
            if self.pause_drained.swap(true, Ordering::SeqCst) {
                return Err(Error::ConnPaused);
            }
            return Ok(self.drain(&mut rx));
        }

        let first = loop {
            tokio::select! {
                packet = rx.recv() => break packet.ok_or(Error::PollingConnClosed)?,
                _ = closed.changed() => return Err(Error::PollingConnClosed),
                _ = paused.changed() => {
                    if self.is_paused() {
                        self.pause_drained.store(true, Ordering::SeqCst);
                        return Ok(self.drain(&mut rx));
                    }
                }
            }
        };
        let mut packets = vec![first];
        while let Ok(packet) = rx.try_recv() {
            packets.push(packet);
        }
        self.drained.notify_waiters();
        Ok(packets)
    }

    /// Drain whatever is buffered; a lone Noop wakes a peer that would
    /// otherwise park on an empty response.
    fn drain(&self, rx: &mut mpsc::Receiver<Packet>) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            packets.push(packet);
        }
        if packets.is_empty() {
            packets.push(Packet::noop());
        }
        self.drained.notify_waiters();
        packets
    }

    /// Serve a polling POST: decode the body as a payload and feed the
    /// inbound queue, aborting if the conn closes mid-push.
    pub async fn handle_post(&self, content_type: Option<&str>, body: Bytes) -> Result<(), Error> {
        let xhr2 = match parse_media_type(content_type)? {
            MediaType::OctetStream => true,
            MediaType::TextPlain => false,
        };
        for packet in Payload::decode(&body, xhr2) {
            let packet = packet?;
            let mut closed = self.closed.subscribe();
            if self.is_closed() {
                return Err(Error::PollingConnClosed);
            }
            tokio::select! {
                res = self.in_tx.send(packet) => res.map_err(|_| Error::PollingConnClosed)?,
                _ = closed.changed() => return Err(Error::PollingConnClosed),
            }
        }
        Ok(())
    }
}

enum MediaType {
    TextPlain,
    OctetStream,
}

fn parse_media_type(content_type: Option<&str>) -> Result<MediaType, Error> {
    let content_type = content_type.ok_or(Error::InvalidMediaType)?;
    let mut parts = content_type.split(';').map(str::trim);
    match parts.next() {
        Some(mediatype) if mediatype.eq_ignore_ascii_case("application/octet-stream") => {
            Ok(MediaType::OctetStream)
        }
        Some(mediatype) if mediatype.eq_ignore_ascii_case("text/plain") => {
            let charset = parts
                .find_map(|p| p.strip_prefix("charset="))
                .ok_or(Error::InvalidCharset)?;
            if charset.eq_ignore_ascii_case("utf-8") {
                Ok(MediaType::TextPlain)
            } else {
                Err(Error::InvalidCharset)
            }
        }
        _ => Err(Error::InvalidMediaType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;

    fn conn() -> PollingConn {
        PollingConn::new(8, ConnInfo::default())
    }

    fn msg(data: &str) -> Packet {
        Packet::text(PacketType::Message, data.to_string())
    }

    #[tokio::test]
    async fn get_observes_writes_in_order() {
        let conn = conn();
        conn.write_packet(msg("one")).await.unwrap();
        conn.write_packet(msg("two")).await.unwrap();
        let body = conn.handle_get(WireFormat::Xhr).await.unwrap();
        assert_eq!(&body[..], b"4:4one4:4two");
    }

    #[tokio::test]
    async fn get_parks_until_packet() {
        let conn = std::sync::Arc::new(conn());
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.handle_get(WireFormat::Xhr).await })
        };
        tokio::task::yield_now().await;
        conn.write_packet(msg("hello")).await.unwrap();
        let body = waiter.await.unwrap().unwrap();
        assert_eq!(&body[..], b"6:4hello");
    }

    #[tokio::test]
    async fn concurrent_polling_rejected() {
        let conn = std::sync::Arc::new(conn());
        let parked = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.handle_get(WireFormat::Xhr).await })
        };
        tokio::task::yield_now().await;
        assert!(matches!(
            conn.handle_get(WireFormat::Xhr).await,
            Err(Error::MultiplePollingRequests)
        ));
        conn.close();
        assert!(matches!(
            parked.await.unwrap(),
            Err(Error::PollingConnClosed)
        ));
    }

    #[tokio::test]
    async fn post_feeds_inbound_queue() {
        let conn = conn();
        conn.handle_post(
            Some("text/plain; charset=utf-8"),
            Bytes::from_static(b"6:4world"),
        )
        .await
        .unwrap();
        let packet = conn.read_packet().await.unwrap();
        assert_eq!(packet, msg("world"));
    }

    #[tokio::test]
    async fn post_rejects_bad_charset() {
        let conn = conn();
        let res = conn
            .handle_post(
                Some("text/plain; charset=latin-1"),
                Bytes::from_static(b"6:4world"),
            )
            .await;
        assert!(matches!(res, Err(Error::InvalidCharset)));
        let res = conn
            .handle_post(Some("application/json"), Bytes::from_static(b"{}"))
            .await;
        assert!(matches!(res, Err(Error::InvalidMediaType)));
    }

    #[tokio::test]
    async fn pause_drains_once_then_rejects() {
        let conn = std::sync::Arc::new(conn());
        conn.write_packet(msg("tail")).await.unwrap();
        // pause resolves once the in-flight request drains the queue
        let pause = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.pause().await })
        };
        tokio::task::yield_now().await;
        let body = conn.handle_get(WireFormat::Xhr).await.unwrap();
        assert_eq!(&body[..], b"5:4tail");
        pause.await.unwrap().unwrap();
        // subsequent requests bounce until resume
        assert!(matches!(
            conn.handle_get(WireFormat::Xhr).await,
            Err(Error::ConnPaused)
        ));
        conn.resume();
        conn.write_packet(msg("after")).await.unwrap();
        let body = conn.handle_get(WireFormat::Xhr).await.unwrap();
        assert_eq!(&body[..], b"6:4after");
    }

    #[tokio::test]
    async fn paused_empty_queue_yields_noop() {
        let conn = std::sync::Arc::new(conn());
        let parked = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.handle_get(WireFormat::Xhr).await })
        };
        tokio::task::yield_now().await;
        conn.pause().await.unwrap();
        let body = parked.await.unwrap().unwrap();
        assert_eq!(&body[..], b"1:6");
    }

    #[tokio::test]
    async fn closed_conn_fails_reads_and_writes() {
        let conn = conn();
        conn.write_packet(msg("left-over")).await.unwrap();
        conn.close();
        assert!(matches!(
            conn.write_packet(msg("nope")).await,
            Err(Error::PollingConnClosed)
        ));
        assert!(matches!(
            conn.read_packet().await,
            Err(Error::PollingConnClosed)
        ));
        assert!(matches!(
            conn.handle_post(
                Some("text/plain; charset=utf-8"),
                Bytes::from_static(b"2:4a")
            )
            .await,
            Err(Error::PollingConnClosed)
        ));
    }
}
