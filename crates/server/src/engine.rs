use std::fmt::Write as _;
use std::io;
use std::time::Duration;

use rand::RngCore;
use rtpscope_protocol::ng::{self, NgError};
use rtpscope_protocol::Bencode;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

/// Read deadline for one control request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine transport: {0}")]
    Transport(#[from] io::Error),
    #[error("engine did not reply within the read deadline")]
    Timeout,
    #[error("engine protocol: {0}")]
    Protocol(NgError),
    #[error("engine: {0}")]
    Engine(String),
}

impl From<NgError> for EngineError {
    fn from(err: NgError) -> Self {
        match err {
            NgError::Engine(reason) => EngineError::Engine(reason),
            other => EngineError::Protocol(other),
        }
    }
}

/// Engine reply to a `subscribe request`.
#[derive(Debug)]
pub struct SubscribeReply {
    /// SDP offer produced by the engine for the backend leg.
    pub sdp: String,
    /// Subscription tag; required for the matching `subscribe answer` and
    /// the eventual `unsubscribe`.
    pub to_tag: String,
}

/// Client for the engine's bencoded UDP control channel.
///
/// One socket, one configured peer, one request in flight at a time.
/// Replies are matched to requests by turn, so the reply cookie is never
/// inspected. Dropping the client closes the socket.
pub struct EngineClient {
    socket: UdpSocket,
    serial: Mutex<()>,
}

impl EngineClient {
    /// Bind an ephemeral local port and associate it with the engine's
    /// control address.
    pub async fn connect(address: &str) -> Result<Self, EngineError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(address).await?;
        tracing::info!(engine = %address, "Engine control channel ready");
        Ok(Self {
            socket,
            serial: Mutex::new(()),
        })
    }

    /// List active call ids.
    pub async fn list_calls(&self) -> Result<Vec<String>, EngineError> {
        let reply = self.request("list", Bencode::dict([])).await?;
        let calls = ng::want_list(&reply, "calls")?;
        Ok(calls
            .iter()
            .filter_map(Bencode::as_str)
            .map(str::to_owned)
            .collect())
    }

    /// Full state of one call as the engine reports it.
    pub async fn query_call(&self, call_id: &str) -> Result<Bencode, EngineError> {
        self.request("query", Bencode::dict([("call-id", call_id.into())]))
            .await
    }

    /// Open a media subscription to one leg of a call.
    ///
    /// The flag set locks the subscription to DTLS-SRTP muxed audio
    /// transcoded to PCMU; the fan-out path depends on exactly that.
    pub async fn subscribe(
        &self,
        call_id: &str,
        from_tag: &str,
    ) -> Result<SubscribeReply, EngineError> {
        let args = Bencode::dict([
            ("call-id", call_id.into()),
            ("from-tag", from_tag.into()),
            (
                "flags",
                Bencode::str_list([
                    "trust-address",
                    "generate-mid",
                    "SDES-off",
                    "no-rtcp-attribute",
                    "trickle-ICE",
                ]),
            ),
            ("rtcp-mux", Bencode::str_list(["offer", "require"])),
            ("transport-protocol", "UDP/TLS/RTP/SAVPF".into()),
            ("ICE", "force".into()),
            (
                "codec",
                Bencode::dict([
                    ("strip", Bencode::str_list(["all"])),
                    ("transcode", Bencode::str_list(["PCMU"])),
                ]),
            ),
        ]);
        let reply = self.request("subscribe request", args).await?;
        Ok(SubscribeReply {
            sdp: ng::want_str(&reply, "sdp")?.to_owned(),
            to_tag: ng::want_str(&reply, "to-tag")?.to_owned(),
        })
    }

    /// Complete a subscription with our SDP answer.
    pub async fn subscribe_answer(
        &self,
        call_id: &str,
        sdp: &str,
        to_tag: &str,
    ) -> Result<(), EngineError> {
        let args = Bencode::dict([
            ("call-id", call_id.into()),
            ("sdp", sdp.into()),
            ("to-tag", to_tag.into()),
        ]);
        self.request("subscribe answer", args).await?;
        Ok(())
    }

    /// Release a subscription. `to_tag` is the subscription tag returned by
    /// [`EngineClient::subscribe`].
    pub async fn unsubscribe(
        &self,
        call_id: &str,
        from_tag: &str,
        to_tag: &str,
    ) -> Result<(), EngineError> {
        let args = Bencode::dict([
            ("call-id", call_id.into()),
            ("from-tag", from_tag.into()),
            ("to-tag", to_tag.into()),
        ]);
        self.request("unsubscribe", args).await?;
        Ok(())
    }

    /// Engine-wide statistics tree.
    pub async fn statistics(&self) -> Result<Bencode, EngineError> {
        let reply = self.request("statistics", Bencode::dict([])).await?;
        Ok(ng::want_dict(&reply, "statistics")?.clone())
    }

    async fn request(&self, command: &str, args: Bencode) -> Result<Bencode, EngineError> {
        let cookie = new_cookie();
        let datagram = ng::frame(&cookie, command, args);

        let turn = self.serial.lock().await;
        self.socket.send(&datagram).await?;
        let mut buf = vec![0u8; ng::MAX_DATAGRAM];
        let n = tokio::time::timeout(REQUEST_TIMEOUT, self.socket.recv(&mut buf))
            .await
            .map_err(|_| {
                tracing::warn!(command, "Engine request timed out");
                EngineError::Timeout
            })??;
        drop(turn);

        Ok(ng::parse_reply(&buf[..n])?)
    }
}

/// Fresh per-request cookie: 8 random bytes as lowercase hex.
fn new_cookie() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut hex = String::with_capacity(16);
    for b in bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::Arc;

    /// Scripted engine bound to a loopback port. The handler receives the
    /// decoded request dictionary and the command string and returns the
    /// reply dictionary; `None` suppresses the reply entirely.
    pub async fn spawn_mock_engine(
        handler: impl Fn(&str, &Bencode) -> Option<Bencode> + Send + Sync + 'static,
    ) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let handler = Arc::new(handler);
        tokio::spawn(async move {
            let mut buf = vec![0u8; ng::MAX_DATAGRAM];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let datagram = &buf[..n];
                let sep = datagram.iter().position(|&b| b == b' ').unwrap();
                let request = Bencode::decode(&datagram[sep + 1..]).unwrap();
                let command = request.get("command").and_then(Bencode::as_str).unwrap();
                if let Some(reply) = handler(command, &request) {
                    let mut out = datagram[..sep + 1].to_vec();
                    reply.encode_into(&mut out);
                    socket.send_to(&out, peer).await.unwrap();
                }
            }
        });
        addr
    }

    pub fn ok_reply(extra: impl IntoIterator<Item = (&'static str, Bencode)>) -> Bencode {
        let mut entries = vec![("result", Bencode::str("ok"))];
        entries.extend(extra);
        Bencode::dict(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ok_reply, spawn_mock_engine};
    use super::*;

    #[test]
    fn cookie_is_16_lowercase_hex() {
        let cookie = new_cookie();
        assert_eq!(cookie.len(), 16);
        assert!(cookie
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn cookie_is_fresh_per_request() {
        assert_ne!(new_cookie(), new_cookie());
    }

    #[tokio::test]
    async fn list_calls_returns_ids() {
        let addr = spawn_mock_engine(|command, _| {
            assert_eq!(command, "list");
            Some(ok_reply([("calls", Bencode::str_list(["one", "two"]))]))
        })
        .await;
        let client = EngineClient::connect(&addr.to_string()).await.unwrap();
        assert_eq!(client.list_calls().await.unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn engine_error_reason_is_preserved() {
        let addr = spawn_mock_engine(|_, _| {
            Some(Bencode::dict([
                ("result", Bencode::str("error")),
                ("error-reason", Bencode::str("no such call")),
            ]))
        })
        .await;
        let client = EngineClient::connect(&addr.to_string()).await.unwrap();
        match client.query_call("missing").await {
            Err(EngineError::Engine(reason)) => assert_eq!(reason, "no such call"),
            other => panic!("expected engine error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_sends_fixed_flag_set() {
        let addr = spawn_mock_engine(|command, request| {
            assert_eq!(command, "subscribe request");
            assert_eq!(
                request.get("call-id").and_then(Bencode::as_str),
                Some("call-1")
            );
            assert_eq!(
                request.get("from-tag").and_then(Bencode::as_str),
                Some("leg-a")
            );
            let flags: Vec<_> = request
                .get("flags")
                .and_then(Bencode::as_list)
                .unwrap()
                .iter()
                .filter_map(Bencode::as_str)
                .collect();
            assert_eq!(
                flags,
                vec![
                    "trust-address",
                    "generate-mid",
                    "SDES-off",
                    "no-rtcp-attribute",
                    "trickle-ICE"
                ]
            );
            assert_eq!(
                request.get("ICE").and_then(Bencode::as_str),
                Some("force")
            );
            assert_eq!(
                request.get("transport-protocol").and_then(Bencode::as_str),
                Some("UDP/TLS/RTP/SAVPF")
            );
            let codec = request.get("codec").unwrap();
            assert_eq!(
                codec.get("transcode").and_then(Bencode::as_list).unwrap()[0],
                Bencode::str("PCMU")
            );
            Some(ok_reply([
                ("sdp", Bencode::str("v=0\r\n")),
                ("to-tag", Bencode::str("sub-1")),
            ]))
        })
        .await;
        let client = EngineClient::connect(&addr.to_string()).await.unwrap();
        let reply = client.subscribe("call-1", "leg-a").await.unwrap();
        assert_eq!(reply.sdp, "v=0\r\n");
        assert_eq!(reply.to_tag, "sub-1");
    }

    #[tokio::test]
    async fn subscribe_without_sdp_is_protocol_error() {
        let addr =
            spawn_mock_engine(|_, _| Some(ok_reply([("to-tag", Bencode::str("sub-1"))]))).await;
        let client = EngineClient::connect(&addr.to_string()).await.unwrap();
        assert!(matches!(
            client.subscribe("call-1", "leg-a").await,
            Err(EngineError::Protocol(NgError::MissingField("sdp")))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_engine_times_out() {
        let addr = spawn_mock_engine(|_, _| None).await;
        let client = EngineClient::connect(&addr.to_string()).await.unwrap();
        assert!(matches!(
            client.list_calls().await,
            Err(EngineError::Timeout)
        ));
    }

    #[tokio::test]
    async fn statistics_returns_subtree() {
        let addr = spawn_mock_engine(|command, _| {
            assert_eq!(command, "statistics");
            Some(ok_reply([(
                "statistics",
                Bencode::dict([("currentstatistics", Bencode::dict([]))]),
            )]))
        })
        .await;
        let client = EngineClient::connect(&addr.to_string()).await.unwrap();
        let stats = client.statistics().await.unwrap();
        assert!(stats.get("currentstatistics").is_some());
    }
}
