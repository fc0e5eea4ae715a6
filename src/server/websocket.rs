//! WebSocket 支持
//!
//! HTTP/1.1 通过 `Upgrade: websocket` 握手（101），HTTP/2 通过扩展 CONNECT
//! 握手（200）。握手完成后帧编解码交给 tokio-tungstenite，读写两个方向
//! 各自经过一个背压流通道：读任务只有在会话授予额度后才继续读 socket，
//! 写任务只有在上一条消息写入 socket 后才授予新的额度。

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use hyper::header::{HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE};
use hyper::{Method, Request, Response, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::{RatError, RatResult};
use crate::server::streaming::{ChannelConsumer, ChannelProducer, Chunk, ControlFrame, StreamChannel};
use crate::utils::logger::{debug, info};

/// WebSocket 消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<(u16, String)>),
}

/// 客户端提出的扩展
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    pub name: String,
    pub params: Vec<(String, Option<String>)>,
}

/// 解析 Sec-WebSocket-Extensions
pub fn parse_extension_offers(value: &str) -> Vec<ExtensionOffer> {
    value
        .split(',')
        .filter_map(|offer| {
            let mut parts = offer.split(';').map(str::trim);
            let name = parts.next().filter(|n| !n.is_empty())?.to_ascii_lowercase();
            let params = parts
                .filter(|p| !p.is_empty())
                .map(|p| match p.split_once('=') {
                    Some((k, v)) => (k.trim().to_string(), Some(v.trim().trim_matches('"').to_string())),
                    None => (p.to_string(), None),
                })
                .collect();
            Some(ExtensionOffer { name, params })
        })
        .collect()
}

fn header_has_token(headers: &HeaderMap, name: hyper::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// 请求是否为 WebSocket 握手（HTTP/1.1 升级或 HTTP/2 扩展 CONNECT）
pub fn is_websocket_request<B>(req: &Request<B>) -> bool {
    if req.method() == Method::CONNECT {
        return req
            .extensions()
            .get::<hyper::ext::Protocol>()
            .is_some_and(|p| p.as_str().eq_ignore_ascii_case("websocket"));
    }
    header_has_token(req.headers(), UPGRADE, "websocket")
}

fn check_version(headers: &HeaderMap) -> RatResult<()> {
    match headers.get(SEC_WEBSOCKET_VERSION).and_then(|v| v.to_str().ok()) {
        Some("13") => Ok(()),
        other => Err(RatError::Protocol(format!("不支持的 Sec-WebSocket-Version: {:?}", other))),
    }
}

fn decline_extensions(headers: &HeaderMap) {
    for value in headers.get_all(SEC_WEBSOCKET_EXTENSIONS).iter().filter_map(|v| v.to_str().ok()) {
        for offer in parse_extension_offers(value) {
            debug!("🧩 [WebSocket] 拒绝扩展 {}", offer.name);
        }
    }
}

/// 校验 HTTP/1.1 握手并生成 101 响应头
pub fn h1_handshake(headers: &HeaderMap) -> RatResult<HeaderMap> {
    if !header_has_token(headers, CONNECTION, "upgrade") {
        return Err(RatError::Protocol("Connection 头部缺少 upgrade".to_string()));
    }
    check_version(headers)?;
    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or_else(|| RatError::Protocol("缺少 Sec-WebSocket-Key".to_string()))?;
    decline_extensions(headers);

    let accept = derive_accept_key(key.as_bytes());
    let mut out = HeaderMap::new();
    out.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    out.insert(UPGRADE, HeaderValue::from_static("websocket"));
    out.insert(
        SEC_WEBSOCKET_ACCEPT,
        HeaderValue::from_str(&accept).map_err(|e| RatError::Protocol(e.to_string()))?,
    );
    Ok(out)
}

/// 校验 HTTP/2 扩展 CONNECT 握手
pub fn h2_handshake(headers: &HeaderMap) -> RatResult<HeaderMap> {
    check_version(headers)?;
    decline_extensions(headers);
    Ok(HeaderMap::new())
}

/// 握手失败时的响应
pub fn handshake_rejection(err: &RatError) -> Response<()> {
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::BAD_REQUEST;
    if err.to_string().contains("Sec-WebSocket-Version") {
        *response.status_mut() = StatusCode::UPGRADE_REQUIRED;
        response.headers_mut().insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    }
    response
}

/// 握手完成后的会话
pub struct WebSocketSession {
    id: String,
    inbound: ChannelConsumer,
    outbound: ChannelProducer,
    demand_step: u64,
}

impl WebSocketSession {
    /// 在升级后的 IO 上启动读写任务
    pub async fn start<IO>(io: IO, capacity: usize, window: u64) -> Self
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws = WebSocketStream::from_raw_socket(io, Role::Server, None).await;
        let (sink, stream) = ws.split();
        let (in_tx, in_rx) = StreamChannel::new(capacity, 0);
        let (out_tx, out_rx) = StreamChannel::new(capacity, 0);
        let id = uuid::Uuid::new_v4().to_string();

        tokio::spawn(read_loop(stream, in_tx, id.clone()));
        tokio::spawn(write_loop(sink, out_rx, window, id.clone()));
        info!("🔌 [WebSocket] 会话 {} 已建立", id);

        Self { id, inbound: in_rx, outbound: out_tx, demand_step: window.max(1) }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// 接收下一条消息，`None` 表示对端已关闭
    pub async fn recv(&mut self) -> Option<RatResult<WsMessage>> {
        let mut text = false;
        let mut buf = BytesMut::new();
        loop {
            if self.inbound.outstanding_demand() == 0 && self.inbound.is_drained() {
                self.inbound.request_demand(self.demand_step);
            }
            let chunk = match self.inbound.pull().await? {
                Ok(chunk) => chunk,
                Err(e) => return Some(Err(e)),
            };
            match chunk {
                Chunk::Control(ControlFrame::Text) => text = true,
                Chunk::Data { bytes, is_last } => {
                    buf.extend_from_slice(&bytes);
                    if !is_last {
                        continue;
                    }
                    let data = buf.split().freeze();
                    if !text {
                        return Some(Ok(WsMessage::Binary(data)));
                    }
                    return Some(
                        String::from_utf8(data.to_vec())
                            .map(WsMessage::Text)
                            .map_err(|e| RatError::Protocol(format!("文本消息不是合法的 UTF-8: {}", e))),
                    );
                }
                Chunk::Control(ControlFrame::Ping(p)) => return Some(Ok(WsMessage::Ping(p))),
                Chunk::Control(ControlFrame::Pong(p)) => return Some(Ok(WsMessage::Pong(p))),
                Chunk::Control(ControlFrame::Close(c)) => return Some(Ok(WsMessage::Close(c))),
                Chunk::Trailers(_) => continue,
            }
        }
    }

    /// 发送一条消息，写任务未授予额度时挂起
    pub async fn send(&self, msg: WsMessage) -> RatResult<()> {
        match msg {
            WsMessage::Text(s) => {
                self.outbound.push(Chunk::Control(ControlFrame::Text)).await?;
                self.outbound.push(Chunk::Data { bytes: Bytes::from(s), is_last: true }).await
            }
            WsMessage::Binary(b) => self.outbound.push(Chunk::Data { bytes: b, is_last: true }).await,
            WsMessage::Ping(p) => self.outbound.push(Chunk::Control(ControlFrame::Ping(p))).await,
            WsMessage::Pong(p) => self.outbound.push(Chunk::Control(ControlFrame::Pong(p))).await,
            WsMessage::Close(c) => {
                let result = self.outbound.push(Chunk::Control(ControlFrame::Close(c))).await;
                self.outbound.close();
                result
            }
        }
    }

    /// 发起关闭握手
    pub async fn close(&self) -> RatResult<()> {
        if self.outbound.is_closed() {
            return Ok(());
        }
        self.send(WsMessage::Close(None)).await
    }
}

async fn push_message(inbound: &ChannelProducer, msg: Message) -> RatResult<()> {
    match msg {
        Message::Text(text) => {
            inbound.push(Chunk::Control(ControlFrame::Text)).await?;
            inbound
                .push(Chunk::Data { bytes: Bytes::copy_from_slice(text.as_str().as_bytes()), is_last: true })
                .await
        }
        Message::Binary(data) => inbound.push(Chunk::Data { bytes: data, is_last: true }).await,
        Message::Ping(p) => inbound.push(Chunk::Control(ControlFrame::Ping(p))).await,
        Message::Pong(p) => inbound.push(Chunk::Control(ControlFrame::Pong(p))).await,
        Message::Close(frame) => {
            let close = frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()));
            inbound.push(Chunk::Control(ControlFrame::Close(close))).await
        }
        Message::Frame(_) => Ok(()),
    }
}

async fn read_loop<S>(mut stream: S, inbound: ChannelProducer, id: String)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let cancel = inbound.cancel_signal();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(msg)) => {
                if let Err(e) = push_message(&inbound, msg).await {
                    debug!("🔌 [WebSocket] 会话 {} 读取端停止: {}", id, e);
                    break;
                }
            }
            Some(Err(e)) => {
                let err = RatError::from(e);
                if err.is_disconnect() {
                    debug!("🔌 [WebSocket] 会话 {} 对端断开: {}", id, err);
                } else {
                    debug!("❌ [WebSocket] 会话 {} 读取失败: {}", id, err);
                }
                inbound.abort(err.to_string());
                return;
            }
            None => break,
        }
    }
    inbound.close();
}

async fn write_loop<S>(mut sink: S, mut outbound: ChannelConsumer, window: u64, id: String)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut text = false;
    let mut buf = BytesMut::new();
    loop {
        if outbound.outstanding_demand() == 0 && outbound.is_drained() {
            outbound.request_demand(window);
        }
        let chunk = match outbound.pull().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                debug!("🔌 [WebSocket] 会话 {} 写入端停止: {}", id, e);
                break;
            }
            None => break,
        };
        let (msg, closing) = match chunk {
            Chunk::Control(ControlFrame::Text) => {
                text = true;
                continue;
            }
            Chunk::Data { bytes, is_last } => {
                buf.extend_from_slice(&bytes);
                if !is_last {
                    continue;
                }
                let data = buf.split().freeze();
                if std::mem::take(&mut text) {
                    match String::from_utf8(data.to_vec()) {
                        Ok(s) => (Message::Text(s.into()), false),
                        Err(_) => (Message::Binary(data), false),
                    }
                } else {
                    (Message::Binary(data), false)
                }
            }
            Chunk::Control(ControlFrame::Ping(p)) => (Message::Ping(p), false),
            Chunk::Control(ControlFrame::Pong(p)) => (Message::Pong(p), false),
            Chunk::Control(ControlFrame::Close(c)) => {
                let frame = c.map(|(code, reason)| CloseFrame { code: CloseCode::from(code), reason: reason.into() });
                (Message::Close(frame), true)
            }
            Chunk::Trailers(_) => continue,
        };
        if let Err(e) = sink.send(msg).await {
            debug!("🔌 [WebSocket] 会话 {} 发送失败: {}", id, e);
            return;
        }
        if closing {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("🔌 [WebSocket] 会话 {} 关闭失败: {}", id, e);
    }
    debug!("👋 [WebSocket] 会话 {} 写入端结束", id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accept_key_matches_rfc_sample() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="));
        headers.insert(SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static("permessage-deflate; client_max_window_bits"));

        let out = h1_handshake(&headers).unwrap();
        assert_eq!(out[SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert!(out.get(SEC_WEBSOCKET_EXTENSIONS).is_none());
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        headers.insert(SEC_WEBSOCKET_KEY, HeaderValue::from_static("x"));
        let err = h1_handshake(&headers).unwrap_err();
        assert_eq!(handshake_rejection(&err).status(), StatusCode::UPGRADE_REQUIRED);
    }

    #[test]
    fn test_parse_extension_offers() {
        let offers = parse_extension_offers("permessage-deflate; client_max_window_bits=15, x-custom");
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].name, "permessage-deflate");
        assert_eq!(offers[0].params, vec![("client_max_window_bits".to_string(), Some("15".to_string()))]);
        assert_eq!(offers[1].name, "x-custom");
    }

    #[test]
    fn test_detects_h1_and_h2_handshakes() {
        let req = Request::builder()
            .uri("/ws")
            .header(UPGRADE, "WebSocket")
            .body(())
            .unwrap();
        assert!(is_websocket_request(&req));

        let mut req = Request::builder().method(Method::CONNECT).uri("/ws").body(()).unwrap();
        assert!(!is_websocket_request(&req));
        req.extensions_mut().insert(hyper::ext::Protocol::from_static("websocket"));
        assert!(is_websocket_request(&req));
    }

    #[tokio::test]
    async fn test_session_echo_over_duplex() {
        let (client_io, server_io) = tokio::io::duplex(1 << 16);
        let server = tokio::spawn(async move {
            let mut session = WebSocketSession::start(server_io, 4, 1024).await;
            while let Some(msg) = session.recv().await {
                match msg.unwrap() {
                    WsMessage::Text(t) => session.send(WsMessage::Text(format!("echo: {}", t))).await.unwrap(),
                    WsMessage::Binary(b) => session.send(WsMessage::Binary(b)).await.unwrap(),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        let mut client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        client.send(Message::Text("hi".into())).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap().as_str(), "echo: hi");

        // 超过额度的二进制消息被拆分后仍完整送达
        let big = Bytes::from(vec![9u8; 5000]);
        client.send(Message::Binary(big.clone())).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.into_data(), big);

        client.close(None).await.unwrap();
        server.await.unwrap();
    }
}
