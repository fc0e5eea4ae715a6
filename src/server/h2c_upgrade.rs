//! H2C (HTTP/2 over Cleartext) 升级处理
//!
//! HTTP/1.1 请求携带 `Upgrade: h2c` 时，处理器只被调用一次，其响应先缓冲；
//! 完整装入缓冲区才回复 101，并在服务端第一个 SETTINGS 帧之后把响应
//! 作为 stream 1 注入到 HTTP/2 连接中。装不下则拒绝升级，
//! 已缓冲的部分与剩余响应体拼接后按 HTTP/1.1 发送。

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{HeaderMap, HeaderName, CONNECTION, CONTENT_LENGTH, UPGRADE};
use hyper::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{RatError, RatResult};
use crate::server::streaming::ChannelBody;
use crate::utils::logger::debug;

pub const HTTP2_SETTINGS: &str = "http2-settings";

const FRAME_HEADER_LEN: usize = 9;
const MAX_FRAME_SIZE: usize = 16384;
const DEFAULT_WINDOW: u32 = 65535;

const FRAME_DATA: u8 = 0x0;
const FRAME_HEADERS: u8 = 0x1;
const FRAME_SETTINGS: u8 = 0x4;
const FRAME_WINDOW_UPDATE: u8 = 0x8;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;

/// 不能出现在 HTTP/2 中的连接级头部
const CONNECTION_HEADERS: &[&str] = &["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

/// 请求是否在请求升级到 h2c
pub fn wants_h2c(headers: &HeaderMap) -> bool {
    headers
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case("h2c"))
}

fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// 客户端通过 HTTP2-Settings 携带的设置
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSettings {
    pub entries: Vec<(u16, u32)>,
}

impl ClientSettings {
    pub fn initial_window_size(&self) -> u32 {
        self.entries
            .iter()
            .rev()
            .find(|(id, _)| *id == SETTINGS_INITIAL_WINDOW_SIZE)
            .map(|(_, v)| *v)
            .unwrap_or(DEFAULT_WINDOW)
    }
}

/// 解码 HTTP2-Settings 头部（base64url 编码的 SETTINGS 帧负载）
pub fn parse_http2_settings(value: &str) -> RatResult<ClientSettings> {
    let payload = URL_SAFE_NO_PAD
        .decode(value.trim().trim_end_matches('='))
        .map_err(|e| RatError::Protocol(format!("HTTP2-Settings 不是合法的 base64url: {}", e)))?;
    if payload.len() % 6 != 0 {
        return Err(RatError::Protocol(format!("HTTP2-Settings 长度 {} 不是 6 的倍数", payload.len())));
    }
    let entries = payload
        .chunks_exact(6)
        .map(|c| (u16::from_be_bytes([c[0], c[1]]), u32::from_be_bytes([c[2], c[3], c[4], c[5]])))
        .collect();
    Ok(ClientSettings { entries })
}

/// 检查升级条件，满足时返回客户端设置
pub fn check_upgrade(headers: &HeaderMap, has_body: bool) -> RatResult<ClientSettings> {
    let mut values = headers.get_all(HTTP2_SETTINGS).iter();
    let settings = match (values.next(), values.next()) {
        (Some(v), None) => v
            .to_str()
            .map_err(|_| RatError::Protocol("HTTP2-Settings 含非 ASCII 字符".to_string()))?,
        (None, _) => return Err(RatError::Protocol("缺少 HTTP2-Settings 头部".to_string())),
        (Some(_), Some(_)) => return Err(RatError::Protocol("HTTP2-Settings 头部重复".to_string())),
    };
    if !connection_has(headers, "upgrade") || !connection_has(headers, HTTP2_SETTINGS) {
        return Err(RatError::Protocol("Connection 头部缺少 upgrade / http2-settings".to_string()));
    }
    if has_body {
        return Err(RatError::Protocol("带请求体的请求不能升级到 h2c".to_string()));
    }
    parse_http2_settings(settings)
}

/// 请求是否带有请求体
pub fn request_has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(hyper::header::TRANSFER_ENCODING) {
        return true;
    }
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .is_some_and(|len| len > 0)
}

/// 升级时响应缓冲上限
pub fn buffer_limit(settings: &ClientSettings, configured: usize) -> usize {
    (DEFAULT_WINDOW as usize)
        .min(settings.initial_window_size() as usize)
        .min(configured)
}

/// 缓冲处理器响应的结果
pub enum Buffered {
    /// 响应体完整装入缓冲区
    Complete { data: Vec<Bytes>, trailers: Option<HeaderMap> },
    /// 超出上限或读取失败，保留已读取的帧
    Overflow { frames: VecDeque<Frame<Bytes>>, error: Option<RatError> },
}

/// 读取响应体直到结束或超过 `limit` 字节
pub async fn buffer_response(body: &mut ChannelBody, limit: usize) -> Buffered {
    let mut frames = VecDeque::new();
    let mut total = 0usize;
    loop {
        match body.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    total += data.len();
                }
                frames.push_back(frame);
                if total > limit {
                    return Buffered::Overflow { frames, error: None };
                }
            }
            Some(Err(e)) => return Buffered::Overflow { frames, error: Some(e) },
            None => break,
        }
    }

    let mut data = Vec::new();
    let mut trailers = None;
    for frame in frames {
        match frame.into_data() {
            Ok(bytes) => data.push(bytes),
            Err(frame) => {
                if let Ok(t) = frame.into_trailers() {
                    trailers = Some(t);
                }
            }
        }
    }
    Buffered::Complete { data, trailers }
}

/// 拒绝升级时使用：先吐出已缓冲的帧，再继续原响应体
pub struct PrefixedBody {
    prefix: VecDeque<Frame<Bytes>>,
    error: Option<RatError>,
    rest: ChannelBody,
}

impl PrefixedBody {
    pub fn new(prefix: VecDeque<Frame<Bytes>>, error: Option<RatError>, rest: ChannelBody) -> Self {
        Self { prefix, error, rest }
    }
}

impl Body for PrefixedBody {
    type Data = Bytes;
    type Error = RatError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if let Some(frame) = this.prefix.pop_front() {
            return Poll::Ready(Some(Ok(frame)));
        }
        if let Some(err) = this.error.take() {
            return Poll::Ready(Some(Err(err)));
        }
        Pin::new(&mut this.rest).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.prefix.is_empty() && self.error.is_none() && self.rest.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

fn put_frame_header(out: &mut BytesMut, len: usize, kind: u8, flags: u8, stream_id: u32) {
    out.put_uint(len as u64, 3);
    out.put_u8(kind);
    out.put_u8(flags);
    out.put_u32(stream_id & 0x7fff_ffff);
}

fn hpack_integer(out: &mut BytesMut, mut value: usize, prefix_bits: u8, first: u8) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        out.put_u8(first | value as u8);
        return;
    }
    out.put_u8(first | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        out.put_u8((value % 128 + 128) as u8);
        value /= 128;
    }
    out.put_u8(value as u8);
}

fn hpack_string(out: &mut BytesMut, s: &[u8]) {
    // 不使用 Huffman 编码
    hpack_integer(out, s.len(), 7, 0x00);
    out.put_slice(s);
}

/// 头部块：全部使用“不索引的字面量”，不改变双方的动态表
fn encode_header_block(status: Option<StatusCode>, headers: &HeaderMap) -> BytesMut {
    let mut block = BytesMut::new();
    if let Some(status) = status {
        // :status 在静态表第 8 项
        hpack_integer(&mut block, 8, 4, 0x00);
        hpack_string(&mut block, status.as_str().as_bytes());
    }
    for (name, value) in headers {
        if is_connection_header(name) {
            continue;
        }
        block.put_u8(0x00);
        hpack_string(&mut block, name.as_str().as_bytes());
        hpack_string(&mut block, value.as_bytes());
    }
    block
}

fn is_connection_header(name: &HeaderName) -> bool {
    CONNECTION_HEADERS.contains(&name.as_str())
}

/// 编码注入的 stream 1 帧序列
#[derive(Debug)]
pub struct Stream1Response {
    pub frames: Bytes,
    /// DATA 帧负载总长度，即需要抵扣的连接级窗口
    pub data_len: u64,
}

pub fn encode_stream1_response(
    status: StatusCode,
    headers: &HeaderMap,
    data: &[Bytes],
    trailers: Option<&HeaderMap>,
) -> RatResult<Stream1Response> {
    let block = encode_header_block(Some(status), headers);
    if block.len() > MAX_FRAME_SIZE {
        return Err(RatError::Protocol(format!("响应头块 {} 字节超过单帧上限", block.len())));
    }
    let trailer_block = trailers.map(|t| encode_header_block(None, t));
    if trailer_block.as_ref().is_some_and(|b| b.len() > MAX_FRAME_SIZE) {
        return Err(RatError::Protocol("尾部头块超过单帧上限".to_string()));
    }

    let data_len: usize = data.iter().map(Bytes::len).sum();
    let mut out = BytesMut::with_capacity(block.len() + data_len + 64);

    let mut flags = FLAG_END_HEADERS;
    if data_len == 0 && trailer_block.is_none() {
        flags |= FLAG_END_STREAM;
    }
    put_frame_header(&mut out, block.len(), FRAME_HEADERS, flags, 1);
    out.extend_from_slice(&block);

    if data_len > 0 {
        let mut body = BytesMut::with_capacity(data_len);
        for piece in data {
            body.extend_from_slice(piece);
        }
        let mut remaining = body.freeze();
        while !remaining.is_empty() {
            let piece = remaining.split_to(remaining.len().min(MAX_FRAME_SIZE));
            let last = remaining.is_empty() && trailer_block.is_none();
            put_frame_header(&mut out, piece.len(), FRAME_DATA, if last { FLAG_END_STREAM } else { 0 }, 1);
            out.extend_from_slice(&piece);
        }
    }

    if let Some(block) = trailer_block {
        put_frame_header(&mut out, block.len(), FRAME_HEADERS, FLAG_END_HEADERS | FLAG_END_STREAM, 1);
        out.extend_from_slice(&block);
    }

    Ok(Stream1Response { frames: out.freeze(), data_len: data_len as u64 })
}

fn frame_len(header: &[u8]) -> usize {
    ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize
}

fn frame_stream_id(header: &[u8]) -> u32 {
    u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff
}

/// 入站帧过滤：丢弃 stream 1 的帧，并从连接级 WINDOW_UPDATE 中扣除注入的 DATA
#[derive(Debug)]
pub struct InboundFilter {
    window_debt: u64,
}

impl InboundFilter {
    pub fn new(window_debt: u64) -> Self {
        Self { window_debt }
    }

    pub fn window_debt(&self) -> u64 {
        self.window_debt
    }

    /// 处理一个完整帧，返回需要交给 h2 的帧
    pub fn filter(&mut self, mut frame: BytesMut) -> Option<BytesMut> {
        let stream_id = frame_stream_id(&frame[..FRAME_HEADER_LEN]);
        if stream_id == 1 {
            return None;
        }
        if frame[3] == FRAME_WINDOW_UPDATE && stream_id == 0 && self.window_debt > 0 && frame.len() >= 13 {
            let increment = u32::from_be_bytes([frame[9], frame[10], frame[11], frame[12]]) & 0x7fff_ffff;
            let discount = self.window_debt.min(increment as u64);
            self.window_debt -= discount;
            let remaining = increment - discount as u32;
            if remaining == 0 {
                return None;
            }
            frame[9..13].copy_from_slice(&remaining.to_be_bytes());
        }
        Some(frame)
    }
}

enum InjectState {
    /// 等待服务端的第一个 SETTINGS 帧写完；`remaining` 为该帧尚未写出的字节数
    AwaitSettings { header: Vec<u8>, remaining: Option<usize>, frames: Bytes },
    Draining(Bytes),
    Done,
}

/// 升级后的连接 IO 包装
pub struct H2cUpgradeIo<IO> {
    inner: IO,
    inject: InjectState,
    preface_left: usize,
    raw: BytesMut,
    filtered: BytesMut,
    filter: InboundFilter,
    read_eof: bool,
}

impl<IO> H2cUpgradeIo<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: IO, response: Stream1Response) -> Self {
        Self {
            inner,
            inject: InjectState::AwaitSettings {
                header: Vec::with_capacity(FRAME_HEADER_LEN),
                remaining: None,
                frames: response.frames,
            },
            preface_left: crate::server::protocol_detector::H2_PREFACE.len(),
            raw: BytesMut::new(),
            filtered: BytesMut::new(),
            filter: InboundFilter::new(response.data_len),
            read_eof: false,
        }
    }

    fn process_inbound(&mut self) {
        if self.preface_left > 0 {
            let n = self.preface_left.min(self.raw.len());
            let preface = self.raw.split_to(n);
            self.filtered.extend_from_slice(&preface);
            self.preface_left -= n;
            if self.preface_left > 0 {
                return;
            }
        }
        while self.raw.len() >= FRAME_HEADER_LEN {
            let total = FRAME_HEADER_LEN + frame_len(&self.raw[..FRAME_HEADER_LEN]);
            if self.raw.len() < total {
                break;
            }
            let frame = self.raw.split_to(total);
            match self.filter.filter(frame) {
                Some(frame) => self.filtered.extend_from_slice(&frame),
                None => debug!("🧹 [H2C] 丢弃客户端发往 stream 1 的帧或已抵扣的窗口更新"),
            }
        }
    }

    /// 把待注入的帧写完
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while let InjectState::Draining(pending) = &mut self.inject {
            if pending.is_empty() {
                debug!("💉 [H2C] stream 1 响应注入完成");
                self.inject = InjectState::Done;
                break;
            }
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &pending[..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            pending.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<IO> AsyncRead for H2cUpgradeIo<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.filtered.is_empty() {
                let n = this.filtered.len().min(buf.remaining());
                buf.put_slice(&this.filtered.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.read_eof {
                // 不完整的尾帧原样交给 h2，由它报告协议错误
                if !this.raw.is_empty() {
                    let rest = this.raw.split();
                    this.filtered.extend_from_slice(&rest);
                    continue;
                }
                return Poll::Ready(Ok(()));
            }

            let mut tmp = [0u8; 8192];
            let mut read_buf = ReadBuf::new(&mut tmp);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            let filled = read_buf.filled();
            if filled.is_empty() {
                this.read_eof = true;
            } else {
                this.raw.extend_from_slice(filled);
                this.process_inbound();
            }
        }
    }
}

impl<IO> AsyncWrite for H2cUpgradeIo<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;

        if let InjectState::AwaitSettings { header, remaining, .. } = &mut this.inject {
            // 第一个帧头未完整写出前逐段转发，先拿到帧长度
            let limit = match *remaining {
                Some(left) => left,
                None => FRAME_HEADER_LEN - header.len(),
            };
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..buf.len().min(limit)]))?;
            if remaining.is_none() {
                header.extend_from_slice(&buf[..n]);
                if header.len() == FRAME_HEADER_LEN {
                    if header[3] != FRAME_SETTINGS {
                        debug!("⚠️ [H2C] 服务端首帧类型 {:#x} 不是 SETTINGS", header[3]);
                    }
                    *remaining = Some(frame_len(header));
                }
            } else if let Some(left) = remaining.as_mut() {
                *left -= n;
            }

            if *remaining == Some(0) {
                let state = std::mem::replace(&mut this.inject, InjectState::Done);
                if let InjectState::AwaitSettings { frames, .. } = state {
                    this.inject = InjectState::Draining(frames);
                }
            }
            return Poll::Ready(Ok(n));
        }

        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
