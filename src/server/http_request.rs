//! 请求视图
//!
//! 每个请求创建一次，处理器结束后丢弃。请求体通过背压通道按需读取。

use std::net::{IpAddr, SocketAddr};

use bytes::{Bytes, BytesMut};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::{Method, Uri, Version};

use crate::common::path_params::PathParams;
use crate::error::{DecoderLimit, RatError, RatResult};
use crate::server::streaming::{ChannelConsumer, Chunk};

/// 请求使用的线路协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
    Http2,
}

impl Protocol {
    pub fn from_version(version: Version) -> Self {
        match version {
            Version::HTTP_10 | Version::HTTP_09 => Self::Http10,
            Version::HTTP_2 | Version::HTTP_3 => Self::Http2,
            _ => Self::Http11,
        }
    }

    /// 访问日志中的协议名
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
            Self::Http2 => "HTTP/2.0",
        }
    }
}

/// 解析后的请求行与头部
#[derive(Debug, Clone)]
pub struct ParsedRequestLine {
    pub method: Method,
    /// 百分号解码后的路径
    pub path: String,
    /// 线路上的原始路径
    pub raw_path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub protocol: Protocol,
}

impl ParsedRequestLine {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap, version: Version, decoded_path: String) -> Self {
        Self {
            method,
            path: decoded_path,
            raw_path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
            protocol: Protocol::from_version(version),
        }
    }
}

/// 交给处理器的请求
pub struct HttpRequest {
    line: ParsedRequestLine,
    params: PathParams,
    route_template: Option<String>,
    remote_addr: SocketAddr,
    trust_forwarded: bool,
    body: ChannelConsumer,
    demand_step: u64,
    max_content_length: Option<u64>,
}

impl HttpRequest {
    pub fn new(line: ParsedRequestLine, remote_addr: SocketAddr, body: ChannelConsumer) -> Self {
        Self {
            line,
            params: PathParams::new(),
            route_template: None,
            remote_addr,
            trust_forwarded: false,
            body,
            demand_step: 8192,
            max_content_length: None,
        }
    }

    pub(crate) fn with_route(mut self, params: PathParams, template: &str) -> Self {
        self.params = params;
        self.route_template = Some(template.to_string());
        self
    }

    pub(crate) fn with_limits(mut self, demand_step: u64, max_content_length: Option<u64>, trust_forwarded: bool) -> Self {
        self.demand_step = demand_step.max(1);
        self.max_content_length = max_content_length;
        self.trust_forwarded = trust_forwarded;
        self
    }

    pub fn method(&self) -> &Method {
        &self.line.method
    }

    /// 解码后的路径
    pub fn path(&self) -> &str {
        &self.line.path
    }

    pub fn raw_path(&self) -> &str {
        &self.line.raw_path
    }

    pub fn query(&self) -> Option<&str> {
        self.line.query.as_deref()
    }

    /// 获取解码后的查询参数
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query()?.split('&').find_map(|pair| {
            let mut kv = pair.splitn(2, '=');
            let key = kv.next()?;
            if urlencoding::decode(key).ok()?.as_ref() != name {
                return None;
            }
            let value = kv.next().unwrap_or("").replace('+', " ");
            urlencoding::decode(&value).ok().map(|v| v.into_owned())
        })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.line.headers
    }

    /// 获取头部字符串值
    pub fn header(&self, name: &str) -> Option<&str> {
        self.line.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// 同名头部的全部值，按到达顺序
    pub fn header_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a HeaderValue> + 'a {
        self.line.headers.get_all(name).iter()
    }

    pub fn protocol(&self) -> Protocol {
        self.line.protocol
    }

    pub fn request_line(&self) -> &ParsedRequestLine {
        &self.line
    }

    /// 获取路径参数
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn params(&self) -> &PathParams {
        &self.params
    }

    /// 命中的路由模板
    pub fn route_template(&self) -> Option<&str> {
        self.route_template.as_deref()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// 客户端 IP；信任转发头时优先取 X-Forwarded-For / Forwarded
    pub fn client_ip(&self) -> IpAddr {
        client_ip(&self.line.headers, self.remote_addr, self.trust_forwarded)
    }

    /// 原始请求体通道，调用方负责授予额度
    pub fn body_mut(&mut self) -> &mut ChannelConsumer {
        &mut self.body
    }

    /// 读取下一段请求体，额度用尽时按步长自动授予
    pub async fn read_chunk(&mut self) -> Option<RatResult<Bytes>> {
        loop {
            if self.body.outstanding_demand() == 0 && self.body.is_drained() {
                self.body.request_demand(self.demand_step);
            }
            match self.body.pull().await? {
                Ok(Chunk::Data { bytes, .. }) if bytes.is_empty() => continue,
                Ok(Chunk::Data { bytes, .. }) => return Some(Ok(bytes)),
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// 读取完整请求体，受 max-content-length 约束
    pub async fn body_bytes(&mut self) -> RatResult<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.read_chunk().await {
            let chunk = chunk?;
            let total = (buf.len() + chunk.len()) as u64;
            if let Some(max) = self.max_content_length {
                if total > max {
                    self.body.cancel();
                    return Err(RatError::DecoderLimitExceeded {
                        limit: DecoderLimit::ContentLength,
                        max,
                        actual: total,
                    });
                }
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// 以 UTF-8 读取请求体
    pub async fn body_text(&mut self) -> RatResult<String> {
        let bytes = self.body_bytes().await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| RatError::Handler(format!("请求体不是合法的 UTF-8: {}", e)))
    }
}

/// 解析客户端 IP
pub fn client_ip(headers: &HeaderMap, remote_addr: SocketAddr, trust_forwarded: bool) -> IpAddr {
    if trust_forwarded {
        let forwarded_for = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded_for {
            return ip;
        }

        let forwarded = headers
            .get("forwarded")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.split([';', ','])
                    .filter_map(|p| p.trim().strip_prefix("for="))
                    .next()
                    .map(|s| s.trim_matches('"').trim_start_matches('[').split(']').next().unwrap_or("").to_string())
            })
            .and_then(|v| v.parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    remote_addr.ip()
}
