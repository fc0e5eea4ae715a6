//! 路由表
//!
//! 路由按声明顺序保存，分发时第一条方法、类型、模板都匹配的路由胜出。
//! 构建完成后路由表不可变，通过 `Arc` 在所有连接间共享，无需加锁。

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::Method;

use crate::common::path_params::{compile, PathParams, PathTemplate};
use crate::error::RatResult;
use crate::server::http_request::HttpRequest;
use crate::server::response_writer::ResponseWriter;
use crate::server::websocket::WebSocketSession;
use crate::utils::logger::debug;

/// HTTP 处理器
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, req: HttpRequest, res: ResponseWriter) -> RatResult<()>;
}

/// WebSocket 处理器，握手完成后调用
#[async_trait]
pub trait WsHandler: Send + Sync + 'static {
    async fn call(&self, req: HttpRequest, session: WebSocketSession) -> RatResult<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HttpRequest, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RatResult<()>> + Send + 'static,
{
    async fn call(&self, req: HttpRequest, res: ResponseWriter) -> RatResult<()> {
        (self.0)(req, res).await
    }
}

struct FnWsHandler<F>(F);

#[async_trait]
impl<F, Fut> WsHandler for FnWsHandler<F>
where
    F: Fn(HttpRequest, WebSocketSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RatResult<()>> + Send + 'static,
{
    async fn call(&self, req: HttpRequest, session: WebSocketSession) -> RatResult<()> {
        (self.0)(req, session).await
    }
}

/// 把异步闭包包装为 HTTP 处理器
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(HttpRequest, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RatResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// 把异步闭包包装为 WebSocket 处理器
pub fn ws_handler_fn<F, Fut>(f: F) -> Arc<dyn WsHandler>
where
    F: Fn(HttpRequest, WebSocketSession) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RatResult<()>> + Send + 'static,
{
    Arc::new(FnWsHandler(f))
}

/// 路由类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    Http,
    WebSocket,
}

/// 路由处理器
#[derive(Clone)]
pub enum RouteHandler {
    Http(Arc<dyn Handler>),
    WebSocket(Arc<dyn WsHandler>),
}

impl RouteHandler {
    pub fn kind(&self) -> RouteKind {
        match self {
            Self::Http(_) => RouteKind::Http,
            Self::WebSocket(_) => RouteKind::WebSocket,
        }
    }
}

impl From<Arc<dyn Handler>> for RouteHandler {
    fn from(handler: Arc<dyn Handler>) -> Self {
        Self::Http(handler)
    }
}

impl From<Arc<dyn WsHandler>> for RouteHandler {
    fn from(handler: Arc<dyn WsHandler>) -> Self {
        Self::WebSocket(handler)
    }
}

/// 单条路由
#[derive(Clone)]
pub struct Route {
    /// `None` 表示匹配任意方法
    pub method: Option<Method>,
    pub template: PathTemplate,
    pub handler: RouteHandler,
}

impl Route {
    pub fn kind(&self) -> RouteKind {
        self.handler.kind()
    }
}

/// 分发结果
#[derive(Clone)]
pub struct RouteMatch {
    pub handler: RouteHandler,
    pub params: PathParams,
    pub kind: RouteKind,
    pub template: String,
}

/// 路由表构建器
#[derive(Default)]
pub struct RouteTableBuilder {
    routes: Vec<Route>,
}

impl RouteTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加路由，模板非法时返回 `InvalidTemplate`
    pub fn add(
        &mut self,
        method: Option<Method>,
        template: &str,
        handler: impl Into<RouteHandler>,
    ) -> RatResult<&mut Self> {
        let template = compile(template)?;
        self.routes.push(Route { method, template, handler: handler.into() });
        Ok(self)
    }

    /// 添加指定方法的 HTTP 路由
    pub fn route(&mut self, method: Method, template: &str, handler: Arc<dyn Handler>) -> RatResult<&mut Self> {
        self.add(Some(method), template, handler)
    }

    /// 添加不限方法的 HTTP 路由
    pub fn handle(&mut self, template: &str, handler: Arc<dyn Handler>) -> RatResult<&mut Self> {
        self.add(None, template, handler)
    }

    /// 添加 WebSocket 路由
    pub fn websocket(&mut self, template: &str, handler: Arc<dyn WsHandler>) -> RatResult<&mut Self> {
        self.add(Some(Method::GET), template, handler)
    }

    pub fn build(&mut self) -> RouteTable {
        RouteTable { routes: std::mem::take(&mut self.routes) }
    }
}

/// 不可变路由表
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::new()
    }

    /// 按声明顺序匹配，未命中返回 `None`（由调用方映射为 404）
    pub fn dispatch(&self, method: &Method, path: &str, is_websocket_upgrade: bool) -> Option<RouteMatch> {
        let wanted = if is_websocket_upgrade { RouteKind::WebSocket } else { RouteKind::Http };
        // H2 扩展 CONNECT 的 WebSocket 请求方法是 CONNECT，按 GET 路由处理
        let method = if is_websocket_upgrade && method == Method::CONNECT { &Method::GET } else { method };

        for route in &self.routes {
            if route.kind() != wanted {
                continue;
            }
            if let Some(m) = &route.method {
                if m != method {
                    continue;
                }
            }
            if let Some(params) = route.template.matches(path) {
                debug!("🔍 [Router] {} {} 命中路由 {}", method, path, route.template.as_str());
                return Some(RouteMatch {
                    handler: route.handler.clone(),
                    params,
                    kind: wanted,
                    template: route.template.as_str().to_string(),
                });
            }
        }
        debug!("🔍 [Router] {} {} 未命中任何路由", method, path);
        None
    }

    /// 列出所有路由，用于启动日志
    pub fn routes(&self) -> Vec<(String, String, RouteKind)> {
        self.routes
            .iter()
            .map(|r| {
                let method = r.method.as_ref().map(|m| m.to_string()).unwrap_or_else(|| "*".to_string());
                (method, r.template.as_str().to_string(), r.kind())
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RatError;

    fn ok_handler() -> Arc<dyn Handler> {
        handler_fn(|_req, mut res: ResponseWriter| async move { res.send("ok").await })
    }

    fn ws_handler() -> Arc<dyn WsHandler> {
        ws_handler_fn(|_req, _session| async move { Ok(()) })
    }

    #[test]
    fn test_first_declared_wins() {
        let mut builder = RouteTable::builder();
        builder
            .route(Method::GET, "/users/me", ok_handler())
            .unwrap()
            .route(Method::GET, "/users/{id}", ok_handler())
            .unwrap();
        let table = builder.build();

        let hit = table.dispatch(&Method::GET, "/users/me", false).unwrap();
        assert_eq!(hit.template, "/users/me");
        assert!(hit.params.is_empty());

        let hit = table.dispatch(&Method::GET, "/users/42", false).unwrap();
        assert_eq!(hit.template, "/users/{id}");
        assert_eq!(hit.params.get("id"), Some("42"));
    }

    #[test]
    fn test_broader_route_added_later_does_not_shadow() {
        let mut builder = RouteTable::builder();
        builder
            .route(Method::GET, "/files/{name}", ok_handler())
            .unwrap()
            .handle("/{any}/{name}", ok_handler())
            .unwrap();
        let table = builder.build();
        assert_eq!(table.dispatch(&Method::GET, "/files/a", false).unwrap().template, "/files/{name}");
        assert_eq!(table.dispatch(&Method::POST, "/files/a", false).unwrap().template, "/{any}/{name}");
    }

    #[test]
    fn test_method_agnostic_route() {
        let mut builder = RouteTable::builder();
        builder.handle("/any", ok_handler()).unwrap();
        let table = builder.build();
        for method in [Method::GET, Method::POST, Method::DELETE] {
            assert!(table.dispatch(&method, "/any", false).is_some());
        }
    }

    #[test]
    fn test_websocket_kind_isolation() {
        let mut builder = RouteTable::builder();
        builder
            .websocket("/ws", ws_handler())
            .unwrap()
            .route(Method::GET, "/plain", ok_handler())
            .unwrap();
        let table = builder.build();

        assert!(table.dispatch(&Method::GET, "/ws", false).is_none());
        assert_eq!(table.dispatch(&Method::GET, "/ws", true).unwrap().kind, RouteKind::WebSocket);
        assert!(table.dispatch(&Method::CONNECT, "/ws", true).is_some());
        assert!(table.dispatch(&Method::GET, "/plain", true).is_none());
    }

    #[test]
    fn test_no_match_and_invalid_template() {
        let mut builder = RouteTable::builder();
        builder.route(Method::GET, "/path/{x}", ok_handler()).unwrap();
        assert!(matches!(
            builder.route(Method::GET, "/bad/{x", ok_handler()),
            Err(RatError::InvalidTemplate { .. })
        ));
        let table = builder.build();
        assert!(table.dispatch(&Method::GET, "/path/", false).is_none());
        assert!(table.dispatch(&Method::POST, "/path/1", false).is_none());
        assert_eq!(table.routes(), vec![("GET".to_string(), "/path/{x}".to_string(), RouteKind::Http)]);
    }
}
