//! 路由路径模板
//!
//! 模板由字面量段和 `{name}` 参数段组成。编译阶段拒绝重复参数名和
//! 不平衡的花括号；匹配阶段字面量逐字节比较（区分大小写），
//! 参数段必须非空。

use crate::error::{RatError, RatResult};
use std::borrow::Cow;
use std::fmt;

/// 模板中的一个路径段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// 字面量段
    Literal(String),
    /// 命名参数段
    Param(String),
}

/// 编译后的路径模板
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

/// 按位置绑定的路径参数
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams {
    entries: Vec<(String, String)>,
}

impl PathParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取参数值
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }
}

/// 编译路径模板
pub fn compile(template: &str) -> RatResult<PathTemplate> {
    let invalid = |reason: &str| RatError::InvalidTemplate {
        template: template.to_string(),
        reason: reason.to_string(),
    };

    if !template.starts_with('/') {
        return Err(invalid("模板必须以 '/' 开头"));
    }

    let mut segments = Vec::new();
    let mut names: Vec<&str> = Vec::new();

    for raw in split_segments(template) {
        let open = raw.matches('{').count();
        let close = raw.matches('}').count();

        if open == 0 && close == 0 {
            segments.push(Segment::Literal(raw.to_string()));
            continue;
        }

        if open != 1 || close != 1 {
            return Err(invalid("花括号不平衡或嵌套"));
        }
        if !(raw.starts_with('{') && raw.ends_with('}')) {
            return Err(invalid("参数段不能混合字面量"));
        }

        let name = &raw[1..raw.len() - 1];
        if name.is_empty() {
            return Err(invalid("参数名不能为空"));
        }
        if names.contains(&name) {
            return Err(invalid(&format!("重复的参数名 '{}'", name)));
        }
        names.push(name);
        segments.push(Segment::Param(name.to_string()));
    }

    Ok(PathTemplate {
        source: template.to_string(),
        segments,
    })
}

/// 按 `/` 切分路径，根路径 `/` 没有段，尾部斜杠保留为空段
fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.strip_prefix('/').unwrap_or(path);
    let mut iter = trimmed.split('/');
    if trimmed.is_empty() {
        // "/" → 零个段
        iter.next();
    }
    iter
}

impl PathTemplate {
    /// 原始模板字符串
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// 模板是否包含参数
    pub fn has_params(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Param(_)))
    }

    /// 匹配已解码的路径
    pub fn matches(&self, path: &str) -> Option<PathParams> {
        if !path.starts_with('/') {
            return None;
        }

        let mut params = PathParams::new();
        let mut parts = split_segments(path);

        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(lit) => {
                    if lit.as_bytes() != part.as_bytes() {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    if part.is_empty() {
                        return None;
                    }
                    params.push(name, part);
                }
            }
        }

        if parts.next().is_some() {
            return None;
        }

        Some(params)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// 对请求路径做百分号解码，解码结果不是合法 UTF-8 时返回 None
pub fn percent_decode_path(raw: &str) -> Option<Cow<'_, str>> {
    if !raw.contains('%') {
        return Some(Cow::Borrowed(raw));
    }
    let bytes = urlencoding::decode_binary(raw.as_bytes());
    match bytes {
        Cow::Borrowed(b) => std::str::from_utf8(b).ok().map(Cow::Borrowed),
        Cow::Owned(v) => String::from_utf8(v).ok().map(Cow::Owned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_binding() {
        let tpl = compile("/path/{x}").unwrap();
        let params = tpl.matches("/path/42").expect("应当匹配");
        assert_eq!(params.get("x"), Some("42"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn test_empty_segment_does_not_bind() {
        let tpl = compile("/path/{x}").unwrap();
        assert!(tpl.matches("/path/").is_none());
        assert!(tpl.matches("/path").is_none());
    }

    #[test]
    fn test_literal_is_case_sensitive() {
        let tpl = compile("/Hello").unwrap();
        assert!(tpl.matches("/Hello").is_some());
        assert!(tpl.matches("/hello").is_none());
    }

    #[test]
    fn test_root_template() {
        let tpl = compile("/").unwrap();
        assert!(tpl.segments().is_empty());
        assert!(tpl.matches("/").is_some());
        assert!(tpl.matches("/a").is_none());
    }

    #[test]
    fn test_multiple_params_bind_positionally() {
        let tpl = compile("/users/{id}/posts/{post}").unwrap();
        let params = tpl.matches("/users/7/posts/abc").unwrap();
        let collected: Vec<_> = params.iter().collect();
        assert_eq!(collected, vec![("id", "7"), ("post", "abc")]);
    }

    #[test]
    fn test_invalid_templates() {
        assert!(matches!(compile("/a/{id}/{id}"), Err(RatError::InvalidTemplate { .. })));
        assert!(matches!(compile("/a/{id"), Err(RatError::InvalidTemplate { .. })));
        assert!(matches!(compile("/a/id}"), Err(RatError::InvalidTemplate { .. })));
        assert!(matches!(compile("/a/{{id}}"), Err(RatError::InvalidTemplate { .. })));
        assert!(matches!(compile("/a/{}"), Err(RatError::InvalidTemplate { .. })));
        assert!(matches!(compile("/a/x{id}"), Err(RatError::InvalidTemplate { .. })));
        assert!(matches!(compile("no-slash"), Err(RatError::InvalidTemplate { .. })));
    }

    #[test]
    fn test_percent_decoding() {
        assert_eq!(percent_decode_path("/a%20b").as_deref(), Some("/a b"));
        assert_eq!(percent_decode_path("/plain").as_deref(), Some("/plain"));
        assert!(percent_decode_path("/bad%FF").is_none());

        let tpl = compile("/files/{name}").unwrap();
        let decoded = percent_decode_path("/files/hello%20world").unwrap();
        assert_eq!(tpl.matches(&decoded).unwrap().get("name"), Some("hello world"));
    }
}
