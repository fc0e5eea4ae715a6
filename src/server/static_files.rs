//! 静态文件
//!
//! `open_for_read` 只负责安全地打开文件；`StaticFiles` 本身也是一个处理器，
//! 按挂载前缀把请求路径映射到根目录下的文件并流式写出。

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use hyper::header::LAST_MODIFIED;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{RatError, RatResult};
use crate::server::http_request::HttpRequest;
use crate::server::response_writer::ResponseWriter;
use crate::server::router::Handler;
use crate::utils::logger::debug;

const READ_CHUNK: usize = 16 * 1024;

/// 按扩展名推断内容类型
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "mp4" => "video/mp4",
        "gz" => "application/gzip",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// 打开的文件流，丢弃时释放文件句柄
#[derive(Debug)]
pub struct FileStream {
    pub len: u64,
    pub content_type: &'static str,
    pub modified: Option<SystemTime>,
    file: File,
}

impl FileStream {
    /// 读取下一块，文件结束时返回 None
    pub async fn next_chunk(&mut self) -> RatResult<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let n = self.file.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }

    pub fn into_stream(self) -> impl Stream<Item = RatResult<Bytes>> + Send {
        futures_util::stream::unfold(self, |mut fs| async move {
            match fs.next_chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), fs)),
                Ok(None) => None,
                Err(e) => Some((Err(e), fs)),
            }
        })
    }
}

/// 静态文件目录
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    mount: String,
    index_file: Option<String>,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), mount: "/".to_string(), index_file: Some("index.html".to_string()) }
    }

    /// 路由挂载前缀，处理时从请求路径中去掉
    pub fn mount(mut self, prefix: &str) -> Self {
        self.mount = prefix.trim_end_matches('/').to_string();
        if self.mount.is_empty() {
            self.mount = "/".to_string();
        }
        self
    }

    pub fn index_file(mut self, name: Option<&str>) -> Self {
        self.index_file = name.map(str::to_string);
        self
    }

    /// 把相对路径解析到根目录下；`..` 或绝对路径一律视为不存在
    fn resolve(&self, relative: &str) -> RatResult<PathBuf> {
        let mut path = self.root.clone();
        for component in Path::new(relative.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return Err(RatError::NotFound(relative.to_string())),
            }
        }
        Ok(path)
    }

    /// 打开文件用于读取
    pub async fn open_for_read(&self, relative: &str) -> RatResult<FileStream> {
        let mut path = self.resolve(relative)?;
        let not_found = || RatError::NotFound(relative.to_string());

        let mut meta = tokio::fs::metadata(&path).await.map_err(|_| not_found())?;
        if meta.is_dir() {
            let index = self.index_file.as_ref().ok_or_else(not_found)?;
            path.push(index);
            meta = tokio::fs::metadata(&path).await.map_err(|_| not_found())?;
            if !meta.is_file() {
                return Err(not_found());
            }
        }

        let file = File::open(&path).await.map_err(|_| not_found())?;
        debug!("📁 [StaticFiles] 打开 {} ({} 字节)", path.display(), meta.len());
        Ok(FileStream {
            len: meta.len(),
            content_type: content_type_for(&path),
            modified: meta.modified().ok(),
            file,
        })
    }

    fn relative_path<'a>(&self, request_path: &'a str) -> &'a str {
        if self.mount == "/" {
            return request_path;
        }
        request_path.strip_prefix(self.mount.as_str()).unwrap_or(request_path)
    }

    /// 按请求路径写出文件，设置长度、类型和 Last-Modified
    pub async fn serve(&self, req: &HttpRequest, mut res: ResponseWriter) -> RatResult<()> {
        let relative = self.relative_path(req.path());
        let mut file = self.open_for_read(relative).await?;

        res.content_type(file.content_type)?.content_length(file.len)?;
        if let Some(modified) = file.modified {
            res.header(LAST_MODIFIED, httpdate::fmt_http_date(modified))?;
        }
        while let Some(chunk) = file.next_chunk().await? {
            res.write(chunk).await?;
        }
        res.finish().await
    }
}

#[async_trait]
impl Handler for StaticFiles {
    async fn call(&self, req: HttpRequest, res: ResponseWriter) -> RatResult<()> {
        self.serve(&req, res).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[test]
    fn test_content_types() {
        assert_eq!(content_type_for(Path::new("a/b/index.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("x.bin")), "application/octet-stream");
        assert_eq!(content_type_for(Path::new("noext")), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_open_and_stream() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello static").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("index.html"), b"<h1>x</h1>").unwrap();

        let files = StaticFiles::new(dir.path());
        let fs = files.open_for_read("/hello.txt").await.unwrap();
        assert_eq!(fs.len, 12);
        assert_eq!(fs.content_type, "text/plain; charset=utf-8");
        let chunks: Vec<_> = fs.into_stream().collect().await;
        let body: Vec<u8> = chunks.into_iter().flat_map(|c| c.unwrap().to_vec()).collect();
        assert_eq!(body, b"hello static");

        let index = files.open_for_read("sub/").await.unwrap();
        assert_eq!(index.content_type, "text/html; charset=utf-8");
    }

    #[tokio::test]
    async fn test_traversal_and_missing_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let files = StaticFiles::new(dir.path().join("public"));
        std::fs::create_dir(dir.path().join("public")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"no").unwrap();

        assert!(matches!(files.open_for_read("../secret.txt").await, Err(RatError::NotFound(_))));
        assert!(matches!(files.open_for_read("missing.txt").await, Err(RatError::NotFound(_))));
        assert!(matches!(files.open_for_read("/").await, Err(RatError::NotFound(_))));
    }

    #[test]
    fn test_mount_prefix() {
        let files = StaticFiles::new("/srv").mount("/static/");
        assert_eq!(files.relative_path("/static/css/a.css"), "/css/a.css");
        assert_eq!(StaticFiles::new("/srv").relative_path("/a"), "/a");
    }
}
