//! In-process HTTP stub server for unit tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
struct Route {
    path: String,
    query_contains: Option<String>,
    status: u16,
    body: Vec<u8>,
    headers: Vec<(String, String)>,
    delay: Option<Duration>,
}

#[derive(Default)]
struct State {
    routes: Vec<Route>,
    hits: Vec<(String, String)>,
}

pub struct StubServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl StubServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(State::default()));

        let shared = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let _ = serve(stream, shared).await;
                });
            }
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn push(&self, route: Route) {
        self.state.lock().unwrap().routes.push(route);
    }

    pub fn route(&self, path: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.push(Route {
            path: path.to_string(),
            query_contains: None,
            status,
            body: body.into(),
            headers: Vec::new(),
            delay: None,
        });
    }

    /// Only matches when the raw query string contains `needle`
    pub fn route_query(&self, path: &str, needle: &str, status: u16, body: impl Into<Vec<u8>>) {
        self.push(Route {
            path: path.to_string(),
            query_contains: Some(needle.to_string()),
            status,
            body: body.into(),
            headers: Vec::new(),
            delay: None,
        });
    }

    pub fn route_delayed(&self, path: &str, status: u16, body: impl Into<Vec<u8>>, delay: Duration) {
        self.push(Route {
            path: path.to_string(),
            query_contains: None,
            status,
            body: body.into(),
            headers: Vec::new(),
            delay: Some(delay),
        });
    }

    pub fn redirect(&self, path: &str, location: &str) {
        self.push(Route {
            path: path.to_string(),
            query_contains: None,
            status: 302,
            body: Vec::new(),
            headers: vec![("Location".to_string(), location.to_string())],
            delay: None,
        });
    }

    /// Number of requests received for `path`
    pub fn hits(&self, path: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .hits
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }

    /// Raw query strings received for `path`, in arrival order
    pub fn queries(&self, path: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .hits
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, q)| q.clone())
            .collect()
    }
}

async fn serve(mut stream: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let target = head
        .lines()
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target.clone(), String::new()),
    };

    let route = {
        let mut state = state.lock().unwrap();
        state.hits.push((path.clone(), query.clone()));
        state
            .routes
            .iter()
            .rev()
            .find(|r| {
                r.path == path
                    && r
                        .query_contains
                        .as_ref()
                        .is_none_or(|needle| query.contains(needle.as_str()))
            })
            .cloned()
    };

    let route = route.unwrap_or(Route {
        path,
        query_contains: None,
        status: 404,
        body: b"not found".to_vec(),
        headers: Vec::new(),
        delay: None,
    });

    if let Some(delay) = route.delay {
        tokio::time::sleep(delay).await;
    }

    let mut response = format!(
        "HTTP/1.1 {} Stub\r\nContent-Length: {}\r\nConnection: close\r\n",
        route.status,
        route.body.len()
    );
    for (name, value) in &route.headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("\r\n");

    stream.write_all(response.as_bytes()).await?;
    stream.write_all(&route.body).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Build an in-memory zip archive from `(path, contents)` pairs
pub fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default();
        for (path, contents) in files {
            writer.start_file(*path, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}
