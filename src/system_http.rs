//! Administrative HTTP control surface.
//!
//! One GET-only servlet mounted at the configured path prefix (default
//! `/sys/`) exposes the framework's runtime levers: module load/unload,
//! module and connection listings, the profiler snapshot, the log mask,
//! and process shutdown. Listing endpoints reply with RFC 4180 CSV.
//!
//! The framework's real HTTP stack lives elsewhere; this surface only ever
//! answers one-line GET requests, so it carries its own minimal
//! request-line reader over a plain accept loop.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ServerConfig, logging, module::ModuleLoader, profile::Profiler,
    registry::SessionRegistry,
};

/// Upper bound on the size of an accepted request head.
const MAX_REQUEST_HEAD: u64 = 8 * 1024;

/// Services the servlet exposes.
pub struct SystemContext {
    /// Module lifecycle manager.
    pub loader: Arc<ModuleLoader>,
    /// Live connection registry.
    pub connections: Arc<SessionRegistry>,
    /// Profiler registry.
    pub profiler: Arc<Profiler>,
}

enum PostAction {
    None,
    RaiseSigterm,
}

struct Response {
    status: u16,
    content_type: Option<&'static str>,
    disposition: Option<String>,
    body: Vec<u8>,
    then: PostAction,
}

impl Response {
    fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            disposition: None,
            body: Vec::new(),
            then: PostAction::None,
        }
    }

    fn csv(name: &str, body: String) -> Self {
        Self {
            status: 200,
            content_type: Some("text/csv; charset=utf-8"),
            disposition: Some(format!("attachment; name=\"{name}\"")),
            body: body.into_bytes(),
            then: PostAction::None,
        }
    }

    fn then_sigterm(mut self) -> Self {
        self.then = PostAction::RaiseSigterm;
        self
    }
}

struct Query(Vec<(String, String)>);

impl Query {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

type EndpointFn = fn(&SystemContext, &Query) -> Response;

// Keep alphabetically sorted; dispatch is a binary search.
const JUMP_TABLE: &[(&str, EndpointFn)] = &[
    ("connections", on_connections),
    ("load_module", on_load_module),
    ("modules", on_modules),
    ("profile", on_profile),
    ("set_log_mask", on_set_log_mask),
    ("shutdown", on_shutdown),
    ("unload_module", on_unload_module),
];

/// Handle of the running administrative server.
pub struct SystemHttpServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl SystemHttpServer {
    /// Bind the configured address and start serving.
    ///
    /// # Errors
    ///
    /// Returns an [`io::Error`] if binding fails.
    pub async fn start(config: &ServerConfig, ctx: SystemContext) -> io::Result<Self> {
        let listener = TcpListener::bind((
            config.system_http_bind.as_str(),
            config.system_http_port,
        ))
        .await?;
        let local_addr = listener.local_addr()?;
        let prefix = config.system_http_prefix();
        log::info!("system HTTP server on {local_addr}, servlet at {prefix}");
        if config.system_http_certificate.is_some() || config.system_http_auth_user_pass.is_some() {
            log::info!("TLS and authentication are delegated to the transport layer");
        }

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let ctx = Arc::new(ctx);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    res = listener.accept() => match res {
                        Ok((stream, peer)) => {
                            let ctx = Arc::clone(&ctx);
                            let prefix = prefix.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, peer, &prefix, &ctx).await {
                                    log::debug!("system HTTP connection from {peer} failed: {e}");
                                }
                            });
                        }
                        Err(e) => log::warn!("system HTTP accept error: {e}"),
                    }
                }
            }
        });
        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    /// Address the server is listening on.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// Stop accepting connections.
    pub fn stop(&self) { self.shutdown.cancel(); }
}

impl Drop for SystemHttpServer {
    fn drop(&mut self) { self.shutdown.cancel(); }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    prefix: &str,
    ctx: &SystemContext,
) -> io::Result<()> {
    log::info!("system HTTP request from {peer}");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half.take(MAX_REQUEST_HEAD));

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    // Consume the header block; nothing in it matters to this surface.
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
    }

    let response = route_request(&request_line, prefix, ctx);
    let fire_sigterm = matches!(response.then, PostAction::RaiseSigterm);
    write_response(&mut write_half, response).await?;
    write_half.shutdown().await?;

    if fire_sigterm {
        log::warn!("shutdown requested over system HTTP; raising SIGTERM");
        unsafe { libc::raise(libc::SIGTERM) };
    }
    Ok(())
}

fn route_request(request_line: &str, prefix: &str, ctx: &SystemContext) -> Response {
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Response::status(400);
    };
    if method != "GET" {
        return Response::status(405);
    }
    let (path, raw_query) = match target.split_once('?') {
        Some((path, query)) => (path, query),
        None => (target, ""),
    };
    let Some(suffix) = path.strip_prefix(prefix) else {
        return Response::status(404);
    };
    let Ok(index) = JUMP_TABLE.binary_search_by(|probe| probe.0.cmp(suffix)) else {
        log::warn!("no system HTTP handler: {path}");
        return Response::status(404);
    };
    let query = parse_query(raw_query);
    (JUMP_TABLE[index].1)(ctx, &query)
}

async fn write_response(writer: &mut OwnedWriteHalf, response: Response) -> io::Result<()> {
    let reason = match response.status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        _ => "Internal Server Error",
    };
    let mut head = format!(
        "HTTP/1.1 {} {reason}\r\nConnection: close\r\nContent-Length: {}\r\n",
        response.status,
        response.body.len()
    );
    if let Some(content_type) = response.content_type {
        head.push_str(&format!("Content-Type: {content_type}\r\n"));
    }
    if let Some(disposition) = &response.disposition {
        head.push_str(&format!("Content-Disposition: {disposition}\r\n"));
    }
    head.push_str("\r\n");

    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&response.body).await?;
    writer.flush().await
}

fn on_shutdown(_ctx: &SystemContext, _query: &Query) -> Response {
    log::warn!("received shutdown request; the server will terminate");
    Response::status(200).then_sigterm()
}

fn on_load_module(ctx: &SystemContext, query: &Query) -> Response {
    let Some(name) = query.get("name").filter(|name| !name.is_empty()) else {
        log::warn!("missing parameter: name");
        return Response::status(400);
    };
    if ctx.loader.load_no_throw(name).is_none() {
        log::warn!("failed to load module: {name}");
        return Response::status(404);
    }
    Response::status(200)
}

fn on_unload_module(ctx: &SystemContext, query: &Query) -> Response {
    let Some(real_path) = query.get("real_path").filter(|path| !path.is_empty()) else {
        log::warn!("missing parameter: real_path");
        return Response::status(400);
    };
    if !ctx.loader.unload_by_real_path(real_path) {
        log::warn!("module not loaded: {real_path}");
        return Response::status(404);
    }
    Response::status(200)
}

fn on_modules(ctx: &SystemContext, _query: &Query) -> Response {
    let mut body = String::from("real_path,base_addr,ref_count\r\n");
    let mut field = String::new();
    for module in ctx.loader.snapshot() {
        escape_csv_field(&mut field, &module.real_path.to_string_lossy());
        body.push_str(&field);
        body.push_str(&format!(",{:#x},{}\r\n", module.base_addr, module.ref_count));
    }
    Response::csv("modules.csv", body)
}

fn on_connections(ctx: &SystemContext, _query: &Query) -> Response {
    let mut body = String::from("remote_ip,remote_port,local_ip,local_port,us_online\r\n");
    let mut field = String::new();
    for conn in ctx.connections.snapshot() {
        escape_csv_field(&mut field, &conn.remote.ip().to_string());
        body.push_str(&field);
        body.push_str(&format!(",{},", conn.remote.port()));
        escape_csv_field(&mut field, &conn.local.ip().to_string());
        body.push_str(&field);
        body.push_str(&format!(",{},{}\r\n", conn.local.port(), conn.us_online));
    }
    Response::csv("connections.csv", body)
}

fn on_profile(ctx: &SystemContext, _query: &Query) -> Response {
    let mut body = String::from("file,line,func,samples,us_total,us_exclusive\r\n");
    let mut field = String::new();
    for entry in ctx.profiler.snapshot() {
        escape_csv_field(&mut field, entry.file);
        body.push_str(&field);
        body.push_str(&format!(",{},", entry.line));
        escape_csv_field(&mut field, entry.func);
        body.push_str(&field);
        body.push_str(&format!(
            ",{},{},{}\r\n",
            entry.samples, entry.us_total, entry.us_exclusive
        ));
    }
    Response::csv("profile.csv", body)
}

fn on_set_log_mask(_ctx: &SystemContext, query: &Query) -> Response {
    let parse = |name: &str| -> Result<u64, ()> {
        match query.get(name) {
            None | Some("") => Ok(0),
            Some(raw) => raw.parse().map_err(|_| ()),
        }
    };
    let (Ok(to_disable), Ok(to_enable)) = (parse("to_disable"), parse("to_enable")) else {
        return Response::status(400);
    };
    let mask = logging::set_mask(to_disable, to_enable);
    log::info!("log mask adjusted to {mask:#x}");
    Response::status(200)
}

/// RFC 4180 field escaping: fields containing `"`, `,`, CR, or LF are
/// wrapped in double quotes with internal `"` doubled.
fn escape_csv_field(dst: &mut String, src: &str) {
    dst.clear();
    if !src.contains(['"', ',', '\r', '\n']) {
        dst.push_str(src);
        return;
    }
    dst.push('"');
    for ch in src.chars() {
        if ch == '"' {
            dst.push('"');
        }
        dst.push(ch);
    }
    dst.push('"');
}

fn parse_query(raw: &str) -> Query {
    let params = raw
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect();
    Query(params)
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{escape_csv_field, parse_query, percent_decode, JUMP_TABLE};

    #[test]
    fn jump_table_is_sorted_for_binary_search() {
        for window in JUMP_TABLE.windows(2) {
            assert!(window[0].0 < window[1].0, "{} >= {}", window[0].0, window[1].0);
        }
    }

    #[rstest]
    #[case("plain", "plain")]
    #[case("with,comma", "\"with,comma\"")]
    #[case("with\"quote", "\"with\"\"quote\"")]
    #[case("line\nbreak", "\"line\nbreak\"")]
    #[case("car\rreturn", "\"car\rreturn\"")]
    fn csv_fields_are_escaped_per_rfc4180(#[case] input: &str, #[case] expected: &str) {
        let mut field = String::new();
        escape_csv_field(&mut field, input);
        assert_eq!(field, expected);
    }

    #[test]
    fn query_strings_are_decoded() {
        let query = parse_query("name=libecho.so&real_path=%2Fopt%2Fmods%2Fa+b.so");
        assert_eq!(query.get("name"), Some("libecho.so"));
        assert_eq!(query.get("real_path"), Some("/opt/mods/a b.so"));
        assert_eq!(query.get("missing"), None);
    }

    #[test]
    fn malformed_percent_escapes_pass_through() {
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
