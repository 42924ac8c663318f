//! A localhost HTTP server that serves one secret exactly once, behind a
//! random path token. See spec §4.2.
//!
//! This is deliberately hand-rolled against `std::net` rather than pulling in
//! a web framework: the credential only ever needs to answer one `GET`, and
//! the rest of this executor already speaks raw sockets for the control
//! protocol.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

use rand::RngCore;

use crate::error::Result;
use crate::utils::{log, warn};

/// IP of the host machine as seen from inside a QEMU user-mode-networking
/// guest, under the default settings.
pub const GUEST_IP: &str = "10.0.2.2";

struct State {
    name: String,
    token: String,
    value: String,
    already_served: std::sync::Mutex<bool>,
}

/// A single-use credential endpoint. Binds an OS-assigned loopback port and
/// serves `value` exactly once at `GET /{token}`.
pub struct CredentialServer {
    port: u16,
    token: String,
}

impl CredentialServer {
    /// Binds the listener, generates a ≥512-bit random token, and starts a
    /// detached accept loop.
    pub fn start(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let token = generate_token();

        let state = Arc::new(State {
            name: name.into(),
            token: token.clone(),
            value: value.into(),
            already_served: std::sync::Mutex::new(false),
        });

        thread::Builder::new()
            .name("credential-server".to_string())
            .spawn(move || accept_loop(listener, state))
            .expect("failed to spawn credential server thread");

        Ok(CredentialServer { port, token })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The URL to hand to the guest: `http://{GUEST_IP}:{port}/{token}`.
    pub fn url(&self) -> String {
        format!("http://{GUEST_IP}:{}/{}", self.port, self.token)
    }
}

/// ≥512 bits of entropy, URL-safe.
fn generate_token() -> String {
    let mut bytes = [0u8; 64];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64_url_no_pad(&bytes)
}

fn base64_url_no_pad(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut out = String::with_capacity((bytes.len() * 4).div_ceil(3));
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = *chunk.get(1).unwrap_or(&0) as u32;
        let b2 = *chunk.get(2).unwrap_or(&0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;

        out.push(ALPHABET[(triple >> 18 & 0x3f) as usize] as char);
        out.push(ALPHABET[(triple >> 12 & 0x3f) as usize] as char);
        if chunk.len() > 1 {
            out.push(ALPHABET[(triple >> 6 & 0x3f) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(ALPHABET[(triple & 0x3f) as usize] as char);
        }
    }
    out
}

fn accept_loop(listener: TcpListener, state: Arc<State>) {
    for incoming in listener.incoming() {
        match incoming {
            Ok(stream) => {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &state) {
                        warn(format!("credential server connection error: {err}"));
                    }
                });
            }
            Err(err) => warn(format!("credential server accept error: {err}")),
        }
    }
}

fn handle_connection(mut stream: TcpStream, state: &State) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    // Drain headers; we don't need them.
    loop {
        let mut header_line = String::new();
        let bytes = reader.read_line(&mut header_line)?;
        if bytes == 0 || header_line == "\r\n" || header_line == "\n" {
            break;
        }
    }

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .trim_start_matches('/');

    if path != state.token {
        log(format!(
            "warning: attempted to retrieve credential {} with invalid token",
            state.name
        ));
        respond(&mut stream, 403, "error: invalid token")?;
        return Ok(());
    }

    let mut already_served = state.already_served.lock().expect("credential state poisoned");
    if *already_served {
        log(format!(
            "warning: attempted to retrieve credential {} multiple times",
            state.name
        ));
        respond(&mut stream, 400, "error: credential already requested")?;
        return Ok(());
    }

    log(format!(
        "credential {} retrieved through the HTTP server",
        state.name
    ));
    respond(&mut stream, 200, &state.value)?;
    *already_served = true;

    Ok(())
}

fn respond(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        _ => "Error",
    };
    let body = format!("{body}\n");
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn http_get(port: u16, path: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        write!(stream, "GET /{path} HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        stream.shutdown(std::net::Shutdown::Write).ok();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();

        let status_line = response.lines().next().unwrap();
        let status: u16 = status_line.split_whitespace().nth(1).unwrap().parse().unwrap();
        let body = response.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
        (status, body)
    }

    #[test]
    fn serves_the_secret_exactly_once() {
        let server = CredentialServer::start("gha-jitconfig-url", "super-secret").unwrap();
        let token = server.url().rsplit('/').next().unwrap().to_string();

        let (status, body) = http_get(server.port(), &token);
        assert_eq!(status, 200);
        assert_eq!(body.trim(), "super-secret");

        let (status, _) = http_get(server.port(), &token);
        assert_eq!(status, 400);
    }

    #[test]
    fn wrong_token_is_rejected() {
        let server = CredentialServer::start("gha-jitconfig-url", "super-secret").unwrap();

        let (status, _) = http_get(server.port(), "");
        assert_eq!(status, 403);
        let (status, _) = http_get(server.port(), "wrong-token");
        assert_eq!(status, 403);

        // Legitimate retrieval still works after bad attempts.
        let token = server.url().rsplit('/').next().unwrap().to_string();
        let (status, body) = http_get(server.port(), &token);
        assert_eq!(status, 200);
        assert_eq!(body.trim(), "super-secret");
    }

    #[test]
    fn url_embeds_guest_ip_port_and_token() {
        let server = CredentialServer::start("gha-jitconfig-url", "v").unwrap();
        let url = server.url();
        assert!(url.starts_with(&format!("http://{GUEST_IP}:{}/", server.port())));
    }
}
