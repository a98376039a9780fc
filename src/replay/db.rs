//! The "database handle" trait object seam from spec §6, plus the one
//! concrete implementation this crate ships: a tokio MySQL client built on
//! the same framing/handshake/command wire code the capture side decodes.
//!
//! The capture side understands what a hand-written MySQL client sends;
//! this module *is* such a client, reusing [`crate::wire`] for every byte
//! on the wire instead of re-deriving the protocol a second time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::constant::CapabilityFlags;
use crate::error::{Error, Result};
use crate::wire::command::{
    read_prepare_ok, write_close_statement, write_execute, write_prepare, write_query,
};
use crate::wire::framing::write_frame;
use crate::wire::handshake::{
    auth_caching_sha2_password, auth_mysql_native_password, read_auth_switch_request,
    read_caching_sha2_password_fast_auth_result, read_initial_handshake,
    write_auth_switch_response, write_handshake_response, CachingSha2PasswordFastAuthResult,
    HandshakeResponse41,
};
use crate::wire::primitive::read_int_lenenc;
use crate::wire::response::{classify_reply, ErrPayload, ErrPayloadBytes, ReplyKind};
use crate::wire::value::ParamValue;
use crate::Dsn;

/// `open(dsn) -> pool` from spec §6.
#[async_trait]
pub trait DatabaseHandle: Send + Sync {
    async fn open(&self, dsn: &Dsn) -> Result<Box<dyn DbPool>>;
}

/// `pool.conn(ctx) -> connection` from spec §6.
#[async_trait]
pub trait DbPool: Send + Sync {
    async fn conn(&self) -> Result<Box<dyn DbConnection>>;
    async fn close(&self);
}

/// `connection.exec(ctx, sql)` / `connection.prepare(ctx, sql) -> statement`
/// from spec §6.
#[async_trait]
pub trait DbConnection: Send + Sync {
    async fn exec(&mut self, sql: &str) -> Result<()>;
    async fn prepare(&mut self, sql: &str) -> Result<Box<dyn DbStatement>>;
    async fn close(&mut self);
}

/// `statement.exec(ctx, params)` from spec §6.
#[async_trait]
pub trait DbStatement: Send + Sync {
    async fn exec(&mut self, params: &[ParamValue]) -> Result<()>;
    async fn close(&mut self);
}

/// Capabilities this crate's own client asks for. `CLIENT_DEPRECATE_EOF` is
/// always on, matching the teacher's `CAPABILITIES_ALWAYS_ENABLED` — result
/// sets are drained generically below regardless, so there's nothing extra
/// to special-case.
fn client_capability_flags(want_schema: bool, server_caps: CapabilityFlags) -> CapabilityFlags {
    use crate::constant::CAPABILITIES_ALWAYS_ENABLED;
    let mut caps = CAPABILITIES_ALWAYS_ENABLED;
    if want_schema && server_caps.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
        caps |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
    }
    caps & server_caps
}

async fn read_frame(stream: &mut BufReader<TcpStream>) -> Result<(u8, Vec<u8>)> {
    let mut payload = Vec::new();
    let mut first_sequence_id = None;
    loop {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        let length = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        if first_sequence_id.is_none() {
            first_sequence_id = Some(header[3]);
        }
        let start = payload.len();
        payload.resize(start + length, 0);
        stream.read_exact(&mut payload[start..]).await?;
        if length < crate::wire::framing::MAX_PACKET_PAYLOAD {
            break;
        }
    }
    Ok((first_sequence_id.unwrap_or(0), payload))
}

async fn send_frame(stream: &mut BufReader<TcpStream>, sequence_id: u8, payload: &[u8]) -> Result<()> {
    let mut buf = Vec::new();
    write_frame(&mut buf, sequence_id, payload);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

fn err_from_payload(payload: &[u8]) -> Error {
    match ErrPayload::try_from(ErrPayloadBytes(payload)) {
        Ok(err) => Error::Server(err),
        Err(e) => e,
    }
}

/// Reads and discards a result set's column definitions and rows. With
/// `CLIENT_DEPRECATE_EOF` negotiated the row terminator is an OK packet
/// rather than a trailing EOF, but [`classify_reply`] already treats both
/// as non-`Other`, so one loop handles both shapes.
async fn drain_result_set(stream: &mut BufReader<TcpStream>, num_columns: u64) -> Result<()> {
    for _ in 0..num_columns {
        read_frame(stream).await?;
    }
    loop {
        let (_, payload) = read_frame(stream).await?;
        match classify_reply(&payload) {
            ReplyKind::Err => return Err(err_from_payload(&payload)),
            ReplyKind::Ok | ReplyKind::Eof => return Ok(()),
            ReplyKind::Other => continue,
        }
    }
}

/// Reads a generic command reply: OK/ERR/EOF directly, or a result set
/// (lenenc column count) which is drained and discarded — replay never
/// compares result rows (spec §1 non-goals).
async fn read_and_drain_reply(stream: &mut BufReader<TcpStream>) -> Result<()> {
    let (_, payload) = read_frame(stream).await?;
    match classify_reply(&payload) {
        ReplyKind::Err => Err(err_from_payload(&payload)),
        ReplyKind::Ok | ReplyKind::Eof => Ok(()),
        ReplyKind::Other => {
            let (num_columns, _) = read_int_lenenc(&payload)?;
            drain_result_set(stream, num_columns).await
        }
    }
}

async fn perform_handshake(
    stream: &mut BufReader<TcpStream>,
    user: &str,
    password: Option<&str>,
    database: Option<&str>,
) -> Result<()> {
    let password = password.unwrap_or("");

    let (_, greeting) = read_frame(stream).await?;
    let handshake = read_initial_handshake(&greeting)?;

    let negotiated_caps = client_capability_flags(database.is_some(), handshake.capability_flags);

    let auth_plugin_name = std::str::from_utf8(handshake.auth_plugin_name).unwrap_or("");
    let (auth_response, auth_plugin_name): (Vec<u8>, &str) = match auth_plugin_name {
        "mysql_native_password" => (
            auth_mysql_native_password(password, &handshake.auth_plugin_data).to_vec(),
            "mysql_native_password",
        ),
        "caching_sha2_password" => (
            auth_caching_sha2_password(password, &handshake.auth_plugin_data).to_vec(),
            "caching_sha2_password",
        ),
        other => return Err(Error::UnsupportedAuthPlugin(other.to_string())),
    };

    let response = HandshakeResponse41 {
        capability_flags: negotiated_caps,
        max_packet_size: 16 * 1024 * 1024,
        charset: 45, // utf8mb4_general_ci
        username: user,
        auth_response: &auth_response,
        database,
        auth_plugin_name: Some(auth_plugin_name),
    };
    let mut out = Vec::new();
    write_handshake_response(&mut out, &response);
    send_frame(stream, 1, &out).await?;

    let (_, reply) = read_frame(stream).await?;
    match classify_reply(&reply) {
        ReplyKind::Ok => Ok(()),
        ReplyKind::Err => Err(err_from_payload(&reply)),
        ReplyKind::Eof if auth_plugin_name == "caching_sha2_password" => {
            match read_caching_sha2_password_fast_auth_result(&reply)? {
                CachingSha2PasswordFastAuthResult::Success => {
                    let (_, ok) = read_frame(stream).await?;
                    match classify_reply(&ok) {
                        ReplyKind::Err => Err(err_from_payload(&ok)),
                        _ => Ok(()),
                    }
                }
                // Same limitation the teacher's own async client has: no
                // RSA/SSL, so a full-auth round trip can't be completed.
                CachingSha2PasswordFastAuthResult::FullAuthRequired => {
                    Err(Error::UnsupportedAuthPlugin(
                        "caching_sha2_password full authentication (SSL/RSA not implemented)"
                            .to_string(),
                    ))
                }
            }
        }
        ReplyKind::Eof => {
            let auth_switch = read_auth_switch_request(&reply)?;
            let plugin_name = std::str::from_utf8(auth_switch.plugin_name).unwrap_or("");
            let new_response = match plugin_name {
                "mysql_native_password" => {
                    auth_mysql_native_password(password, auth_switch.plugin_data).to_vec()
                }
                "caching_sha2_password" => {
                    auth_caching_sha2_password(password, auth_switch.plugin_data).to_vec()
                }
                other => return Err(Error::UnsupportedAuthPlugin(other.to_string())),
            };
            let mut out = Vec::new();
            write_auth_switch_response(&mut out, &new_response);
            send_frame(stream, 3, &out).await?;

            let (_, final_reply) = read_frame(stream).await?;
            match classify_reply(&final_reply) {
                ReplyKind::Err => Err(err_from_payload(&final_reply)),
                _ => Ok(()),
            }
        }
        ReplyKind::Other => Err(Error::Framing("unexpected packet after handshake response")),
    }
}

/// The crate's own tokio-based MySQL client, the concrete
/// [`DatabaseHandle`] shipped alongside the trait.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioMysqlHandle;

#[async_trait]
impl DatabaseHandle for TokioMysqlHandle {
    async fn open(&self, dsn: &Dsn) -> Result<Box<dyn DbPool>> {
        Ok(Box::new(TokioPool { dsn: dsn.clone() }))
    }
}

/// A pool is just a DSN to connect fresh from — spec §11/DESIGN.md: each
/// replay worker only ever holds one live connection at a time, so there's
/// no shared bounded pool to manage here (unlike the teacher's
/// `crossbeam-queue`-backed `Pool`).
pub struct TokioPool {
    dsn: Dsn,
}

#[async_trait]
impl DbPool for TokioPool {
    async fn conn(&self) -> Result<Box<dyn DbConnection>> {
        let tcp = TcpStream::connect((self.dsn.host.as_str(), self.dsn.port)).await?;
        tcp.set_nodelay(true)?;
        let mut stream = BufReader::new(tcp);
        perform_handshake(
            &mut stream,
            &self.dsn.user,
            self.dsn.password.as_deref(),
            self.dsn.schema.as_deref(),
        )
        .await?;
        Ok(Box::new(TokioConnection {
            stream: Arc::new(Mutex::new(stream)),
        }))
    }

    async fn close(&self) {}
}

/// Wrapped in an `Arc<Mutex<_>>` so statements prepared against this
/// connection can share the same socket without borrowing `&mut self`
/// across the connection's own lifetime.
pub struct TokioConnection {
    stream: Arc<Mutex<BufReader<TcpStream>>>,
}

#[async_trait]
impl DbConnection for TokioConnection {
    async fn exec(&mut self, sql: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let mut out = Vec::new();
        write_query(&mut out, sql);
        send_frame(&mut stream, 0, &out).await?;
        read_and_drain_reply(&mut stream).await
    }

    async fn prepare(&mut self, sql: &str) -> Result<Box<dyn DbStatement>> {
        let mut stream = self.stream.lock().await;
        let mut out = Vec::new();
        write_prepare(&mut out, sql);
        send_frame(&mut stream, 0, &out).await?;

        let (_, reply) = read_frame(&mut stream).await?;
        if classify_reply(&reply) == ReplyKind::Err {
            return Err(err_from_payload(&reply));
        }
        let ok = read_prepare_ok(&reply)?;
        let statement_id = ok.statement_id();
        let num_params = ok.num_params();
        let num_columns = ok.num_columns();

        // No trailing EOF after either block: CLIENT_DEPRECATE_EOF is
        // always negotiated (see `client_capability_flags`).
        for _ in 0..num_params {
            read_frame(&mut stream).await?;
        }
        for _ in 0..num_columns {
            read_frame(&mut stream).await?;
        }

        drop(stream);
        Ok(Box::new(TokioStatement {
            stream: self.stream.clone(),
            statement_id,
        }))
    }

    async fn close(&mut self) {
        if let Ok(mut stream) = self.stream.try_lock() {
            let mut out = Vec::new();
            crate::wire::command::write_quit(&mut out);
            let _ = send_frame(&mut stream, 0, &out).await;
        }
    }
}

pub struct TokioStatement {
    stream: Arc<Mutex<BufReader<TcpStream>>>,
    statement_id: u32,
}

#[async_trait]
impl DbStatement for TokioStatement {
    async fn exec(&mut self, params: &[ParamValue]) -> Result<()> {
        let mut stream = self.stream.lock().await;
        let mut out = Vec::new();
        write_execute(&mut out, self.statement_id, params);
        send_frame(&mut stream, 0, &out).await?;
        read_and_drain_reply(&mut stream).await
    }

    async fn close(&mut self) {
        if let Ok(mut stream) = self.stream.try_lock() {
            let mut out = Vec::new();
            write_close_statement(&mut out, self.statement_id);
            let _ = send_frame(&mut stream, 0, &out).await;
        }
    }
}
