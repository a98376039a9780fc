//! Server greeting, client handshake response, auth-switch negotiation and
//! the two password auth plugins this crate speaks. Used by the capture
//! side purely to recognize the `AwaitHandshake` / `AwaitHandshakeResponse`
//! boundary, and by the replay engine's own client to actually log in
//! against the target.

use crate::error::{Error, Result};
use crate::constant::CapabilityFlags;
use crate::wire::primitive::*;
use crate::wire::response::{ErrPayload, ErrPayloadBytes};

/// Server's initial greeting (`Protocol::HandshakeV10`).
#[derive(Debug, Clone)]
pub struct InitialHandshake<'a> {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data: Vec<u8>,
    pub capability_flags: CapabilityFlags,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin_name: &'a [u8],
}

pub fn read_initial_handshake(payload: &[u8]) -> Result<InitialHandshake<'_>> {
    let (protocol_version, data) = read_int_1(payload)?;

    if protocol_version == 0xFF {
        let err = ErrPayload::try_from(ErrPayloadBytes(payload))?;
        return Err(Error::Server(err));
    }

    let (server_version_bytes, data) = read_string_null(data)?;
    let server_version = String::from_utf8_lossy(server_version_bytes).to_string();

    let (connection_id, data) = read_int_4(data)?;
    let (auth_data_1, data) = read_string_fix(data, 8)?;
    let (_filler, data) = read_int_1(data)?;
    let (cap_lower, data) = read_int_2(data)?;
    let (charset, data) = read_int_1(data)?;
    let (status_flags, data) = read_int_2(data)?;
    let (cap_upper, data) = read_int_2(data)?;

    let cap_bits = ((cap_upper as u32) << 16) | (cap_lower as u32);
    let capability_flags =
        CapabilityFlags::from_bits(cap_bits).ok_or(Error::Framing("capability flags"))?;

    let (auth_data_len, data) = read_int_1(data)?;
    let (_reserved, data) = read_string_fix(data, 10)?;

    let auth_data_2_len = (auth_data_len as usize).saturating_sub(9).max(12);
    let (auth_data_2, data) = read_string_fix(data, auth_data_2_len)?;
    let (_trailing_nul, data) = read_int_1(data)?;

    let mut auth_plugin_data = Vec::with_capacity(auth_data_1.len() + auth_data_2.len());
    auth_plugin_data.extend_from_slice(auth_data_1);
    auth_plugin_data.extend_from_slice(auth_data_2);

    let (auth_plugin_name, rest) = read_string_null(data)?;
    if !rest.is_empty() {
        return Err(Error::Framing("trailing bytes after handshake"));
    }

    Ok(InitialHandshake {
        protocol_version,
        server_version,
        connection_id,
        auth_plugin_data,
        capability_flags,
        charset,
        status_flags,
        auth_plugin_name,
    })
}

/// Client's `HandshakeResponse41`.
#[derive(Debug, Clone)]
pub struct HandshakeResponse41<'a> {
    pub capability_flags: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin_name: Option<&'a str>,
}

pub fn write_handshake_response(out: &mut Vec<u8>, response: &HandshakeResponse41) {
    write_int_4(out, response.capability_flags.bits());
    write_int_4(out, response.max_packet_size);
    write_int_1(out, response.charset);
    out.extend_from_slice(&[0u8; 23]);

    write_string_null(out, response.username);

    if response
        .capability_flags
        .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
    {
        write_bytes_lenenc(out, response.auth_response);
    } else {
        write_int_1(out, response.auth_response.len() as u8);
        out.extend_from_slice(response.auth_response);
    }

    if let Some(db) = response.database {
        write_string_null(out, db);
    }

    if let Some(plugin) = response.auth_plugin_name
        && response
            .capability_flags
            .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH)
    {
        write_string_null(out, plugin);
    }
}

/// Parses a `HandshakeResponse41` the capture side observed from a client,
/// recovering the requested initial schema (§3 `InitDB field`).
pub fn read_handshake_response(payload: &[u8]) -> Result<HandshakeResponse41<'_>> {
    let (cap_bits, data) = read_int_4(payload)?;
    let capability_flags =
        CapabilityFlags::from_bits_truncate(cap_bits) | CapabilityFlags::CLIENT_PROTOCOL_41;
    let (max_packet_size, data) = read_int_4(data)?;
    let (charset, data) = read_int_1(data)?;
    let (_reserved, data) = read_string_fix(data, 23)?;

    let (username, data) = read_string_null(data)?;
    let username = std::str::from_utf8(username).map_err(|_| Error::Framing("username utf8"))?;

    let (auth_response, data) = if capability_flags
        .contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA)
    {
        read_string_lenenc(data)?
    } else {
        let (len, data) = read_int_1(data)?;
        read_string_fix(data, len as usize)?
    };

    let (database, data) = if capability_flags.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
        let (db, rest) = read_string_null(data)?;
        (
            Some(std::str::from_utf8(db).map_err(|_| Error::Framing("database utf8"))?),
            rest,
        )
    } else {
        (None, data)
    };

    let auth_plugin_name = if capability_flags.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        let (name, _rest) = read_string_null(data)?;
        Some(std::str::from_utf8(name).map_err(|_| Error::Framing("auth plugin utf8"))?)
    } else {
        None
    };

    Ok(HandshakeResponse41 {
        capability_flags,
        max_packet_size,
        charset,
        username,
        auth_response,
        database,
        auth_plugin_name,
    })
}

#[derive(Debug, Clone)]
pub struct AuthSwitchRequest<'a> {
    pub plugin_name: &'a [u8],
    pub plugin_data: &'a [u8],
}

pub fn read_auth_switch_request(payload: &[u8]) -> Result<AuthSwitchRequest<'_>> {
    let (header, data) = read_int_1(payload)?;
    if header != 0xFE {
        return Err(Error::Framing("expected auth switch header"));
    }

    let (plugin_name, data) = read_string_null(data)?;

    if data.last() == Some(&0) {
        Ok(AuthSwitchRequest {
            plugin_name,
            plugin_data: &data[..data.len() - 1],
        })
    } else {
        Err(Error::Framing("auth switch missing trailing nul"))
    }
}

pub fn write_auth_switch_response(out: &mut Vec<u8>, auth_data: &[u8]) {
    out.extend_from_slice(auth_data);
}

/// `mysql_native_password`: `SHA1(password) XOR SHA1(challenge + SHA1(SHA1(password)))`.
pub fn auth_mysql_native_password(password: &str, challenge: &[u8]) -> [u8; 20] {
    use sha1::{Digest, Sha1};

    if password.is_empty() {
        return [0u8; 20];
    }

    let stage1_hash = Sha1::digest(password.as_bytes());
    let stage2_hash = Sha1::digest(stage1_hash);

    let mut hasher = Sha1::new();
    hasher.update(challenge);
    hasher.update(stage2_hash);
    let token_hash = hasher.finalize();

    let mut result = [0u8; 20];
    for i in 0..20 {
        result[i] = stage1_hash[i] ^ token_hash[i];
    }
    result
}

/// `caching_sha2_password` initial response: `XOR(SHA256(password), SHA256(SHA256(SHA256(password)), challenge))`.
pub fn auth_caching_sha2_password(password: &str, challenge: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    if password.is_empty() {
        return [0u8; 32];
    }

    let stage1 = Sha256::digest(password.as_bytes());
    let stage2 = Sha256::digest(stage1);

    let mut hasher = Sha256::new();
    hasher.update(stage2);
    hasher.update(challenge);
    let scramble = hasher.finalize();

    let mut result = [0u8; 32];
    for i in 0..32 {
        result[i] = stage1[i] ^ scramble[i];
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachingSha2PasswordFastAuthResult {
    Success,
    FullAuthRequired,
}

pub fn read_caching_sha2_password_fast_auth_result(
    payload: &[u8],
) -> Result<CachingSha2PasswordFastAuthResult> {
    if payload.is_empty() {
        return Err(Error::NeedMoreBytes);
    }

    match payload[0] {
        0x03 => Ok(CachingSha2PasswordFastAuthResult::Success),
        0x04 => Ok(CachingSha2PasswordFastAuthResult::FullAuthRequired),
        _ => Err(Error::Framing("caching_sha2_password fast auth marker")),
    }
}
