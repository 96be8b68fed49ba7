//! MySQL replication protocol client
//!
//! Blocking implementation of the subset of the client/server protocol a
//! binlog replica needs:
//! - Handshake and authentication (mysql_native_password, caching_sha2_password)
//! - COM_QUERY for session variables (checksum, heartbeat)
//! - COM_REGISTER_SLAVE
//! - COM_BINLOG_DUMP and event streaming
//!
//! The client owns a plain `std::net::TcpStream` and is meant to live on a
//! dedicated OS thread. [`ShutdownHandle`] lets another thread abort a read
//! that is blocked on the socket.

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connect timeout for the replication socket
pub const CONNECTION_TIMEOUT_SECS: u64 = 10;

/// MySQL packet header size (3 bytes length + 1 byte sequence)
const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload
const MAX_PACKET_SIZE: usize = 16_777_215;
/// utf8mb4_general_ci
const CHARSET_UTF8MB4: u8 = 45;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

/// MySQL capability flags
#[derive(Debug, Clone, Copy)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u32 = 0x00000001;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 0x00000008;
    pub const CLIENT_PROTOCOL_41: u32 = 0x00000200;
    pub const CLIENT_TRANSACTIONS: u32 = 0x00002000;
    pub const CLIENT_SECURE_CONNECTION: u32 = 0x00008000;
    pub const CLIENT_PLUGIN_AUTH: u32 = 0x00080000;
    pub const CLIENT_DEPRECATE_EOF: u32 = 0x01000000;

    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    pub fn has(&self, flag: u32) -> bool {
        (self.0 & flag) != 0
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Initial greeting sent by the server
#[derive(Debug)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data_part1: Vec<u8>,
    pub capability_flags: CapabilityFlags,
    pub character_set: u8,
    pub status_flags: u16,
    pub auth_plugin_data_part2: Vec<u8>,
    pub auth_plugin_name: String,
}

impl HandshakePacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(data);
        let mut buf = [0u8; 1];

        cursor.read_exact(&mut buf)?;
        let protocol_version = buf[0];

        let mut server_version = Vec::new();
        loop {
            cursor.read_exact(&mut buf)?;
            if buf[0] == 0 {
                break;
            }
            server_version.push(buf[0]);
        }
        let server_version = String::from_utf8_lossy(&server_version).to_string();

        let mut buf4 = [0u8; 4];
        cursor.read_exact(&mut buf4)?;
        let connection_id = u32::from_le_bytes(buf4);

        let mut auth_plugin_data_part1 = vec![0u8; 8];
        cursor.read_exact(&mut auth_plugin_data_part1)?;

        // filler
        cursor.read_exact(&mut buf)?;

        let mut buf2 = [0u8; 2];
        cursor.read_exact(&mut buf2)?;
        let cap_lower = u16::from_le_bytes(buf2);

        cursor.read_exact(&mut buf)?;
        let character_set = buf[0];

        cursor.read_exact(&mut buf2)?;
        let status_flags = u16::from_le_bytes(buf2);

        cursor.read_exact(&mut buf2)?;
        let cap_upper = u16::from_le_bytes(buf2);
        let capability_flags =
            CapabilityFlags::new(((cap_upper as u32) << 16) | (cap_lower as u32));

        cursor.read_exact(&mut buf)?;
        let auth_data_len = buf[0] as usize;

        let mut reserved = [0u8; 10];
        cursor.read_exact(&mut reserved)?;

        // Part 2 is max(13, len - 8) bytes and null-terminated
        let remaining_len = if auth_data_len > 8 {
            (auth_data_len - 8).max(13)
        } else {
            13
        };
        let mut auth_plugin_data_part2 = vec![0u8; remaining_len];
        cursor.read_exact(&mut auth_plugin_data_part2)?;
        if let Some(pos) = auth_plugin_data_part2.iter().position(|&b| b == 0) {
            auth_plugin_data_part2.truncate(pos);
        }

        let mut auth_plugin_name = Vec::new();
        if capability_flags.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            loop {
                let n = cursor.read(&mut buf)?;
                if n == 0 || buf[0] == 0 {
                    break;
                }
                auth_plugin_name.push(buf[0]);
            }
        }
        let auth_plugin_name = String::from_utf8_lossy(&auth_plugin_name).to_string();

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data_part1,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_part2,
            auth_plugin_name,
        })
    }

    /// Full auth data (salt)
    pub fn auth_data(&self) -> Vec<u8> {
        let mut data = self.auth_plugin_data_part1.clone();
        data.extend_from_slice(&self.auth_plugin_data_part2);
        data
    }
}

/// Aborts a blocked read on the replication socket from another thread.
#[derive(Debug)]
pub struct ShutdownHandle {
    stream: TcpStream,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("Replication socket shutdown: {}", e);
        }
    }
}

/// Blocking MySQL client for binlog replication
pub struct MySqlBinlogClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    sequence_id: u8,
    server_version: String,
    connection_id: u32,
}

impl std::fmt::Debug for MySqlBinlogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlBinlogClient")
            .field("sequence_id", &self.sequence_id)
            .field("server_version", &self.server_version)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

impl MySqlBinlogClient {
    /// Connect to the server and authenticate.
    pub fn connect(host: &str, port: u16, user: &str, password: Option<&str>) -> Result<Self> {
        validate_identifier(user)?;

        let addr = format!("{}:{}", host, port);
        info!("Connecting to MySQL at {}", addr);

        let tcp = Self::connect_tcp(&addr)?;
        tcp.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
        let writer = tcp
            .try_clone()
            .context("Failed to clone replication socket")?;
        let mut reader = BufReader::new(tcp);

        let (handshake_data, seq) = read_packet(&mut reader)?;
        if handshake_data.first() == Some(&0xFF) {
            bail!("Server refused connection: {}", server_error(&handshake_data));
        }
        let handshake =
            HandshakePacket::parse(&handshake_data).context("Failed to parse handshake packet")?;

        info!(
            "Connected to MySQL {} (connection_id={})",
            handshake.server_version, handshake.connection_id
        );
        debug!("Auth plugin: {}", handshake.auth_plugin_name);

        let mut client = Self {
            reader,
            writer,
            sequence_id: seq.wrapping_add(1),
            server_version: handshake.server_version.clone(),
            connection_id: handshake.connection_id,
        };

        client.authenticate(user, password, &handshake)?;
        Ok(client)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Handle that can shut the socket down while this client is blocked.
    pub fn shutdown_handle(&self) -> Result<ShutdownHandle> {
        let stream = self
            .writer
            .try_clone()
            .context("Failed to clone replication socket")?;
        Ok(ShutdownHandle { stream })
    }

    /// Set (or clear) the socket read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.reader
            .get_ref()
            .set_read_timeout(timeout)
            .context("Failed to set read timeout")
    }

    fn connect_tcp(addr: &str) -> Result<TcpStream> {
        let timeout = Duration::from_secs(CONNECTION_TIMEOUT_SECS);
        let mut last_err = None;
        for sock_addr in addr
            .to_socket_addrs()
            .with_context(|| format!("Failed to resolve {}", addr))?
        {
            match TcpStream::connect_timeout(&sock_addr, timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) if e.kind() == std::io::ErrorKind::TimedOut => bail!(
                "Connection timeout after {}s connecting to MySQL",
                CONNECTION_TIMEOUT_SECS
            ),
            Some(e) => Err(e).context("Failed to connect to MySQL server"),
            None => bail!("No addresses resolved for {}", addr),
        }
    }

    fn read_packet(&mut self) -> Result<Vec<u8>> {
        let (payload, next_seq) = read_packet(&mut self.reader)?;
        self.sequence_id = next_seq;
        Ok(payload)
    }

    fn write_packet(&mut self, data: &[u8]) -> Result<()> {
        let packet = encode_packet(data, self.sequence_id)?;
        self.writer.write_all(&packet)?;
        self.writer.flush()?;
        self.sequence_id = self.sequence_id.wrapping_add(1);
        Ok(())
    }

    fn authenticate(
        &mut self,
        user: &str,
        password: Option<&str>,
        handshake: &HandshakePacket,
    ) -> Result<()> {
        let client_flags = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_TRANSACTIONS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_DEPRECATE_EOF;

        let auth_response = match handshake.auth_plugin_name.as_str() {
            "mysql_native_password" => mysql_native_password(password, &handshake.auth_data()),
            "caching_sha2_password" => caching_sha2_password(password, &handshake.auth_data()),
            other => {
                warn!(
                    "Unknown auth plugin: {}, trying mysql_native_password",
                    other
                );
                mysql_native_password(password, &handshake.auth_data())
            }
        };

        let mut response = BytesMut::with_capacity(128 + user.len());
        response.put_u32_le(client_flags);
        response.put_u32_le(MAX_PACKET_SIZE as u32);
        response.put_u8(CHARSET_UTF8MB4);
        response.put_slice(&[0u8; 23]);
        response.put_slice(user.as_bytes());
        response.put_u8(0);
        response.put_u8(auth_response.len() as u8);
        response.put_slice(&auth_response);
        response.put_slice(handshake.auth_plugin_name.as_bytes());
        response.put_u8(0);

        self.write_packet(&response)?;

        let resp = self.read_packet()?;
        match resp.first() {
            Some(0x00) => {
                debug!("Authentication successful");
                Ok(())
            }
            Some(0x01) if resp.get(1) == Some(&0x03) => {
                // caching_sha2_password fast auth, followed by OK
                let ok = self.read_packet()?;
                expect_ok(&ok, "Authentication")
            }
            Some(0x01) => bail!("caching_sha2_password full authentication requires TLS"),
            Some(0xFF) => bail!("Authentication failed: {}", server_error(&resp)),
            Some(0xFE) => {
                let plugin_name_end = resp[1..]
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(resp.len() - 1);
                let plugin_name =
                    String::from_utf8_lossy(&resp[1..1 + plugin_name_end]).to_string();
                let mut auth_data = resp
                    .get(2 + plugin_name_end..)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default();
                if auth_data.last() == Some(&0) {
                    auth_data.pop();
                }
                debug!("Auth switch to plugin: {}", plugin_name);
                self.handle_auth_switch(&plugin_name, &auth_data, password)
            }
            Some(other) => bail!("Unexpected auth response: 0x{:02X}", other),
            None => bail!("Empty auth response"),
        }
    }

    fn handle_auth_switch(
        &mut self,
        plugin: &str,
        auth_data: &[u8],
        password: Option<&str>,
    ) -> Result<()> {
        let auth_response = match plugin {
            "mysql_native_password" => mysql_native_password(password, auth_data),
            "caching_sha2_password" => caching_sha2_password(password, auth_data),
            _ => bail!("Unsupported auth plugin for switch: {}", plugin),
        };

        self.write_packet(&auth_response)?;

        let resp = self.read_packet()?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0x01) if plugin == "caching_sha2_password" && resp.get(1) == Some(&0x03) => {
                debug!("Fast auth success");
                let ok = self.read_packet()?;
                expect_ok(&ok, "Auth switch")
            }
            Some(0x01) => bail!("caching_sha2_password full authentication requires TLS"),
            Some(0xFF) => bail!("Auth switch failed: {}", server_error(&resp)),
            _ => bail!("Unexpected auth switch response"),
        }
    }

    /// Execute a statement that returns an OK packet (session `SET`s).
    pub fn query(&mut self, sql: &str) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(sql.len() + 1);
        packet.put_u8(COM_QUERY);
        packet.put_slice(sql.as_bytes());
        self.write_packet(&packet)?;

        let resp = self.read_packet()?;
        match resp.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => bail!("Query failed: {}", server_error(&resp)),
            _ => bail!("Statement returned a result set: {}", sql),
        }
    }

    /// Ask the server to send binlog events with CRC32 checksums when it
    /// writes them, so the decoder sees the same layout as the file.
    pub fn negotiate_checksum(&mut self) -> Result<()> {
        self.query("SET @master_binlog_checksum = @@global.binlog_checksum")
            .context("Failed to negotiate binlog checksum")
    }

    /// Ask the server for a heartbeat event whenever the stream is idle.
    pub fn set_heartbeat_period(&mut self, period: Duration) -> Result<()> {
        self.query(&format!(
            "SET @master_heartbeat_period = {}",
            period.as_nanos()
        ))
        .context("Failed to set heartbeat period")
    }

    /// Register as a replica
    pub fn register_slave(&mut self, server_id: u32) -> Result<()> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(18);
        packet.put_u8(COM_REGISTER_SLAVE);
        packet.put_u32_le(server_id);
        packet.put_u8(0); // hostname length
        packet.put_u8(0); // user length
        packet.put_u8(0); // password length
        packet.put_u16_le(0); // port
        packet.put_u32_le(0); // replication rank
        packet.put_u32_le(0); // master id
        self.write_packet(&packet)?;

        let resp = self.read_packet()?;
        match resp.first() {
            Some(0x00) => {
                info!("Registered as replica with server_id={}", server_id);
                Ok(())
            }
            Some(0xFF) => bail!("Failed to register as replica: {}", server_error(&resp)),
            _ => bail!("Unexpected response to COM_REGISTER_SLAVE"),
        }
    }

    /// Start streaming binlog events from `file:position`.
    pub fn binlog_dump(
        &mut self,
        server_id: u32,
        binlog_filename: &str,
        binlog_position: u32,
    ) -> Result<BinlogStream<'_>> {
        self.sequence_id = 0;
        let mut packet = BytesMut::with_capacity(binlog_filename.len() + 11);
        packet.put_u8(COM_BINLOG_DUMP);
        packet.put_u32_le(binlog_position);
        packet.put_u16_le(0); // flags: block when caught up
        packet.put_u32_le(server_id);
        packet.put_slice(binlog_filename.as_bytes());
        self.write_packet(&packet)?;

        info!(
            "Started binlog dump from {}:{}",
            binlog_filename, binlog_position
        );

        Ok(BinlogStream { client: self })
    }
}

/// Stream of raw binlog events
pub struct BinlogStream<'a> {
    client: &'a mut MySqlBinlogClient,
}

impl BinlogStream<'_> {
    /// Block until the next event arrives. `Ok(None)` means the server ended
    /// the stream.
    pub fn next_event(&mut self) -> Result<Option<Bytes>> {
        let packet = self.client.read_packet()?;

        match packet.first() {
            None => Ok(None),
            Some(0x00) => Ok(Some(Bytes::copy_from_slice(&packet[1..]))),
            Some(0xFE) if packet.len() < 9 => {
                debug!("Received EOF in binlog stream");
                Ok(None)
            }
            Some(0xFF) => bail!("Binlog error: {}", server_error(&packet)),
            Some(_) => Ok(Some(Bytes::from(packet))),
        }
    }
}

/// Read one packet. Returns the payload and the next sequence id.
fn read_packet<R: Read>(reader: &mut R) -> Result<(Vec<u8>, u8)> {
    let mut header = [0u8; PACKET_HEADER_SIZE];
    reader.read_exact(&mut header)?;
    let payload_len =
        (header[0] as usize) | ((header[1] as usize) << 8) | ((header[2] as usize) << 16);
    let sequence_id = header[3];

    let mut payload = vec![0u8; payload_len];
    reader.read_exact(&mut payload)?;

    // Payloads of exactly MAX_PACKET_SIZE continue in the next packet
    let mut next_seq = sequence_id.wrapping_add(1);
    if payload_len == MAX_PACKET_SIZE {
        let (rest, seq) = read_packet(reader)?;
        payload.extend_from_slice(&rest);
        next_seq = seq;
    }

    Ok((payload, next_seq))
}

fn encode_packet(data: &[u8], seq: u8) -> Result<Vec<u8>> {
    let len = data.len();
    if len >= MAX_PACKET_SIZE {
        bail!("Packet too large: {} bytes", len);
    }
    let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + len);
    packet.push((len & 0xFF) as u8);
    packet.push(((len >> 8) & 0xFF) as u8);
    packet.push(((len >> 16) & 0xFF) as u8);
    packet.push(seq);
    packet.extend_from_slice(data);
    Ok(packet)
}

fn expect_ok(resp: &[u8], what: &str) -> Result<()> {
    match resp.first() {
        Some(0x00) => Ok(()),
        Some(0xFF) => bail!("{} failed: {}", what, server_error(resp)),
        _ => bail!("{}: unexpected response", what),
    }
}

/// Render an ERR packet as `code - message`.
fn server_error(resp: &[u8]) -> String {
    if resp.len() < 3 {
        return "malformed error packet".to_string();
    }
    let code = u16::from_le_bytes([resp[1], resp[2]]);
    // Protocol 4.1 puts '#' and a 5-byte SQL state before the message
    let msg_start = if resp.get(3) == Some(&b'#') { 9 } else { 3 };
    let msg = resp
        .get(msg_start..)
        .map(String::from_utf8_lossy)
        .unwrap_or_default();
    format!("{} - {}", code, msg)
}

fn validate_identifier(ident: &str) -> Result<()> {
    if ident.is_empty() {
        bail!("Identifier must not be empty");
    }
    if ident.len() > 64 {
        bail!("Identifier too long: {} chars", ident.len());
    }
    if ident
        .chars()
        .any(|c| c == '\0' || c == '\'' || c == '"' || c == '`' || c.is_control())
    {
        bail!("Identifier contains invalid characters: {:?}", ident);
    }
    Ok(())
}

/// SHA1(password) XOR SHA1(salt + SHA1(SHA1(password)))
fn mysql_native_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            let stage1 = Sha1::digest(pwd.as_bytes());
            let stage2 = Sha1::digest(stage1);
            let mut hasher = Sha1::new();
            hasher.update(salt);
            hasher.update(stage2);
            let stage3 = hasher.finalize();
            stage1
                .iter()
                .zip(stage3.iter())
                .map(|(a, b)| a ^ b)
                .collect()
        }
    }
}

/// XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + salt))
fn caching_sha2_password(password: Option<&str>, salt: &[u8]) -> Vec<u8> {
    match password {
        None | Some("") => vec![],
        Some(pwd) => {
            let hash1 = Sha256::digest(pwd.as_bytes());
            let hash2 = Sha256::digest(hash1);
            let mut hasher = Sha256::new();
            hasher.update(hash2);
            hasher.update(salt);
            let hash3 = hasher.finalize();
            hash1.iter().zip(hash3.iter()).map(|(a, b)| a ^ b).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn handshake_bytes() -> Vec<u8> {
        let mut data = vec![10u8];
        data.extend_from_slice(b"8.0.36\0");
        data.extend_from_slice(&77u32.to_le_bytes());
        data.extend_from_slice(b"abcdefgh");
        data.push(0);
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41 | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        data.extend_from_slice(&((caps & 0xFFFF) as u16).to_le_bytes());
        data.push(CHARSET_UTF8MB4);
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&((caps >> 16) as u16).to_le_bytes());
        data.push(21);
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(b"ijklmnopqrst\0");
        data.extend_from_slice(b"caching_sha2_password\0");
        data
    }

    #[test]
    fn test_mysql_native_password() {
        let salt = b"12345678901234567890";
        let result = mysql_native_password(Some("password"), salt);
        assert_eq!(result.len(), 20);
        assert_eq!(result, mysql_native_password(Some("password"), salt));
        assert_ne!(result, mysql_native_password(Some("other"), salt));
    }

    #[test]
    fn test_empty_password_sends_empty_response() {
        let salt = b"12345678901234567890";
        assert!(mysql_native_password(None, salt).is_empty());
        assert!(caching_sha2_password(Some(""), salt).is_empty());
    }

    #[test]
    fn test_caching_sha2_password() {
        let salt = b"12345678901234567890";
        let result = caching_sha2_password(Some("password"), salt);
        assert_eq!(result.len(), 32);
    }

    #[test]
    fn test_handshake_parse() {
        let handshake = HandshakePacket::parse(&handshake_bytes()).unwrap();
        assert_eq!(handshake.protocol_version, 10);
        assert_eq!(handshake.server_version, "8.0.36");
        assert_eq!(handshake.connection_id, 77);
        assert_eq!(handshake.auth_plugin_name, "caching_sha2_password");
        assert_eq!(handshake.auth_data(), b"abcdefghijklmnopqrst".to_vec());
    }

    #[test]
    fn test_packet_framing() {
        let packet = encode_packet(b"hello", 3).unwrap();
        assert_eq!(&packet[..4], &[5, 0, 0, 3]);

        let mut cursor = Cursor::new(packet);
        let (payload, next_seq) = read_packet(&mut cursor).unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(next_seq, 4);
    }

    #[test]
    fn test_read_packet_truncated() {
        let mut cursor = Cursor::new(vec![10u8, 0, 0, 0, 1, 2]);
        assert!(read_packet(&mut cursor).is_err());
    }

    #[test]
    fn test_server_error_rendering() {
        let mut packet = vec![0xFF];
        packet.extend_from_slice(&1236u16.to_le_bytes());
        packet.extend_from_slice(b"#HY000");
        packet.extend_from_slice(b"Could not find first log file name");
        assert_eq!(
            server_error(&packet),
            "1236 - Could not find first log file name"
        );
        assert_eq!(server_error(&[0xFF]), "malformed error packet");
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("repl").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("root'--").is_err());
        assert!(validate_identifier(&"x".repeat(65)).is_err());
    }
}
