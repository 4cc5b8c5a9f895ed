//! Server Name Indication extraction from a raw TLS ClientHello.
//!
//! The parser walks fixed offsets of the TLS record layout:
//!
//! ```text
//! offset 0      record type (22 = handshake)
//! offset 43     session id length, then session id
//!               cipher suites length (u16), then suites
//!               compression methods length (u8), then methods
//!               extensions block length (u16, not checked)
//!               extensions: type (u16) | length (u16) | payload
//! ```
//!
//! Offset 43 is the 5-byte record header, the 4-byte handshake header, the
//! 2-byte client version and the 32-byte random.
//!
//! Truncated or malformed input yields `None`; nothing is read past the end
//! of the buffer.

/// TLS record content type for handshake messages.
pub const TLS_HANDSHAKE_TYPE: u8 = 22;

/// Extension type carrying the server name list.
const EXT_SERVER_NAME: u16 = 0;

/// Offset of the session id length byte.
const SESSION_ID_OFFSET: usize = 43;

/// Name type for DNS host names inside the server name list.
const NAME_TYPE_HOST: u8 = 0;

/// Extract the SNI host name from the start of a TLS stream.
///
/// Returns `None` if the buffer is not a handshake record, carries no
/// server name extension, uses a non-hostname name type, or ends before
/// the name does.
pub fn extract(buf: &[u8]) -> Option<String> {
    let mut cursor = Cursor::new(buf);

    if cursor.u8_at(0)? != TLS_HANDSHAKE_TYPE {
        return None;
    }

    cursor.seek(SESSION_ID_OFFSET);
    let session_id_len = cursor.read_u8()? as usize;
    cursor.skip(session_id_len);

    let cipher_suites_len = cursor.read_u16()? as usize;
    cursor.skip(cipher_suites_len);

    let compression_len = cursor.read_u8()? as usize;
    cursor.skip(compression_len);

    // Extensions block length
    cursor.skip(2);

    while cursor.pos < buf.len() {
        let ext_type = cursor.read_u16()?;
        let ext_len = cursor.read_u16()? as usize;

        if ext_type != EXT_SERVER_NAME {
            cursor.skip(ext_len);
            continue;
        }

        // Payload: list length (u16) | name type (u8) | name length (u16) | name.
        // The first entry's name occupies the rest of the extension.
        let entry = cursor.pos + 2;
        if cursor.u8_at(entry)? != NAME_TYPE_HOST {
            return None;
        }
        let name_len = ext_len.checked_sub(5)?;
        let start = cursor.pos + 5;
        let name = buf.get(start..start.checked_add(name_len)?)?;
        return std::str::from_utf8(name).ok().map(str::to_string);
    }

    None
}

/// Bounds-checked big-endian reader.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    fn skip(&mut self, n: usize) {
        self.pos = self.pos.saturating_add(n);
    }

    fn u8_at(&self, pos: usize) -> Option<u8> {
        self.buf.get(pos).copied()
    }

    fn read_u8(&mut self) -> Option<u8> {
        let b = self.u8_at(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn read_u16(&mut self) -> Option<u16> {
        let end = self.pos.checked_add(2)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
