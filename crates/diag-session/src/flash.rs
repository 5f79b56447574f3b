//! VBF software download
//!
//! A VBF file starts with a brace-delimited ASCII header followed by
//! binary data blocks, each block being a big-endian start address and
//! length, the payload, and a 16-bit checksum. [`VbfFlashDriver`]
//! performs the standard download flow: erase routine, request
//! download, transfer data, transfer exit per block, then the
//! check-memory routine with the signature from the header.

use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use doip_codec::{uds, MAX_DIAG_PAYLOAD};
use tracing::{debug, info};

use crate::error::SessionError;
use crate::session::{SessionCore, SessionEvent};

/// One erase region from the header's `erase` field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EraseRegion {
    pub start: Vec<u8>,
    pub length: Vec<u8>,
}

/// Parsed VBF header fields
#[derive(Debug, Clone, Default)]
pub struct VbfHeader {
    pub sw_part_number: String,
    pub sw_version: String,
    pub sw_part_type: String,
    pub ecu_address: String,
    pub data_format_identifier: String,
    pub erase: Option<EraseRegion>,
    pub verification_block_start: String,
    pub verification_block_length: String,
    pub verification_block_root_hash: String,
    pub sw_signature: Vec<u8>,
    pub file_checksum: String,
    /// Byte offset where the binary data blocks begin
    pub data_offset: u64,
}

impl VbfHeader {
    /// Read the brace-balanced header block from the start of a VBF
    /// file and extract its fields.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let file = std::fs::File::open(path.as_ref()).map_err(|e| {
            SessionError::Flash(format!("cannot open {}: {e}", path.as_ref().display()))
        })?;
        let mut reader = BufReader::new(file);

        let mut text = String::new();
        let mut brace_count = 0u32;
        let mut inside_header = false;
        let mut offset = 0u64;
        loop {
            let mut byte = [0u8; 1];
            if reader.read_exact(&mut byte).is_err() {
                return Err(SessionError::Flash(format!(
                    "{}: header block never closes",
                    path.as_ref().display()
                )));
            }
            offset += 1;
            let character = byte[0] as char;
            text.push(character);

            match character {
                '{' => {
                    inside_header = true;
                    brace_count += 1;
                }
                '}' if inside_header => {
                    brace_count -= 1;
                    if brace_count == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }

        let signature_text = extract_value(&text, "sw_signature_dev");
        let sw_signature = if signature_text.is_empty() {
            Vec::new()
        } else {
            hex_field_bytes(&signature_text)
                .ok_or_else(|| SessionError::Flash("invalid sw_signature_dev".into()))?
        };

        Ok(Self {
            sw_part_number: extract_value(&text, "sw_part_number"),
            sw_version: extract_value(&text, "sw_version"),
            sw_part_type: extract_value(&text, "sw_part_type"),
            ecu_address: extract_value(&text, "ecu_address"),
            data_format_identifier: extract_value(&text, "data_format_identifier"),
            erase: parse_erase(&extract_value(&text, "erase")),
            verification_block_start: extract_value(&text, "verification_block_start"),
            verification_block_length: extract_value(&text, "verification_block_length"),
            verification_block_root_hash: extract_value(&text, "verification_block_root_hash"),
            sw_signature,
            file_checksum: extract_value(&text, "file_checksum"),
            data_offset: offset,
        })
    }
}

/// `field = value;` lookup in the header text. Quotes are stripped;
/// a missing field yields an empty string.
fn extract_value(contents: &str, field: &str) -> String {
    let Some(start) = contents.find(field) else {
        return String::new();
    };
    let rest = &contents[start + field.len()..];
    let Some(end) = rest.find(';') else {
        return String::new();
    };
    rest[..end]
        .trim()
        .trim_start_matches('=')
        .trim()
        .trim_matches('"')
        .to_string()
}

/// Parse `{ 0xAAAAAAAA, 0xLLLLLLLL }` erase region pairs; the header
/// carries at most one region per file in practice.
fn parse_erase(content: &str) -> Option<EraseRegion> {
    let parts: Vec<&str> = content
        .split(',')
        .map(|s| s.trim_matches(|c: char| c.is_whitespace() || c == '{' || c == '}'))
        .filter(|s| !s.is_empty())
        .collect();
    if parts.len() != 2 {
        return None;
    }
    Some(EraseRegion {
        start: hex_field_bytes(parts[0])?,
        length: hex_field_bytes(parts[1])?,
    })
}

/// `"0x00010000"` style hex text to raw bytes, left-padded to an even
/// digit count.
fn hex_field_bytes(text: &str) -> Option<Vec<u8>> {
    let digits = text.trim().trim_start_matches("0x");
    let padded = if digits.len() % 2 == 1 {
        format!("0{digits}")
    } else {
        digits.to_string()
    };
    hex::decode(padded).ok()
}

/// A VBF file scheduled for download
#[derive(Debug, Clone)]
pub struct FlashFile {
    pub path: PathBuf,
    pub header: VbfHeader,
}

/// The ordered set of files for one flash run
#[derive(Debug, Clone, Default)]
pub struct FlashSet {
    pub files: Vec<FlashFile>,
}

impl FlashSet {
    /// Parse the headers of all given files up front so a broken file
    /// fails the load, not the flash.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self, SessionError> {
        let files = paths
            .iter()
            .map(|path| {
                Ok(FlashFile {
                    path: path.as_ref().to_path_buf(),
                    header: VbfHeader::parse(path)?,
                })
            })
            .collect::<Result<_, SessionError>>()?;
        Ok(Self { files })
    }
}

/// Strategy seam for software download; the session core only knows
/// this trait.
#[async_trait]
pub trait FlashDriver: Send + Sync {
    async fn flash(&self, session: &SessionCore, set: &FlashSet) -> Result<(), SessionError>;
}

/// Standard VBF download over UDS
#[derive(Debug, Clone)]
pub struct VbfFlashDriver {
    /// Largest data slice per transfer-data request, excluding the two
    /// service bytes
    pub chunk_size: usize,
}

impl Default for VbfFlashDriver {
    fn default() -> Self {
        Self {
            chunk_size: MAX_DIAG_PAYLOAD - 2,
        }
    }
}

#[async_trait]
impl FlashDriver for VbfFlashDriver {
    async fn flash(&self, session: &SessionCore, set: &FlashSet) -> Result<(), SessionError> {
        for file in &set.files {
            info!(
                path = %file.path.display(),
                part = %file.header.sw_part_number,
                "flashing"
            );
            self.flash_file(session, file).await?;
        }
        Ok(())
    }
}

impl VbfFlashDriver {
    pub fn new(chunk_size: usize) -> Self {
        Self { chunk_size }
    }

    async fn flash_file(&self, session: &SessionCore, file: &FlashFile) -> Result<(), SessionError> {
        let header = &file.header;

        if let Some(erase) = &header.erase {
            let mut request = vec![uds::service_id::ROUTINE_CONTROL, 0x01, 0xFF, 0x00];
            request.extend_from_slice(&erase.start);
            request.extend_from_slice(&erase.length);
            expect_prefix(session, &request, &[0x71, 0x01, 0xFF, 0x00]).await?;
            debug!("erase routine accepted");
        }

        let mut reader = std::fs::File::open(&file.path)
            .map_err(|e| SessionError::Flash(format!("cannot open {}: {e}", file.path.display())))?;
        reader
            .seek(SeekFrom::Start(header.data_offset))
            .map_err(|e| SessionError::Flash(format!("seek failed: {e}")))?;

        let total: u64 = std::fs::metadata(&file.path)
            .map(|m| m.len().saturating_sub(header.data_offset))
            .unwrap_or(0);
        let mut transferred: u64 = 0;
        let file_name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        loop {
            let mut start_bytes = [0u8; 4];
            if reader.read_exact(&mut start_bytes).is_err() {
                break;
            }
            let mut length_bytes = [0u8; 4];
            reader
                .read_exact(&mut length_bytes)
                .map_err(|e| SessionError::Flash(format!("truncated block header: {e}")))?;
            let block_start = u32::from_be_bytes(start_bytes);
            let block_length = u32::from_be_bytes(length_bytes);
            debug!(
                start = format_args!("0x{block_start:08X}"),
                length = block_length,
                "downloading block"
            );

            let mut request = vec![uds::service_id::REQUEST_DOWNLOAD, 0x00, 0x44];
            request.extend_from_slice(&start_bytes);
            request.extend_from_slice(&length_bytes);
            expect_prefix(session, &request, &[0x74]).await?;

            let mut remaining = block_length as usize;
            let mut sequence: u8 = 1;
            while remaining > 0 {
                let chunk_len = remaining.min(self.chunk_size);
                let mut chunk = vec![0u8; chunk_len];
                reader
                    .read_exact(&mut chunk)
                    .map_err(|e| SessionError::Flash(format!("truncated data block: {e}")))?;
                remaining -= chunk_len;

                let mut request = vec![uds::service_id::TRANSFER_DATA, sequence];
                request.extend_from_slice(&chunk);
                expect_prefix(session, &request, &[0x76]).await?;
                sequence = sequence.wrapping_add(1);

                transferred += chunk_len as u64;
                if total > 0 {
                    session.emit_event(SessionEvent::FlashProgress {
                        file: file_name.clone(),
                        percent: ((transferred * 100) / total) as u8,
                    });
                }
            }

            expect_prefix(
                session,
                &[uds::service_id::REQUEST_TRANSFER_EXIT],
                &[0x77],
            )
            .await?;

            // Trailing per-block checksum, not sent to the ECU
            let mut checksum = [0u8; 2];
            reader
                .read_exact(&mut checksum)
                .map_err(|e| SessionError::Flash(format!("truncated block checksum: {e}")))?;
            transferred += (8 + 2) as u64;
        }

        let mut request = vec![uds::service_id::ROUTINE_CONTROL, 0x01, 0x02, 0x12];
        request.extend_from_slice(&header.sw_signature);
        expect_prefix(session, &request, &[0x71, 0x01, 0x02, 0x12, 0x10, 0x00]).await?;

        info!(path = %file.path.display(), "flashed successfully");
        Ok(())
    }
}

async fn expect_prefix(
    session: &SessionCore,
    request: &[u8],
    prefix: &[u8],
) -> Result<(), SessionError> {
    let response = session
        .send_uds(request)
        .await?
        .ok_or_else(|| SessionError::Flash("no response to flash request".into()))?;
    if response.raw.starts_with(prefix) {
        Ok(())
    } else {
        Err(SessionError::UnexpectedResponse {
            expected: format!("prefix {}", hex::encode(prefix)),
            received: hex::encode(&response.raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    const HEADER: &str = "vbf_version = 2.6;\nheader {\n\
        sw_part_number = \"32336593 AA\";\n\
        sw_version = \"A\";\n\
        sw_part_type = EXE;\n\
        ecu_address = 0x1A01;\n\
        data_format_identifier = 0x00;\n\
        erase = { { 0x00010000, 0x0001E000 } };\n\
        verification_block_start = 0x00010000;\n\
        verification_block_length = 0x00000100;\n\
        verification_block_root_hash = 0xAB12;\n\
        sw_signature_dev = 0x11223344;\n\
        file_checksum = 0xDEADBEEF;\n}";

    fn write_vbf(blocks: &[(u32, &[u8])]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(HEADER.as_bytes()).unwrap();
        for (start, data) in blocks {
            file.write_all(&start.to_be_bytes()).unwrap();
            file.write_all(&(data.len() as u32).to_be_bytes()).unwrap();
            file.write_all(data).unwrap();
            file.write_all(&[0x00, 0x00]).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn parses_header_fields() {
        let file = write_vbf(&[]);
        let header = VbfHeader::parse(file.path()).unwrap();
        assert_eq!(header.sw_part_number, "32336593 AA");
        assert_eq!(header.sw_version, "A");
        assert_eq!(header.sw_part_type, "EXE");
        assert_eq!(header.ecu_address, "0x1A01");
        assert_eq!(
            header.erase,
            Some(EraseRegion {
                start: vec![0x00, 0x01, 0x00, 0x00],
                length: vec![0x00, 0x01, 0xE0, 0x00],
            })
        );
        assert_eq!(header.sw_signature, vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(header.file_checksum, "0xDEADBEEF");
        assert_eq!(header.data_offset, HEADER.len() as u64);
    }

    #[test]
    fn load_rejects_missing_file() {
        assert!(FlashSet::load(&["/nonexistent/sw.vbf"]).is_err());
    }

    #[test]
    fn hex_field_pads_odd_digits() {
        assert_eq!(hex_field_bytes("0x1A01"), Some(vec![0x1A, 0x01]));
        assert_eq!(hex_field_bytes("0xA01"), Some(vec![0x0A, 0x01]));
        assert_eq!(hex_field_bytes("junk"), None);
    }
}
