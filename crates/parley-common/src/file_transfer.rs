//! Whole-file payloads carried inside a `file` envelope.
//!
//! Files travel as a single base64 string, so the size bound applies to the
//! raw bytes before encoding.

use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Largest file accepted for sending.
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_FILENAME_BYTES: usize = 255;

/// Checks the size bound and base64 encodes the bytes.
pub fn encode_file_payload(bytes: &[u8]) -> Result<String> {
    if bytes.len() > MAX_FILE_BYTES {
        return Err(Error::PayloadTooLarge {
            size: bytes.len(),
            limit: MAX_FILE_BYTES,
        });
    }
    Ok(STANDARD.encode(bytes))
}

pub fn decode_file_payload(content: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(content.trim())
        .map_err(|e| Error::protocol(format!("file content is not base64: {e}")))
}

/// Reads a file from disk, returning its sanitized name and bytes.
pub fn read_file_payload(path: &Path) -> anyhow::Result<(String, Vec<u8>)> {
    let metadata =
        fs::metadata(path).with_context(|| format!("failed to stat {}", path.display()))?;
    if !metadata.is_file() {
        return Err(anyhow!("not a regular file: {}", path.display()));
    }
    if metadata.len() > MAX_FILE_BYTES as u64 {
        return Err(anyhow!(
            "file {} exceeds max size {} bytes (got {})",
            path.display(),
            MAX_FILE_BYTES,
            metadata.len()
        ));
    }

    let filename = path
        .file_name()
        .and_then(|s| s.to_str())
        .and_then(sanitize_filename)
        .ok_or_else(|| anyhow!("invalid filename: {}", path.display()))?;
    let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok((filename, bytes))
}

/// Decodes a received file into `output_dir` without overwriting anything.
pub fn save_received_file(
    output_dir: &Path,
    filename: &str,
    content: &str,
) -> anyhow::Result<PathBuf> {
    let sanitized =
        sanitize_filename(filename).ok_or_else(|| anyhow!("invalid filename: {filename}"))?;
    let bytes = decode_file_payload(content)?;

    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let destination = unique_destination_path(&output_dir.join(sanitized));
    fs::write(&destination, bytes)
        .with_context(|| format!("failed to write {}", destination.display()))?;
    Ok(destination)
}

pub fn sanitize_filename(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    let base = Path::new(trimmed).file_name()?.to_string_lossy();
    let mut clean = String::with_capacity(base.len().min(MAX_FILENAME_BYTES));
    for ch in base.chars() {
        let safe = ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ' ');
        clean.push(if safe { ch } else { '_' });
        if clean.len() >= MAX_FILENAME_BYTES {
            break;
        }
    }
    let clean = clean.trim().trim_matches('.').to_string();
    if clean.is_empty() {
        return None;
    }
    Some(clean)
}

fn unique_destination_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file")
        .to_string();
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    for n in 1..=9_999u32 {
        let candidate = if ext.is_empty() {
            path.with_file_name(format!("{stem} ({n})"))
        } else {
            path.with_file_name(format!("{stem} ({n}).{ext}"))
        };
        if !candidate.exists() {
            return candidate;
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(name: &str) -> PathBuf {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("parley-{name}-{unique}"));
        fs::create_dir_all(&path).unwrap();
        path
    }

    #[test]
    fn sanitize_filename_rejects_path_traversal() {
        assert_eq!(
            sanitize_filename("../../../../etc/passwd"),
            Some("passwd".to_string())
        );
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("notes<1>.txt"), Some("notes_1_.txt".to_string()));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let bytes = vec![0u8; MAX_FILE_BYTES + 1];
        match encode_file_payload(&bytes) {
            Err(Error::PayloadTooLarge { size, limit }) => {
                assert_eq!(size, MAX_FILE_BYTES + 1);
                assert_eq!(limit, MAX_FILE_BYTES);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn payload_at_limit_is_accepted() {
        let bytes = vec![7u8; MAX_FILE_BYTES];
        let encoded = encode_file_payload(&bytes).unwrap();
        assert_eq!(decode_file_payload(&encoded).unwrap().len(), MAX_FILE_BYTES);
    }

    #[test]
    fn read_then_save_does_not_overwrite() {
        let src_dir = temp_dir("src");
        let out_dir = temp_dir("out");
        let src = src_dir.join("report.txt");
        fs::write(&src, b"quarterly numbers").unwrap();

        let (name, bytes) = read_file_payload(&src).unwrap();
        assert_eq!(name, "report.txt");
        let content = encode_file_payload(&bytes).unwrap();

        let first = save_received_file(&out_dir, &name, &content).unwrap();
        let second = save_received_file(&out_dir, &name, &content).unwrap();

        assert_eq!(first, out_dir.join("report.txt"));
        assert_eq!(second, out_dir.join("report (1).txt"));
        assert_eq!(fs::read(&second).unwrap(), b"quarterly numbers");

        fs::remove_dir_all(src_dir).unwrap();
        fs::remove_dir_all(out_dir).unwrap();
    }

    #[test]
    fn save_rejects_bad_base64() {
        let out_dir = temp_dir("badb64");
        assert!(save_received_file(&out_dir, "x.bin", "%%%not base64%%%").is_err());
        fs::remove_dir_all(out_dir).unwrap();
    }

    #[test]
    fn read_rejects_directories() {
        let dir = temp_dir("isdir");
        assert!(read_file_payload(&dir).is_err());
        fs::remove_dir_all(dir).unwrap();
    }
}
