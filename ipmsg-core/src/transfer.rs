//! TCP transfer framing: the request a downloader sends, and the header-framed stream a
//! directory attachment is served as.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::attachment::{
    escape_name, format_extensions, parse_extensions, parse_hex_u64, split_fields, Attachment,
    DescriptorError,
};
use crate::protocol::{Command, Mode};

/// What the downloader asks the sender's file endpoint for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    /// Packet number of the message that carried the attachment.
    pub packet_no: u64,
    pub file_id: u32,
    pub offset: u64,
    pub directory: bool,
}

impl TransferRequest {
    pub fn file(packet_no: u64, file_id: u32, offset: u64) -> Self {
        Self {
            packet_no,
            file_id,
            offset,
            directory: false,
        }
    }

    pub fn directory(packet_no: u64, file_id: u32) -> Self {
        Self {
            packet_no,
            file_id,
            offset: 0,
            directory: true,
        }
    }

    pub fn command(&self) -> Command {
        if self.directory {
            Command::new(Mode::GetDirFiles)
        } else {
            Command::new(Mode::GetFileData)
        }
    }

    /// Packet message text: `<packet hex>:<file id hex>:[<offset hex>:]`.
    pub fn message(&self) -> String {
        if self.directory {
            format!("{:x}:{:x}:", self.packet_no, self.file_id)
        } else {
            format!("{:x}:{:x}:{:x}:", self.packet_no, self.file_id, self.offset)
        }
    }

    /// Parse the message of a GETFILEDATA or GETDIRFILES packet.
    pub fn parse(command: Command, message: &str) -> Option<Self> {
        let fields: Vec<&str> = message.split(':').collect();
        let packet_no = u64::from_str_radix(fields.first()?.trim(), 16).ok()?;
        let file_id = u32::from_str_radix(fields.get(1)?.trim(), 16).ok()?;
        match command.mode()? {
            Mode::GetFileData => {
                let offset = match fields.get(2).map(|f| f.trim()) {
                    Some(f) if !f.is_empty() => u64::from_str_radix(f, 16).ok()?,
                    _ => 0,
                };
                Some(Self::file(packet_no, file_id, offset))
            }
            Mode::GetDirFiles => Some(Self::directory(packet_no, file_id)),
            _ => None,
        }
    }
}

/// One entry header of a directory stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub attachment: Attachment,
}

const HEADER_SIZE_DIGITS: usize = 4;
/// Longest run of bytes searched for the header-size separator.
const HEADER_SIZE_PROBE: usize = 16;

/// `<header size hex>:<name>:<size hex>:<attr hex>[:<ext>=<val>]*:` where the size counts the
/// whole header.
pub fn encode_stream_header(attachment: &Attachment) -> Result<Vec<u8>, DescriptorError> {
    let body = format!(
        ":{}:{:x}:{:x}:{}",
        escape_name(&attachment.name),
        attachment.size,
        attachment.attr(),
        format_extensions(&attachment.extensions())
    );
    let total = HEADER_SIZE_DIGITS + body.len();
    if total > 0xffff {
        return Err(DescriptorError::HeaderSize);
    }
    Ok(format!("{total:04x}{body}").into_bytes())
}

/// Try to parse one header from the front of `buf`. `Ok(None)` means more bytes are needed;
/// on success returns the header and the number of bytes it occupied.
pub fn decode_stream_header(buf: &[u8]) -> Result<Option<(StreamHeader, usize)>, DescriptorError> {
    let probe = &buf[..buf.len().min(HEADER_SIZE_PROBE)];
    let Some(colon) = probe.iter().position(|&b| b == b':') else {
        if buf.len() >= HEADER_SIZE_PROBE {
            return Err(DescriptorError::HeaderSize);
        }
        return Ok(None);
    };
    let size_text = std::str::from_utf8(&buf[..colon]).map_err(|_| DescriptorError::HeaderSize)?;
    let header_size =
        usize::from_str_radix(size_text.trim(), 16).map_err(|_| DescriptorError::HeaderSize)?;
    if header_size <= colon {
        return Err(DescriptorError::HeaderSize);
    }
    if buf.len() < header_size {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&buf[colon + 1..header_size]);
    let fields = split_fields(&text);
    if fields.len() < 3 {
        return Err(DescriptorError::MissingField);
    }
    let size = parse_hex_u64(&fields[1], "size")?;
    let attr_word = u32::try_from(parse_hex_u64(&fields[2], "attr")?)
        .map_err(|_| DescriptorError::BadNumber("attr"))?;
    let extensions = parse_extensions(&fields[3..])?;
    let attachment = Attachment::from_parts(0, fields[0].clone(), size, None, attr_word, &extensions)?;
    Ok(Some((StreamHeader { attachment }, header_size)))
}

/// One entry of a directory stream in serving order, with the file to stream for regular entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub attachment: Attachment,
    pub source: Option<PathBuf>,
}

/// Flatten a directory into stream order: the directory itself, its children depth-first, then
/// the return-parent marker that closes it. Symbolic links below the root and entries that are
/// neither files nor directories are skipped.
pub fn directory_entries(root: &Path) -> io::Result<Vec<StreamEntry>> {
    let mut out = Vec::new();
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "directory has no name"))?;
    walk(root, name, &mut out)?;
    Ok(out)
}

fn walk(dir: &Path, name: String, out: &mut Vec<StreamEntry>) -> io::Result<()> {
    let meta = fs::metadata(dir)?;
    out.push(StreamEntry {
        attachment: Attachment::from_metadata(0, name, &meta),
        source: None,
    });
    let mut children: Vec<fs::DirEntry> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());
    for child in children {
        let path = child.path();
        let child_name = child.file_name().to_string_lossy().into_owned();
        let meta = fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            tracing::debug!(path = %path.display(), "skipping symbolic link");
        } else if meta.is_dir() {
            walk(&path, child_name, out)?;
        } else if meta.is_file() {
            out.push(StreamEntry {
                attachment: Attachment::from_metadata(0, child_name, &meta),
                source: Some(path),
            });
        }
    }
    out.push(StreamEntry {
        attachment: Attachment::return_parent(),
        source: None,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentKind;

    #[test]
    fn request_messages() {
        let file = TransferRequest::file(0x1234, 2, 0x10);
        assert_eq!(file.message(), "1234:2:10:");
        assert_eq!(TransferRequest::parse(file.command(), &file.message()), Some(file));
        let dir = TransferRequest::directory(0x1234, 3);
        assert_eq!(dir.message(), "1234:3:");
        assert_eq!(TransferRequest::parse(dir.command(), &dir.message()), Some(dir));
        assert_eq!(
            TransferRequest::parse(Command::new(Mode::SendMsg), "1:2:"),
            None
        );
        assert_eq!(
            TransferRequest::parse(Command::new(Mode::GetFileData), "zz:2:0:"),
            None
        );
    }

    #[test]
    fn header_roundtrip_and_partial() {
        let file = Attachment::regular(0, "b:c.txt", 50);
        let bytes = encode_stream_header(&file).unwrap();
        let declared = usize::from_str_radix(std::str::from_utf8(&bytes[..4]).unwrap(), 16).unwrap();
        assert_eq!(declared, bytes.len());
        assert!(decode_stream_header(&bytes[..bytes.len() - 1]).unwrap().is_none());
        assert!(decode_stream_header(&bytes[..2]).unwrap().is_none());
        let mut with_data = bytes.clone();
        with_data.extend_from_slice(b"payload");
        let (header, used) = decode_stream_header(&with_data).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(header.attachment.name, "b:c.txt");
        assert_eq!(header.attachment.size, 50);
    }

    #[test]
    fn header_rejects_traversal() {
        let bad = b"000c:..:0:2:";
        assert!(matches!(
            decode_stream_header(bad),
            Err(DescriptorError::InvalidName(_))
        ));
        let marker = encode_stream_header(&Attachment::return_parent()).unwrap();
        let (h, _) = decode_stream_header(&marker).unwrap().unwrap();
        assert_eq!(h.attachment.kind, AttachmentKind::ReturnParent);
        assert!(matches!(
            decode_stream_header(b"zzzzzzzzzzzzzzzzzz"),
            Err(DescriptorError::HeaderSize)
        ));
    }

    #[test]
    fn walks_directory_in_stream_order() {
        let root = tempfile::tempdir().unwrap();
        let docs = root.path().join("docs");
        fs::create_dir_all(docs.join("sub")).unwrap();
        fs::write(docs.join("b.txt"), vec![0u8; 50]).unwrap();
        fs::write(docs.join("sub").join("c.txt"), b"c").unwrap();
        let entries = directory_entries(&docs).unwrap();
        let kinds: Vec<(String, u32)> = entries
            .iter()
            .map(|e| (e.attachment.name.clone(), e.attachment.type_code()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("docs".to_string(), 2),
                ("b.txt".to_string(), 1),
                ("sub".to_string(), 2),
                ("c.txt".to_string(), 1),
                (".".to_string(), 3),
                (".".to_string(), 3),
            ]
        );
        assert_eq!(entries[1].attachment.size, 50);
        assert_eq!(entries[1].source.as_deref(), Some(docs.join("b.txt").as_path()));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loop_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let share = root.path().join("share");
        fs::create_dir(&share).unwrap();
        fs::write(share.join("a.txt"), b"a").unwrap();
        std::os::unix::fs::symlink(&share, share.join("loop")).unwrap();
        std::os::unix::fs::symlink(share.join("a.txt"), share.join("alias.txt")).unwrap();
        let names: Vec<String> = directory_entries(&share)
            .unwrap()
            .into_iter()
            .map(|e| e.attachment.name)
            .collect();
        assert_eq!(names, vec!["share", "a.txt", "."]);
    }
}
