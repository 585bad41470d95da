//! Attachment model: one unit of transferable content, its descriptor codec, and the
//! receive-side handle that downloaded bytes are written through.

use std::fs::{self, File, Metadata, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

/// Attribute word: low byte is the type, the rest are flags.
pub mod attr {
    pub const REGULAR: u32 = 0x01;
    pub const DIR: u32 = 0x02;
    pub const RETPARENT: u32 = 0x03;
    pub const CLIPBOARD: u32 = 0x20;
    pub const TYPE_MASK: u32 = 0xff;

    pub const RONLY: u32 = 0x0100;
    pub const HIDDEN: u32 = 0x1000;
    pub const EXHIDDEN: u32 = 0x2000;
}

/// Extended attribute keys (`key=value`, both hex).
pub mod ext {
    pub const CLIPBOARDPOS: u32 = 0x08;
    pub const PERM: u32 = 0x10;
    pub const MTIME: u32 = 0x14;
    pub const CREATETIME: u32 = 0x16;
    pub const CREATOR: u32 = 0x20;
    pub const FILETYPE: u32 = 0x21;
}

const ENTRY_TERMINATOR: char = '\u{7}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentKind {
    RegularFile {
        permission: Option<u32>,
        created: Option<u64>,
        creator: Option<u32>,
        file_type: Option<u32>,
    },
    Directory {
        permission: Option<u32>,
        created: Option<u64>,
    },
    /// Closes the directory opened by the matching `Directory` entry. Carries no payload.
    ReturnParent,
    /// Inline image; `position` is its offset in the message text.
    Clipboard { position: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Unique within the message that introduced it.
    pub file_id: u32,
    pub name: String,
    pub size: u64,
    /// Seconds since the unix epoch.
    pub modified: Option<u64>,
    pub read_only: bool,
    pub hidden: bool,
    pub kind: AttachmentKind,
}

impl Attachment {
    pub fn regular(file_id: u32, name: impl Into<String>, size: u64) -> Self {
        Self::with_kind(
            file_id,
            name,
            size,
            AttachmentKind::RegularFile {
                permission: None,
                created: None,
                creator: None,
                file_type: None,
            },
        )
    }

    pub fn directory(file_id: u32, name: impl Into<String>) -> Self {
        Self::with_kind(
            file_id,
            name,
            0,
            AttachmentKind::Directory {
                permission: None,
                created: None,
            },
        )
    }

    pub fn return_parent() -> Self {
        Self::with_kind(0, ".", 0, AttachmentKind::ReturnParent)
    }

    pub fn clipboard(file_id: u32, name: impl Into<String>, size: u64, position: u32) -> Self {
        Self::with_kind(file_id, name, size, AttachmentKind::Clipboard { position })
    }

    fn with_kind(file_id: u32, name: impl Into<String>, size: u64, kind: AttachmentKind) -> Self {
        Self {
            file_id,
            name: name.into(),
            size,
            modified: None,
            read_only: false,
            hidden: false,
            kind,
        }
    }

    /// Describe a file or directory on disk.
    pub fn from_metadata(file_id: u32, name: impl Into<String>, meta: &Metadata) -> Self {
        let name = name.into();
        let permission = unix_mode(meta);
        let mut attachment = if meta.is_dir() {
            Self::with_kind(
                file_id,
                name,
                0,
                AttachmentKind::Directory {
                    permission,
                    created: None,
                },
            )
        } else {
            Self::with_kind(
                file_id,
                name,
                meta.len(),
                AttachmentKind::RegularFile {
                    permission,
                    created: None,
                    creator: None,
                    file_type: None,
                },
            )
        };
        attachment.modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        attachment.read_only = meta.permissions().readonly();
        attachment.hidden = attachment.name.starts_with('.');
        attachment
    }

    pub fn type_code(&self) -> u32 {
        match self.kind {
            AttachmentKind::RegularFile { .. } => attr::REGULAR,
            AttachmentKind::Directory { .. } => attr::DIR,
            AttachmentKind::ReturnParent => attr::RETPARENT,
            AttachmentKind::Clipboard { .. } => attr::CLIPBOARD,
        }
    }

    pub fn attr(&self) -> u32 {
        let mut value = self.type_code();
        if self.read_only {
            value |= attr::RONLY;
        }
        if self.hidden {
            value |= attr::HIDDEN;
        }
        value
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, AttachmentKind::Directory { .. })
    }

    pub fn is_clipboard(&self) -> bool {
        matches!(self.kind, AttachmentKind::Clipboard { .. })
    }

    /// Extended attributes in wire order.
    pub fn extensions(&self) -> Vec<(u32, u64)> {
        let mut out = Vec::new();
        match &self.kind {
            AttachmentKind::RegularFile {
                permission,
                created,
                creator,
                file_type,
            } => {
                push_ext(&mut out, ext::PERM, permission.map(u64::from));
                push_ext(&mut out, ext::MTIME, self.modified);
                push_ext(&mut out, ext::CREATETIME, *created);
                push_ext(&mut out, ext::CREATOR, creator.map(u64::from));
                push_ext(&mut out, ext::FILETYPE, file_type.map(u64::from));
            }
            AttachmentKind::Directory {
                permission,
                created,
            } => {
                push_ext(&mut out, ext::PERM, permission.map(u64::from));
                push_ext(&mut out, ext::MTIME, self.modified);
                push_ext(&mut out, ext::CREATETIME, *created);
            }
            AttachmentKind::Clipboard { position } => {
                out.push((ext::CLIPBOARDPOS, u64::from(*position)));
            }
            AttachmentKind::ReturnParent => {}
        }
        out
    }

    /// Rebuild from decoded wire fields.
    pub(crate) fn from_parts(
        file_id: u32,
        name: String,
        size: u64,
        modified: Option<u64>,
        attr_word: u32,
        extensions: &[(u32, u64)],
    ) -> Result<Self, DescriptorError> {
        let lookup = |key: u32| extensions.iter().find(|(k, _)| *k == key).map(|(_, v)| *v);
        let as_u32 = |v: Option<u64>| v.and_then(|v| u32::try_from(v).ok());
        let kind = match attr_word & attr::TYPE_MASK {
            attr::REGULAR => AttachmentKind::RegularFile {
                permission: as_u32(lookup(ext::PERM)),
                created: lookup(ext::CREATETIME),
                creator: as_u32(lookup(ext::CREATOR)),
                file_type: as_u32(lookup(ext::FILETYPE)),
            },
            attr::DIR => AttachmentKind::Directory {
                permission: as_u32(lookup(ext::PERM)),
                created: lookup(ext::CREATETIME),
            },
            attr::RETPARENT => AttachmentKind::ReturnParent,
            attr::CLIPBOARD => AttachmentKind::Clipboard {
                position: as_u32(lookup(ext::CLIPBOARDPOS)).unwrap_or(0),
            },
            other => return Err(DescriptorError::UnknownType(other)),
        };
        if kind != AttachmentKind::ReturnParent {
            validate_name(&name)?;
        }
        Ok(Self {
            file_id,
            name,
            size,
            modified: modified.or_else(|| lookup(ext::MTIME)),
            read_only: attr_word & attr::RONLY != 0,
            hidden: attr_word & (attr::HIDDEN | attr::EXHIDDEN) != 0,
            kind,
        })
    }
}

fn push_ext(out: &mut Vec<(u32, u64)>, key: u32, value: Option<u64>) {
    if let Some(v) = value {
        out.push((key, v));
    }
}

#[cfg(unix)]
fn unix_mode(meta: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn unix_mode(_meta: &Metadata) -> Option<u32> {
    None
}

/// A received name must be a single path component.
pub fn validate_name(name: &str) -> Result<(), DescriptorError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(DescriptorError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub(crate) fn escape_name(name: &str) -> String {
    name.replace(':', "::")
}

/// Split on `:`, reading `::` as a literal colon. Trailing text after the last separator is
/// returned as a final field only if non-empty.
pub(crate) fn split_fields(s: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == ':' {
            if chars.peek() == Some(&':') {
                chars.next();
                current.push(':');
            } else {
                fields.push(std::mem::take(&mut current));
            }
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}

pub(crate) fn parse_hex_u64(field: &str, what: &'static str) -> Result<u64, DescriptorError> {
    u64::from_str_radix(field.trim(), 16).map_err(|_| DescriptorError::BadNumber(what))
}

pub(crate) fn parse_extensions(fields: &[String]) -> Result<Vec<(u32, u64)>, DescriptorError> {
    fields
        .iter()
        .filter(|f| !f.is_empty())
        .map(|f| {
            let (k, v) = f.split_once('=').ok_or(DescriptorError::BadExtension)?;
            let key = u32::from_str_radix(k.trim(), 16).map_err(|_| DescriptorError::BadExtension)?;
            let value = u64::from_str_radix(v.trim(), 16).map_err(|_| DescriptorError::BadExtension)?;
            Ok((key, value))
        })
        .collect()
}

pub(crate) fn format_extensions(extensions: &[(u32, u64)]) -> String {
    let mut out = String::new();
    for (k, v) in extensions {
        out.push_str(&format!("{k:x}={v:x}:"));
    }
    out
}

/// `<file id>:<name>:<size hex>:<mtime hex>:<attr hex>[:<ext>=<val>]*:` per entry, each
/// terminated by BEL.
pub fn encode_descriptors(attachments: &[Attachment]) -> String {
    let mut out = String::new();
    for a in attachments {
        let extensions: Vec<(u32, u64)> = a
            .extensions()
            .into_iter()
            .filter(|(k, _)| *k != ext::MTIME)
            .collect();
        out.push_str(&format!(
            "{}:{}:{:x}:{:x}:{:x}:{}",
            a.file_id,
            escape_name(&a.name),
            a.size,
            a.modified.unwrap_or(0),
            a.attr(),
            format_extensions(&extensions)
        ));
        out.push(ENTRY_TERMINATOR);
    }
    out
}

/// File ids must be unique within one extension.
pub fn decode_descriptors(s: &str) -> Result<Vec<Attachment>, DescriptorError> {
    let mut out: Vec<Attachment> = Vec::new();
    for entry in s.split(ENTRY_TERMINATOR).map(str::trim_start) {
        if entry.trim().is_empty() {
            continue;
        }
        let attachment = decode_descriptor(entry)?;
        if out.iter().any(|a| a.file_id == attachment.file_id) {
            return Err(DescriptorError::DuplicateId(attachment.file_id));
        }
        out.push(attachment);
    }
    Ok(out)
}

fn decode_descriptor(entry: &str) -> Result<Attachment, DescriptorError> {
    let fields = split_fields(entry);
    if fields.len() < 5 {
        return Err(DescriptorError::MissingField);
    }
    let file_id = fields[0]
        .trim()
        .parse::<u32>()
        .map_err(|_| DescriptorError::BadNumber("file id"))?;
    let size = parse_hex_u64(&fields[2], "size")?;
    let modified = parse_hex_u64(&fields[3], "mtime")?;
    let attr_word = u32::try_from(parse_hex_u64(&fields[4], "attr")?)
        .map_err(|_| DescriptorError::BadNumber("attr"))?;
    let extensions = parse_extensions(&fields[5..])?;
    Attachment::from_parts(
        file_id,
        fields[1].clone(),
        size,
        (modified != 0).then_some(modified),
        attr_word,
        &extensions,
    )
}

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("missing descriptor field")]
    MissingField,
    #[error("malformed {0}")]
    BadNumber(&'static str),
    #[error("malformed extended attribute")]
    BadExtension,
    #[error("unknown attachment type {0:#x}")]
    UnknownType(u32),
    #[error("invalid file name {0:?}")]
    InvalidName(String),
    #[error("header size out of range")]
    HeaderSize,
    #[error("duplicate file id {0}")]
    DuplicateId(u32),
}

enum Handle {
    File(File),
    Clipboard(Vec<u8>),
}

/// Inbound attachment plus the write handle used while it downloads.
pub struct RecvAttachment {
    pub attachment: Attachment,
    /// Where the content was (or is being) saved. `None` for clipboard data.
    pub save_path: Option<PathBuf>,
    pub downloaded: bool,
    clipboard_data: Option<Vec<u8>>,
    handle: Option<Handle>,
}

impl RecvAttachment {
    pub fn new(attachment: Attachment) -> Self {
        Self {
            attachment,
            save_path: None,
            downloaded: false,
            clipboard_data: None,
            handle: None,
        }
    }

    /// Prepare to receive into `dir`. Directories are created; return-parent markers are no-ops.
    pub fn open_handle(&mut self, dir: &Path) -> io::Result<()> {
        match self.attachment.kind {
            AttachmentKind::RegularFile { .. } => {
                let path = dir.join(&self.attachment.name);
                self.handle = Some(Handle::File(File::create(&path)?));
                self.save_path = Some(path);
            }
            AttachmentKind::Directory { .. } => {
                let path = dir.join(&self.attachment.name);
                fs::create_dir_all(&path)?;
                self.save_path = Some(path);
            }
            AttachmentKind::ReturnParent => {}
            AttachmentKind::Clipboard { .. } => {
                let capacity = usize::try_from(self.attachment.size).unwrap_or(0);
                self.handle = Some(Handle::Clipboard(Vec::with_capacity(capacity)));
            }
        }
        Ok(())
    }

    /// Like `open_handle`, but a shorter regular file already at the target path is kept and
    /// appended to. Returns the number of bytes already present.
    pub fn open_resumable(&mut self, dir: &Path) -> io::Result<u64> {
        if let AttachmentKind::RegularFile { .. } = self.attachment.kind {
            let path = dir.join(&self.attachment.name);
            let existing = fs::symlink_metadata(&path)
                .ok()
                .filter(|m| m.is_file())
                .map_or(0, |m| m.len());
            if existing > 0 && existing < self.attachment.size {
                let file = OpenOptions::new().append(true).open(&path)?;
                self.handle = Some(Handle::File(file));
                self.save_path = Some(path);
                return Ok(existing);
            }
        }
        self.open_handle(dir)?;
        Ok(0)
    }

    pub fn write_data(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.handle.as_mut() {
            Some(Handle::File(f)) => f.write_all(buf),
            Some(Handle::Clipboard(data)) => {
                data.extend_from_slice(buf);
                Ok(())
            }
            None if buf.is_empty() => Ok(()),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "attachment has no open handle",
            )),
        }
    }

    pub fn close_handle(&mut self) -> io::Result<()> {
        match self.handle.take() {
            Some(Handle::File(mut f)) => {
                f.flush()?;
                if let Some(mtime) = self.attachment.modified {
                    if let Err(e) = f.set_modified(UNIX_EPOCH + Duration::from_secs(mtime)) {
                        tracing::debug!(error = %e, "could not preserve modification time");
                    }
                }
            }
            Some(Handle::Clipboard(data)) => self.clipboard_data = Some(data),
            None => {}
        }
        Ok(())
    }

    /// Drop the handle and delete a partially written file.
    pub fn discard(&mut self) {
        if let Some(Handle::File(f)) = self.handle.take() {
            drop(f);
            if let Some(path) = self.save_path.take() {
                if let Err(e) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "could not remove partial file");
                }
            }
        }
    }

    /// Drop the handle and leave whatever was written on disk.
    pub fn suspend(&mut self) {
        self.handle = None;
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Image bytes of a downloaded clipboard attachment.
    pub fn clipboard_data(&self) -> Option<&[u8]> {
        self.clipboard_data.as_deref()
    }
}

impl std::fmt::Debug for RecvAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecvAttachment")
            .field("attachment", &self.attachment)
            .field("save_path", &self.save_path)
            .field("downloaded", &self.downloaded)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Clone for RecvAttachment {
    /// Clones the record only; an open handle stays with the original.
    fn clone(&self) -> Self {
        Self {
            attachment: self.attachment.clone(),
            save_path: self.save_path.clone(),
            downloaded: self.downloaded,
            clipboard_data: self.clipboard_data.clone(),
            handle: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_roundtrip_with_escaped_name() {
        let mut file = Attachment::regular(0, "notes: draft.txt", 100);
        file.modified = Some(0x6500_0000);
        file.read_only = true;
        let dir = Attachment::directory(1, "docs");
        let clip = Attachment::clipboard(2, "image.png", 2048, 14);
        let encoded = encode_descriptors(&[file.clone(), dir.clone(), clip.clone()]);
        assert!(encoded.starts_with("0:notes:: draft.txt:64:65000000:101:\u{7}"));
        let decoded = decode_descriptors(&encoded).unwrap();
        assert_eq!(decoded, vec![file, dir, clip]);
    }

    #[test]
    fn decodes_legacy_entry_with_extensions() {
        let decoded = decode_descriptors("3:report.pdf:1f4:5f5e1000:1:10=1a4:16=5f000000:\u{7}").unwrap();
        assert_eq!(decoded.len(), 1);
        let a = &decoded[0];
        assert_eq!(a.file_id, 3);
        assert_eq!(a.size, 500);
        assert_eq!(a.modified, Some(0x5f5e_1000));
        assert_eq!(
            a.kind,
            AttachmentKind::RegularFile {
                permission: Some(0o644),
                created: Some(0x5f00_0000),
                creator: None,
                file_type: None
            }
        );
    }

    #[test]
    fn rejects_path_names_and_bad_fields() {
        for bad in ["../x", "a/b", "a\\b", "..", "."] {
            let entry = format!("0:{}:1:0:1:\u{7}", escape_name(bad));
            assert!(matches!(
                decode_descriptors(&entry),
                Err(DescriptorError::InvalidName(_))
            ));
        }
        assert!(matches!(
            decode_descriptors("0:x:zz:0:1:\u{7}"),
            Err(DescriptorError::BadNumber("size"))
        ));
        assert!(matches!(
            decode_descriptors("0:x:1:\u{7}"),
            Err(DescriptorError::MissingField)
        ));
        assert!(matches!(
            decode_descriptors("0:x:1:0:7:\u{7}"),
            Err(DescriptorError::UnknownType(7))
        ));
    }

    #[test]
    fn split_fields_escapes() {
        assert_eq!(split_fields("a::b:c:"), vec!["a:b", "c"]);
        assert_eq!(split_fields("x:y"), vec!["x", "y"]);
    }

    #[test]
    fn file_handle_writes_and_discards() {
        let dir = tempfile::tempdir().unwrap();
        let mut recv = RecvAttachment::new(Attachment::regular(0, "a.txt", 5));
        recv.open_handle(dir.path()).unwrap();
        recv.write_data(b"hello").unwrap();
        recv.close_handle().unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"hello");

        let mut partial = RecvAttachment::new(Attachment::regular(1, "b.txt", 10));
        partial.open_handle(dir.path()).unwrap();
        partial.write_data(b"half").unwrap();
        partial.discard();
        assert!(!dir.path().join("b.txt").exists());
        assert!(dir.path().join("a.txt").exists());
    }

    #[test]
    fn clipboard_accumulates_in_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut recv = RecvAttachment::new(Attachment::clipboard(0, "clip.png", 4, 0));
        recv.open_handle(dir.path()).unwrap();
        recv.write_data(b"ab").unwrap();
        recv.write_data(b"cd").unwrap();
        recv.close_handle().unwrap();
        assert_eq!(recv.clipboard_data(), Some(&b"abcd"[..]));
        assert!(recv.save_path.is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn directory_and_marker_are_handle_trivial() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = RecvAttachment::new(Attachment::directory(0, "docs"));
        d.open_handle(dir.path()).unwrap();
        assert!(!d.is_open());
        assert!(dir.path().join("docs").is_dir());
        assert!(d.write_data(b"x").is_err());
        let mut r = RecvAttachment::new(Attachment::return_parent());
        r.open_handle(dir.path()).unwrap();
        r.close_handle().unwrap();
    }

    #[test]
    fn duplicate_file_ids_are_rejected() {
        let list = encode_descriptors(&[
            Attachment::regular(1, "a.txt", 1),
            Attachment::regular(1, "b.txt", 2),
        ]);
        assert!(matches!(
            decode_descriptors(&list),
            Err(DescriptorError::DuplicateId(1))
        ));
    }

    #[test]
    fn resumable_open_appends_to_shorter_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hel").unwrap();
        let mut recv = RecvAttachment::new(Attachment::regular(0, "a.txt", 5));
        assert_eq!(recv.open_resumable(dir.path()).unwrap(), 3);
        recv.write_data(b"lo").unwrap();
        recv.close_handle().unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"hello");

        // Already full length: start over.
        let mut again = RecvAttachment::new(Attachment::regular(0, "a.txt", 5));
        assert_eq!(again.open_resumable(dir.path()).unwrap(), 0);
        again.write_data(b"world").unwrap();
        again.close_handle().unwrap();
        assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"world");
    }
}
