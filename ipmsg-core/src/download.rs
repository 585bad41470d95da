//! Download state machine for one inbound transfer. The host owns the socket and feeds the
//! bytes it reads; the session writes them through attachment handles and reports progress.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use crate::attachment::{AttachmentKind, RecvAttachment};
use crate::lock;
use crate::peer::PeerKey;
use crate::transfer::{decode_stream_header, TransferRequest};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum DownloadState {
    #[default]
    Idle,
    Connecting,
    Transferring,
    Completed,
    Stopped,
    Failed,
}

impl DownloadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DownloadState::Completed | DownloadState::Stopped | DownloadState::Failed
        )
    }
}

/// Why a download ended without completing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum DownloadError {
    #[error("stopped by user")]
    UserStop,
    #[error("timed out")]
    Timeout,
    #[error("socket error: {0}")]
    Socket(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("peer disconnected")]
    Disconnected,
    #[error("communication error: {0}")]
    Communication(String),
    #[error("cannot open file: {0}")]
    FileOpen(String),
    #[error("invalid data received: {0}")]
    InvalidData(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

/// Progress counters. Always read and written as a whole.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub state: DownloadState,
    pub target_index: usize,
    pub total_targets: usize,
    pub downloaded_targets: usize,
    pub current_file: String,
    pub total_files: u64,
    pub downloaded_files: u64,
    pub total_dirs: u64,
    pub downloaded_dirs: u64,
    pub total_size: u64,
    pub downloaded_size: u64,
    pub failure: Option<DownloadError>,
}

/// Progress callbacks. Each receives the snapshot that includes the change being reported.
pub trait DownloadListener: Send + Sync {
    fn will_start(&self, _progress: &DownloadProgress) {}
    fn finished(&self, _progress: &DownloadProgress, _result: &Result<(), DownloadError>) {}
    fn target_index_changed(&self, _progress: &DownloadProgress) {}
    fn file_changed(&self, _progress: &DownloadProgress) {}
    fn file_count_changed(&self, _progress: &DownloadProgress) {}
    fn dir_count_changed(&self, _progress: &DownloadProgress) {}
    fn total_size_changed(&self, _progress: &DownloadProgress) {}
    fn downloaded_size_changed(&self, _progress: &DownloadProgress) {}
}

/// Listener that ignores everything.
pub struct NoopListener;

impl DownloadListener for NoopListener {}

/// Read-only view of a running download, shared between the worker and its owner.
#[derive(Debug)]
pub struct DownloaderContext {
    id: Uuid,
    packet_no: u64,
    peer: PeerKey,
    save_dir: PathBuf,
    progress: Mutex<DownloadProgress>,
    cancelled: AtomicBool,
}

impl DownloaderContext {
    pub fn new(packet_no: u64, peer: PeerKey, save_dir: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            packet_no,
            peer,
            save_dir,
            progress: Mutex::new(DownloadProgress::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Packet number of the message the attachments came with.
    pub fn packet_no(&self) -> u64 {
        self.packet_no
    }

    pub fn peer(&self) -> &PeerKey {
        &self.peer
    }

    pub fn save_dir(&self) -> &PathBuf {
        &self.save_dir
    }

    pub fn progress(&self) -> DownloadProgress {
        lock(&self.progress).clone()
    }

    pub fn state(&self) -> DownloadState {
        lock(&self.progress).state
    }

    /// Ask the worker to stop. It notices before its next write or request.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn update<F: FnOnce(&mut DownloadProgress)>(&self, f: F) -> DownloadProgress {
        let mut progress = lock(&self.progress);
        f(&mut progress);
        progress.clone()
    }
}

struct DirCursor {
    index: usize,
    buffer: Vec<u8>,
    stack: Vec<PathBuf>,
    file: Option<(RecvAttachment, u64)>,
    root_seen: bool,
    done: bool,
}

enum Current {
    File { index: usize, remaining: u64 },
    Directory(DirCursor),
}

/// Drives the requested attachments in order: `begin`, then per target `next_request`, `feed`
/// until `target_complete`, `close_target`; finally `complete` or `fail`.
pub struct DownloadSession {
    context: Arc<DownloaderContext>,
    listener: Arc<dyn DownloadListener>,
    targets: Vec<RecvAttachment>,
    next_target: usize,
    current: Option<Current>,
    finished: bool,
}

impl DownloadSession {
    pub fn new(
        context: Arc<DownloaderContext>,
        listener: Arc<dyn DownloadListener>,
        targets: Vec<RecvAttachment>,
    ) -> Self {
        context.update(|p| {
            p.total_targets = targets.len();
            for t in &targets {
                match t.attachment.kind {
                    AttachmentKind::Directory { .. } => p.total_dirs += 1,
                    AttachmentKind::ReturnParent => {}
                    _ => {
                        p.total_files += 1;
                        p.total_size += t.attachment.size;
                    }
                }
            }
        });
        Self {
            context,
            listener,
            targets,
            next_target: 0,
            current: None,
            finished: false,
        }
    }

    pub fn context(&self) -> &Arc<DownloaderContext> {
        &self.context
    }

    pub fn targets(&self) -> &[RecvAttachment] {
        &self.targets
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn notify(&self, progress: &DownloadProgress, f: impl FnOnce(&dyn DownloadListener, &DownloadProgress)) {
        if !self.finished {
            f(self.listener.as_ref(), progress);
        }
    }

    fn check_cancel(&self) -> Result<(), DownloadError> {
        if self.finished {
            return Err(DownloadError::Internal("download already finished".into()));
        }
        if self.context.is_cancelled() {
            return Err(DownloadError::UserStop);
        }
        Ok(())
    }

    /// Idle → Connecting.
    pub fn begin(&mut self) {
        let p = self.context.update(|p| p.state = DownloadState::Connecting);
        self.notify(&p, |l, p| l.will_start(p));
    }

    /// The sender's endpoint accepted the first connection: Connecting → Transferring.
    pub fn connected(&mut self) {
        self.context.update(|p| {
            if p.state == DownloadState::Connecting {
                p.state = DownloadState::Transferring;
            }
        });
    }

    /// Open the next target and return what to ask the sender for. `None` once every target
    /// has been transferred.
    pub fn next_request(&mut self) -> Result<Option<TransferRequest>, DownloadError> {
        self.check_cancel()?;
        if self.current.is_some() {
            return Err(DownloadError::Internal("previous target still open".into()));
        }
        let index = self.next_target;
        let Some(target) = self.targets.get_mut(index) else {
            return Ok(None);
        };
        self.next_target += 1;
        let offset = target
            .open_resumable(&self.context.save_dir)
            .map_err(|e| DownloadError::FileOpen(e.to_string()))?;
        let name = target.attachment.name.clone();
        let file_id = target.attachment.file_id;
        let (request, current) = match target.attachment.kind {
            AttachmentKind::Directory { .. } => (
                TransferRequest::directory(self.context.packet_no, file_id),
                Current::Directory(DirCursor {
                    index,
                    buffer: Vec::new(),
                    stack: Vec::new(),
                    file: None,
                    root_seen: false,
                    done: false,
                }),
            ),
            AttachmentKind::ReturnParent => {
                return Err(DownloadError::InvalidData("return-parent requested".into()))
            }
            _ => (
                TransferRequest::file(self.context.packet_no, file_id, offset),
                Current::File {
                    index,
                    remaining: target.attachment.size - offset,
                },
            ),
        };
        self.current = Some(current);
        let p = self.context.update(|p| {
            p.target_index = index;
            p.current_file = name;
        });
        self.notify(&p, |l, p| l.target_index_changed(p));
        self.notify(&p, |l, p| l.file_changed(p));
        if offset > 0 {
            let p = self.context.update(|p| p.downloaded_size += offset);
            self.notify(&p, |l, p| l.downloaded_size_changed(p));
        }
        Ok(Some(request))
    }

    /// Every byte of the current target has arrived.
    pub fn target_complete(&self) -> bool {
        match &self.current {
            Some(Current::File { remaining, .. }) => *remaining == 0,
            Some(Current::Directory(cursor)) => cursor.done,
            None => false,
        }
    }

    /// Bytes read from the sender for the current target, in stream order.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), DownloadError> {
        self.check_cancel()?;
        match self.current.take() {
            Some(Current::File { index, remaining }) => {
                let result = self.feed_file(index, remaining, bytes);
                let remaining = match &result {
                    Ok(()) => remaining - bytes.len() as u64,
                    Err(_) => remaining,
                };
                self.current = Some(Current::File { index, remaining });
                result
            }
            Some(Current::Directory(mut cursor)) => {
                let result = self.feed_directory(&mut cursor, bytes);
                self.current = Some(Current::Directory(cursor));
                result
            }
            None => Err(DownloadError::Internal("no target open".into())),
        }
    }

    fn feed_file(&mut self, index: usize, remaining: u64, bytes: &[u8]) -> Result<(), DownloadError> {
        if bytes.len() as u64 > remaining {
            return Err(DownloadError::InvalidData(
                "more bytes than the declared size".into(),
            ));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.targets[index]
            .write_data(bytes)
            .map_err(|e| DownloadError::Internal(e.to_string()))?;
        let p = self
            .context
            .update(|p| p.downloaded_size += bytes.len() as u64);
        self.notify(&p, |l, p| l.downloaded_size_changed(p));
        Ok(())
    }

    fn feed_directory(&mut self, cursor: &mut DirCursor, bytes: &[u8]) -> Result<(), DownloadError> {
        cursor.buffer.extend_from_slice(bytes);
        let mut pos = 0;
        let result = loop {
            if let Some((file, remaining)) = cursor.file.as_mut() {
                let take = (*remaining).min((cursor.buffer.len() - pos) as u64) as usize;
                if take == 0 && *remaining > 0 {
                    break Ok(());
                }
                if let Err(e) = file.write_data(&cursor.buffer[pos..pos + take]) {
                    break Err(DownloadError::Internal(e.to_string()));
                }
                pos += take;
                *remaining -= take as u64;
                if take > 0 {
                    let p = self.context.update(|p| p.downloaded_size += take as u64);
                    self.notify(&p, |l, p| l.downloaded_size_changed(p));
                }
                if *remaining == 0 {
                    if let Some((mut file, _)) = cursor.file.take() {
                        if let Err(e) = file.close_handle() {
                            break Err(DownloadError::Internal(e.to_string()));
                        }
                        file.downloaded = true;
                    }
                    let p = self.context.update(|p| p.downloaded_files += 1);
                    self.notify(&p, |l, p| l.file_count_changed(p));
                }
                continue;
            }
            if cursor.done {
                if pos < cursor.buffer.len() {
                    break Err(DownloadError::InvalidData(
                        "data after the end of the directory".into(),
                    ));
                }
                break Ok(());
            }
            match decode_stream_header(&cursor.buffer[pos..]) {
                Ok(None) => break Ok(()),
                Err(e) => break Err(DownloadError::InvalidData(e.to_string())),
                Ok(Some((header, used))) => {
                    pos += used;
                    if let Err(e) = self.enter_entry(cursor, RecvAttachment::new(header.attachment)) {
                        break Err(e);
                    }
                }
            }
        };
        cursor.buffer.drain(..pos);
        result
    }

    fn enter_entry(&mut self, cursor: &mut DirCursor, mut entry: RecvAttachment) -> Result<(), DownloadError> {
        if !cursor.root_seen {
            if !entry.attachment.is_directory() {
                return Err(DownloadError::InvalidData(
                    "directory stream must start with the directory".into(),
                ));
            }
            cursor.root_seen = true;
            let root = self.targets[cursor.index]
                .save_path
                .clone()
                .ok_or_else(|| DownloadError::Internal("directory target not opened".into()))?;
            cursor.stack.push(root);
            return Ok(());
        }
        let parent = cursor
            .stack
            .last()
            .cloned()
            .ok_or_else(|| DownloadError::InvalidData("entry outside the directory".into()))?;
        match entry.attachment.kind {
            AttachmentKind::Directory { .. } => {
                entry
                    .open_handle(&parent)
                    .map_err(|e| DownloadError::FileOpen(e.to_string()))?;
                let path = entry
                    .save_path
                    .clone()
                    .ok_or_else(|| DownloadError::Internal("directory has no path".into()))?;
                cursor.stack.push(path);
                let p = self.context.update(|p| {
                    p.total_dirs += 1;
                    p.current_file = entry.attachment.name.clone();
                });
                self.notify(&p, |l, p| l.dir_count_changed(p));
                self.notify(&p, |l, p| l.file_changed(p));
            }
            AttachmentKind::ReturnParent => {
                cursor.stack.pop();
                let p = self.context.update(|p| p.downloaded_dirs += 1);
                self.notify(&p, |l, p| l.dir_count_changed(p));
                if cursor.stack.is_empty() {
                    cursor.done = true;
                }
            }
            AttachmentKind::RegularFile { .. } => {
                entry
                    .open_handle(&parent)
                    .map_err(|e| DownloadError::FileOpen(e.to_string()))?;
                let size = entry.attachment.size;
                let p = self.context.update(|p| {
                    p.total_files += 1;
                    p.total_size += size;
                    p.current_file = entry.attachment.name.clone();
                });
                self.notify(&p, |l, p| l.file_count_changed(p));
                self.notify(&p, |l, p| l.total_size_changed(p));
                self.notify(&p, |l, p| l.file_changed(p));
                if size == 0 {
                    entry
                        .close_handle()
                        .map_err(|e| DownloadError::Internal(e.to_string()))?;
                    let p = self.context.update(|p| p.downloaded_files += 1);
                    self.notify(&p, |l, p| l.file_count_changed(p));
                } else {
                    cursor.file = Some((entry, size));
                }
            }
            AttachmentKind::Clipboard { .. } => {
                return Err(DownloadError::InvalidData(
                    "clipboard entry inside a directory".into(),
                ))
            }
        }
        Ok(())
    }

    /// Close the finished target and count it.
    pub fn close_target(&mut self) -> Result<(), DownloadError> {
        if !self.target_complete() {
            return Err(DownloadError::Internal("target not complete".into()));
        }
        let index = match self.current.take() {
            Some(Current::File { index, .. }) => {
                self.targets[index]
                    .close_handle()
                    .map_err(|e| DownloadError::Internal(e.to_string()))?;
                let p = self.context.update(|p| p.downloaded_files += 1);
                self.notify(&p, |l, p| l.file_count_changed(p));
                index
            }
            Some(Current::Directory(cursor)) => cursor.index,
            None => return Err(DownloadError::Internal("no target open".into())),
        };
        self.targets[index].downloaded = true;
        self.context.update(|p| p.downloaded_targets += 1);
        Ok(())
    }

    /// All targets transferred: Completed, provided the byte counts add up.
    pub fn complete(&mut self) -> Result<(), DownloadError> {
        if self.finished {
            return Err(DownloadError::Internal("download already finished".into()));
        }
        if self.current.is_some() || self.next_target < self.targets.len() {
            let err = DownloadError::Internal("targets remain".into());
            self.fail(err.clone());
            return Err(err);
        }
        let p = self.context.progress();
        if p.downloaded_size != p.total_size {
            let err = DownloadError::SizeMismatch {
                expected: p.total_size,
                actual: p.downloaded_size,
            };
            self.fail(err.clone());
            return Err(err);
        }
        let p = self.context.update(|p| p.state = DownloadState::Completed);
        self.finished = true;
        self.listener.finished(&p, &Ok(()));
        Ok(())
    }

    /// Terminate: Stopped for `UserStop`, Failed otherwise. A stop deletes the partial output
    /// of the in-flight file; a failure leaves it for a later download to resume. Files already
    /// completed stay. `finished` fires once and nothing after it.
    pub fn fail(&mut self, err: DownloadError) {
        if self.finished {
            return;
        }
        let state = if err == DownloadError::UserStop {
            self.discard_current();
            DownloadState::Stopped
        } else {
            self.suspend_current();
            DownloadState::Failed
        };
        let p = self.context.update(|p| {
            p.state = state;
            p.failure = Some(err.clone());
        });
        self.finished = true;
        self.listener.finished(&p, &Err(err));
    }

    pub fn stop(&mut self) {
        self.fail(DownloadError::UserStop);
    }

    fn discard_current(&mut self) {
        match self.current.take() {
            Some(Current::File { index, .. }) => self.targets[index].discard(),
            Some(Current::Directory(mut cursor)) => {
                if let Some((mut file, _)) = cursor.file.take() {
                    file.discard();
                }
            }
            None => {}
        }
    }

    fn suspend_current(&mut self) {
        match self.current.take() {
            Some(Current::File { index, .. }) => self.targets[index].suspend(),
            Some(Current::Directory(mut cursor)) => {
                if let Some((mut file, _)) = cursor.file.take() {
                    file.suspend();
                }
            }
            None => {}
        }
    }

    pub fn into_targets(mut self) -> Vec<RecvAttachment> {
        std::mem::take(&mut self.targets)
    }
}

impl Drop for DownloadSession {
    fn drop(&mut self) {
        if !self.finished {
            self.discard_current();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::Attachment;
    use crate::transfer::encode_stream_header;
    use std::fs;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(&'static str, DownloadProgress)>>,
    }

    impl Recorder {
        fn push(&self, name: &'static str, p: &DownloadProgress) {
            lock(&self.events).push((name, p.clone()));
        }

        fn names(&self) -> Vec<&'static str> {
            lock(&self.events).iter().map(|(n, _)| *n).collect()
        }
    }

    impl DownloadListener for Recorder {
        fn will_start(&self, p: &DownloadProgress) {
            self.push("start", p);
        }
        fn finished(&self, p: &DownloadProgress, _r: &Result<(), DownloadError>) {
            self.push("finished", p);
        }
        fn target_index_changed(&self, p: &DownloadProgress) {
            self.push("target", p);
        }
        fn file_changed(&self, p: &DownloadProgress) {
            self.push("file", p);
        }
        fn file_count_changed(&self, p: &DownloadProgress) {
            self.push("files", p);
        }
        fn dir_count_changed(&self, p: &DownloadProgress) {
            self.push("dirs", p);
        }
        fn total_size_changed(&self, p: &DownloadProgress) {
            self.push("total", p);
        }
        fn downloaded_size_changed(&self, p: &DownloadProgress) {
            self.push("size", p);
        }
    }

    fn session(
        dir: &std::path::Path,
        targets: Vec<Attachment>,
    ) -> (DownloadSession, Arc<Recorder>) {
        let ctx = Arc::new(DownloaderContext::new(
            0x42,
            PeerKey::new("bob", ([127, 0, 0, 1], 2425).into()),
            dir.to_path_buf(),
        ));
        let recorder = Arc::new(Recorder::default());
        let targets = targets.into_iter().map(RecvAttachment::new).collect();
        (DownloadSession::new(ctx, recorder.clone(), targets), recorder)
    }

    fn dir_stream() -> Vec<u8> {
        let mut out = encode_stream_header(&Attachment::directory(0, "docs")).unwrap();
        out.extend(encode_stream_header(&Attachment::regular(0, "b.txt", 50)).unwrap());
        out.extend(vec![b'b'; 50]);
        out.extend(encode_stream_header(&Attachment::return_parent()).unwrap());
        out
    }

    fn run_file(s: &mut DownloadSession, data: &[u8]) {
        let req = s.next_request().unwrap().unwrap();
        assert!(!req.directory);
        s.feed(data).unwrap();
        assert!(s.target_complete());
        s.close_target().unwrap();
    }

    #[test]
    fn file_and_directory_scenario_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut s, rec) = session(
            tmp.path(),
            vec![Attachment::regular(0, "a.txt", 100), Attachment::directory(1, "docs")],
        );
        s.begin();
        s.connected();
        assert_eq!(s.context().state(), DownloadState::Transferring);
        run_file(&mut s, &[b'a'; 100]);

        let req = s.next_request().unwrap().unwrap();
        assert_eq!(req, TransferRequest::directory(0x42, 1));
        for piece in dir_stream().chunks(7) {
            assert!(!s.target_complete());
            s.feed(piece).unwrap();
        }
        assert!(s.target_complete());
        s.close_target().unwrap();
        assert_eq!(s.next_request().unwrap(), None);
        s.complete().unwrap();

        let p = s.context().progress();
        assert_eq!(p.state, DownloadState::Completed);
        assert_eq!(p.downloaded_files, 2);
        assert_eq!(p.downloaded_dirs, 1);
        assert_eq!(p.downloaded_size, 150);
        assert_eq!(p.total_size, 150);
        assert_eq!(fs::read(tmp.path().join("a.txt")).unwrap().len(), 100);
        assert_eq!(fs::read(tmp.path().join("docs/b.txt")).unwrap(), vec![b'b'; 50]);
        assert_eq!(rec.names().last(), Some(&"finished"));
        assert!(s.targets().iter().all(|t| t.downloaded));
    }

    #[test]
    fn progress_is_monotonic() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut s, rec) = session(
            tmp.path(),
            vec![Attachment::regular(0, "a.txt", 100), Attachment::directory(1, "docs")],
        );
        s.begin();
        s.connected();
        let req = s.next_request().unwrap();
        assert!(req.is_some());
        for piece in [[b'a'; 10]; 10] {
            s.feed(&piece).unwrap();
        }
        s.close_target().unwrap();
        s.next_request().unwrap();
        for piece in dir_stream().chunks(3) {
            s.feed(piece).unwrap();
        }
        s.close_target().unwrap();
        s.complete().unwrap();
        let events = lock(&rec.events);
        for pair in events.windows(2) {
            let (a, b) = (&pair[0].1, &pair[1].1);
            assert!(b.downloaded_size >= a.downloaded_size);
            assert!(b.downloaded_files >= a.downloaded_files);
            assert!(b.downloaded_dirs >= a.downloaded_dirs);
            assert!(b.total_size >= a.total_size);
            assert!(b.total_files >= a.total_files);
        }
        for (name, p) in events.iter() {
            if *name != "finished" {
                assert_ne!(p.state, DownloadState::Completed);
            }
        }
    }

    #[test]
    fn stop_mid_second_file_keeps_first_and_goes_silent() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut s, rec) = session(
            tmp.path(),
            vec![
                Attachment::regular(0, "one.txt", 10),
                Attachment::regular(1, "two.txt", 10),
                Attachment::regular(2, "three.txt", 10),
            ],
        );
        s.begin();
        s.connected();
        run_file(&mut s, &[1; 10]);
        s.next_request().unwrap();
        s.feed(&[2; 4]).unwrap();

        s.context().cancel();
        let err = s.feed(&[2; 4]).unwrap_err();
        assert_eq!(err, DownloadError::UserStop);
        s.fail(err);
        let seen = rec.names().len();
        assert_eq!(rec.names().last(), Some(&"finished"));

        assert!(s.feed(&[2; 2]).is_err());
        assert!(s.next_request().is_err());
        s.stop();
        assert_eq!(rec.names().len(), seen);

        let p = s.context().progress();
        assert_eq!(p.state, DownloadState::Stopped);
        assert_eq!(p.failure, Some(DownloadError::UserStop));
        assert_eq!(fs::read(tmp.path().join("one.txt")).unwrap(), vec![1; 10]);
        assert!(!tmp.path().join("two.txt").exists());
        assert!(!tmp.path().join("three.txt").exists());
    }

    #[test]
    fn overflow_and_traversal_are_invalid_data() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut s, _) = session(tmp.path(), vec![Attachment::regular(0, "a.txt", 3)]);
        s.begin();
        s.next_request().unwrap();
        assert!(matches!(s.feed(b"abcd"), Err(DownloadError::InvalidData(_))));

        let (mut s, _) = session(tmp.path(), vec![Attachment::directory(0, "d")]);
        s.begin();
        s.next_request().unwrap();
        let mut stream = encode_stream_header(&Attachment::directory(0, "d")).unwrap();
        stream.extend_from_slice(b"000c:..:1:1:");
        assert!(matches!(s.feed(&stream), Err(DownloadError::InvalidData(_))));
    }

    #[test]
    fn short_transfer_is_size_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut s, _) = session(tmp.path(), vec![Attachment::directory(0, "d")]);
        s.begin();
        s.next_request().unwrap();
        let mut stream = encode_stream_header(&Attachment::directory(0, "d")).unwrap();
        stream.extend(encode_stream_header(&Attachment::return_parent()).unwrap());
        s.feed(&stream).unwrap();
        s.close_target().unwrap();
        // Declared more than was delivered.
        s.context().update(|p| p.total_size += 5);
        assert!(matches!(
            s.complete(),
            Err(DownloadError::SizeMismatch { expected: 5, actual: 0 })
        ));
        assert_eq!(s.context().state(), DownloadState::Failed);
    }

    #[test]
    fn clipboard_target_lands_in_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut s, _) = session(tmp.path(), vec![Attachment::clipboard(0, "c.png", 3, 0)]);
        s.begin();
        run_file(&mut s, b"png");
        s.complete().unwrap();
        let targets = s.into_targets();
        assert_eq!(targets[0].clipboard_data(), Some(&b"png"[..]));
    }

    #[test]
    fn failure_keeps_partial_file_and_next_download_resumes() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut s, _) = session(tmp.path(), vec![Attachment::regular(3, "big.bin", 100)]);
        s.begin();
        s.connected();
        assert_eq!(s.next_request().unwrap(), Some(TransferRequest::file(0x42, 3, 0)));
        s.feed(&[7; 30]).unwrap();
        s.fail(DownloadError::Disconnected);
        assert_eq!(s.context().state(), DownloadState::Failed);
        assert_eq!(fs::read(tmp.path().join("big.bin")).unwrap(), vec![7; 30]);

        let (mut s, _) = session(tmp.path(), vec![Attachment::regular(3, "big.bin", 100)]);
        s.begin();
        s.connected();
        assert_eq!(s.next_request().unwrap(), Some(TransferRequest::file(0x42, 3, 30)));
        assert_eq!(s.context().progress().downloaded_size, 30);
        s.feed(&[7; 70]).unwrap();
        assert!(s.target_complete());
        s.close_target().unwrap();
        assert_eq!(s.next_request().unwrap(), None);
        s.complete().unwrap();
        assert_eq!(fs::read(tmp.path().join("big.bin")).unwrap(), vec![7; 100]);
        assert_eq!(s.context().progress().downloaded_size, 100);
    }

    #[test]
    fn target_counters_follow_closed_targets() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut s, _) = session(
            tmp.path(),
            vec![Attachment::regular(0, "a.txt", 2), Attachment::regular(1, "b.txt", 2)],
        );
        assert_eq!(s.context().progress().total_targets, 2);
        s.begin();
        run_file(&mut s, b"aa");
        assert_eq!(s.context().progress().downloaded_targets, 1);
        run_file(&mut s, b"bb");
        s.complete().unwrap();
        let p = s.context().progress();
        assert_eq!((p.downloaded_targets, p.total_targets), (2, 2));
    }
}
