//! The asynchronous disk log writer.
//!
//! A dedicated task owns the segment files and a queue of write
//! requests. Submissions return immediately with a completion receiver;
//! completions are delivered **in submission order** no matter which
//! order the kernel finishes them in, because the consensus layer's
//! acknowledgement logic depends on it.
//!
//! Submission path on Linux: kernel AIO with eventfd completion
//! (see [`crate::aio`]); a would-block submit falls back to a worker
//! thread. Elsewhere, or when AIO is unavailable, every write goes
//! through `spawn_blocking` with an explicit data sync.
//!
//! Each request moves through `submitted -> in_flight -> completed`;
//! completion events arrive over an internal channel (worker threads and
//! the eventfd watcher both post to it) and acknowledgements are
//! released strictly from the front of the in-flight queue.
//!
//! Any I/O error latches the writer: the failed request and everything
//! after it complete with the error until a fresh writer is built over a
//! repaired directory.

use crate::probe::WriteCapabilities;
use crate::segment::{
    self, AlignedBuf, BatchInfo, ClosedSegment, OpenSegmentInfo, SegmentFiles,
    closed_segment_name, open_segment_name,
};
use common::{Entry, LogIndex, RaftError, RaftResult};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

/// Receives the terminal status of one submitted write.
pub type WriteCompletion = oneshot::Receiver<RaftResult<()>>;

/// Ceiling on concurrently submitted disk writes.
const MAX_INFLIGHT_WRITES: usize = 64;

enum Cmd {
    Append {
        entries: Vec<Entry>,
        done: oneshot::Sender<RaftResult<()>>,
    },
    TruncateSuffix {
        from: LogIndex,
        done: oneshot::Sender<RaftResult<()>>,
    },
    CompactThrough {
        index: LogIndex,
        done: oneshot::Sender<RaftResult<()>>,
    },
    Reset {
        next_index: LogIndex,
        done: oneshot::Sender<RaftResult<()>>,
    },
    Close {
        done: oneshot::Sender<RaftResult<()>>,
    },
}

enum Completion {
    Write(u64, io::Result<()>),
    /// The eventfd watcher died; every AIO submission still in flight is
    /// lost.
    AioFailed(io::Error),
}

/// Handle to the writer task.
pub struct LogWriter {
    tx: mpsc::UnboundedSender<Cmd>,
}

impl LogWriter {
    /// Take ownership of the segment files found by a directory scan and
    /// start the writer task.
    ///
    /// Stale `open-N` files (anything but the newest) are finalized or
    /// deleted first; the newest is adopted as the write tail, or a fresh
    /// one is created. `next_index` is the index the first append must
    /// carry.
    pub fn open(
        dir: PathBuf,
        segment_size: u64,
        caps: WriteCapabilities,
        mut scan: SegmentFiles,
        next_index: LogIndex,
    ) -> RaftResult<Self> {
        let mut closed = std::mem::take(&mut scan.closed);
        let mut opens = std::mem::take(&mut scan.open);
        let newest = opens.pop();
        let mut max_seq = newest.as_ref().map(|o| o.seq).unwrap_or(0);

        // A crash can leave an older open segment behind after its
        // successor was created but before the rename landed.
        for stale in opens {
            max_seq = max_seq.max(stale.seq);
            if let (Some(first), Some(last)) = (
                stale.batches.first().map(|b| b.first_index),
                stale.batches.last().map(|b| b.last_index),
            ) {
                let target = dir.join(closed_segment_name(first, last));
                let file = OpenOptions::new().write(true).open(&stale.path)?;
                file.set_len(stale.next_offset)?;
                file.sync_all()?;
                fs::rename(&stale.path, &target)?;
                closed.push(ClosedSegment {
                    path: target,
                    first,
                    last,
                    batches: stale.batches,
                    entries: Vec::new(),
                });
            } else {
                fs::remove_file(&stale.path)?;
            }
        }
        segment::sync_dir(&dir)?;
        closed.sort_by_key(|s| s.first);
        for seg in &mut closed {
            // Recovery has read these already; the writer only needs the
            // file geometry.
            seg.entries = Vec::new();
        }

        let open = match newest {
            Some(info) => OpenSegment::adopt(info, segment_size, caps)?,
            None => OpenSegment::create(&dir, max_seq + 1, segment_size, caps)?,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (comp_tx, comp_rx) = mpsc::unbounded_channel();

        #[cfg(target_os = "linux")]
        let aio = if caps.aio {
            match crate::aio::AioContext::new(MAX_INFLIGHT_WRITES as u32) {
                Ok(ctx) => {
                    let ctx = std::sync::Arc::new(ctx);
                    spawn_eventfd_watcher(ctx.clone(), comp_tx.clone());
                    Some(ctx)
                }
                Err(err) => {
                    tracing::warn!(%err, "kernel AIO unavailable, using worker threads");
                    None
                }
            }
        } else {
            None
        };

        let task = WriterTask {
            dir,
            segment_size,
            caps,
            open,
            closed,
            inflight: VecDeque::new(),
            comp_tx,
            #[cfg(target_os = "linux")]
            aio,
            next_id: 0,
            next_index,
            error: None,
        };
        tokio::spawn(task.run(rx, comp_rx));
        Ok(Self { tx })
    }

    /// Queue a contiguous batch for durable append.
    pub fn append(&self, entries: Vec<Entry>) -> WriteCompletion {
        self.submit(|done| Cmd::Append { entries, done })
    }

    /// Queue removal of every entry at or after `from`.
    pub fn truncate_suffix(&self, from: LogIndex) -> WriteCompletion {
        self.submit(|done| Cmd::TruncateSuffix { from, done })
    }

    /// Queue deletion of segments made obsolete by a snapshot at `index`.
    pub fn compact_through(&self, index: LogIndex) -> WriteCompletion {
        self.submit(|done| Cmd::CompactThrough { index, done })
    }

    /// Drop every segment and restart the log at `next_index`.
    ///
    /// Used after an installed snapshot supersedes the entire log.
    pub fn reset(&self, next_index: LogIndex) -> WriteCompletion {
        self.submit(|done| Cmd::Reset { next_index, done })
    }

    /// Stop accepting submissions, await outstanding writes, release
    /// descriptors.
    pub async fn close(self) -> RaftResult<()> {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Cmd::Close { done }).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    fn submit(&self, build: impl FnOnce(oneshot::Sender<RaftResult<()>>) -> Cmd) -> WriteCompletion {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(build(done)) {
            let done = match cmd {
                Cmd::Append { done, .. }
                | Cmd::TruncateSuffix { done, .. }
                | Cmd::CompactThrough { done, .. }
                | Cmd::Reset { done, .. }
                | Cmd::Close { done } => done,
            };
            let _ = done.send(Err(RaftError::Shutdown));
        }
        rx
    }
}

/// Forward eventfd wakes as completion events.
///
/// The eventfd read value is advisory only: every wake drains the whole
/// completion ring. The watcher exits when the writer task goes away.
#[cfg(target_os = "linux")]
fn spawn_eventfd_watcher(
    ctx: std::sync::Arc<crate::aio::AioContext>,
    comp_tx: mpsc::UnboundedSender<Completion>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                ready = ctx.ready() => {
                    if let Err(err) = ready {
                        let _ = comp_tx.send(Completion::AioFailed(err));
                        return;
                    }
                    match ctx.drain() {
                        Ok(events) => {
                            for event in events {
                                let result = if event.res < 0 {
                                    Err(io::Error::from_raw_os_error(-event.res as i32))
                                } else {
                                    Ok(())
                                };
                                if comp_tx.send(Completion::Write(event.data, result)).is_err() {
                                    return;
                                }
                            }
                        }
                        Err(err) => {
                            let _ = comp_tx.send(Completion::AioFailed(err));
                            return;
                        }
                    }
                }
                () = comp_tx.closed() => return,
            }
        }
    });
}

struct OpenSegment {
    file: File,
    path: PathBuf,
    seq: u64,
    size: u64,
    next_offset: u64,
    batches: Vec<BatchInfo>,
    /// File opened `O_DSYNC`, so writes need no explicit sync.
    file_syncs: bool,
}

impl OpenSegment {
    fn open_options(caps: WriteCapabilities) -> (OpenOptions, bool) {
        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(false);
        let mut file_syncs = false;
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut flags = 0;
            #[cfg(target_os = "linux")]
            if caps.direct {
                flags |= libc::O_DIRECT;
            }
            if !caps.dsync {
                flags |= libc::O_DSYNC;
                file_syncs = true;
            }
            options.custom_flags(flags);
        }
        #[cfg(not(unix))]
        let _ = caps;
        (options, file_syncs)
    }

    fn create(
        dir: &std::path::Path,
        seq: u64,
        size: u64,
        caps: WriteCapabilities,
    ) -> RaftResult<Self> {
        let path = dir.join(open_segment_name(seq));
        let (options, file_syncs) = Self::open_options(caps);
        let file = options.open(&path)?;
        segment::preallocate(&file, size)?;
        file.sync_all()?;
        segment::sync_dir(dir)?;
        Ok(Self {
            file,
            path,
            seq,
            size,
            next_offset: 0,
            batches: Vec::new(),
            file_syncs,
        })
    }

    fn adopt(info: OpenSegmentInfo, configured_size: u64, caps: WriteCapabilities) -> RaftResult<Self> {
        let (options, file_syncs) = Self::open_options(caps);
        let file = options.open(&info.path)?;
        let size = file.metadata()?.len().max(configured_size);
        if file.metadata()?.len() < size {
            segment::preallocate(&file, size)?;
        }
        Ok(Self {
            file,
            path: info.path,
            seq: info.seq,
            size,
            next_offset: info.next_offset,
            batches: info.batches,
            file_syncs,
        })
    }

    fn first_index(&self) -> Option<LogIndex> {
        self.batches.first().map(|b| b.first_index)
    }

    fn last_index(&self) -> Option<LogIndex> {
        self.batches.last().map(|b| b.last_index)
    }
}

struct Inflight {
    id: u64,
    done: Option<oneshot::Sender<RaftResult<()>>>,
    result: Option<io::Result<()>>,
    /// Keeps the AIO buffer alive until the kernel is done with it.
    aio_buf: Option<AlignedBuf>,
}

struct WriterTask {
    dir: PathBuf,
    segment_size: u64,
    caps: WriteCapabilities,
    open: OpenSegment,
    closed: Vec<ClosedSegment>,
    inflight: VecDeque<Inflight>,
    comp_tx: mpsc::UnboundedSender<Completion>,
    #[cfg(target_os = "linux")]
    aio: Option<std::sync::Arc<crate::aio::AioContext>>,
    next_id: u64,
    /// Index the next appended entry must carry.
    next_index: LogIndex,
    error: Option<(io::ErrorKind, String)>,
}

impl WriterTask {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Cmd>,
        mut comp_rx: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            tokio::select! {
                biased;

                Some(completion) = comp_rx.recv(), if !self.inflight.is_empty() => {
                    self.record_completion(completion);
                    self.flush_completions();
                }

                cmd = rx.recv() => match cmd {
                    Some(Cmd::Append { entries, done }) => {
                        self.handle_append(entries, done, &mut comp_rx).await;
                    }
                    Some(Cmd::TruncateSuffix { from, done }) => {
                        self.drain_all(&mut comp_rx).await;
                        let result = self.handle_truncate(from);
                        let _ = done.send(result);
                    }
                    Some(Cmd::CompactThrough { index, done }) => {
                        self.drain_all(&mut comp_rx).await;
                        let result = self.handle_compact(index);
                        let _ = done.send(result);
                    }
                    Some(Cmd::Reset { next_index, done }) => {
                        self.drain_all(&mut comp_rx).await;
                        let result = self.handle_reset(next_index);
                        let _ = done.send(result);
                    }
                    Some(Cmd::Close { done }) => {
                        self.drain_all(&mut comp_rx).await;
                        let _ = done.send(self.latched().map_or(Ok(()), Err));
                        break;
                    }
                    None => {
                        self.drain_all(&mut comp_rx).await;
                        break;
                    }
                },
            }
        }
    }

    fn latched(&self) -> Option<RaftError> {
        self.error
            .as_ref()
            .map(|(kind, msg)| RaftError::Io(io::Error::new(*kind, msg.clone())))
    }

    fn latch(&mut self, kind: io::ErrorKind, msg: String) {
        if self.error.is_none() {
            tracing::error!(%msg, "disk writer latched into error state");
            self.error = Some((kind, msg));
        }
    }

    async fn handle_append(
        &mut self,
        entries: Vec<Entry>,
        done: oneshot::Sender<RaftResult<()>>,
        comp_rx: &mut mpsc::UnboundedReceiver<Completion>,
    ) {
        if let Some(err) = self.latched() {
            let _ = done.send(Err(err));
            return;
        }
        assert!(!entries.is_empty(), "empty append batch");
        assert_eq!(
            entries[0].index, self.next_index,
            "append must continue the log tail"
        );

        let batch = match segment::encode_batch(&entries) {
            Ok(batch) => batch,
            Err(err) => {
                let _ = done.send(Err(err));
                return;
            }
        };
        let len = batch.len() as u64;

        if self.open.next_offset + len > self.open.size {
            // A roll renames and shrinks the old file; wait out writes
            // still targeting it.
            self.drain_all(comp_rx).await;
            if let Some(err) = self.latched() {
                let _ = done.send(Err(err));
                return;
            }
            if let Err(err) = self.roll_segment(len) {
                self.latch(err.kind(), err.to_string());
                let _ = done.send(Err(self.latched().unwrap()));
                return;
            }
        }
        let info = BatchInfo {
            offset: self.open.next_offset,
            len,
            first_index: entries[0].index,
            last_index: entries[entries.len() - 1].index,
        };

        if self.inflight.len() >= MAX_INFLIGHT_WRITES {
            self.drain_one(comp_rx).await;
            self.flush_completions();
        }

        let id = self.next_id;
        self.next_id += 1;
        self.next_index = info.last_index + 1;
        self.open.next_offset = info.offset + info.len;
        self.open.batches.push(info.clone());

        #[cfg(target_os = "linux")]
        if let Some(aio) = self.aio.clone() {
            use crate::aio;
            use std::os::fd::AsRawFd;

            let mut rw_flags = 0;
            if self.caps.dsync {
                rw_flags |= aio::RWF_DSYNC;
            }
            if self.caps.nowait {
                rw_flags |= aio::RWF_NOWAIT;
            }
            if self.caps.hipri {
                rw_flags |= aio::RWF_HIPRI;
            }
            let mut iocb = aio::write_iocb(
                id,
                self.open.file.as_raw_fd(),
                batch.as_slice(),
                info.offset,
                rw_flags,
            );
            match aio.submit(&mut iocb) {
                Ok(()) => {
                    self.inflight.push_back(Inflight {
                        id,
                        done: Some(done),
                        result: None,
                        aio_buf: Some(batch),
                    });
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Kernel queue full or a NOWAIT refusal: worker path.
                }
                Err(err) => {
                    self.latch(err.kind(), err.to_string());
                    let _ = done.send(Err(self.latched().unwrap()));
                    return;
                }
            }
        }

        self.submit_worker(id, batch, info.offset, done);
    }

    fn submit_worker(
        &mut self,
        id: u64,
        batch: AlignedBuf,
        offset: u64,
        done: oneshot::Sender<RaftResult<()>>,
    ) {
        let file = match self.open.file.try_clone() {
            Ok(file) => file,
            Err(err) => {
                self.latch(err.kind(), err.to_string());
                let _ = done.send(Err(self.latched().unwrap()));
                return;
            }
        };
        let needs_sync = !self.open.file_syncs;
        let comp_tx = self.comp_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = write_all_at(&file, batch.as_slice(), offset).and_then(|()| {
                if needs_sync { file.sync_data() } else { Ok(()) }
            });
            let _ = comp_tx.send(Completion::Write(id, result));
        });
        self.inflight.push_back(Inflight {
            id,
            done: Some(done),
            result: None,
            aio_buf: None,
        });
    }

    fn roll_segment(&mut self, needed: u64) -> io::Result<()> {
        let seq = self.open.seq + 1;
        if self.open.batches.is_empty() {
            // Nothing written; replace with a segment large enough.
            fs::remove_file(&self.open.path)?;
        } else {
            let first = self.open.first_index().unwrap();
            let last = self.open.last_index().unwrap();
            let target = self.dir.join(closed_segment_name(first, last));
            self.open.file.set_len(self.open.next_offset)?;
            self.open.file.sync_all()?;
            fs::rename(&self.open.path, &target)?;
            let batches = std::mem::take(&mut self.open.batches);
            self.closed.push(ClosedSegment {
                path: target,
                first,
                last,
                batches,
                entries: Vec::new(),
            });
        }
        let size = self.segment_size.max(needed);
        let fresh = OpenSegment::create(&self.dir, seq, size, self.caps)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.open = fresh;
        tracing::debug!(seq, size, "rolled to a new open segment");
        Ok(())
    }

    fn handle_truncate(&mut self, from: LogIndex) -> RaftResult<()> {
        if let Some(err) = self.latched() {
            return Err(err);
        }
        assert!(from <= self.next_index, "truncate beyond the log tail");
        tracing::debug!(from, "truncating log suffix");

        // Open segment first: it always holds the newest entries.
        if self.open.first_index().is_some_and(|first| from <= first) {
            // Everything in the open segment goes; recreate rather than
            // shrink under a direct-I/O handle.
            fs::remove_file(&self.open.path)?;
            let seq = self.open.seq + 1;
            self.open = OpenSegment::create(&self.dir, seq, self.segment_size, self.caps)?;
            // Make the removal durable before touching closed segments so
            // a crash cannot leave the old tail beside a fresh one.
            segment::sync_dir(&self.dir)?;
        } else if self.open.last_index().is_some_and(|last| from <= last) {
            self.truncate_open_within(from)?;
        }

        // Closed segments entirely at or past the cut are deleted.
        let mut changed = false;
        let mut remove_err = None;
        self.closed.retain(|seg| {
            if seg.first >= from {
                if let Err(err) = fs::remove_file(&seg.path) {
                    remove_err.get_or_insert(err);
                }
                changed = true;
                false
            } else {
                true
            }
        });
        if let Some(err) = remove_err {
            return Err(err.into());
        }

        // One closed segment may straddle the cut.
        if let Some(seg) = self.closed.last_mut() {
            if seg.last >= from {
                let cut_batch = seg
                    .batches
                    .iter()
                    .position(|b| b.last_index >= from)
                    .expect("straddling batch exists");
                let cut_offset = seg.batches[cut_batch].offset;
                let (entries, _, _) = segment::scan_segment(&seg.path)?;
                let tail: Vec<Entry> = entries
                    .into_iter()
                    .filter(|e| {
                        e.index < from && e.index >= seg.batches[cut_batch].first_index
                    })
                    .collect();

                let file = OpenOptions::new().write(true).open(&seg.path)?;
                file.set_len(cut_offset)?;
                let mut new_batches: Vec<BatchInfo> = seg.batches.drain(..cut_batch).collect();
                if !tail.is_empty() {
                    let buf = segment::encode_batch(&tail)?;
                    write_all_at(&file, buf.as_slice(), cut_offset)?;
                    new_batches.push(BatchInfo {
                        offset: cut_offset,
                        len: buf.len() as u64,
                        first_index: tail[0].index,
                        last_index: tail[tail.len() - 1].index,
                    });
                }
                file.sync_all()?;

                let new_last = from - 1;
                let target = self.dir.join(closed_segment_name(seg.first, new_last));
                fs::rename(&seg.path, &target)?;
                seg.path = target;
                seg.last = new_last;
                seg.batches = new_batches;
                changed = true;
            }
        }

        if changed {
            segment::sync_dir(&self.dir)?;
        }
        self.next_index = from;
        Ok(())
    }

    /// Cut inside the open segment at `from` and rewrite the surviving
    /// head of the straddling batch.
    fn truncate_open_within(&mut self, from: LogIndex) -> RaftResult<()> {
        let cut_batch = self
            .open
            .batches
            .iter()
            .position(|b| b.last_index >= from)
            .expect("straddling batch exists");
        let cut_offset = self.open.batches[cut_batch].offset;

        let (entries, _, _) = segment::scan_segment(&self.open.path)?;
        let tail: Vec<Entry> = entries
            .into_iter()
            .filter(|e| e.index < from && e.index >= self.open.batches[cut_batch].first_index)
            .collect();

        // Rewrite through a plain buffered handle; the direct-I/O handle
        // keeps writing block-aligned batches after the cut.
        let plain = OpenOptions::new().write(true).open(&self.open.path)?;
        plain.set_len(cut_offset)?;
        segment::preallocate(&plain, self.open.size)?;
        let mut new_next = cut_offset;
        self.open.batches.truncate(cut_batch);
        if !tail.is_empty() {
            let buf = segment::encode_batch(&tail)?;
            write_all_at(&plain, buf.as_slice(), cut_offset)?;
            self.open.batches.push(BatchInfo {
                offset: cut_offset,
                len: buf.len() as u64,
                first_index: tail[0].index,
                last_index: tail[tail.len() - 1].index,
            });
            new_next = cut_offset + buf.len() as u64;
        }
        plain.sync_all()?;
        self.open.next_offset = new_next;
        Ok(())
    }

    fn handle_compact(&mut self, index: LogIndex) -> RaftResult<()> {
        if let Some(err) = self.latched() {
            return Err(err);
        }
        let mut deleted = 0u32;
        self.closed.retain(|seg| {
            if seg.last <= index {
                if let Err(err) = fs::remove_file(&seg.path) {
                    tracing::warn!(path = %seg.path.display(), %err, "obsolete segment not deleted");
                }
                deleted += 1;
                false
            } else {
                true
            }
        });
        if deleted > 0 {
            segment::sync_dir(&self.dir)?;
            tracing::debug!(through = index, deleted, "compacted log segments");
        }
        Ok(())
    }

    fn handle_reset(&mut self, next_index: LogIndex) -> RaftResult<()> {
        if let Some(err) = self.latched() {
            return Err(err);
        }
        tracing::debug!(next_index, "resetting the log after snapshot install");
        for seg in self.closed.drain(..) {
            fs::remove_file(&seg.path)?;
        }
        fs::remove_file(&self.open.path)?;
        let seq = self.open.seq + 1;
        self.open = OpenSegment::create(&self.dir, seq, self.segment_size, self.caps)?;
        self.next_index = next_index;
        Ok(())
    }

    fn record_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Write(id, result) => {
                if let Err(err) = &result {
                    self.latch(err.kind(), err.to_string());
                }
                if let Some(slot) = self.inflight.iter_mut().find(|i| i.id == id) {
                    slot.result = Some(result);
                    slot.aio_buf = None;
                }
            }
            Completion::AioFailed(err) => {
                self.latch(err.kind(), err.to_string());
                for slot in &mut self.inflight {
                    if slot.aio_buf.is_some() && slot.result.is_none() {
                        slot.result = Some(Err(io::Error::new(err.kind(), "aio lost")));
                        slot.aio_buf = None;
                    }
                }
            }
        }
    }

    /// Complete acknowledgements strictly in submission order.
    fn flush_completions(&mut self) {
        while self
            .inflight
            .front()
            .is_some_and(|front| front.result.is_some())
        {
            let mut front = self.inflight.pop_front().unwrap();
            let result = front.result.take().unwrap();
            let status = match (&self.error, result) {
                // Nothing past a latched failure is acknowledged, even if
                // the kernel happened to finish it.
                (Some((kind, msg)), _) => Err(RaftError::Io(io::Error::new(*kind, msg.clone()))),
                (None, Ok(())) => Ok(()),
                (None, Err(err)) => Err(RaftError::Io(err)),
            };
            if let Some(done) = front.done.take() {
                let _ = done.send(status);
            }
        }
    }

    async fn drain_one(&mut self, comp_rx: &mut mpsc::UnboundedReceiver<Completion>) {
        if self.inflight.iter().all(|i| i.result.is_some()) {
            return;
        }
        if let Some(completion) = comp_rx.recv().await {
            self.record_completion(completion);
        }
    }

    /// Await every outstanding write. Shutdown and barrier operations
    /// (truncate, compact) require an empty pipeline.
    async fn drain_all(&mut self, comp_rx: &mut mpsc::UnboundedReceiver<Completion>) {
        while self.inflight.iter().any(|i| i.result.is_none()) {
            if let Some(completion) = comp_rx.recv().await {
                self.record_completion(completion);
            } else {
                break;
            }
        }
        self.flush_completions();
    }
}

fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)
    }
}
