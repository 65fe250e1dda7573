//! Store coordinator.
//!
//! The store runs as a single background thread that owns every piece
//! of mutable state: the current append segment, the location index,
//! the segment summaries, the queue sequence index, the caches and the
//! dirty set. Public operations are messages on the coordinator's
//! inboxes and run to completion one at a time, which makes every
//! externally visible operation linearisable without fine-grained
//! locking.
//!
//! Three inboxes are drained in priority order (control ahead of
//! commands ahead of background work), with the group-commit timer
//! checked before any of them so a sync is never starved by load.
//! Synchronous operations carry a reply channel; a reply sent to a
//! caller that walked away is silently dropped.
//!
//! The coordinator does not self-heal: an error inside an asynchronous
//! operation stops it, after which every handle observes
//! [`Error::Stopped`].
//! Errors on synchronous operations are returned to the caller, and
//! only fatal ones (I/O, index, fsync) stop the coordinator too.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::{self, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, unbounded, Receiver, Sender};

use crate::alarm::{AlarmToken, MemoryMode, MemoryReport, ReportRegistry};
use crate::cache::{CacheInfo, MessageCache};
use crate::compact::{self, CompactCtx};
use crate::config::{self, StoreConfig};
use crate::handles::HandleCache;
use crate::kv::SledTable;
use crate::msg_index::{swap_backend, DiskIndex, IndexMode, LocationIndex, MsgLoc, RamIndex};
use crate::queue_index::QueueIndex;
use crate::record::{self, MsgId, FRAMING, ID_BYTES};
use crate::segment::{self, AppendSegment};
use crate::summary::SummaryIndex;
use crate::{Error, Result};

const QUEUE_TREE: &str = "queue_entries";
const CMD_INBOX_DEPTH: usize = 4096;

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub msg_id: MsgId,
    pub seq: u64,
    pub payload: Vec<u8>,
    pub is_persistent: bool,
    pub redelivered: bool,
    pub remaining: u64,
}

/// A delivery without the payload read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhantomDelivery {
    pub msg_id: MsgId,
    pub seq: u64,
    pub is_persistent: bool,
    pub redelivered: bool,
    pub remaining: u64,
}

/// One row yielded by [`Store::foldl`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldEntry {
    pub seq: u64,
    pub msg_id: MsgId,
    pub payload: Vec<u8>,
    pub delivered: bool,
}

enum Cmd {
    Publish {
        queue: String,
        id: MsgId,
        payload: Vec<u8>,
        persistent: bool,
        delivered: bool,
    },
    Deliver {
        queue: String,
        reply: Sender<Result<Option<Delivery>>>,
    },
    PhantomDeliver {
        queue: String,
        reply: Sender<Result<Option<PhantomDelivery>>>,
    },
    Ack {
        queue: String,
        tags: Vec<(MsgId, u64)>,
    },
    TxPublish {
        id: MsgId,
        payload: Vec<u8>,
        persistent: bool,
    },
    TxCommit {
        queue: String,
        publishes: Vec<MsgId>,
        acks: Vec<(MsgId, u64)>,
        reply: Sender<Result<()>>,
    },
    TxCancel {
        ids: Vec<MsgId>,
    },
    Requeue {
        queue: String,
        entries: Vec<(MsgId, u64, bool)>,
    },
    RequeueNextN {
        queue: String,
        n: u64,
    },
    Purge {
        queue: String,
        reply: Sender<Result<u64>>,
    },
    DeleteQueue {
        queue: String,
    },
    Length {
        queue: String,
        reply: Sender<u64>,
    },
    Foldl {
        queue: String,
        out: Sender<FoldEntry>,
    },
    CacheInfo {
        reply: Sender<CacheInfo>,
    },
}

enum Ctrl {
    ToDiskOnly { reply: Sender<Result<()>> },
    ToRamDisk { reply: Sender<Result<()>> },
    SetMode { mode: MemoryMode },
    ReportMemory { reply: Sender<MemoryReport> },
    Stop { reply: Sender<Result<()>>, obliterate: bool },
}

enum Bg {
    Compact,
}

enum Flow {
    Continue,
    Stop,
}

/// Cloneable handle onto the store coordinator.
#[derive(Clone)]
pub struct Store {
    ctrl: Sender<Ctrl>,
    cmds: Sender<Cmd>,
    shared: Arc<Shared>,
}

struct Shared {
    segment_cap: u64,
    reports: Arc<ReportRegistry>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Store {
    /// Open (or recover) a store in `config.dir` and start the
    /// coordinator.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;
        config::load_or_init_meta(&config.dir, config.segment_cap)?;

        let db = sled::Config::default()
            .path(config.dir.join("tables"))
            .mode(sled::Mode::HighThroughput)
            .flush_every_ms(Some(50))
            .open()?;
        let mut queues = QueueIndex::open(Box::new(SledTable::open(&db, QUEUE_TREE)?));
        let mut index: Box<dyn LocationIndex> = match config.index_mode {
            IndexMode::Ram => Box::new(RamIndex::new()),
            IndexMode::Disk => Box::new(DiskIndex::open(&db)?),
        };
        // The location index is recomputed from scratch on every open.
        index.clear()?;

        let mut summary = SummaryIndex::new();
        let mut dirty_segments = HashSet::new();
        let current = recover(
            &config,
            &mut queues,
            &mut index,
            &mut summary,
            &mut dirty_segments,
        )?;

        let (ctrl_tx, ctrl_rx) = unbounded();
        let (cmd_tx, cmd_rx) = bounded(CMD_INBOX_DEPTH);
        let (bg_tx, bg_rx) = unbounded();
        let reports = Arc::new(ReportRegistry::new());

        let mut coordinator = Coordinator {
            root: config.dir.clone(),
            cap: config.segment_cap,
            db,
            index,
            index_mode: config.index_mode,
            queues,
            summary,
            current,
            handles: HandleCache::new(config.dir.clone(), config.handle_cache_size),
            cache: MessageCache::new(config.message_cache_bytes),
            dirty_segments,
            compaction_scheduled: false,
            pending_sync: Vec::new(),
            reports: Arc::clone(&reports),
            bg_tx: bg_tx.clone(),
            busy: false,
            sync_interval: config.sync_interval,
            report_interval: config.report_interval,
            obliterated: false,
        };
        coordinator.maybe_schedule_compact();

        let thread = std::thread::Builder::new()
            .name("depot-store".to_string())
            .spawn(move || coordinator.run(ctrl_rx, cmd_rx, bg_rx))?;

        Ok(Self {
            ctrl: ctrl_tx,
            cmds: cmd_tx,
            shared: Arc::new(Shared {
                segment_cap: config.segment_cap,
                reports,
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    fn send(&self, cmd: Cmd) -> Result<()> {
        self.cmds.send(cmd).map_err(|_| Error::Stopped)
    }

    fn send_ctrl(&self, ctrl: Ctrl) -> Result<()> {
        self.ctrl.send(ctrl).map_err(|_| Error::Stopped)
    }

    fn check_payload(&self, payload: &[u8]) -> Result<()> {
        if (ID_BYTES + payload.len()) as u64 + FRAMING > self.shared.segment_cap {
            return Err(Error::Unsupported("message exceeds segment capacity"));
        }
        Ok(())
    }

    /// Append a message (or bump the refcount of an already-stored one)
    /// and enqueue it on `queue`.
    pub fn publish(
        &self,
        queue: &str,
        id: MsgId,
        payload: Vec<u8>,
        persistent: bool,
        delivered: bool,
    ) -> Result<()> {
        self.check_payload(&payload)?;
        self.send(Cmd::Publish {
            queue: queue.to_string(),
            id,
            payload,
            persistent,
            delivered,
        })
    }

    /// Take the next message off `queue`, payload included.
    pub fn deliver(&self, queue: &str) -> Result<Option<Delivery>> {
        let (reply, rx) = bounded(1);
        self.send(Cmd::Deliver {
            queue: queue.to_string(),
            reply,
        })?;
        rx.recv().map_err(|_| Error::Stopped)?
    }

    /// Like [`Store::deliver`] but without reading the payload off
    /// disk.
    pub fn phantom_deliver(&self, queue: &str) -> Result<Option<PhantomDelivery>> {
        let (reply, rx) = bounded(1);
        self.send(Cmd::PhantomDeliver {
            queue: queue.to_string(),
            reply,
        })?;
        rx.recv().map_err(|_| Error::Stopped)?
    }

    /// Acknowledge delivered messages, dropping references.
    pub fn ack(&self, queue: &str, tags: Vec<(MsgId, u64)>) -> Result<()> {
        self.send(Cmd::Ack {
            queue: queue.to_string(),
            tags,
        })
    }

    /// Store a message without making it queue-visible yet.
    pub fn tx_publish(&self, id: MsgId, payload: Vec<u8>, persistent: bool) -> Result<()> {
        self.check_payload(&payload)?;
        self.send(Cmd::TxPublish {
            id,
            payload,
            persistent,
        })
    }

    /// Atomically assign queue positions to previously tx-published
    /// messages and apply acks. Blocks until the writes are durable:
    /// if any published record sits past the last fsync of the current
    /// segment, the reply is deferred to the next group commit.
    pub fn tx_commit(
        &self,
        queue: &str,
        publishes: Vec<MsgId>,
        acks: Vec<(MsgId, u64)>,
    ) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.send(Cmd::TxCommit {
            queue: queue.to_string(),
            publishes,
            acks,
            reply,
        })?;
        rx.recv().map_err(|_| Error::Stopped)?
    }

    /// Abandon tx-published messages, dropping their references.
    pub fn tx_cancel(&self, ids: Vec<MsgId>) -> Result<()> {
        self.send(Cmd::TxCancel { ids })
    }

    /// Move delivered entries back to the tail of the queue.
    pub fn requeue(&self, queue: &str, entries: Vec<(MsgId, u64, bool)>) -> Result<()> {
        self.send(Cmd::Requeue {
            queue: queue.to_string(),
            entries,
        })
    }

    /// Rotate the next `n` entries to the tail of the queue.
    pub fn requeue_next_n(&self, queue: &str, n: u64) -> Result<()> {
        self.send(Cmd::RequeueNextN {
            queue: queue.to_string(),
            n,
        })
    }

    /// Remove every entry of the queue, returning how many rows were
    /// dropped.
    pub fn purge(&self, queue: &str) -> Result<u64> {
        let (reply, rx) = bounded(1);
        self.send(Cmd::Purge {
            queue: queue.to_string(),
            reply,
        })?;
        rx.recv().map_err(|_| Error::Stopped)?
    }

    /// Purge plus removal of the queue itself.
    pub fn delete_queue(&self, queue: &str) -> Result<()> {
        self.send(Cmd::DeleteQueue {
            queue: queue.to_string(),
        })
    }

    /// Logical queue length.
    pub fn length(&self, queue: &str) -> Result<u64> {
        let (reply, rx) = bounded(1);
        self.send(Cmd::Length {
            queue: queue.to_string(),
            reply,
        })?;
        rx.recv().map_err(|_| Error::Stopped)
    }

    /// Fold over every row of the queue in seq order, payloads
    /// included.
    pub fn foldl<B, F>(&self, queue: &str, init: B, mut f: F) -> Result<B>
    where
        F: FnMut(B, FoldEntry) -> B,
    {
        let (out, rx) = bounded(64);
        self.send(Cmd::Foldl {
            queue: queue.to_string(),
            out,
        })?;
        let mut acc = init;
        for entry in rx {
            acc = f(acc, entry);
        }
        Ok(acc)
    }

    /// Payload cache statistics.
    pub fn cache_info(&self) -> Result<CacheInfo> {
        let (reply, rx) = bounded(1);
        self.send(Cmd::CacheInfo { reply })?;
        rx.recv().map_err(|_| Error::Stopped)
    }

    /// Swap the location index onto disk.
    pub fn to_disk_only_mode(&self) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.send_ctrl(Ctrl::ToDiskOnly { reply })?;
        rx.recv().map_err(|_| Error::Stopped)?
    }

    /// Swap the location index back into RAM.
    pub fn to_ram_disk_mode(&self) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.send_ctrl(Ctrl::ToRamDisk { reply })?;
        rx.recv().map_err(|_| Error::Stopped)?
    }

    /// Asynchronous mode switch, as invoked by the memory alarm.
    pub fn set_mode(&self, mode: MemoryMode) -> Result<()> {
        self.send_ctrl(Ctrl::SetMode { mode })
    }

    /// A callback suitable for registering with a memory alarm; it
    /// forwards the requested mode to [`Store::set_mode`].
    pub fn mode_callback(&self) -> Arc<dyn Fn(MemoryMode) + Send + Sync> {
        let ctrl = self.ctrl.clone();
        Arc::new(move |mode| {
            let _ = ctrl.send(Ctrl::SetMode { mode });
        })
    }

    /// Current approximate memory footprint.
    pub fn report_memory(&self) -> Result<MemoryReport> {
        let (reply, rx) = bounded(1);
        self.send_ctrl(Ctrl::ReportMemory { reply })?;
        rx.recv().map_err(|_| Error::Stopped)
    }

    /// Register a callback invoked with the periodic memory report.
    pub fn register_memory_report(
        &self,
        callback: &Arc<dyn Fn(MemoryReport) + Send + Sync>,
    ) -> AlarmToken {
        self.shared.reports.register(callback)
    }

    pub fn unregister_memory_report(&self, token: AlarmToken) {
        self.shared.reports.unregister(token);
    }

    /// Graceful shutdown: fsync, flush the queue table and join the
    /// coordinator.
    pub fn stop(&self) -> Result<()> {
        self.stop_inner(false)
    }

    /// Destructive shutdown: every store file is deleted.
    pub fn stop_and_obliterate(&self) -> Result<()> {
        self.stop_inner(true)
    }

    fn stop_inner(&self, obliterate: bool) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.send_ctrl(Ctrl::Stop { reply, obliterate })?;
        let result = rx.recv().map_err(|_| Error::Stopped)?;
        if let Some(thread) = self.shared.thread.lock().expect("thread slot").take() {
            thread.join().map_err(|_| Error::Stopped)?;
        }
        result
    }
}

struct Coordinator {
    root: PathBuf,
    cap: u64,
    db: sled::Db,
    index: Box<dyn LocationIndex>,
    index_mode: IndexMode,
    queues: QueueIndex,
    summary: SummaryIndex,
    current: AppendSegment,
    handles: HandleCache,
    cache: MessageCache,
    dirty_segments: HashSet<u64>,
    compaction_scheduled: bool,
    pending_sync: Vec<Sender<Result<()>>>,
    reports: Arc<ReportRegistry>,
    bg_tx: Sender<Bg>,
    busy: bool,
    sync_interval: Duration,
    report_interval: Duration,
    obliterated: bool,
}

impl Coordinator {
    fn run(mut self, ctrl: Receiver<Ctrl>, cmds: Receiver<Cmd>, bg: Receiver<Bg>) {
        log::info!("message store running in {}", self.root.display());
        match self.event_loop(&ctrl, &cmds, &bg) {
            Ok(()) => log::info!("message store stopped"),
            Err(err) => {
                log::error!("message store stopped on error: {err}");
                for waiter in self.pending_sync.drain(..) {
                    let _ = waiter.send(Err(Error::Stopped));
                }
            }
        }
    }

    fn event_loop(
        &mut self,
        ctrl: &Receiver<Ctrl>,
        cmds: &Receiver<Cmd>,
        bg: &Receiver<Bg>,
    ) -> Result<()> {
        let sync_tick = tick(self.sync_interval);
        let report_tick = tick(self.report_interval);
        loop {
            // The sync timer outranks everything so group commit is
            // never starved by a busy inbox; then control, commands and
            // background work in that order.
            if sync_tick.try_recv().is_ok() {
                self.on_sync_tick()?;
            }
            if report_tick.try_recv().is_ok() {
                self.on_report_tick();
            }
            if let Ok(op) = ctrl.try_recv() {
                match self.on_ctrl(op, cmds, bg)? {
                    Flow::Stop => return Ok(()),
                    Flow::Continue => continue,
                }
            }
            if let Ok(op) = cmds.try_recv() {
                self.on_cmd(op)?;
                continue;
            }
            if let Ok(op) = bg.try_recv() {
                self.on_bg(op)?;
                continue;
            }

            select! {
                recv(ctrl) -> op => match op {
                    Ok(op) => match self.on_ctrl(op, cmds, bg)? {
                        Flow::Stop => return Ok(()),
                        Flow::Continue => {}
                    },
                    Err(_) => return self.on_disconnect(),
                },
                recv(cmds) -> op => match op {
                    Ok(op) => self.on_cmd(op)?,
                    Err(_) => return self.on_disconnect(),
                },
                recv(bg) -> op => if let Ok(op) = op {
                    self.on_bg(op)?;
                },
                recv(sync_tick) -> _ => self.on_sync_tick()?,
                recv(report_tick) -> _ => self.on_report_tick(),
            }
        }
    }

    /// Every handle is gone; flush what we can and leave.
    fn on_disconnect(&mut self) -> Result<()> {
        if !self.obliterated {
            if let Err(err) = self.shutdown() {
                log::warn!("final flush failed: {err}");
            }
        }
        Ok(())
    }

    fn on_cmd(&mut self, cmd: Cmd) -> Result<()> {
        self.busy = true;
        match cmd {
            Cmd::Publish {
                queue,
                id,
                payload,
                persistent,
                delivered,
            } => self.publish(&queue, id, payload, persistent, delivered),
            Cmd::Deliver { queue, reply } => {
                let result = self.deliver(&queue);
                self.reply_sync(result, |r| reply.send(r))
            }
            Cmd::PhantomDeliver { queue, reply } => {
                let result = self.phantom_deliver(&queue);
                self.reply_sync(result, |r| reply.send(r))
            }
            Cmd::Ack { queue, tags } => self.ack(&queue, &tags),
            Cmd::TxPublish {
                id,
                payload,
                persistent,
            } => self.tx_publish(id, payload, persistent),
            Cmd::TxCommit {
                queue,
                publishes,
                acks,
                reply,
            } => match self.tx_commit(&queue, &publishes, &acks) {
                Ok(true) => {
                    self.pending_sync.push(reply);
                    Ok(())
                }
                Ok(false) => {
                    let _ = reply.send(Ok(()));
                    Ok(())
                }
                Err(err) => {
                    let fatal = err.is_fatal();
                    log::error!("tx_commit failed: {err}");
                    let _ = reply.send(Err(err));
                    if fatal {
                        Err(Error::Stopped)
                    } else {
                        Ok(())
                    }
                }
            },
            Cmd::TxCancel { ids } => self.tx_cancel(&ids),
            Cmd::Requeue { queue, entries } => self.queues.requeue(&queue, &entries),
            Cmd::RequeueNextN { queue, n } => self.queues.requeue_next_n(&queue, n).map(|_| ()),
            Cmd::Purge { queue, reply } => {
                let result = self.purge(&queue);
                self.reply_sync(result, |r| reply.send(r))
            }
            Cmd::DeleteQueue { queue } => self.delete_queue(&queue),
            Cmd::Length { queue, reply } => {
                let _ = reply.send(self.queues.length(&queue));
                Ok(())
            }
            Cmd::Foldl { queue, out } => match self.foldl(&queue, &out) {
                Ok(()) => Ok(()),
                Err(err) if err.is_fatal() => Err(err),
                Err(err) => {
                    log::warn!("foldl on {queue} aborted: {err}");
                    Ok(())
                }
            },
            Cmd::CacheInfo { reply } => {
                let _ = reply.send(self.cache.info());
                Ok(())
            }
        }
    }

    /// Reply to a synchronous caller. Fatal errors stop the
    /// coordinator after the caller has been told.
    fn reply_sync<T>(
        &mut self,
        result: Result<T>,
        send: impl FnOnce(Result<T>) -> std::result::Result<(), crossbeam_channel::SendError<Result<T>>>,
    ) -> Result<()> {
        match result {
            Ok(value) => {
                let _ = send(Ok(value));
                Ok(())
            }
            Err(err) => {
                let fatal = err.is_fatal();
                log::error!("operation failed: {err}");
                let _ = send(Err(err));
                if fatal {
                    Err(Error::Stopped)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn on_ctrl(&mut self, op: Ctrl, cmds: &Receiver<Cmd>, bg: &Receiver<Bg>) -> Result<Flow> {
        self.busy = true;
        match op {
            Ctrl::ToDiskOnly { reply } => {
                let result = self.switch_index(IndexMode::Disk);
                self.reply_sync(result, |r| reply.send(r))?;
                Ok(Flow::Continue)
            }
            Ctrl::ToRamDisk { reply } => {
                let result = self.switch_index(IndexMode::Ram);
                self.reply_sync(result, |r| reply.send(r))?;
                Ok(Flow::Continue)
            }
            Ctrl::SetMode { mode } => {
                let target = match mode {
                    MemoryMode::Disk => IndexMode::Disk,
                    MemoryMode::Mixed => IndexMode::Ram,
                };
                self.switch_index(target)?;
                Ok(Flow::Continue)
            }
            Ctrl::ReportMemory { reply } => {
                let _ = reply.send(self.memory_report());
                Ok(Flow::Continue)
            }
            Ctrl::Stop { reply, obliterate } => {
                // Control outranks commands, so drain outstanding work
                // before sealing the store; a graceful stop must not
                // drop queued publishes or acks.
                let mut result = Ok(());
                while let Ok(cmd) = cmds.try_recv() {
                    if let Err(err) = self.on_cmd(cmd) {
                        result = Err(err);
                        break;
                    }
                }
                if result.is_ok() {
                    while let Ok(op) = bg.try_recv() {
                        if let Err(err) = self.on_bg(op) {
                            result = Err(err);
                            break;
                        }
                    }
                }
                let result = result.and_then(|_| {
                    if obliterate {
                        self.obliterate()
                    } else {
                        self.shutdown()
                    }
                });
                let _ = reply.send(result);
                Ok(Flow::Stop)
            }
        }
    }

    fn on_bg(&mut self, op: Bg) -> Result<()> {
        match op {
            Bg::Compact => {
                self.compaction_scheduled = false;
                if self.dirty_segments.is_empty() {
                    return Ok(());
                }
                let mut ctx = CompactCtx {
                    root: &self.root,
                    cap: self.cap,
                    current_segment: self.current.id(),
                    summary: &mut self.summary,
                    index: &mut self.index,
                    handles: &mut self.handles,
                };
                compact::run(&mut ctx, &mut self.dirty_segments)
            }
        }
    }

    // ---- publish / deliver ----

    fn publish(
        &mut self,
        queue: &str,
        id: MsgId,
        payload: Vec<u8>,
        persistent: bool,
        delivered: bool,
    ) -> Result<()> {
        self.store_message(id, payload, persistent)?;
        self.queues.publish(queue, &id, delivered)?;
        Ok(())
    }

    fn tx_publish(&mut self, id: MsgId, payload: Vec<u8>, persistent: bool) -> Result<()> {
        self.store_message(id, payload, persistent)
    }

    /// Append a new message or bump the refcount of a known one.
    fn store_message(&mut self, id: MsgId, payload: Vec<u8>, persistent: bool) -> Result<()> {
        match self.index.get(&id)? {
            Some(mut loc) => {
                loc.refcount += 1;
                self.index.insert(id, loc)?;
                // A message referenced twice is likely to be delivered
                // again; cache it while the payload is in hand.
                if self.cache.contains(&id) {
                    self.cache.bump(&id);
                } else {
                    self.cache.insert_new(id, payload, loc.refcount);
                }
            }
            None => {
                let total_size = (ID_BYTES + payload.len()) as u64;
                if !self.current.has_room(total_size) {
                    self.roll_segment()?;
                }
                let (offset, size) = self.current.append(&id, &payload, persistent)?;
                self.index.insert_new(
                    id,
                    MsgLoc {
                        segment: self.current.id(),
                        offset,
                        size,
                        refcount: 1,
                        is_persistent: persistent,
                    },
                )?;
                self.summary
                    .record_append(self.current.id(), offset, size + FRAMING)?;
            }
        }
        Ok(())
    }

    fn roll_segment(&mut self) -> Result<()> {
        // Seals the old tail; commit waiters are released by the sync.
        self.sync_now()?;
        let next = self.current.id() + 1;
        let fresh = AppendSegment::create(&self.root, next, self.cap)?;
        self.summary.append_segment(next);
        self.current = fresh;
        log::debug!("rolled to segment {next}");
        // Holes punched while the old segment was current become fair
        // game now.
        self.maybe_schedule_compact();
        Ok(())
    }

    fn deliver(&mut self, queue: &str) -> Result<Option<Delivery>> {
        let (seq, entry, remaining, redelivered) = match self.queues.next_entry(queue)? {
            Some(next) => next,
            None => return Ok(None),
        };
        let loc = self
            .index
            .get(&entry.msg_id)?
            .ok_or(Error::Corrupt("queue entry references unknown message"))?;
        let payload = self.read_payload(&entry.msg_id, &loc)?;
        Ok(Some(Delivery {
            msg_id: entry.msg_id,
            seq,
            payload,
            is_persistent: loc.is_persistent,
            redelivered,
            remaining,
        }))
    }

    fn phantom_deliver(&mut self, queue: &str) -> Result<Option<PhantomDelivery>> {
        let (seq, entry, remaining, redelivered) = match self.queues.next_entry(queue)? {
            Some(next) => next,
            None => return Ok(None),
        };
        let loc = self
            .index
            .get(&entry.msg_id)?
            .ok_or(Error::Corrupt("queue entry references unknown message"))?;
        Ok(Some(PhantomDelivery {
            msg_id: entry.msg_id,
            seq,
            is_persistent: loc.is_persistent,
            redelivered,
            remaining,
        }))
    }

    fn read_payload(&mut self, id: &MsgId, loc: &MsgLoc) -> Result<Vec<u8>> {
        if let Some(payload) = self.cache.fetch(id) {
            return Ok(payload);
        }
        let payload = self.read_from_segment(id, loc)?;
        if loc.refcount > 1 && !self.cache.contains(id) {
            self.cache.insert_new(*id, payload.clone(), loc.refcount);
        }
        Ok(payload)
    }

    /// Read a record off disk, forcing a sync first when the read would
    /// otherwise see unflushed bytes of the current segment.
    fn read_from_segment(&mut self, id: &MsgId, loc: &MsgLoc) -> Result<Vec<u8>> {
        if loc.segment == self.current.id()
            && self.current.is_dirty()
            && loc.offset + loc.size + FRAMING > self.current.last_sync()
        {
            self.sync_now()?;
        }
        let file = self.handles.get(loc.segment)?;
        let rec = record::read_record(file, loc.offset, loc.size)?;
        if rec.id != *id {
            return Err(Error::Corrupt("record id mismatch at location"));
        }
        Ok(rec.payload)
    }

    // ---- ack / tx / requeue / purge ----

    fn ack(&mut self, queue: &str, tags: &[(MsgId, u64)]) -> Result<()> {
        let mut batch = self.queues.begin_write();
        for (_, seq) in tags {
            self.queues.stage_ack(&mut batch, queue, *seq);
        }
        self.queues.commit(batch)?;
        for (id, _) in tags {
            self.release_ref(id)?;
        }
        self.maybe_schedule_compact();
        Ok(())
    }

    fn tx_commit(&mut self, queue: &str, publishes: &[MsgId], acks: &[(MsgId, u64)]) -> Result<bool> {
        for id in publishes {
            if self.index.get(id)?.is_none() {
                return Err(Error::Corrupt("transactional publish for unknown message"));
            }
        }
        let mut batch = self.queues.begin_write();
        self.queues.stage_publishes(&mut batch, queue, publishes, false);
        for (_, seq) in acks {
            self.queues.stage_ack(&mut batch, queue, *seq);
        }
        self.queues.commit(batch)?;
        self.queues.advance_write(queue, publishes.len() as u64);
        for (id, _) in acks {
            self.release_ref(id)?;
        }
        self.maybe_schedule_compact();

        // The reply is deferred while any published record sits past
        // the last synced byte of the current segment.
        if self.current.is_dirty() {
            for id in publishes {
                if let Some(loc) = self.index.get(id)? {
                    if loc.segment == self.current.id()
                        && loc.offset + loc.size + FRAMING > self.current.last_sync()
                    {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn tx_cancel(&mut self, ids: &[MsgId]) -> Result<()> {
        for id in ids {
            self.release_ref(id)?;
        }
        self.maybe_schedule_compact();
        Ok(())
    }

    fn purge(&mut self, queue: &str) -> Result<u64> {
        let rows = self.queues.purge(queue)?;
        for (_, entry) in &rows {
            self.release_ref(&entry.msg_id)?;
        }
        self.maybe_schedule_compact();
        Ok(rows.len() as u64)
    }

    fn delete_queue(&mut self, queue: &str) -> Result<()> {
        let rows = self.queues.delete_queue(queue)?;
        for (_, entry) in &rows {
            self.release_ref(&entry.msg_id)?;
        }
        self.maybe_schedule_compact();
        Ok(())
    }

    /// Drop one reference; at zero the message dies and its byte range
    /// becomes a hole counted toward compaction.
    fn release_ref(&mut self, id: &MsgId) -> Result<()> {
        let mut loc = self
            .index
            .get(id)?
            .ok_or(Error::Corrupt("reference release for unknown message"))?;
        loc.refcount -= 1;
        if loc.refcount == 0 {
            self.index.delete(id)?;
            self.cache.remove(id);
            self.summary
                .record_hole(loc.segment, loc.offset, loc.size + FRAMING)?;
            self.dirty_segments.insert(loc.segment);
        } else {
            self.index.insert(*id, loc)?;
        }
        Ok(())
    }

    fn maybe_schedule_compact(&mut self) {
        if !self.dirty_segments.is_empty() && !self.compaction_scheduled {
            self.compaction_scheduled = true;
            let _ = self.bg_tx.send(Bg::Compact);
        }
    }

    fn foldl(&mut self, queue: &str, out: &Sender<FoldEntry>) -> Result<()> {
        for (seq, entry) in self.queues.rows(queue)? {
            let loc = self
                .index
                .get(&entry.msg_id)?
                .ok_or(Error::Corrupt("queue entry references unknown message"))?;
            let payload = match self.cache.peek(&entry.msg_id) {
                Some(payload) => payload,
                None => self.read_from_segment(&entry.msg_id, &loc)?,
            };
            let item = FoldEntry {
                seq,
                msg_id: entry.msg_id,
                payload,
                delivered: entry.delivered,
            };
            // A stalled or vanished consumer must not wedge the
            // coordinator.
            if out.send_timeout(item, Duration::from_secs(5)).is_err() {
                break;
            }
        }
        Ok(())
    }

    // ---- sync / mode / shutdown ----

    fn on_sync_tick(&mut self) -> Result<()> {
        if !self.current.is_dirty() && self.pending_sync.is_empty() {
            return Ok(());
        }
        self.sync_now()
    }

    /// Fsync the current segment and flush the queue table, then
    /// release every deferred commit. A failure is propagated to all
    /// waiters before it stops the coordinator.
    fn sync_now(&mut self) -> Result<()> {
        let result = self
            .current
            .sync()
            .and_then(|_| self.queues.flush());
        match result {
            Ok(()) => {
                for waiter in self.pending_sync.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                for waiter in self.pending_sync.drain(..) {
                    let _ = waiter.send(Err(Error::SyncFailed(message.clone())));
                }
                Err(Error::SyncFailed(message))
            }
        }
    }

    fn switch_index(&mut self, target: IndexMode) -> Result<()> {
        if self.index_mode == target {
            return Ok(());
        }
        let fresh: Box<dyn LocationIndex> = match target {
            IndexMode::Ram => Box::new(RamIndex::new()),
            IndexMode::Disk => Box::new(DiskIndex::open(&self.db)?),
        };
        let placeholder: Box<dyn LocationIndex> = Box::new(RamIndex::new());
        let active = std::mem::replace(&mut self.index, placeholder);
        self.index = swap_backend(active, fresh)?;
        self.index_mode = target;
        log::info!("location index switched to {target:?} mode");
        Ok(())
    }

    fn memory_report(&self) -> MemoryReport {
        let index_bytes = match self.index_mode {
            IndexMode::Ram => self.index.len() as u64 * 64,
            IndexMode::Disk => 0,
        };
        let bytes = index_bytes
            + self.cache.bytes() as u64
            + self.queues.queue_count() as u64 * 48;
        MemoryReport {
            bytes,
            hibernating: !self.busy,
        }
    }

    fn on_report_tick(&mut self) {
        let report = self.memory_report();
        self.reports.invoke(report);
        self.busy = false;
    }

    fn shutdown(&mut self) -> Result<()> {
        self.sync_now()?;
        if self.index_mode == IndexMode::Disk {
            // Recomputable on the next open; not worth persisting.
            self.index.clear()?;
        }
        self.db.flush()?;
        Ok(())
    }

    fn obliterate(&mut self) -> Result<()> {
        self.obliterated = true;
        for waiter in self.pending_sync.drain(..) {
            let _ = waiter.send(Err(Error::Stopped));
        }
        std::fs::remove_dir_all(&self.root)?;
        log::info!("obliterated message store at {}", self.root.display());
        Ok(())
    }
}

// ---- recovery ----

/// Rebuild every in-memory structure from the store directory and
/// return the reopened append segment.
fn recover(
    config: &StoreConfig,
    queues: &mut QueueIndex,
    index: &mut Box<dyn LocationIndex>,
    summary: &mut SummaryIndex,
    dirty: &mut HashSet<u64>,
) -> Result<AppendSegment> {
    let root = &config.dir;
    let (segments, temps) = segment::discover(root)?;

    // Queues outside the durable set do not survive a restart. Their
    // rows go first so reference counts reflect surviving rows only.
    let dropped = queues.drop_queues_except(&config.durable_queues)?;
    if dropped > 0 {
        log::info!("recovery dropped {dropped} rows of non-durable queues");
    }
    let counts = queues.ref_counts()?;

    for temp_id in &temps {
        recover_temp(root, *temp_id, &counts)?;
    }

    let highest = segments.last().copied();
    let mut live_ids = HashSet::new();
    let mut append_offset = 0u64;
    for seg in &segments {
        let mut file = segment::open_read(root, *seg)?;
        let mut records = record::scan_records(&mut file)?;
        drop(file);

        if Some(*seg) == highest {
            // Only the leading well-framed run of the append segment is
            // trusted; a record past a gap there is suspect and
            // discarded rather than fabricated around.
            let mut end = 0u64;
            let mut keep = 0usize;
            for rec in &records {
                if rec.offset != end {
                    break;
                }
                end = rec.offset + rec.total_size + FRAMING;
                keep += 1;
            }
            if keep < records.len() {
                log::warn!(
                    "segment {seg}: discarding {} records past a framing gap",
                    records.len() - keep
                );
            }
            records.truncate(keep);
            append_offset = end;
            let file = OpenOptions::new()
                .write(true)
                .open(segment::segment_path(root, *seg))?;
            file.set_len(append_offset)?;
        }

        summary.append_segment(*seg);
        let mut has_dead = false;
        for rec in &records {
            let refcount = counts.get(&rec.id).copied().unwrap_or(0);
            // Transient records never survive a restart, and a second
            // copy left by an interrupted combine is dead too.
            if rec.is_persistent && refcount > 0 && !live_ids.contains(&rec.id) {
                index.insert_new(
                    rec.id,
                    MsgLoc {
                        segment: *seg,
                        offset: rec.offset,
                        size: rec.total_size,
                        refcount,
                        is_persistent: true,
                    },
                )?;
                live_ids.insert(rec.id);
                summary.record_append(*seg, rec.offset, rec.total_size + FRAMING)?;
            } else {
                has_dead = true;
            }
        }
        let valid = summary.lookup(*seg).map(|s| s.valid_bytes).unwrap_or(0);
        if has_dead || valid == 0 {
            dirty.insert(*seg);
        }
    }

    let removed = queues.retain_live(&live_ids)?;
    if removed > 0 {
        log::info!("recovery dropped {removed} queue rows referencing lost messages");
    }
    queues.rebuild_seqs()?;
    queues.flush()?;

    let current = match highest {
        Some(id) => {
            dirty.remove(&id);
            AppendSegment::open_at(root, id, config.segment_cap, append_offset)?
        }
        None => {
            summary.append_segment(0);
            AppendSegment::create(root, 0, config.segment_cap)?
        }
    };
    log::info!(
        "recovered {} segments, {} live messages, {} queues",
        summary.len(),
        index.len(),
        queues.queue_count()
    );
    Ok(current)
}

/// Classify a compaction temp file against its main segment. Only the
/// case where the temp holds live records missing from the main file
/// is replayed; everything else deletes the temp.
fn recover_temp(
    root: &std::path::Path,
    id: u64,
    counts: &std::collections::HashMap<MsgId, u64>,
) -> Result<()> {
    let tmp = segment::temp_path(root, id);
    let main = segment::segment_path(root, id);
    if !main.exists() {
        log::warn!("temp file for segment {id} has no main segment; deleting");
        std::fs::remove_file(&tmp)?;
        return Ok(());
    }

    let mut tmp_file = std::fs::File::open(&tmp)?;
    let temp_records = record::scan_records(&mut tmp_file)?;
    drop(tmp_file);
    let temp_live: Vec<_> = temp_records
        .iter()
        .filter(|rec| rec.is_persistent && counts.get(&rec.id).copied().unwrap_or(0) > 0)
        .collect();
    if temp_live.is_empty() {
        std::fs::remove_file(&tmp)?;
        log::debug!("deleted stale temp file for segment {id}");
        return Ok(());
    }

    let mut main_file = std::fs::File::open(&main)?;
    let main_records = record::scan_records(&mut main_file)?;
    drop(main_file);
    let main_ids: HashSet<MsgId> = main_records.iter().map(|rec| rec.id).collect();
    if temp_live.iter().all(|rec| main_ids.contains(&rec.id)) {
        std::fs::remove_file(&tmp)?;
        log::debug!("deleted superseded temp file for segment {id}");
        return Ok(());
    }

    // The main file lost its upper part mid-rewrite: truncate it to the
    // leading dense run of live records and replay the temp onto it.
    let mut contig_end = 0u64;
    for rec in &main_records {
        let live = rec.is_persistent && counts.get(&rec.id).copied().unwrap_or(0) > 0;
        if rec.offset == contig_end && live {
            contig_end = rec.offset + rec.total_size + FRAMING;
        } else {
            break;
        }
    }
    let mut writer = OpenOptions::new().write(true).open(&main)?;
    writer.set_len(contig_end)?;
    writer.seek(SeekFrom::Start(contig_end))?;
    let mut tmp_reader = std::fs::File::open(&tmp)?;
    io::copy(&mut tmp_reader, &mut writer)?;
    writer.sync_data()?;
    std::fs::remove_file(&tmp)?;
    log::info!("replayed compaction temp file onto segment {id}");
    Ok(())
}
