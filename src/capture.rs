// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Capture runtime and the callback surface used by the instrumentation
//! engine.
//!
//! The engine calls [`Capture::thread_begin`] when a thread appears, keeps
//! the returned [`ThreadContext`] with that thread, and passes it into every
//! other callback made on the thread. Each event-producing callback body
//! runs under one global capture lock. The lockstep wait, if any, happens
//! after the lock is dropped so other threads keep making progress while
//! one thread waits for the backends.

use std::fs::File;
use std::io::BufWriter;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::Result;
use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::collision::CollisionAnalyzer;
use crate::config::Config;
use crate::config::StatsFormat;
use crate::context::PendingWrite;
use crate::context::ThreadContext;
use crate::drain::DrainSummary;
use crate::drain::Drainer;
use crate::drain::TextMirror;
use crate::event::Event;
use crate::event::EventKind;
use crate::event::Semantics;
use crate::event::SiteInfo;
use crate::fault::CaptureResult;
use crate::lockstep::BoundaryPolicy;
use crate::lockstep::LockstepSync;
use crate::memory::snapshot;
use crate::memory::split_access;
use crate::memory::MemoryReader;
use crate::queue::EventQueue;
use crate::sink::open_sink;
use crate::sink::Sink;
use crate::site::SiteTables;
use crate::stats::StatsReport;
use crate::stats::TraceStats;
use crate::types::ThreadId;
use crate::wire::TextWriter;

/// Source location of the instruction that triggered a callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeSite {
    pub line: u16,
    pub file: u16,
    pub routine: u16,
}

/// Memory operand as reported by the engine before the access executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub addr: u64,
    pub size: u32,
    pub stack: bool,
    pub atomic: bool,
}

pub struct Capture {
    config: Config,
    global: Mutex<()>,
    queue: Arc<EventQueue>,
    stats: Arc<TraceStats>,
    drain: Option<Drainer>,
    lockstep: Option<LockstepSync>,
    policy: BoundaryPolicy,
    collision: Option<CollisionAnalyzer>,
    memory: Box<dyn MemoryReader>,
    sites: Mutex<SiteTables>,
    root: ThreadId,
}

impl Capture {
    /// Set up the full pipeline from `config`: trace sink, optional text
    /// mirror, lockstep channels and the drain thread.
    pub fn new(config: Config, memory: Box<dyn MemoryReader>) -> Result<Self> {
        config.validate()?;
        let sink = open_sink(config.sink.kind, &config.sink.path)?;
        let lockstep = if config.lockstep {
            Some(LockstepSync::open(
                config.backends,
                &config.channel_dir,
                &config.channel_prefix,
                &config.channel_suffix,
                config.lockstep_channels(),
            )?)
        } else {
            None
        };
        Self::with_parts(config, sink, memory, lockstep)
    }

    /// Like [`Capture::new`] but with an already opened sink and lockstep
    /// channels.
    pub fn with_parts(
        config: Config,
        sink: Sink,
        memory: Box<dyn MemoryReader>,
        lockstep: Option<LockstepSync>,
    ) -> Result<Self> {
        config.validate()?;
        let text: Option<TextMirror> = match &config.text_trace {
            Some(path) => {
                let f = File::create(path)
                    .with_context(|| format!("Failed to create text trace {}", path.display()))?;
                Some(TextWriter::new(Box::new(BufWriter::new(f))))
            }
            None => None,
        };

        let queue = Arc::new(EventQueue::with_capacity(config.queue_capacity));
        let stats = Arc::new(TraceStats::new());
        let root = ThreadId(config.root_tid);
        let drain = Drainer::spawn(queue.clone(), sink, text, stats.clone(), root)?;
        let collision = config
            .collision
            .as_ref()
            .map(|c| CollisionAnalyzer::new(c.sites()));
        if collision.is_some() {
            info!("Collision analysis enabled, memory events are not traced");
        }
        info!(
            "Capture started: queue capacity {}, lockstep {}, {} backend(s)",
            config.queue_capacity,
            lockstep.is_some(),
            config.backends
        );

        Ok(Capture {
            policy: BoundaryPolicy {
                pausing: config.pausing,
            },
            config,
            global: Mutex::new(()),
            queue,
            stats,
            drain: Some(drain),
            lockstep,
            collision,
            memory,
            sites: Mutex::new(SiteTables::default()),
            root,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &TraceStats {
        &self.stats
    }

    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Hand `ev` to the queue. Must be called with the capture lock held.
    fn enqueue(&self, ev: Event) {
        let kind = ev.kind();
        self.stats.record_enqueue(kind);
        if let Err(ev) = self.queue.push(ev) {
            trace!("drain stopped, dropping {}", ev);
            self.stats.record_undelivered(kind);
        }
    }

    /// Region boundary after `kind`/`semantics` was emitted by `tid`; waits
    /// for the backends at lockstep checkpoints. Must be called without the
    /// capture lock.
    fn boundary(&self, tid: ThreadId, kind: EventKind, semantics: Semantics) -> CaptureResult<()> {
        if BoundaryPolicy::is_boundary(kind, semantics) {
            self.stats.record_region_boundary();
        }
        if !self.policy.is_checkpoint(kind, semantics) {
            return Ok(());
        }
        match &self.lockstep {
            Some(sync) => sync.wait_for_backends(tid),
            None => Ok(()),
        }
    }

    fn site_info(&self, ctx: &ThreadContext, site: CodeSite) -> SiteInfo {
        if !self.config.site_tracking {
            return SiteInfo::default();
        }
        let (prev_line, prev_file) = ctx.last_site();
        SiteInfo {
            line: site.line,
            file: site.file,
            routine: site.routine,
            prev_line,
            prev_file,
        }
    }

    /// Build the events for one access, wide operands split into 8-byte
    /// pieces, each with its own datum snapshot.
    fn memory_events(
        &self,
        ctx: &ThreadContext,
        kind: EventKind,
        addr: u64,
        size: u32,
        stack: bool,
        site: SiteInfo,
    ) -> CaptureResult<Vec<Event>> {
        split_access(addr, size)?
            .into_iter()
            .map(|(a, s)| {
                let value = snapshot(self.memory.as_ref(), a, s)?;
                Event::memory(kind, ctx.tid(), a, s, stack, site)?.with_value(value)
            })
            .collect()
    }

    fn analyze_collision(&self, collision: &CollisionAnalyzer, events: &[Event]) -> CaptureResult<()> {
        for ev in events {
            collision.observe(ev)?;
        }
        Ok(())
    }

    fn emit_paired(
        &self,
        ctx: &mut ThreadContext,
        kind: EventKind,
        semantics: Semantics,
        lock_addr: Option<u64>,
    ) -> CaptureResult<()> {
        {
            let _guard = self.global.lock().unwrap();
            if ctx.is_suppressed() {
                return Ok(());
            }
            let ev = match lock_addr {
                Some(addr) => Event::lock(kind, semantics, ctx.tid(), addr)?,
                None => Event::thread(kind, semantics, ctx.tid())?,
            };
            match (kind, semantics) {
                (EventKind::LockAcquire, Semantics::End) => ctx.note_acquire(),
                (EventKind::LockRelease, _) => ctx.note_release(),
                _ => {}
            }
            self.enqueue(ev);
        }
        self.boundary(ctx.tid(), kind, semantics)
    }

    // -----------------------------------------------------------------------
    // Thread lifecycle
    // -----------------------------------------------------------------------

    pub fn thread_begin(&self, tid: ThreadId) -> CaptureResult<ThreadContext> {
        let _guard = self.global.lock().unwrap();
        self.enqueue(Event::thread(EventKind::ThreadStart, Semantics::End, tid)?);
        debug!("Thread start: {}", tid);
        Ok(ThreadContext::new(tid))
    }

    /// Emits the thread's finish boundary. The finish of the root thread
    /// stops the drain. Never waits for backends.
    pub fn thread_end(&self, ctx: ThreadContext) -> CaptureResult<()> {
        let _guard = self.global.lock().unwrap();
        if ctx.is_suppressed() {
            warn!(
                "Thread {} finished inside {} suppression scope(s)",
                ctx.tid(),
                ctx.suppression_depth()
            );
        }
        if ctx.has_staged_write() {
            warn!("Thread {} finished with a staged write", ctx.tid());
        }
        self.enqueue(Event::thread(
            EventKind::ThreadFinish,
            Semantics::End,
            ctx.tid(),
        )?);
        debug!("Thread end: {}", ctx.tid());
        Ok(())
    }

    pub fn before_thread_spawn(&self, ctx: &mut ThreadContext) -> CaptureResult<()> {
        self.emit_paired(ctx, EventKind::ThreadSpawn, Semantics::End, None)
    }

    pub fn after_join(&self, ctx: &mut ThreadContext) -> CaptureResult<()> {
        self.emit_paired(ctx, EventKind::ThreadJoin, Semantics::End, None)
    }

    // -----------------------------------------------------------------------
    // Region markers
    // -----------------------------------------------------------------------

    /// Program-defined marker. Emitted even inside suppression scopes.
    pub fn region(&self, ctx: &ThreadContext, kind: EventKind) -> CaptureResult<()> {
        let ev = Event::region(kind, ctx.tid())?;
        let _guard = self.global.lock().unwrap();
        debug!("{} on thread {}", kind, ctx.tid());
        self.enqueue(ev);
        Ok(())
    }

    pub fn roi_start(&self, ctx: &ThreadContext) -> CaptureResult<()> {
        self.region(ctx, EventKind::RoiStart)
    }

    pub fn roi_end(&self, ctx: &ThreadContext) -> CaptureResult<()> {
        self.region(ctx, EventKind::RoiEnd)
    }

    pub fn server_roi_start(&self, ctx: &ThreadContext) -> CaptureResult<()> {
        self.region(ctx, EventKind::ServerRoiStart)
    }

    pub fn server_roi_end(&self, ctx: &ThreadContext) -> CaptureResult<()> {
        self.region(ctx, EventKind::ServerRoiEnd)
    }

    pub fn trans_start(&self, ctx: &ThreadContext) -> CaptureResult<()> {
        self.region(ctx, EventKind::TransStart)
    }

    pub fn trans_end(&self, ctx: &ThreadContext) -> CaptureResult<()> {
        self.region(ctx, EventKind::TransEnd)
    }

    pub fn checkpoint(&self, ctx: &ThreadContext) -> CaptureResult<()> {
        self.region(ctx, EventKind::CheckPoint)
    }

    // -----------------------------------------------------------------------
    // Suppression
    // -----------------------------------------------------------------------

    pub fn begin_suppression(&self, ctx: &mut ThreadContext) {
        if self.config.suppress_library_internals {
            ctx.begin_suppression();
        }
    }

    pub fn end_suppression(&self, ctx: &mut ThreadContext) -> CaptureResult<()> {
        if self.config.suppress_library_internals {
            ctx.end_suppression()?;
        }
        Ok(())
    }

    /// See [`ThreadContext::end_suppression_twice`].
    pub fn end_suppression_twice(&self, ctx: &mut ThreadContext) -> CaptureResult<()> {
        if self.config.suppress_library_internals {
            ctx.end_suppression_twice()?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    pub fn record_site(&self, ctx: &mut ThreadContext, line: u16, file: u16) {
        ctx.record_site(line, file);
    }

    /// Index for a source file name, for use in [`CodeSite::file`].
    pub fn file_index(&self, name: &str) -> u16 {
        self.sites.lock().unwrap().files.intern(name).unwrap_or_else(|| {
            warn!("Source file index space exhausted at {}", name);
            0
        })
    }

    /// Index for a routine name, for use in [`CodeSite::routine`].
    pub fn routine_index(&self, name: &str) -> u16 {
        self.sites
            .lock()
            .unwrap()
            .routines
            .intern(name)
            .unwrap_or_else(|| {
                warn!("Routine index space exhausted at {}", name);
                0
            })
    }

    /// A load. Atomic read-modify-write operands are traced as
    /// `ATOMIC_READ`; the engine reports their store half separately.
    pub fn read_access(&self, ctx: &mut ThreadContext, access: Access, site: CodeSite) -> CaptureResult<()> {
        let kind = if access.atomic {
            EventKind::AtomicRead
        } else {
            EventKind::MemoryRead
        };
        if let Some(collision) = &self.collision {
            if ctx.is_suppressed() {
                return Ok(());
            }
            let site = SiteInfo {
                line: site.line,
                file: site.file,
                routine: site.routine,
                prev_line: site.line,
                prev_file: site.file,
            };
            let events = self.memory_events(ctx, kind, access.addr, access.size, access.stack, site)?;
            return self.analyze_collision(collision, &events);
        }

        let _guard = self.global.lock().unwrap();
        if ctx.is_suppressed() {
            return Ok(());
        }
        let site = self.site_info(ctx, site);
        for ev in self.memory_events(ctx, kind, access.addr, access.size, access.stack, site)? {
            self.enqueue(ev);
        }
        Ok(())
    }

    /// First half of a store: remember the operand until the store retires.
    pub fn before_write(&self, ctx: &mut ThreadContext, access: Access) -> CaptureResult<()> {
        let _guard = self.global.lock().unwrap();
        if ctx.is_suppressed() {
            return Ok(());
        }
        split_access(access.addr, access.size)?;
        ctx.stage_write(PendingWrite {
            kind: if access.atomic {
                EventKind::AtomicWrite
            } else {
                EventKind::MemoryWrite
            },
            addr: access.addr,
            size: access.size,
            stack: access.stack,
        });
        Ok(())
    }

    /// Second half of a store: emit the staged write with the value now in
    /// memory.
    pub fn after_write(&self, ctx: &mut ThreadContext, size: u32, site: CodeSite) -> CaptureResult<()> {
        if let Some(collision) = &self.collision {
            if ctx.is_suppressed() {
                return Ok(());
            }
            let w = ctx.take_staged_write(size)?;
            let site = SiteInfo {
                line: site.line,
                file: site.file,
                routine: site.routine,
                prev_line: site.line,
                prev_file: site.file,
            };
            let events = self.memory_events(ctx, w.kind, w.addr, w.size, w.stack, site)?;
            return self.analyze_collision(collision, &events);
        }

        let _guard = self.global.lock().unwrap();
        if ctx.is_suppressed() {
            return Ok(());
        }
        let w = ctx.take_staged_write(size)?;
        let site = self.site_info(ctx, site);
        for ev in self.memory_events(ctx, w.kind, w.addr, w.size, w.stack, site)? {
            self.enqueue(ev);
        }
        Ok(())
    }

    pub fn allocation(&self, ctx: &mut ThreadContext, kind: EventKind, addr: u64, extent: u32) -> CaptureResult<()> {
        let ev = Event::allocation(kind, ctx.tid(), addr, extent)?;
        let _guard = self.global.lock().unwrap();
        if !ctx.is_suppressed() {
            self.enqueue(ev);
        }
        Ok(())
    }

    pub fn basic_block(&self, ctx: &mut ThreadContext, insn_count: u32) -> CaptureResult<()> {
        let _guard = self.global.lock().unwrap();
        if !ctx.is_suppressed() {
            self.enqueue(Event::basic_block(ctx.tid(), insn_count));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Locks
    // -----------------------------------------------------------------------

    /// End of the region preceding an acquire; a lockstep checkpoint.
    pub fn before_lock_acquire(&self, ctx: &mut ThreadContext, lock: u64) -> CaptureResult<()> {
        self.emit_paired(ctx, EventKind::LockAcquire, Semantics::End, Some(lock))
    }

    /// Start of the region after the acquire returned.
    pub fn after_lock_acquire(&self, ctx: &mut ThreadContext, lock: u64) -> CaptureResult<()> {
        self.emit_paired(ctx, EventKind::LockAcquire, Semantics::Begin, Some(lock))
    }

    /// End of the region preceding a release; a lockstep checkpoint unless
    /// the backends are pausing.
    pub fn before_lock_release(&self, ctx: &mut ThreadContext, lock: u64) -> CaptureResult<()> {
        self.emit_paired(ctx, EventKind::LockRelease, Semantics::End, Some(lock))
    }

    /// Access to a reader/writer lock word by the lock implementation.
    pub fn lock_access(&self, ctx: &mut ThreadContext, kind: EventKind, addr: u64) -> CaptureResult<()> {
        let ev = Event::lock_access(kind, ctx.tid(), addr)?;
        let _guard = self.global.lock().unwrap();
        if !ctx.is_suppressed() {
            self.enqueue(ev);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    fn write_outputs(&self, report: &StatsReport) -> Result<()> {
        if let Some(path) = &self.config.stats_file {
            let mut f = BufWriter::new(
                File::create(path)
                    .with_context(|| format!("Failed to create stats file {}", path.display()))?,
            );
            match self.config.stats_format {
                StatsFormat::Text => report.format(&mut f)?,
                StatsFormat::Json => report.format_json(&mut f)?,
            }
            f.flush()?;
        }
        let sites = self.sites.lock().unwrap();
        for (path, table) in [
            (&self.config.source_index_file, &sites.files),
            (&self.config.routine_index_file, &sites.routines),
        ] {
            if let Some(path) = path {
                let mut f = BufWriter::new(
                    File::create(path)
                        .with_context(|| format!("Failed to create index {}", path.display()))?,
                );
                table.write_to(&mut f)?;
                f.flush()?;
            }
        }
        Ok(())
    }

    /// Stop the pipeline and account for every event.
    ///
    /// Must be called once all monitored threads have stopped calling into
    /// the capture. Events still queued after the drain stopped at the root
    /// thread's finish are counted as undelivered. With statistics tracking
    /// on, any enqueue/dequeue difference other than late thread start and
    /// finish records is a fault.
    pub fn finish(mut self) -> Result<StatsReport> {
        self.queue.close();
        let summary = match self.drain.take() {
            Some(d) => d.join()?,
            None => DrainSummary::default(),
        };
        if !summary.root_finished {
            warn!("Drain stopped before thread {} finished", self.root);
        }
        for ev in self.queue.drain_remaining() {
            self.stats.record_undelivered(ev.kind());
        }
        if self.config.track_stats {
            self.stats.verify()?;
        }
        let mut report = self.stats.report();
        report.collision = self.collision.as_ref().map(|c| c.tally());
        self.write_outputs(&report)?;
        info!(
            "Capture finished: {} events written, {} undelivered",
            summary.written, report.total_undelivered
        );
        Ok(report)
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.queue.close();
    }
}
