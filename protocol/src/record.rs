use crate::wire::{self, Cursor, Result, WireError};

/// Lock flavor announced by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Exclusive,
    Shared,
}

impl LockKind {
    fn to_u8(self) -> u8 {
        match self {
            LockKind::Exclusive => 0,
            LockKind::Shared => 1,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(LockKind::Exclusive),
            1 => Ok(LockKind::Shared),
            other => Err(WireError::UnknownLockKind(other)),
        }
    }
}

/// Synthetic allocation-site frame carried by `CallstackAllocPayload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocSite {
    pub name: String,
    pub file: String,
    pub line: u32,
}

mod tag {
    pub const ZONE_BEGIN: u8 = 1;
    pub const ZONE_BEGIN_CALLSTACK: u8 = 2;
    pub const ZONE_BEGIN_ALLOC: u8 = 3;
    pub const ZONE_BEGIN_ALLOC_CALLSTACK: u8 = 4;
    pub const ZONE_END: u8 = 5;
    pub const ZONE_VALIDATION: u8 = 6;
    pub const ZONE_TEXT: u8 = 7;
    pub const ZONE_NAME: u8 = 8;
    pub const FRAME_MARK: u8 = 9;
    pub const FRAME_MARK_START: u8 = 10;
    pub const FRAME_MARK_END: u8 = 11;
    pub const LOCK_ANNOUNCE: u8 = 12;
    pub const LOCK_TERMINATE: u8 = 13;
    pub const LOCK_WAIT: u8 = 14;
    pub const LOCK_OBTAIN: u8 = 15;
    pub const LOCK_RELEASE: u8 = 16;
    pub const LOCK_SHARED_WAIT: u8 = 17;
    pub const LOCK_SHARED_OBTAIN: u8 = 18;
    pub const LOCK_SHARED_RELEASE: u8 = 19;
    pub const LOCK_MARK: u8 = 20;
    pub const PLOT_DATA: u8 = 21;
    pub const MESSAGE: u8 = 22;
    pub const MESSAGE_LITERAL: u8 = 23;
    pub const MESSAGE_COLOR: u8 = 24;
    pub const MESSAGE_LITERAL_COLOR: u8 = 25;
    pub const GPU_NEW_CONTEXT: u8 = 26;
    pub const GPU_ZONE_BEGIN: u8 = 27;
    pub const GPU_ZONE_BEGIN_CALLSTACK: u8 = 28;
    pub const GPU_ZONE_END: u8 = 29;
    pub const GPU_TIME: u8 = 30;
    pub const MEM_ALLOC: u8 = 31;
    pub const MEM_ALLOC_CALLSTACK: u8 = 32;
    pub const MEM_FREE: u8 = 33;
    pub const MEM_FREE_CALLSTACK: u8 = 34;
    pub const CALLSTACK: u8 = 35;
    pub const CALLSTACK_ALLOC: u8 = 36;
    pub const CALLSTACK_MEMORY: u8 = 37;
    pub const CALLSTACK_PAYLOAD: u8 = 38;
    pub const CALLSTACK_ALLOC_PAYLOAD: u8 = 39;
    pub const CALLSTACK_FRAME_SIZE: u8 = 40;
    pub const CALLSTACK_FRAME: u8 = 41;
    pub const SOURCE_LOCATION: u8 = 42;
    pub const SOURCE_LOCATION_PAYLOAD: u8 = 43;
    pub const STRING_DATA: u8 = 44;
    pub const THREAD_NAME: u8 = 45;
    pub const PLOT_NAME: u8 = 46;
    pub const FRAME_NAME: u8 = 47;
    pub const CUSTOM_STRING_DATA: u8 = 48;
    pub const CRASH: u8 = 49;
    pub const CRASH_REPORT: u8 = 50;
    pub const SYS_TIME_REPORT: u8 = 51;
    pub const TERMINATE: u8 = 52;
    pub const KEEP_ALIVE: u8 = 53;
}

/// One decoded protocol record. Dynamic strings travel as separate
/// `CustomStringData`/`StringData` transfers referenced by origin pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    ZoneBegin { thread: u64, time: i64, src_loc: u64, cpu: i16 },
    ZoneBeginCallstack { thread: u64, time: i64, src_loc: u64, cpu: i16 },
    ZoneBeginAllocSrcLoc { thread: u64, time: i64, src_loc: u64, cpu: i16 },
    ZoneBeginAllocSrcLocCallstack { thread: u64, time: i64, src_loc: u64, cpu: i16 },
    ZoneEnd { thread: u64, time: i64, cpu: i16 },
    ZoneValidation { thread: u64, id: u32 },
    ZoneText { thread: u64, text: u64 },
    ZoneName { thread: u64, text: u64 },
    FrameMark { name: u64, time: i64 },
    FrameMarkStart { name: u64, time: i64 },
    FrameMarkEnd { name: u64, time: i64 },
    LockAnnounce { id: u32, time: i64, src_loc: u64, kind: LockKind },
    LockTerminate { id: u32, time: i64, kind: LockKind },
    LockWait { id: u32, thread: u64, time: i64, kind: LockKind },
    LockObtain { id: u32, thread: u64, time: i64 },
    LockRelease { id: u32, thread: u64, time: i64 },
    LockSharedWait { id: u32, thread: u64, time: i64 },
    LockSharedObtain { id: u32, thread: u64, time: i64 },
    LockSharedRelease { id: u32, thread: u64, time: i64 },
    LockMark { id: u32, thread: u64, src_loc: u64 },
    PlotData { name: u64, time: i64, value: f64 },
    Message { thread: u64, time: i64, text: u64 },
    MessageLiteral { thread: u64, time: i64, text: u64 },
    MessageColor { thread: u64, time: i64, text: u64, color: u32 },
    MessageLiteralColor { thread: u64, time: i64, text: u64, color: u32 },
    GpuNewContext { context: u8, thread: u64, cpu_time: i64, gpu_time: i64, period: f32 },
    GpuZoneBegin { context: u8, thread: u64, cpu_time: i64, src_loc: u64, query_id: u16 },
    GpuZoneBeginCallstack { context: u8, thread: u64, cpu_time: i64, src_loc: u64, query_id: u16 },
    GpuZoneEnd { context: u8, cpu_time: i64, query_id: u16 },
    GpuTime { context: u8, query_id: u16, gpu_time: i64 },
    MemAlloc { thread: u64, time: i64, ptr: u64, size: u64 },
    MemAllocCallstack { thread: u64, time: i64, ptr: u64, size: u64 },
    MemFree { thread: u64, time: i64, ptr: u64 },
    MemFreeCallstack { thread: u64, time: i64, ptr: u64 },
    Callstack { thread: u64, ptr: u64 },
    CallstackAlloc { thread: u64, ptr: u64 },
    CallstackMemory { ptr: u64 },
    CallstackPayload { ptr: u64, frames: Vec<u64> },
    CallstackAllocPayload { ptr: u64, frames: Vec<u64>, sites: Vec<AllocSite> },
    CallstackFrameSize { ptr: u64, count: u8 },
    CallstackFrame { name: String, file: String, line: u32 },
    SourceLocation { ptr: u64, name: u64, function: u64, file: u64, line: u32, color: u32 },
    SourceLocationPayload {
        ptr: u64,
        line: u32,
        color: u32,
        name: String,
        function: String,
        file: String,
    },
    StringData { ptr: u64, text: String },
    ThreadName { thread: u64, name: String },
    PlotName { name: u64, text: String },
    FrameName { name: u64, text: String },
    CustomStringData { ptr: u64, text: String },
    Crash { thread: u64, time: i64 },
    CrashReport { thread: u64, time: i64, text: u64 },
    SysTimeReport { time: i64, usage: f32 },
    Terminate,
    KeepAlive,
}

impl Record {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        use Record::*;
        match self {
            ZoneBegin { thread, time, src_loc, cpu } => {
                wire::put_u8(buf, tag::ZONE_BEGIN);
                Self::put_zone_begin(buf, *thread, *time, *src_loc, *cpu);
            }
            ZoneBeginCallstack { thread, time, src_loc, cpu } => {
                wire::put_u8(buf, tag::ZONE_BEGIN_CALLSTACK);
                Self::put_zone_begin(buf, *thread, *time, *src_loc, *cpu);
            }
            ZoneBeginAllocSrcLoc { thread, time, src_loc, cpu } => {
                wire::put_u8(buf, tag::ZONE_BEGIN_ALLOC);
                Self::put_zone_begin(buf, *thread, *time, *src_loc, *cpu);
            }
            ZoneBeginAllocSrcLocCallstack { thread, time, src_loc, cpu } => {
                wire::put_u8(buf, tag::ZONE_BEGIN_ALLOC_CALLSTACK);
                Self::put_zone_begin(buf, *thread, *time, *src_loc, *cpu);
            }
            ZoneEnd { thread, time, cpu } => {
                wire::put_u8(buf, tag::ZONE_END);
                wire::put_u64(buf, *thread);
                wire::put_i64(buf, *time);
                wire::put_i16(buf, *cpu);
            }
            ZoneValidation { thread, id } => {
                wire::put_u8(buf, tag::ZONE_VALIDATION);
                wire::put_u64(buf, *thread);
                wire::put_u32(buf, *id);
            }
            ZoneText { thread, text } => {
                wire::put_u8(buf, tag::ZONE_TEXT);
                wire::put_u64(buf, *thread);
                wire::put_u64(buf, *text);
            }
            ZoneName { thread, text } => {
                wire::put_u8(buf, tag::ZONE_NAME);
                wire::put_u64(buf, *thread);
                wire::put_u64(buf, *text);
            }
            FrameMark { name, time } => {
                wire::put_u8(buf, tag::FRAME_MARK);
                wire::put_u64(buf, *name);
                wire::put_i64(buf, *time);
            }
            FrameMarkStart { name, time } => {
                wire::put_u8(buf, tag::FRAME_MARK_START);
                wire::put_u64(buf, *name);
                wire::put_i64(buf, *time);
            }
            FrameMarkEnd { name, time } => {
                wire::put_u8(buf, tag::FRAME_MARK_END);
                wire::put_u64(buf, *name);
                wire::put_i64(buf, *time);
            }
            LockAnnounce { id, time, src_loc, kind } => {
                wire::put_u8(buf, tag::LOCK_ANNOUNCE);
                wire::put_u32(buf, *id);
                wire::put_i64(buf, *time);
                wire::put_u64(buf, *src_loc);
                wire::put_u8(buf, kind.to_u8());
            }
            LockTerminate { id, time, kind } => {
                wire::put_u8(buf, tag::LOCK_TERMINATE);
                wire::put_u32(buf, *id);
                wire::put_i64(buf, *time);
                wire::put_u8(buf, kind.to_u8());
            }
            LockWait { id, thread, time, kind } => {
                wire::put_u8(buf, tag::LOCK_WAIT);
                wire::put_u32(buf, *id);
                wire::put_u64(buf, *thread);
                wire::put_i64(buf, *time);
                wire::put_u8(buf, kind.to_u8());
            }
            LockObtain { id, thread, time } => {
                wire::put_u8(buf, tag::LOCK_OBTAIN);
                Self::put_lock_event(buf, *id, *thread, *time);
            }
            LockRelease { id, thread, time } => {
                wire::put_u8(buf, tag::LOCK_RELEASE);
                Self::put_lock_event(buf, *id, *thread, *time);
            }
            LockSharedWait { id, thread, time } => {
                wire::put_u8(buf, tag::LOCK_SHARED_WAIT);
                Self::put_lock_event(buf, *id, *thread, *time);
            }
            LockSharedObtain { id, thread, time } => {
                wire::put_u8(buf, tag::LOCK_SHARED_OBTAIN);
                Self::put_lock_event(buf, *id, *thread, *time);
            }
            LockSharedRelease { id, thread, time } => {
                wire::put_u8(buf, tag::LOCK_SHARED_RELEASE);
                Self::put_lock_event(buf, *id, *thread, *time);
            }
            LockMark { id, thread, src_loc } => {
                wire::put_u8(buf, tag::LOCK_MARK);
                wire::put_u32(buf, *id);
                wire::put_u64(buf, *thread);
                wire::put_u64(buf, *src_loc);
            }
            PlotData { name, time, value } => {
                wire::put_u8(buf, tag::PLOT_DATA);
                wire::put_u64(buf, *name);
                wire::put_i64(buf, *time);
                wire::put_f64(buf, *value);
            }
            Message { thread, time, text } => {
                wire::put_u8(buf, tag::MESSAGE);
                Self::put_message(buf, *thread, *time, *text);
            }
            MessageLiteral { thread, time, text } => {
                wire::put_u8(buf, tag::MESSAGE_LITERAL);
                Self::put_message(buf, *thread, *time, *text);
            }
            MessageColor { thread, time, text, color } => {
                wire::put_u8(buf, tag::MESSAGE_COLOR);
                Self::put_message(buf, *thread, *time, *text);
                wire::put_u32(buf, *color);
            }
            MessageLiteralColor { thread, time, text, color } => {
                wire::put_u8(buf, tag::MESSAGE_LITERAL_COLOR);
                Self::put_message(buf, *thread, *time, *text);
                wire::put_u32(buf, *color);
            }
            GpuNewContext { context, thread, cpu_time, gpu_time, period } => {
                wire::put_u8(buf, tag::GPU_NEW_CONTEXT);
                wire::put_u8(buf, *context);
                wire::put_u64(buf, *thread);
                wire::put_i64(buf, *cpu_time);
                wire::put_i64(buf, *gpu_time);
                wire::put_f32(buf, *period);
            }
            GpuZoneBegin { context, thread, cpu_time, src_loc, query_id } => {
                wire::put_u8(buf, tag::GPU_ZONE_BEGIN);
                Self::put_gpu_begin(buf, *context, *thread, *cpu_time, *src_loc, *query_id);
            }
            GpuZoneBeginCallstack { context, thread, cpu_time, src_loc, query_id } => {
                wire::put_u8(buf, tag::GPU_ZONE_BEGIN_CALLSTACK);
                Self::put_gpu_begin(buf, *context, *thread, *cpu_time, *src_loc, *query_id);
            }
            GpuZoneEnd { context, cpu_time, query_id } => {
                wire::put_u8(buf, tag::GPU_ZONE_END);
                wire::put_u8(buf, *context);
                wire::put_i64(buf, *cpu_time);
                wire::put_u16(buf, *query_id);
            }
            GpuTime { context, query_id, gpu_time } => {
                wire::put_u8(buf, tag::GPU_TIME);
                wire::put_u8(buf, *context);
                wire::put_u16(buf, *query_id);
                wire::put_i64(buf, *gpu_time);
            }
            MemAlloc { thread, time, ptr, size } => {
                wire::put_u8(buf, tag::MEM_ALLOC);
                Self::put_mem_alloc(buf, *thread, *time, *ptr, *size);
            }
            MemAllocCallstack { thread, time, ptr, size } => {
                wire::put_u8(buf, tag::MEM_ALLOC_CALLSTACK);
                Self::put_mem_alloc(buf, *thread, *time, *ptr, *size);
            }
            MemFree { thread, time, ptr } => {
                wire::put_u8(buf, tag::MEM_FREE);
                Self::put_mem_free(buf, *thread, *time, *ptr);
            }
            MemFreeCallstack { thread, time, ptr } => {
                wire::put_u8(buf, tag::MEM_FREE_CALLSTACK);
                Self::put_mem_free(buf, *thread, *time, *ptr);
            }
            Callstack { thread, ptr } => {
                wire::put_u8(buf, tag::CALLSTACK);
                wire::put_u64(buf, *thread);
                wire::put_u64(buf, *ptr);
            }
            CallstackAlloc { thread, ptr } => {
                wire::put_u8(buf, tag::CALLSTACK_ALLOC);
                wire::put_u64(buf, *thread);
                wire::put_u64(buf, *ptr);
            }
            CallstackMemory { ptr } => {
                wire::put_u8(buf, tag::CALLSTACK_MEMORY);
                wire::put_u64(buf, *ptr);
            }
            CallstackPayload { ptr, frames } => {
                wire::put_u8(buf, tag::CALLSTACK_PAYLOAD);
                wire::put_u64(buf, *ptr);
                debug_assert!(frames.len() <= u16::MAX as usize);
                wire::put_u16(buf, frames.len() as u16);
                for f in frames {
                    wire::put_u64(buf, *f);
                }
            }
            CallstackAllocPayload { ptr, frames, sites } => {
                wire::put_u8(buf, tag::CALLSTACK_ALLOC_PAYLOAD);
                wire::put_u64(buf, *ptr);
                wire::put_u16(buf, frames.len() as u16);
                for f in frames {
                    wire::put_u64(buf, *f);
                }
                wire::put_u16(buf, sites.len() as u16);
                for s in sites {
                    wire::put_string(buf, &s.name);
                    wire::put_string(buf, &s.file);
                    wire::put_u32(buf, s.line);
                }
            }
            CallstackFrameSize { ptr, count } => {
                wire::put_u8(buf, tag::CALLSTACK_FRAME_SIZE);
                wire::put_u64(buf, *ptr);
                wire::put_u8(buf, *count);
            }
            CallstackFrame { name, file, line } => {
                wire::put_u8(buf, tag::CALLSTACK_FRAME);
                wire::put_string(buf, name);
                wire::put_string(buf, file);
                wire::put_u32(buf, *line);
            }
            SourceLocation { ptr, name, function, file, line, color } => {
                wire::put_u8(buf, tag::SOURCE_LOCATION);
                wire::put_u64(buf, *ptr);
                wire::put_u64(buf, *name);
                wire::put_u64(buf, *function);
                wire::put_u64(buf, *file);
                wire::put_u32(buf, *line);
                wire::put_u32(buf, *color);
            }
            SourceLocationPayload { ptr, line, color, name, function, file } => {
                wire::put_u8(buf, tag::SOURCE_LOCATION_PAYLOAD);
                wire::put_u64(buf, *ptr);
                wire::put_u32(buf, *line);
                wire::put_u32(buf, *color);
                wire::put_string(buf, name);
                wire::put_string(buf, function);
                wire::put_string(buf, file);
            }
            StringData { ptr, text } => {
                wire::put_u8(buf, tag::STRING_DATA);
                wire::put_u64(buf, *ptr);
                wire::put_string(buf, text);
            }
            ThreadName { thread, name } => {
                wire::put_u8(buf, tag::THREAD_NAME);
                wire::put_u64(buf, *thread);
                wire::put_string(buf, name);
            }
            PlotName { name, text } => {
                wire::put_u8(buf, tag::PLOT_NAME);
                wire::put_u64(buf, *name);
                wire::put_string(buf, text);
            }
            FrameName { name, text } => {
                wire::put_u8(buf, tag::FRAME_NAME);
                wire::put_u64(buf, *name);
                wire::put_string(buf, text);
            }
            CustomStringData { ptr, text } => {
                wire::put_u8(buf, tag::CUSTOM_STRING_DATA);
                wire::put_u64(buf, *ptr);
                wire::put_string(buf, text);
            }
            Crash { thread, time } => {
                wire::put_u8(buf, tag::CRASH);
                wire::put_u64(buf, *thread);
                wire::put_i64(buf, *time);
            }
            CrashReport { thread, time, text } => {
                wire::put_u8(buf, tag::CRASH_REPORT);
                wire::put_u64(buf, *thread);
                wire::put_i64(buf, *time);
                wire::put_u64(buf, *text);
            }
            SysTimeReport { time, usage } => {
                wire::put_u8(buf, tag::SYS_TIME_REPORT);
                wire::put_i64(buf, *time);
                wire::put_f32(buf, *usage);
            }
            Terminate => wire::put_u8(buf, tag::TERMINATE),
            KeepAlive => wire::put_u8(buf, tag::KEEP_ALIVE),
        }
    }

    fn put_zone_begin(buf: &mut Vec<u8>, thread: u64, time: i64, src_loc: u64, cpu: i16) {
        wire::put_u64(buf, thread);
        wire::put_i64(buf, time);
        wire::put_u64(buf, src_loc);
        wire::put_i16(buf, cpu);
    }

    fn put_lock_event(buf: &mut Vec<u8>, id: u32, thread: u64, time: i64) {
        wire::put_u32(buf, id);
        wire::put_u64(buf, thread);
        wire::put_i64(buf, time);
    }

    fn put_message(buf: &mut Vec<u8>, thread: u64, time: i64, text: u64) {
        wire::put_u64(buf, thread);
        wire::put_i64(buf, time);
        wire::put_u64(buf, text);
    }

    fn put_gpu_begin(
        buf: &mut Vec<u8>,
        context: u8,
        thread: u64,
        cpu_time: i64,
        src_loc: u64,
        query_id: u16,
    ) {
        wire::put_u8(buf, context);
        wire::put_u64(buf, thread);
        wire::put_i64(buf, cpu_time);
        wire::put_u64(buf, src_loc);
        wire::put_u16(buf, query_id);
    }

    fn put_mem_alloc(buf: &mut Vec<u8>, thread: u64, time: i64, ptr: u64, size: u64) {
        wire::put_u64(buf, thread);
        wire::put_i64(buf, time);
        wire::put_u64(buf, ptr);
        wire::put_u64(buf, size);
    }

    fn put_mem_free(buf: &mut Vec<u8>, thread: u64, time: i64, ptr: u64) {
        wire::put_u64(buf, thread);
        wire::put_i64(buf, time);
        wire::put_u64(buf, ptr);
    }

    pub fn decode(c: &mut Cursor<'_>) -> Result<Record> {
        let t = c.read_u8()?;
        let rec = match t {
            tag::ZONE_BEGIN => Self::read_zone_begin(c, ZoneBeginKind::Plain)?,
            tag::ZONE_BEGIN_CALLSTACK => Self::read_zone_begin(c, ZoneBeginKind::Callstack)?,
            tag::ZONE_BEGIN_ALLOC => Self::read_zone_begin(c, ZoneBeginKind::Alloc)?,
            tag::ZONE_BEGIN_ALLOC_CALLSTACK => {
                Self::read_zone_begin(c, ZoneBeginKind::AllocCallstack)?
            }
            tag::ZONE_END => Record::ZoneEnd {
                thread: c.read_u64()?,
                time: c.read_i64()?,
                cpu: c.read_i16()?,
            },
            tag::ZONE_VALIDATION => Record::ZoneValidation {
                thread: c.read_u64()?,
                id: c.read_u32()?,
            },
            tag::ZONE_TEXT => Record::ZoneText {
                thread: c.read_u64()?,
                text: c.read_u64()?,
            },
            tag::ZONE_NAME => Record::ZoneName {
                thread: c.read_u64()?,
                text: c.read_u64()?,
            },
            tag::FRAME_MARK => Record::FrameMark {
                name: c.read_u64()?,
                time: c.read_i64()?,
            },
            tag::FRAME_MARK_START => Record::FrameMarkStart {
                name: c.read_u64()?,
                time: c.read_i64()?,
            },
            tag::FRAME_MARK_END => Record::FrameMarkEnd {
                name: c.read_u64()?,
                time: c.read_i64()?,
            },
            tag::LOCK_ANNOUNCE => Record::LockAnnounce {
                id: c.read_u32()?,
                time: c.read_i64()?,
                src_loc: c.read_u64()?,
                kind: LockKind::from_u8(c.read_u8()?)?,
            },
            tag::LOCK_TERMINATE => Record::LockTerminate {
                id: c.read_u32()?,
                time: c.read_i64()?,
                kind: LockKind::from_u8(c.read_u8()?)?,
            },
            tag::LOCK_WAIT => Record::LockWait {
                id: c.read_u32()?,
                thread: c.read_u64()?,
                time: c.read_i64()?,
                kind: LockKind::from_u8(c.read_u8()?)?,
            },
            tag::LOCK_OBTAIN => {
                let (id, thread, time) = Self::read_lock_event(c)?;
                Record::LockObtain { id, thread, time }
            }
            tag::LOCK_RELEASE => {
                let (id, thread, time) = Self::read_lock_event(c)?;
                Record::LockRelease { id, thread, time }
            }
            tag::LOCK_SHARED_WAIT => {
                let (id, thread, time) = Self::read_lock_event(c)?;
                Record::LockSharedWait { id, thread, time }
            }
            tag::LOCK_SHARED_OBTAIN => {
                let (id, thread, time) = Self::read_lock_event(c)?;
                Record::LockSharedObtain { id, thread, time }
            }
            tag::LOCK_SHARED_RELEASE => {
                let (id, thread, time) = Self::read_lock_event(c)?;
                Record::LockSharedRelease { id, thread, time }
            }
            tag::LOCK_MARK => Record::LockMark {
                id: c.read_u32()?,
                thread: c.read_u64()?,
                src_loc: c.read_u64()?,
            },
            tag::PLOT_DATA => Record::PlotData {
                name: c.read_u64()?,
                time: c.read_i64()?,
                value: c.read_f64()?,
            },
            tag::MESSAGE => {
                let (thread, time, text) = Self::read_message(c)?;
                Record::Message { thread, time, text }
            }
            tag::MESSAGE_LITERAL => {
                let (thread, time, text) = Self::read_message(c)?;
                Record::MessageLiteral { thread, time, text }
            }
            tag::MESSAGE_COLOR => {
                let (thread, time, text) = Self::read_message(c)?;
                Record::MessageColor {
                    thread,
                    time,
                    text,
                    color: c.read_u32()?,
                }
            }
            tag::MESSAGE_LITERAL_COLOR => {
                let (thread, time, text) = Self::read_message(c)?;
                Record::MessageLiteralColor {
                    thread,
                    time,
                    text,
                    color: c.read_u32()?,
                }
            }
            tag::GPU_NEW_CONTEXT => Record::GpuNewContext {
                context: c.read_u8()?,
                thread: c.read_u64()?,
                cpu_time: c.read_i64()?,
                gpu_time: c.read_i64()?,
                period: c.read_f32()?,
            },
            tag::GPU_ZONE_BEGIN => {
                let (context, thread, cpu_time, src_loc, query_id) = Self::read_gpu_begin(c)?;
                Record::GpuZoneBegin { context, thread, cpu_time, src_loc, query_id }
            }
            tag::GPU_ZONE_BEGIN_CALLSTACK => {
                let (context, thread, cpu_time, src_loc, query_id) = Self::read_gpu_begin(c)?;
                Record::GpuZoneBeginCallstack { context, thread, cpu_time, src_loc, query_id }
            }
            tag::GPU_ZONE_END => Record::GpuZoneEnd {
                context: c.read_u8()?,
                cpu_time: c.read_i64()?,
                query_id: c.read_u16()?,
            },
            tag::GPU_TIME => Record::GpuTime {
                context: c.read_u8()?,
                query_id: c.read_u16()?,
                gpu_time: c.read_i64()?,
            },
            tag::MEM_ALLOC => {
                let (thread, time, ptr, size) = Self::read_mem_alloc(c)?;
                Record::MemAlloc { thread, time, ptr, size }
            }
            tag::MEM_ALLOC_CALLSTACK => {
                let (thread, time, ptr, size) = Self::read_mem_alloc(c)?;
                Record::MemAllocCallstack { thread, time, ptr, size }
            }
            tag::MEM_FREE => Record::MemFree {
                thread: c.read_u64()?,
                time: c.read_i64()?,
                ptr: c.read_u64()?,
            },
            tag::MEM_FREE_CALLSTACK => Record::MemFreeCallstack {
                thread: c.read_u64()?,
                time: c.read_i64()?,
                ptr: c.read_u64()?,
            },
            tag::CALLSTACK => Record::Callstack {
                thread: c.read_u64()?,
                ptr: c.read_u64()?,
            },
            tag::CALLSTACK_ALLOC => Record::CallstackAlloc {
                thread: c.read_u64()?,
                ptr: c.read_u64()?,
            },
            tag::CALLSTACK_MEMORY => Record::CallstackMemory { ptr: c.read_u64()? },
            tag::CALLSTACK_PAYLOAD => {
                let ptr = c.read_u64()?;
                let n = c.read_u16()? as usize;
                let mut frames = Vec::with_capacity(n);
                for _ in 0..n {
                    frames.push(c.read_u64()?);
                }
                Record::CallstackPayload { ptr, frames }
            }
            tag::CALLSTACK_ALLOC_PAYLOAD => {
                let ptr = c.read_u64()?;
                let n = c.read_u16()? as usize;
                let mut frames = Vec::with_capacity(n);
                for _ in 0..n {
                    frames.push(c.read_u64()?);
                }
                let n = c.read_u16()? as usize;
                let mut sites = Vec::with_capacity(n);
                for _ in 0..n {
                    sites.push(AllocSite {
                        name: c.read_string()?,
                        file: c.read_string()?,
                        line: c.read_u32()?,
                    });
                }
                Record::CallstackAllocPayload { ptr, frames, sites }
            }
            tag::CALLSTACK_FRAME_SIZE => Record::CallstackFrameSize {
                ptr: c.read_u64()?,
                count: c.read_u8()?,
            },
            tag::CALLSTACK_FRAME => Record::CallstackFrame {
                name: c.read_string()?,
                file: c.read_string()?,
                line: c.read_u32()?,
            },
            tag::SOURCE_LOCATION => Record::SourceLocation {
                ptr: c.read_u64()?,
                name: c.read_u64()?,
                function: c.read_u64()?,
                file: c.read_u64()?,
                line: c.read_u32()?,
                color: c.read_u32()?,
            },
            tag::SOURCE_LOCATION_PAYLOAD => Record::SourceLocationPayload {
                ptr: c.read_u64()?,
                line: c.read_u32()?,
                color: c.read_u32()?,
                name: c.read_string()?,
                function: c.read_string()?,
                file: c.read_string()?,
            },
            tag::STRING_DATA => Record::StringData {
                ptr: c.read_u64()?,
                text: c.read_string()?,
            },
            tag::THREAD_NAME => Record::ThreadName {
                thread: c.read_u64()?,
                name: c.read_string()?,
            },
            tag::PLOT_NAME => Record::PlotName {
                name: c.read_u64()?,
                text: c.read_string()?,
            },
            tag::FRAME_NAME => Record::FrameName {
                name: c.read_u64()?,
                text: c.read_string()?,
            },
            tag::CUSTOM_STRING_DATA => Record::CustomStringData {
                ptr: c.read_u64()?,
                text: c.read_string()?,
            },
            tag::CRASH => Record::Crash {
                thread: c.read_u64()?,
                time: c.read_i64()?,
            },
            tag::CRASH_REPORT => Record::CrashReport {
                thread: c.read_u64()?,
                time: c.read_i64()?,
                text: c.read_u64()?,
            },
            tag::SYS_TIME_REPORT => Record::SysTimeReport {
                time: c.read_i64()?,
                usage: c.read_f32()?,
            },
            tag::TERMINATE => Record::Terminate,
            tag::KEEP_ALIVE => Record::KeepAlive,
            other => return Err(WireError::UnknownTag(other)),
        };
        Ok(rec)
    }

    fn read_zone_begin(c: &mut Cursor<'_>, kind: ZoneBeginKind) -> Result<Record> {
        let thread = c.read_u64()?;
        let time = c.read_i64()?;
        let src_loc = c.read_u64()?;
        let cpu = c.read_i16()?;
        Ok(match kind {
            ZoneBeginKind::Plain => Record::ZoneBegin { thread, time, src_loc, cpu },
            ZoneBeginKind::Callstack => Record::ZoneBeginCallstack { thread, time, src_loc, cpu },
            ZoneBeginKind::Alloc => Record::ZoneBeginAllocSrcLoc { thread, time, src_loc, cpu },
            ZoneBeginKind::AllocCallstack => {
                Record::ZoneBeginAllocSrcLocCallstack { thread, time, src_loc, cpu }
            }
        })
    }

    fn read_lock_event(c: &mut Cursor<'_>) -> Result<(u32, u64, i64)> {
        Ok((c.read_u32()?, c.read_u64()?, c.read_i64()?))
    }

    fn read_message(c: &mut Cursor<'_>) -> Result<(u64, i64, u64)> {
        Ok((c.read_u64()?, c.read_i64()?, c.read_u64()?))
    }

    fn read_gpu_begin(c: &mut Cursor<'_>) -> Result<(u8, u64, i64, u64, u16)> {
        Ok((
            c.read_u8()?,
            c.read_u64()?,
            c.read_i64()?,
            c.read_u64()?,
            c.read_u16()?,
        ))
    }

    fn read_mem_alloc(c: &mut Cursor<'_>) -> Result<(u64, i64, u64, u64)> {
        Ok((c.read_u64()?, c.read_i64()?, c.read_u64()?, c.read_u64()?))
    }
}

enum ZoneBeginKind {
    Plain,
    Callstack,
    Alloc,
    AllocCallstack,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Record::ZoneBegin { thread: 7, time: 100, src_loc: 0xdead, cpu: 2 })]
    #[case(Record::ZoneEnd { thread: 7, time: 130, cpu: -1 })]
    #[case(Record::ZoneValidation { thread: 7, id: 42 })]
    #[case(Record::FrameMark { name: 0, time: 5000 })]
    #[case(Record::LockAnnounce { id: 1, time: 10, src_loc: 0x10, kind: LockKind::Shared })]
    #[case(Record::LockWait { id: 1, thread: 9, time: 20, kind: LockKind::Exclusive })]
    #[case(Record::PlotData { name: 0x99, time: 77, value: -1.25 })]
    #[case(Record::MessageColor { thread: 3, time: 9, text: 0x40, color: 0x00ff_00ff })]
    #[case(Record::GpuNewContext { context: 1, thread: 3, cpu_time: 50, gpu_time: 40, period: 1.0 })]
    #[case(Record::GpuZoneBegin { context: 1, thread: 3, cpu_time: 60, src_loc: 0x11, query_id: 5 })]
    #[case(Record::GpuTime { context: 1, query_id: 5, gpu_time: 61 })]
    #[case(Record::MemAlloc { thread: 2, time: 1, ptr: 0x1000, size: 64 })]
    #[case(Record::MemFree { thread: 2, time: 2, ptr: 0x1000 })]
    #[case(Record::CallstackPayload { ptr: 0x5, frames: vec![1, 2, 3] })]
    #[case(Record::CallstackAllocPayload {
        ptr: 0x6,
        frames: vec![4, 5],
        sites: vec![AllocSite { name: "operator new".into(), file: "new.cpp".into(), line: 12 }],
    })]
    #[case(Record::CallstackFrame { name: "main".into(), file: "main.cpp".into(), line: 10 })]
    #[case(Record::SourceLocationPayload {
        ptr: 0x7, line: 3, color: 0xff0000,
        name: "".into(), function: "update".into(), file: "scene.cpp".into(),
    })]
    #[case(Record::StringData { ptr: 0x8, text: "hello".into() })]
    #[case(Record::ThreadName { thread: 11, name: "worker".into() })]
    #[case(Record::CrashReport { thread: 11, time: 400, text: 0x30 })]
    #[case(Record::SysTimeReport { time: 123, usage: 42.5 })]
    #[case(Record::Terminate)]
    #[case(Record::KeepAlive)]
    fn record_roundtrip(#[case] rec: Record) {
        let mut buf = Vec::new();
        rec.encode(&mut buf);
        let mut c = Cursor::new(&buf);
        assert_eq!(Record::decode(&mut c).unwrap(), rec);
        assert!(c.is_empty());
    }

    #[test]
    fn several_records_in_one_block() {
        let records = vec![
            Record::ZoneBegin { thread: 1, time: 100, src_loc: 0xa, cpu: 0 },
            Record::ZoneBegin { thread: 1, time: 110, src_loc: 0xb, cpu: 0 },
            Record::ZoneEnd { thread: 1, time: 120, cpu: 0 },
            Record::ZoneEnd { thread: 1, time: 130, cpu: 0 },
        ];
        let mut buf = Vec::new();
        for r in &records {
            r.encode(&mut buf);
        }
        let mut c = Cursor::new(&buf);
        let mut out = Vec::new();
        while !c.is_empty() {
            out.push(Record::decode(&mut c).unwrap());
        }
        assert_eq!(out, records);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let buf = [0xfeu8];
        let mut c = Cursor::new(&buf);
        assert_eq!(Record::decode(&mut c), Err(WireError::UnknownTag(0xfe)));
    }
}
