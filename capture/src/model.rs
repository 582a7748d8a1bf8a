use std::collections::HashMap;

use protocol::LockKind;

use crate::interner::{CallstackId, Interner, SrcLocRef, StringRef};

/// Index into the zone arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneRef(pub u32);

/// Index into the GPU zone arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuZoneRef(pub u32);

/// One CPU zone. `end` stays `None` while the zone is open; a closed zone
/// always satisfies `end >= start`.
#[derive(Debug, Clone)]
pub struct Zone {
    pub start: i64,
    pub end: Option<i64>,
    /// CPU core the zone began and ended on; -1 when the client did not
    /// report one. `cpu_end` stays -1 while the zone is open.
    pub cpu_start: i16,
    pub cpu_end: i16,
    pub src_loc: SrcLocRef,
    pub text: StringRef,
    pub name: StringRef,
    pub callstack: Option<CallstackId>,
    /// Child-list id, allocated lazily on the first child.
    pub children: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GpuZone {
    pub cpu_start: i64,
    pub cpu_end: Option<i64>,
    pub gpu_start: Option<i64>,
    pub gpu_end: Option<i64>,
    pub src_loc: SrcLocRef,
    pub callstack: Option<CallstackId>,
    pub thread: u16,
    pub children: Option<u32>,
}

#[derive(Debug)]
pub struct Thread {
    pub id: u64,
    pub name: StringRef,
    /// Top-level zones in start order.
    pub timeline: Vec<ZoneRef>,
    /// Message indices, time ordered.
    pub messages: Vec<u32>,
    // Live-session state, not persisted.
    pub stack: Vec<ZoneRef>,
    pub zone_id_stack: Vec<u32>,
    pub next_zone_id: u32,
}

impl Thread {
    fn new(id: u64) -> Self {
        Thread {
            id,
            name: StringRef::None,
            timeline: Vec::new(),
            messages: Vec::new(),
            stack: Vec::new(),
            zone_id_stack: Vec::new(),
            next_zone_id: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEventKind {
    Wait,
    Obtain,
    Release,
    WaitShared,
    ObtainShared,
    ReleaseShared,
}

/// One lock transition with its derived running state. The derived fields
/// describe the lock immediately after this event; thread sets are bitsets
/// over compressed thread indices.
#[derive(Debug, Clone)]
pub struct LockEvent {
    pub time: i64,
    pub thread: u16,
    pub kind: LockEventKind,
    /// Attached retroactively by a lock mark.
    pub src_loc: Option<SrcLocRef>,
    pub lock_count: u8,
    pub locking_thread: u16,
    pub wait_list: u64,
    pub wait_shared: u64,
    pub shared_list: u64,
}

#[derive(Debug)]
pub struct LockMap {
    pub src_loc: SrcLocRef,
    pub kind: LockKind,
    pub announce: Option<i64>,
    pub terminate: Option<i64>,
    /// False for placeholder locks created by a wait on an unannounced id.
    pub valid: bool,
    pub is_contended: bool,
    pub timeline: Vec<LockEvent>,
    /// Threads seen on this lock, in bit order. The derived bitsets index
    /// into this list, so a lock tracks at most 64 threads.
    pub thread_list: Vec<u16>,
}

impl LockMap {
    /// Bit position of a thread in the derived bitsets. Threads past the
    /// 64th are recorded but excluded from contention tracking.
    pub fn thread_bit(&mut self, thread: u16) -> Option<u32> {
        match self.thread_list.iter().position(|&t| t == thread) {
            Some(pos) => Some(pos as u32),
            None => {
                self.thread_list.push(thread);
                let pos = self.thread_list.len() - 1;
                (pos < 64).then_some(pos as u32)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageData {
    pub time: i64,
    pub text: StringRef,
    pub color: u32,
    pub thread: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameEvent {
    pub start: i64,
    pub end: Option<i64>,
}

#[derive(Debug)]
pub struct FrameSet {
    /// Name token; zero is the default continuous set named "Frame".
    pub name: u64,
    pub continuous: bool,
    pub frames: Vec<FrameEvent>,
}

#[derive(Debug, Clone, Copy)]
pub struct PlotItem {
    pub time: i64,
    pub value: f64,
}

#[derive(Debug)]
pub struct PlotSeries {
    pub name: u64,
    pub data: Vec<PlotItem>,
    pub min: f64,
    pub max: f64,
    /// Out-of-order samples held back until the debounce window closes.
    pub postponed: Vec<PlotItem>,
}

#[derive(Debug)]
pub struct GpuContext {
    pub thread: u16,
    pub period: f32,
    /// Rebases raw GPU timestamps onto the CPU clock.
    pub time_diff: i64,
    pub timeline: Vec<GpuZoneRef>,
    // Live-session state, not persisted.
    pub stack: Vec<GpuZoneRef>,
    pub query_slots: Box<[Option<GpuSlot>]>,
}

pub const GPU_QUERY_SLOTS: usize = 8192;

/// Which timestamp the pending query will deliver for the slotted zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuSlot {
    pub zone: GpuZoneRef,
    pub target: GpuSlotTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuSlotTarget {
    Start,
    End,
}

#[derive(Debug, Clone)]
pub struct MemEvent {
    pub ptr: u64,
    pub size: u64,
    pub alloc_time: i64,
    pub alloc_thread: u16,
    pub free_time: Option<i64>,
    pub free_thread: Option<u16>,
    pub callstack_alloc: Option<CallstackId>,
    pub callstack_free: Option<CallstackId>,
}

#[derive(Debug)]
pub struct MemData {
    pub events: Vec<MemEvent>,
    /// Active allocations: ptr to event index.
    pub active: HashMap<u64, u32>,
    /// Event indices in free order.
    pub frees: Vec<u32>,
    pub usage: u64,
    pub low: u64,
    pub high: u64,
}

impl Default for MemData {
    fn default() -> Self {
        MemData {
            events: Vec::new(),
            active: HashMap::new(),
            frees: Vec::new(),
            usage: 0,
            low: u64::MAX,
            high: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrashEvent {
    pub thread: u16,
    pub time: i64,
    pub message: StringRef,
    pub callstack: Option<CallstackId>,
}

/// The reconstructed trace. Every cross-reference is an index into one of
/// the arenas below; loading a capture file rebuilds the same shape.
#[derive(Debug)]
pub struct TraceModel {
    pub strings: Interner,

    pub zones: Vec<Zone>,
    pub zone_children: Vec<Vec<ZoneRef>>,
    pub gpu_zones: Vec<GpuZone>,
    pub gpu_children: Vec<Vec<GpuZoneRef>>,

    pub threads: Vec<Thread>,
    thread_map: HashMap<u64, u16>,

    pub locks: HashMap<u32, LockMap>,
    pub messages: Vec<MessageData>,
    /// Message indices sorted by time.
    pub message_order: Vec<u32>,
    pub frame_sets: Vec<FrameSet>,
    frame_set_map: HashMap<u64, u32>,
    pub gpu_contexts: HashMap<u8, GpuContext>,
    pub plots: Vec<PlotSeries>,
    plot_map: HashMap<u64, u32>,
    pub memory: MemData,
    pub crash: Option<CrashEvent>,
    /// Live-only; not persisted.
    pub sys_time: Vec<(i64, f32)>,

    pub last_time: i64,
    pub timer_mul: f64,
    pub program_name: String,
    pub capture_name: String,
    pub host_info: String,
    pub epoch: u64,
    pub on_demand: bool,
    pub frame_offset: u64,
}

impl TraceModel {
    pub fn new() -> Self {
        let mut model = TraceModel {
            strings: Interner::new(),
            zones: Vec::new(),
            zone_children: Vec::new(),
            gpu_zones: Vec::new(),
            gpu_children: Vec::new(),
            threads: Vec::new(),
            thread_map: HashMap::new(),
            locks: HashMap::new(),
            messages: Vec::new(),
            message_order: Vec::new(),
            frame_sets: Vec::new(),
            frame_set_map: HashMap::new(),
            gpu_contexts: HashMap::new(),
            plots: Vec::new(),
            plot_map: HashMap::new(),
            memory: MemData::default(),
            crash: None,
            sys_time: Vec::new(),
            last_time: 0,
            timer_mul: 1.0,
            program_name: String::new(),
            capture_name: String::new(),
            host_info: String::new(),
            epoch: 0,
            on_demand: false,
            frame_offset: 0,
        };
        // The default frame set exists from the start of every session.
        model.frame_sets.push(FrameSet {
            name: 0,
            continuous: true,
            frames: Vec::new(),
        });
        model.frame_set_map.insert(0, 0);
        model
    }

    /// Maps a client thread id to its compressed index, registering the
    /// thread on first sight.
    pub fn compress_thread(&mut self, id: u64) -> u16 {
        if let Some(&idx) = self.thread_map.get(&id) {
            return idx;
        }
        let idx = self.threads.len() as u16;
        self.threads.push(Thread::new(id));
        self.thread_map.insert(id, idx);
        idx
    }

    pub fn find_thread(&self, id: u64) -> Option<u16> {
        self.thread_map.get(&id).copied()
    }

    pub fn thread(&self, idx: u16) -> &Thread {
        &self.threads[idx as usize]
    }

    pub fn thread_mut(&mut self, idx: u16) -> &mut Thread {
        &mut self.threads[idx as usize]
    }

    pub fn new_zone(&mut self, zone: Zone) -> ZoneRef {
        let r = ZoneRef(self.zones.len() as u32);
        self.zones.push(zone);
        r
    }

    /// Appends `child` to the parent's child list, allocating it first if
    /// this is the parent's first child.
    pub fn add_zone_child(&mut self, parent: ZoneRef, child: ZoneRef) {
        let list = match self.zones[parent.0 as usize].children {
            Some(list) => list,
            None => {
                let list = self.zone_children.len() as u32;
                self.zone_children.push(Vec::new());
                self.zones[parent.0 as usize].children = Some(list);
                list
            }
        };
        self.zone_children[list as usize].push(child);
    }

    pub fn new_gpu_zone(&mut self, zone: GpuZone) -> GpuZoneRef {
        let r = GpuZoneRef(self.gpu_zones.len() as u32);
        self.gpu_zones.push(zone);
        r
    }

    pub fn add_gpu_child(&mut self, parent: GpuZoneRef, child: GpuZoneRef) {
        let list = match self.gpu_zones[parent.0 as usize].children {
            Some(list) => list,
            None => {
                let list = self.gpu_children.len() as u32;
                self.gpu_children.push(Vec::new());
                self.gpu_zones[parent.0 as usize].children = Some(list);
                list
            }
        };
        self.gpu_children[list as usize].push(child);
    }

    /// Inserts a message keeping both the global and the per-thread lists
    /// time ordered. Late arrivals walk back from the tail.
    pub fn insert_message(&mut self, msg: MessageData) {
        let thread = msg.thread;
        let time = msg.time;
        let idx = self.messages.len() as u32;
        self.messages.push(msg);

        let pos = self
            .message_order
            .partition_point(|&m| self.messages[m as usize].time <= time);
        self.message_order.insert(pos, idx);

        let list = &mut self.threads[thread as usize].messages;
        let pos = list.partition_point(|&m| self.messages[m as usize].time <= time);
        list.insert(pos, idx);
    }

    pub fn frame_set(&mut self, name: u64, continuous: bool) -> u32 {
        if let Some(&idx) = self.frame_set_map.get(&name) {
            return idx;
        }
        let idx = self.frame_sets.len() as u32;
        self.frame_sets.push(FrameSet {
            name,
            continuous,
            frames: Vec::new(),
        });
        self.frame_set_map.insert(name, idx);
        idx
    }

    pub fn plot(&mut self, name: u64) -> u32 {
        if let Some(&idx) = self.plot_map.get(&name) {
            return idx;
        }
        let idx = self.plots.len() as u32;
        self.plots.push(PlotSeries {
            name,
            data: Vec::new(),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            postponed: Vec::new(),
        });
        self.plot_map.insert(name, idx);
        idx
    }

    pub fn observe_time(&mut self, time: i64) {
        if time > self.last_time {
            self.last_time = time;
        }
    }

    pub fn zone_children(&self, zone: ZoneRef) -> &[ZoneRef] {
        match self.zones[zone.0 as usize].children {
            Some(list) => &self.zone_children[list as usize],
            None => &[],
        }
    }

    pub fn gpu_zone_children(&self, zone: GpuZoneRef) -> &[GpuZoneRef] {
        match self.gpu_zones[zone.0 as usize].children {
            Some(list) => &self.gpu_children[list as usize],
            None => &[],
        }
    }
}

impl Default for TraceModel {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuContext {
    pub fn new(thread: u16, period: f32, time_diff: i64) -> Self {
        GpuContext {
            thread,
            period,
            time_diff,
            timeline: Vec::new(),
            stack: Vec::new(),
            query_slots: vec![None; GPU_QUERY_SLOTS].into_boxed_slice(),
        }
    }

    /// Raw GPU timestamp to CPU-clock nanoseconds.
    pub fn rebase(&self, gpu_time: i64) -> i64 {
        (gpu_time as f64 * self.period as f64) as i64 + self.time_diff
    }
}
