//! In-process stand-in for the allocator driver.
//!
//! Each fake node owns a memfd that plays the role of physical memory: a chunk's
//! physical address is its byte offset in the memfd, so `mmap` through the
//! library's normal path sees real shared pages. Nodes hand out disjoint
//! address ranges, as they would on the SoC.

use crate::driver::ioctl::{
    AllocCoherentArgs, AllocGenericArgs, AllocSegmentsArgs, FreeArgs, InfoArgs,
    SIMAAI_INFO_BY_ID, SIMAAI_INFO_BY_PHYS, SIMAAI_MAX_SEGMENTS, SIMAAI_MEM_TARGET_GENERIC,
};
use crate::driver::{AllocatorDevice, DeviceNode};
use crate::mem::{Session, SessionConfig};
use crate::utils::{align_up, page_size};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const FAKE_CAPACITY: u64 = 16 * 1024 * 1024;
pub const FAKE_BUS_OFFSET: u64 = 0x4000_0000;
const FAKE_DEVICE_DIR: &str = "/fake-dev";
const SEGMENT_ALIGN: usize = 64;

#[derive(Debug, Default, Clone, Copy)]
pub struct Calls {
    pub generic: usize,
    pub coherent: usize,
    pub segments: usize,
    pub info: usize,
    pub free: usize,
}

#[derive(Debug)]
struct Unit {
    id: u32,
    base: u64,
    len: u64,
    target: u32,
    flags: u32,
    // (offset, size) per segment
    segments: Vec<(u64, u64)>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    units: Vec<Unit>,
    calls: Calls,
    fail_free: Option<i32>,
    fail_info: Option<i32>,
}

impl State {
    /// First-fit placement of `len` page-rounded bytes in `[floor, limit)`.
    fn place(&self, len: u64, floor: u64, limit: u64) -> io::Result<u64> {
        let mut spans: Vec<(u64, u64)> = self.units.iter().map(|u| (u.base, u.len)).collect();
        spans.sort_unstable();

        let mut candidate = floor;
        for (base, span) in spans {
            if base >= candidate + len {
                break;
            }
            candidate = candidate.max(base + span);
        }
        if candidate + len > limit {
            return Err(io::Error::from_raw_os_error(libc::ENOMEM));
        }
        Ok(candidate)
    }

    fn insert(&mut self, base: u64, len: u64, target: u32, flags: u32, segments: Vec<(u64, u64)>) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        self.units.push(Unit {
            id,
            base,
            len,
            target,
            flags,
            segments,
        });
        id
    }
}

#[derive(Debug)]
pub struct FakeDevice {
    memory: OwnedFd,
    floor: u64,
    limit: u64,
    state: Mutex<State>,
}

impl FakeDevice {
    /// A node owning `capacity` bytes of the address space, starting at
    /// `node`'s slot. Address 0 is never handed out.
    fn new(capacity: u64, node: DeviceNode) -> Self {
        let start = u64::from(node.tag()) * capacity;
        let floor = start + page_size() as u64;
        let limit = start + capacity;

        let fd = unsafe { libc::memfd_create(c"simaai-fake-mem".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(fd >= 0, "memfd_create: {}", io::Error::last_os_error());
        let memory = unsafe { OwnedFd::from_raw_fd(fd) };
        let ret = unsafe { libc::ftruncate(memory.as_raw_fd(), limit as libc::off_t) };
        assert_eq!(ret, 0, "ftruncate: {}", io::Error::last_os_error());

        Self {
            memory,
            floor,
            limit,
            state: Mutex::new(State::default()),
        }
    }

    /// Makes the next info query fail with `errno`.
    pub fn fail_next_info(&self, errno: i32) {
        self.state.lock().unwrap().fail_info = Some(errno);
    }

    /// Makes the next free request fail with `errno` without releasing anything.
    pub fn fail_next_free(&self, errno: i32) {
        self.state.lock().unwrap().fail_free = Some(errno);
    }

    pub fn calls(&self) -> Calls {
        self.state.lock().unwrap().calls
    }

    pub fn live_units(&self) -> usize {
        self.state.lock().unwrap().units.len()
    }

    fn alloc_single(&self, size: u64, target: u32, flags: u32) -> io::Result<(u32, u64, u64)> {
        if size == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let mut state = self.state.lock().unwrap();
        // The driver hands out whole pages.
        let len = align_up(size as usize, page_size()) as u64;
        let base = state.place(len, self.floor, self.limit)?;
        let id = state.insert(base, len, target, flags, vec![(0, len)]);
        Ok((id, base, len))
    }
}

impl AllocatorDevice for FakeDevice {
    fn alloc_generic(&self, args: &mut AllocGenericArgs) -> io::Result<()> {
        self.state.lock().unwrap().calls.generic += 1;
        let (id, _, len) = self.alloc_single(args.size, SIMAAI_MEM_TARGET_GENERIC, args.flags)?;
        args.size = len;
        args.id = id;
        Ok(())
    }

    fn alloc_coherent(&self, args: &mut AllocCoherentArgs) -> io::Result<()> {
        self.state.lock().unwrap().calls.coherent += 1;
        let (id, base, len) = self.alloc_single(args.size, args.target, args.flags)?;
        args.size = len;
        args.id = id;
        args.phys_addr = base;
        args.bus_addr = base + FAKE_BUS_OFFSET;
        Ok(())
    }

    fn alloc_segments(&self, args: &mut AllocSegmentsArgs) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.segments += 1;

        let count = args.num_segments as usize;
        if count == 0 || count > SIMAAI_MAX_SEGMENTS || args.size[..count].contains(&0) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let mut segments = Vec::with_capacity(count);
        let mut end = 0usize;
        for &size in &args.size[..count] {
            let offset = align_up(end, SEGMENT_ALIGN);
            segments.push((offset as u64, size));
            end = offset + size as usize;
        }
        let len = align_up(end, page_size()) as u64;
        let base = state.place(len, self.floor, self.limit)?;
        let id = state.insert(base, len, args.target, args.flags, segments.clone());

        for (i, (offset, _)) in segments.into_iter().enumerate() {
            args.phys_addr[i] = base;
            args.bus_addr[i] = base + FAKE_BUS_OFFSET;
            args.offset[i] = offset;
        }
        args.id = id;
        Ok(())
    }

    fn query_info(&self, args: &mut InfoArgs) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.info += 1;
        if let Some(errno) = state.fail_info.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let found = match args.query {
            SIMAAI_INFO_BY_ID => state
                .units
                .iter()
                .find(|u| u.id == args.id)
                .filter(|u| (args.segment as usize) < u.segments.len())
                .map(|u| (u, args.segment as usize)),
            SIMAAI_INFO_BY_PHYS => state.units.iter().find_map(|u| {
                u.segments
                    .iter()
                    .position(|&(offset, _)| u.base + offset == args.phys_addr)
                    .map(|i| (u, i))
            }),
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };
        let Some((unit, index)) = found else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };

        let (offset, size) = unit.segments[index];
        args.id = unit.id;
        args.segment = index as u32;
        args.num_segments = unit.segments.len() as u32;
        args.target = unit.target;
        args.flags = unit.flags;
        args.phys_addr = unit.base;
        args.bus_addr = unit.base + FAKE_BUS_OFFSET;
        args.size = size;
        args.offset = offset;
        Ok(())
    }

    fn free(&self, args: &mut FreeArgs) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.free += 1;
        if let Some(errno) = state.fail_free.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let count = args.num_segments as usize;
        if count == 0 || count > SIMAAI_MAX_SEGMENTS {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let requested = &args.phys_addr[..count];

        let Some(pos) = state.units.iter().position(|u| {
            u.segments
                .iter()
                .any(|&(offset, _)| u.base + offset == requested[0])
        }) else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };

        let unit = &state.units[pos];
        let complete = unit.segments.len() == count
            && unit
                .segments
                .iter()
                .all(|&(offset, _)| requested.contains(&(unit.base + offset)));
        if !complete {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        state.units.swap_remove(pos);
        Ok(())
    }
}

impl AsRawFd for FakeDevice {
    fn as_raw_fd(&self) -> RawFd {
        self.memory.as_raw_fd()
    }
}

/// A set of fake device nodes, created on demand as the session opens them.
#[derive(Debug)]
pub struct FakeNodes {
    capacity: u64,
    missing: Vec<DeviceNode>,
    devices: Mutex<HashMap<DeviceNode, (Arc<FakeDevice>, usize)>>,
}

impl FakeNodes {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(FAKE_CAPACITY)
    }

    pub fn with_capacity(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            missing: Vec::new(),
            devices: Mutex::new(HashMap::new()),
        })
    }

    /// Makes `node` fail to open with `ENOENT`.
    pub fn without(self: Arc<Self>, node: DeviceNode) -> Arc<Self> {
        let mut nodes = Arc::try_unwrap(self).expect("configure FakeNodes before sharing");
        nodes.missing.push(node);
        Arc::new(nodes)
    }

    pub fn session(self: &Arc<Self>) -> Session {
        let nodes = Arc::clone(self);
        let config = SessionConfig {
            device_dir: PathBuf::from(FAKE_DEVICE_DIR),
        };
        Session::with_opener(config, move |path| nodes.open(path)).expect("fake session")
    }

    fn open(&self, path: &Path) -> io::Result<Arc<dyn AllocatorDevice>> {
        let node = DeviceNode::ALL
            .into_iter()
            .find(|n| path.file_name().is_some_and(|f| f == n.file_name()))
            .filter(|n| !self.missing.contains(n))
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))?;

        let mut devices = self.devices.lock().unwrap();
        let entry = devices
            .entry(node)
            .or_insert_with(|| (Arc::new(FakeDevice::new(self.capacity, node)), 0));
        entry.1 += 1;
        Ok(Arc::clone(&entry.0) as Arc<dyn AllocatorDevice>)
    }

    pub fn node(&self, node: DeviceNode) -> Arc<FakeDevice> {
        let devices = self.devices.lock().unwrap();
        Arc::clone(&devices.get(&node).expect("node was never opened").0)
    }

    pub fn generic(&self) -> Arc<FakeDevice> {
        self.node(DeviceNode::Generic)
    }

    /// How many times the session asked for `node` to be opened.
    pub fn opens(&self, node: DeviceNode) -> usize {
        self.devices.lock().unwrap().get(&node).map_or(0, |e| e.1)
    }
}

pub fn fake_session() -> (Session, Arc<FakeNodes>) {
    let nodes = FakeNodes::new();
    (nodes.session(), nodes)
}
