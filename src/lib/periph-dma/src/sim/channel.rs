use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex};

use super::{EventLog, HwEvent, PhysMemory, SimBus};
use crate::{
    dma::{PhysAddr, SgEntry},
    error::HwError,
    hw::{
        CompletionCallback, Cookie, Descriptor, DeviceMapper, DmaCaps, DmaChannel, DmaController,
        PrepFlags, SlaveConfig, TransferDirection, TransferKind,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Failures and quirks to inject into a [SimController] and its channels.
pub struct ChannelFaults {
    /// Refuse every channel request.
    pub unavailable: bool,
    pub fail_configure: bool,
    pub fail_prep: bool,
    pub fail_submit: bool,
    /// Accept and issue descriptors but never run them.
    pub stall: bool,
    /// Rewrite every prepared descriptor to a memory-to-memory transfer, like some controller
    /// bindings need.
    pub force_mem_to_mem: bool,
}

struct Job {
    cookie: Cookie,
    desc: Descriptor,
    config: SlaveConfig,
    callback: CompletionCallback,
}

#[derive(Default)]
struct Queues {
    pending: VecDeque<Job>,
    active: VecDeque<Job>,
    running: bool,
    shutdown: bool,
}

struct Engine {
    queues: Mutex<Queues>,
    cv: Condvar,
    ctrl: Arc<ControllerShared>,
}

struct ControllerShared {
    phys: Arc<PhysMemory>,
    bus: Arc<SimBus>,
    events: EventLog,
    faults: Mutex<ChannelFaults>,
    names: HashSet<String>,
    reserved: Mutex<HashSet<String>>,
    engines: Mutex<Vec<Weak<Engine>>>,
    /// Data pushed into fixed-address (FIFO) peripheral registers, by physical address.
    fifos: Mutex<HashMap<u64, VecDeque<u8>>>,
}

/// A simulated DMA controller. Channels execute descriptors on a worker thread and run completion
/// callbacks from it.
pub struct SimController {
    shared: Arc<ControllerShared>,
}

/// A channel reserved from a [SimController]. Dropping it releases the channel.
pub struct SimChannel {
    name: String,
    engine: Arc<Engine>,
    config: Mutex<Option<SlaveConfig>>,
    next_id: AtomicU64,
    next_cookie: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimController {
    /// A controller that provides one slave channel for each of `names`.
    pub fn new(
        phys: Arc<PhysMemory>,
        bus: Arc<SimBus>,
        events: EventLog,
        names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            shared: Arc::new(ControllerShared {
                phys,
                bus,
                events,
                faults: Mutex::new(ChannelFaults::default()),
                names: names.into_iter().collect(),
                reserved: Mutex::new(HashSet::new()),
                engines: Mutex::new(Vec::new()),
                fifos: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn set_faults(&self, faults: ChannelFaults) {
        *self.shared.faults.lock() = faults;
        // Wake workers so a cleared stall takes effect.
        for engine in self.shared.engines.lock().iter().filter_map(Weak::upgrade) {
            let _q = engine.queues.lock();
            engine.cv.notify_all();
        }
    }

    pub fn faults(&self) -> ChannelFaults {
        *self.shared.faults.lock()
    }

    /// Bytes waiting in the FIFO register at `phys`.
    pub fn fifo_len(&self, phys: PhysAddr) -> usize {
        self.shared
            .fifos
            .lock()
            .get(&phys.0)
            .map_or(0, VecDeque::len)
    }
}

impl DmaController for SimController {
    fn request_channel(&self, name: &str, caps: DmaCaps) -> Result<Arc<dyn DmaChannel>, HwError> {
        if self.shared.faults.lock().unavailable {
            return Err(HwError::Busy);
        }
        if !self.shared.names.contains(name) {
            return Err(HwError::Unsupported);
        }
        if !(DmaCaps::SLAVE | DmaCaps::MEMCPY).contains(caps) {
            return Err(HwError::Unsupported);
        }
        if !self.shared.reserved.lock().insert(name.to_owned()) {
            return Err(HwError::Busy);
        }

        let engine = Arc::new(Engine {
            queues: Mutex::new(Queues::default()),
            cv: Condvar::new(),
            ctrl: self.shared.clone(),
        });
        self.shared.engines.lock().push(Arc::downgrade(&engine));
        let worker_engine = engine.clone();
        let worker = std::thread::Builder::new()
            .name(format!("dma-{}", name))
            .spawn(move || worker_engine.run())
            .map_err(|_| {
                self.shared.reserved.lock().remove(name);
                HwError::OutOfResources
            })?;

        self.shared.events.push(HwEvent::RequestChannel {
            name: name.to_owned(),
        });
        Ok(Arc::new(SimChannel {
            name: name.to_owned(),
            engine,
            config: Mutex::new(None),
            next_id: AtomicU64::new(1),
            next_cookie: AtomicU64::new(1),
            worker: Mutex::new(Some(worker)),
        }))
    }
}

impl Engine {
    fn run(&self) {
        loop {
            let job = {
                let mut q = self.queues.lock();
                loop {
                    if q.shutdown {
                        return;
                    }
                    if !q.active.is_empty() && !self.ctrl.faults.lock().stall {
                        break;
                    }
                    self.cv.wait(&mut q);
                }
                q.running = true;
                q.active.pop_front()
            };
            if let Some(job) = job {
                self.execute(job);
            }
            let mut q = self.queues.lock();
            q.running = false;
            self.cv.notify_all();
        }
    }

    fn execute(&self, job: Job) {
        let Job {
            cookie,
            desc,
            config,
            callback,
        } = job;
        if let Err(e) = self.copy(&desc, &config) {
            tracing::warn!("descriptor {} faulted: {}", desc.id, e);
            self.ctrl.events.push(HwEvent::Fault { cookie });
        }
        self.ctrl.events.push(HwEvent::Complete { cookie });
        callback();
    }

    fn copy(&self, desc: &Descriptor, config: &SlaveConfig) -> Result<(), HwError> {
        let total: usize = desc.segments.iter().map(|s| s.len).sum();
        let device_bus = match desc.direction {
            TransferDirection::DeviceToMemory => config.src_addr,
            TransferDirection::MemoryToDevice => config.dst_addr,
        };
        let fixed = config.device_addr_fixed;
        let device = self
            .ctrl
            .bus
            .resolve(device_bus, if fixed { 1 } else { total })?;

        let mut dev_off = 0;
        for seg in &desc.segments {
            let mem = self.ctrl.bus.resolve(seg.bus, seg.len)?;
            let dev = if fixed { device } else { device.offset(dev_off) };
            let mut data = vec![0u8; seg.len];
            match desc.direction {
                TransferDirection::DeviceToMemory => {
                    if fixed {
                        let mut fifos = self.ctrl.fifos.lock();
                        let fifo = fifos.entry(dev.0).or_default();
                        for b in data.iter_mut() {
                            *b = fifo.pop_front().unwrap_or(0);
                        }
                    } else {
                        self.ctrl.phys.read(dev, &mut data)?;
                    }
                    self.ctrl.phys.write(mem, &data)?;
                }
                TransferDirection::MemoryToDevice => {
                    self.ctrl.phys.read(mem, &mut data)?;
                    if fixed {
                        self.ctrl
                            .fifos
                            .lock()
                            .entry(dev.0)
                            .or_default()
                            .extend(data);
                    } else {
                        self.ctrl.phys.write(dev, &data)?;
                    }
                }
            }
            dev_off += seg.len;
        }
        Ok(())
    }
}

impl SimChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn faults(&self) -> ChannelFaults {
        *self.engine.ctrl.faults.lock()
    }

    fn events(&self) -> &EventLog {
        &self.engine.ctrl.events
    }
}

impl DmaChannel for SimChannel {
    fn device(&self) -> Arc<dyn DeviceMapper> {
        self.engine.ctrl.bus.clone()
    }

    fn configure(&self, config: &SlaveConfig) -> Result<(), HwError> {
        if self.faults().fail_configure {
            return Err(HwError::InvalidArgument);
        }
        *self.config.lock() = Some(*config);
        self.events().push(HwEvent::Configure(*config));
        Ok(())
    }

    fn prep_slave_sg(
        &self,
        sgl: &[SgEntry],
        direction: TransferDirection,
        flags: PrepFlags,
    ) -> Result<Descriptor, HwError> {
        if self.faults().fail_prep || sgl.is_empty() {
            return Err(HwError::InvalidArgument);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.events().push(HwEvent::Prep {
            id,
            segments: sgl.len(),
        });
        Ok(Descriptor {
            id,
            direction,
            kind: direction.into(),
            segments: sgl.to_vec(),
            flags,
        })
    }

    fn fixup_descriptor(&self, desc: &mut Descriptor) {
        if self.faults().force_mem_to_mem {
            desc.kind = TransferKind::MemoryToMemory;
            self.events().push(HwEvent::Fixup {
                id: desc.id,
                kind: desc.kind,
            });
        }
    }

    fn submit(&self, desc: Descriptor, callback: CompletionCallback) -> Result<Cookie, HwError> {
        if self.faults().fail_submit {
            return Err(HwError::Busy);
        }
        let config = (*self.config.lock()).ok_or(HwError::InvalidArgument)?;
        let cookie = Cookie(self.next_cookie.fetch_add(1, Ordering::Relaxed));
        self.events().push(HwEvent::Submit {
            id: desc.id,
            cookie,
        });
        self.engine.queues.lock().pending.push_back(Job {
            cookie,
            desc,
            config,
            callback,
        });
        Ok(cookie)
    }

    fn issue_pending(&self) {
        let mut q = self.engine.queues.lock();
        let pending: Vec<Job> = q.pending.drain(..).collect();
        q.active.extend(pending);
        self.events().push(HwEvent::IssuePending);
        self.engine.cv.notify_all();
    }

    fn terminate_sync(&self) {
        let dropped: Vec<Job> = {
            let mut q = self.engine.queues.lock();
            let mut dropped: Vec<Job> = q.pending.drain(..).collect();
            dropped.extend(q.active.drain(..));
            while q.running {
                self.engine.cv.wait(&mut q);
            }
            dropped
        };
        self.events().push(HwEvent::Terminate);
        for job in dropped {
            self.events().push(HwEvent::Discard { cookie: job.cookie });
        }
    }
}

impl Drop for SimChannel {
    fn drop(&mut self) {
        {
            let mut q = self.engine.queues.lock();
            q.shutdown = true;
            q.pending.clear();
            q.active.clear();
            self.engine.cv.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        self.engine.ctrl.reserved.lock().remove(&self.name);
        self.engine.ctrl.events.push(HwEvent::ReleaseChannel);
    }
}

impl std::fmt::Debug for SimChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimChannel")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
