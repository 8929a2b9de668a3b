//! An in-memory [`ThreadSystem`] for exercising the sampler and unwinder
//! without a live kernel.

use crate::remote::TaskMemory;
use crate::sampler::{RawThreadCounters, ThreadSystem};
use crate::unwind::{FrameRegisters, ThreadControl};
use powermetrics_types::{KernStatus, LoadBias};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};

/// Sparse 64-bit word memory. Unmapped words read as `KERN_INVALID_ADDRESS`.
#[derive(Debug, Default)]
pub struct FakeMemory {
    words: HashMap<u64, u64>,
    poisoned: HashSet<u64>,
    reads: Cell<usize>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        assert_eq!(address % 8, 0, "fake memory is word addressed");
        self.words.insert(address, value);
    }

    /// Lay out frame records `[next_fp, return_address]` at `base`, `base + 16`,
    /// ..., terminated by a null frame pointer.
    pub fn push_frame_chain(&mut self, base: u64, return_addresses: &[u64]) {
        for (i, &ret) in return_addresses.iter().enumerate() {
            let record = base + 16 * i as u64;
            let next = if i + 1 == return_addresses.len() {
                0
            } else {
                record + 16
            };
            self.write_u64(record, next);
            self.write_u64(record + 8, ret);
        }
    }

    /// Make any read touching `address` fail even if the word is mapped.
    pub fn fail_reads_at(&mut self, address: u64) {
        self.poisoned.insert(address);
    }

    /// Number of reads issued so far.
    pub fn read_count(&self) -> usize {
        self.reads.get()
    }
}

impl TaskMemory for FakeMemory {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), KernStatus> {
        self.reads.set(self.reads.get() + 1);
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = address
                .checked_add(i as u64)
                .ok_or(KernStatus::INVALID_ADDRESS)?;
            let word_address = at & !7;
            if self.poisoned.contains(&word_address) {
                return Err(KernStatus::INVALID_ADDRESS);
            }
            let word = self
                .words
                .get(&word_address)
                .ok_or(KernStatus::INVALID_ADDRESS)?;
            *byte = word.to_ne_bytes()[(at & 7) as usize];
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FakeThread {
    id: Result<u64, KernStatus>,
    name: Vec<u8>,
    queue_label: Option<Vec<u8>>,
    counters: Result<RawThreadCounters, KernStatus>,
    registers: Result<FrameRegisters, KernStatus>,
    suspend: Result<(), KernStatus>,
    resume: Result<(), KernStatus>,
    current: bool,
}

impl FakeThread {
    pub fn new(id: u64) -> Self {
        Self {
            id: Ok(id),
            name: Vec::new(),
            queue_label: None,
            counters: Ok(RawThreadCounters::default()),
            registers: Ok(FrameRegisters {
                frame_pointer: 0,
                link_register: None,
            }),
            suspend: Ok(()),
            resume: Ok(()),
            current: false,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.as_bytes().to_vec();
        self
    }

    pub fn with_queue_label(mut self, label: &str) -> Self {
        self.queue_label = Some(label.as_bytes().to_vec());
        self
    }

    pub fn with_counters(mut self, counters: RawThreadCounters) -> Self {
        self.counters = Ok(counters);
        self
    }

    pub fn with_frame_pointer(mut self, frame_pointer: u64) -> Self {
        self.registers = Ok(FrameRegisters {
            frame_pointer,
            link_register: None,
        });
        self
    }

    pub fn with_registers(mut self, registers: FrameRegisters) -> Self {
        self.registers = Ok(registers);
        self
    }

    pub fn failing_identifier(mut self) -> Self {
        self.id = Err(KernStatus::TERMINATED);
        self
    }

    pub fn failing_counters(mut self) -> Self {
        self.counters = Err(KernStatus::FAILURE);
        self
    }

    pub fn failing_suspend(mut self) -> Self {
        self.suspend = Err(KernStatus::TERMINATED);
        self
    }

    pub fn failing_resume(mut self) -> Self {
        self.resume = Err(KernStatus::FAILURE);
        self
    }

    pub fn failing_registers(mut self) -> Self {
        self.registers = Err(KernStatus::INVALID_ARGUMENT);
        self
    }

    /// Pretend this is the thread doing the sampling.
    pub fn current(mut self) -> Self {
        self.current = true;
        self
    }
}

/// Handle to a thread registered with a [`FakeSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FakeThreadHandle(usize);

#[derive(Debug)]
struct ThreadSlot {
    thread: FakeThread,
    suspends: Cell<usize>,
    resumes: Cell<usize>,
}

#[derive(Debug)]
pub struct FakeSystem {
    pub memory: FakeMemory,
    pid: i32,
    threads: Vec<ThreadSlot>,
    enumeration: Result<(), KernStatus>,
    load_bias: LoadBias,
}

impl Default for FakeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSystem {
    pub fn new() -> Self {
        Self::with_pid(1)
    }

    pub fn with_pid(pid: i32) -> Self {
        Self {
            memory: FakeMemory::new(),
            pid,
            threads: Vec::new(),
            enumeration: Ok(()),
            load_bias: LoadBias::ZERO,
        }
    }

    pub fn add_thread(&mut self, thread: FakeThread) -> FakeThreadHandle {
        self.threads.push(ThreadSlot {
            thread,
            suspends: Cell::new(0),
            resumes: Cell::new(0),
        });
        FakeThreadHandle(self.threads.len() - 1)
    }

    /// Replace a thread's definition, e.g. to change its counters between passes.
    pub fn update_thread(&mut self, handle: FakeThreadHandle, thread: FakeThread) {
        self.threads[handle.0].thread = thread;
    }

    pub fn fail_enumeration(&mut self, status: KernStatus) {
        self.enumeration = Err(status);
    }

    pub fn set_load_bias(&mut self, bias: LoadBias) {
        self.load_bias = bias;
    }

    pub fn suspend_count(&self, handle: &FakeThreadHandle) -> usize {
        self.threads[handle.0].suspends.get()
    }

    pub fn resume_count(&self, handle: &FakeThreadHandle) -> usize {
        self.threads[handle.0].resumes.get()
    }

    fn slot(&self, handle: &FakeThreadHandle) -> &ThreadSlot {
        &self.threads[handle.0]
    }
}

impl TaskMemory for FakeSystem {
    fn read_into(&self, address: u64, buf: &mut [u8]) -> Result<(), KernStatus> {
        self.memory.read_into(address, buf)
    }
}

impl ThreadControl for FakeSystem {
    type Thread = FakeThreadHandle;

    fn is_current_thread(&self, thread: &FakeThreadHandle) -> bool {
        self.slot(thread).thread.current
    }

    fn suspend(&self, thread: &FakeThreadHandle) -> Result<(), KernStatus> {
        let slot = self.slot(thread);
        slot.thread.suspend?;
        slot.suspends.set(slot.suspends.get() + 1);
        Ok(())
    }

    fn resume(&self, thread: &FakeThreadHandle) -> Result<(), KernStatus> {
        let slot = self.slot(thread);
        slot.resumes.set(slot.resumes.get() + 1);
        slot.thread.resume
    }

    fn frame_registers(&self, thread: &FakeThreadHandle) -> Result<FrameRegisters, KernStatus> {
        self.slot(thread).thread.registers
    }
}

impl ThreadSystem for FakeSystem {
    fn process_id(&self) -> i32 {
        self.pid
    }

    fn threads(&self) -> Result<Vec<FakeThreadHandle>, KernStatus> {
        self.enumeration?;
        Ok((0..self.threads.len()).map(FakeThreadHandle).collect())
    }

    fn thread_id(&self, thread: &FakeThreadHandle) -> Result<u64, KernStatus> {
        self.slot(thread).thread.id
    }

    fn thread_name(&self, thread: &FakeThreadHandle) -> Result<Vec<u8>, KernStatus> {
        Ok(self.slot(thread).thread.name.clone())
    }

    fn queue_label(&self, thread: &FakeThreadHandle) -> Result<Option<Vec<u8>>, KernStatus> {
        Ok(self.slot(thread).thread.queue_label.clone())
    }

    fn thread_counters(&self, _pid: i32, thread_id: u64) -> Result<RawThreadCounters, KernStatus> {
        self.threads
            .iter()
            .find(|slot| slot.thread.id == Ok(thread_id))
            .ok_or(KernStatus::INVALID_ARGUMENT)?
            .thread
            .counters
    }

    fn load_bias(&self) -> LoadBias {
        self.load_bias
    }
}
