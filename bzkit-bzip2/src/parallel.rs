//! Parallel BZip2 encoder.
//!
//! Blocks are independent once the first-stage run-length pass has cut the
//! input into blocks, so that pass (and the block CRCs) runs on the caller's
//! thread and the expensive part, sorting and entropy coding, runs on a
//! rayon pool. Finished blocks come back over a channel tagged with their
//! ordinal and are written strictly in order, which makes the output
//! byte-identical to [`BzEncoder`](crate::BzEncoder).

use crate::block::{Block, RunState};
use crate::encode::{EncodeWorkspace, compress_block};
use crate::{CompressionLevel, framing};
use bzkit_core::{BitBuffer, BitWriter, BzError, Result, crc};
use crossbeam_channel::{Receiver, Sender, TryRecvError, unbounded};
use log::{debug, trace};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::panic::{self, AssertUnwindSafe};

/// Default upper bound on work units.
pub const DEFAULT_MAX_WORKERS: usize = 16;
/// Smallest accepted `max_workers`.
pub const MIN_MAX_WORKERS: usize = 4;
/// Default work units per available core.
pub const DEFAULT_BUFFERS_PER_CORE: usize = 4;

/// Configuration for [`ParallelBzEncoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelOptions {
    level: CompressionLevel,
    max_workers: usize,
    buffers_per_core: usize,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::default(),
            max_workers: DEFAULT_MAX_WORKERS,
            buffers_per_core: DEFAULT_BUFFERS_PER_CORE,
        }
    }
}

impl ParallelOptions {
    /// Default options: level 9, 16 workers, 4 buffers per core.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the compression level.
    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Cap the number of blocks in flight. Must be at least 4.
    pub fn with_max_workers(mut self, max_workers: usize) -> Result<Self> {
        if max_workers < MIN_MAX_WORKERS {
            return Err(BzError::invalid_config(format!(
                "max_workers must be at least {}, got {}",
                MIN_MAX_WORKERS, max_workers
            )));
        }
        self.max_workers = max_workers;
        Ok(self)
    }

    /// Set how many work units to allow per available core. Must be at
    /// least 1.
    pub fn with_buffers_per_core(mut self, buffers_per_core: usize) -> Result<Self> {
        if buffers_per_core == 0 {
            return Err(BzError::invalid_config("buffers_per_core must be at least 1"));
        }
        self.buffers_per_core = buffers_per_core;
        Ok(self)
    }

    /// The compression level.
    pub fn level(&self) -> CompressionLevel {
        self.level
    }

    /// Upper bound on work units.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Work units per available core.
    pub fn buffers_per_core(&self) -> usize {
        self.buffers_per_core
    }

    /// Number of work units the encoder will allocate at most.
    pub fn pool_size(&self) -> usize {
        self.max_workers
            .min(self.buffers_per_core.saturating_mul(available_cores()))
    }
}

fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// One block's worth of reusable state.
struct WorkUnit {
    block: Block,
    workspace: EncodeWorkspace,
    output: BitWriter<Vec<u8>>,
    bits: BitBuffer,
    ordinal: u64,
    /// Makes the worker wait on the gate, then panic.
    #[cfg(test)]
    fault: Option<Receiver<()>>,
}

impl WorkUnit {
    fn new(level: CompressionLevel) -> Box<Self> {
        Box::new(Self {
            block: Block::new(level),
            workspace: EncodeWorkspace::new(level),
            output: BitWriter::new(Vec::new()),
            bits: BitBuffer::default(),
            ordinal: 0,
            #[cfg(test)]
            fault: None,
        })
    }

    fn reset(&mut self) {
        self.block.reset();
        let bits = std::mem::take(&mut self.bits);
        self.output.recycle(bits);
    }
}

struct Completion {
    unit: Box<WorkUnit>,
    result: Result<()>,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
fn trip_fault(unit: &mut WorkUnit) {
    if let Some(gate) = unit.fault.take() {
        let _ = gate.recv();
        panic!("fault injected into block {}", unit.ordinal);
    }
}

#[cfg(not(test))]
#[inline(always)]
fn trip_fault(_unit: &mut WorkUnit) {}

/// Runs on a pool thread.
fn compress_unit(mut unit: Box<WorkUnit>, tx: Sender<Completion>) {
    let ordinal = unit.ordinal;

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        trip_fault(&mut unit);
        let WorkUnit {
            block,
            workspace,
            output,
            ..
        } = &mut *unit;
        compress_block(block, workspace, output, ordinal)
    }));
    let result = match outcome {
        Ok(result) => result.map(|_| ()),
        Err(payload) => Err(BzError::internal(format!(
            "block {} compression panicked: {}",
            ordinal,
            panic_message(&*payload)
        ))),
    };

    unit.bits = unit.output.take_bits();
    // The receiver is gone only if the encoder was dropped.
    let _ = tx.send(Completion { unit, result });
}

/// BZip2 encoder that compresses blocks on a thread pool.
pub struct ParallelBzEncoder<W: Write> {
    writer: BitWriter<W>,
    options: ParallelOptions,
    pool: ThreadPool,
    pool_size: usize,
    allocated: usize,
    current: Option<Box<WorkUnit>>,
    free: Vec<Box<WorkUnit>>,
    done: BTreeMap<u64, Box<WorkUnit>>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    in_flight: usize,
    run: RunState,
    next_ordinal: u64,
    next_to_write: u64,
    combined_crc: u32,
    total_in: u64,
    finished: bool,
    poisoned: bool,
    /// Block ordinal whose worker fails once the gate opens.
    #[cfg(test)]
    fault: Option<(u64, Receiver<()>)>,
}

impl<W: Write> ParallelBzEncoder<W> {
    /// Create an encoder, start its thread pool and write the stream
    /// header.
    pub fn new(writer: W, options: ParallelOptions) -> Result<Self> {
        let pool_size = options.pool_size().max(1);
        let threads = options.max_workers.min(available_cores()).max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("bzkit-worker-{}", i))
            .build()
            .map_err(|e| BzError::internal(format!("failed to start worker pool: {}", e)))?;

        let mut bit_writer = BitWriter::new(writer);
        framing::write_stream_header(&mut bit_writer, options.level)?;

        debug!(
            "parallel encoder: level {}, {} threads, up to {} work units",
            options.level.level(),
            threads,
            pool_size
        );

        let (tx, rx) = unbounded();
        Ok(Self {
            writer: bit_writer,
            options,
            pool,
            pool_size,
            allocated: 0,
            current: None,
            free: Vec::new(),
            done: BTreeMap::new(),
            tx,
            rx,
            in_flight: 0,
            run: RunState::new(),
            next_ordinal: 0,
            next_to_write: 0,
            combined_crc: 0,
            total_in: 0,
            finished: false,
            poisoned: false,
            #[cfg(test)]
            fault: None,
        })
    }

    /// The options this encoder was built with.
    pub fn options(&self) -> &ParallelOptions {
        &self.options
    }

    /// Uncompressed bytes accepted so far.
    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    /// Compressed bytes produced so far. Blocks still being compressed are
    /// not counted.
    pub fn total_out(&self) -> u64 {
        self.writer.bits_written() / 8
    }

    /// Reference to the underlying writer.
    pub fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }

    fn check_open(&self) -> Result<()> {
        if self.poisoned {
            Err(BzError::Poisoned)
        } else if self.finished {
            Err(BzError::Finished)
        } else {
            Ok(())
        }
    }

    fn poison_on_err<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    /// Feed uncompressed bytes.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let result = self.fold(data);
        self.poison_on_err(result)
    }

    fn fold(&mut self, data: &[u8]) -> Result<()> {
        // A failed block must surface even when the input fits the current
        // unit and no new unit is acquired.
        self.collect_ready()?;
        let mut rest = data;
        while !rest.is_empty() {
            self.ensure_current()?;
            let Some(unit) = self.current.as_deref_mut() else {
                return Err(BzError::internal("no current work unit"));
            };
            let consumed = self.run.fill(&mut unit.block, rest);
            let full = unit.block.is_full();
            rest = &rest[consumed..];
            self.total_in += consumed as u64;
            if full {
                self.dispatch()?;
            }
        }
        Ok(())
    }

    /// Make sure there is a unit to fill, acquiring one if needed.
    fn ensure_current(&mut self) -> Result<()> {
        if self.current.is_none() {
            let unit = self.acquire_unit()?;
            self.current = Some(unit);
        }
        Ok(())
    }

    fn acquire_unit(&mut self) -> Result<Box<WorkUnit>> {
        self.collect_ready()?;

        if let Some(unit) = self.free.pop() {
            return Ok(unit);
        }
        if self.allocated < self.pool_size {
            self.allocated += 1;
            trace!("allocating work unit {}", self.allocated);
            return Ok(WorkUnit::new(self.options.level));
        }

        // Every unit is in flight or waiting to be written.
        while self.free.is_empty() {
            self.wait_one()?;
        }
        self.free
            .pop()
            .ok_or_else(|| BzError::internal("work unit pool exhausted"))
    }

    /// Take completions that are already available, without blocking.
    fn collect_ready(&mut self) -> Result<()> {
        loop {
            match self.rx.try_recv() {
                Ok(completion) => self.accept(completion)?,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    return Err(BzError::internal("worker channel closed"));
                }
            }
        }
    }

    fn wait_one(&mut self) -> Result<()> {
        if self.in_flight == 0 {
            return Err(BzError::internal("waiting for a block with none in flight"));
        }
        let completion = self
            .rx
            .recv()
            .map_err(|_| BzError::internal("worker channel closed"))?;
        self.accept(completion)
    }

    fn accept(&mut self, completion: Completion) -> Result<()> {
        self.in_flight -= 1;
        let Completion { unit, result } = completion;
        result?;
        trace!(
            "block {} done, next to write {}",
            unit.ordinal, self.next_to_write
        );
        self.done.insert(unit.ordinal, unit);
        self.write_in_order()
    }

    fn write_in_order(&mut self) -> Result<()> {
        while let Some(mut unit) = self.done.remove(&self.next_to_write) {
            self.writer.write_bit_buffer(&unit.bits)?;
            self.next_to_write += 1;
            unit.reset();
            self.free.push(unit);
        }
        Ok(())
    }

    /// Hand the current block to the pool.
    fn dispatch(&mut self) -> Result<()> {
        let Some(mut unit) = self.current.take() else {
            return Ok(());
        };
        if unit.block.is_empty() {
            self.free.push(unit);
            return Ok(());
        }

        unit.ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        self.combined_crc = crc::combine(self.combined_crc, unit.block.crc());
        self.in_flight += 1;

        trace!(
            "dispatching block {} ({} bytes), {} in flight",
            unit.ordinal,
            unit.block.len(),
            self.in_flight
        );

        self.arm_fault(&mut unit);
        let tx = self.tx.clone();
        self.pool.spawn(move || compress_unit(unit, tx));
        Ok(())
    }

    #[cfg(test)]
    fn arm_fault(&self, unit: &mut WorkUnit) {
        if let Some((ordinal, gate)) = &self.fault {
            if *ordinal == unit.ordinal {
                unit.fault = Some(gate.clone());
            }
        }
    }

    #[cfg(not(test))]
    #[inline(always)]
    fn arm_fault(&self, _unit: &mut WorkUnit) {}

    /// Compress the remaining input, wait for every block, write the
    /// trailer and flush the sink.
    pub fn try_finish(&mut self) -> Result<()> {
        if self.poisoned {
            return Err(BzError::Poisoned);
        }
        if self.finished {
            return Ok(());
        }
        let result = self.finish_stream();
        self.poison_on_err(result)?;
        self.finished = true;
        Ok(())
    }

    fn finish_stream(&mut self) -> Result<()> {
        if !self.run.is_empty() {
            self.ensure_current()?;
            if let Some(unit) = self.current.as_deref_mut() {
                self.run.flush(&mut unit.block);
            }
        }
        self.dispatch()?;

        while self.in_flight > 0 {
            self.wait_one()?;
        }
        if !self.done.is_empty() {
            return Err(BzError::internal("blocks left unwritten after draining"));
        }

        framing::write_stream_trailer(&mut self.writer, self.combined_crc)?;
        self.writer.flush()?;
        debug!(
            "parallel stream finished: {} blocks, {} bytes in, {} bytes out, {} work units",
            self.next_ordinal,
            self.total_in,
            self.total_out(),
            self.allocated
        );
        Ok(())
    }

    /// Finish the stream and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.try_finish()?;
        self.writer.finish()
    }
}

impl<W: Write> Write for ParallelBzEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_data(buf)?;
        Ok(buf.len())
    }

    /// Write blocks that are already finished and flush the sink. Blocks
    /// still in flight are not waited for.
    fn flush(&mut self) -> io::Result<()> {
        if self.poisoned {
            return Err(BzError::Poisoned.into());
        }
        let result = self.collect_ready().and_then(|_| self.writer.flush());
        self.poison_on_err(result)?;
        Ok(())
    }
}

/// Compress `data` into a single BZip2 stream using a thread pool.
pub fn compress_parallel(data: &[u8], options: ParallelOptions) -> Result<Vec<u8>> {
    let mut encoder =
        ParallelBzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), options)?;
    encoder.write_data(data)?;
    encoder.finish()
}
