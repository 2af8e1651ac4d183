//! Page buffer: one write slot and one read cache slot per stream.

use crate::error::Result;
use crate::storage::PageDevice;
use tracing::warn;

/// The three page logs an engine maintains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    /// Fixed-size records.
    Data,
    /// Per-page bitmap summaries.
    Index,
    /// Variable-length payloads.
    Var,
}

impl Stream {
    fn ordinal(self) -> usize {
        match self {
            Stream::Data => 0,
            Stream::Index => 1,
            Stream::Var => 2,
        }
    }
}

/// Cumulative I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Data pages read from the device.
    pub num_reads: u64,
    /// Data pages written to the device.
    pub num_writes: u64,
    /// Reads served from a cached read slot, any stream.
    pub buffer_hits: u64,
    /// Index pages read from the device.
    pub num_idx_reads: u64,
    /// Index pages written to the device.
    pub num_idx_writes: u64,
    /// Var pages read from the device.
    pub num_var_reads: u64,
    /// Var pages written to the device.
    pub num_var_writes: u64,
}

impl IoStats {
    fn record_read(&mut self, stream: Stream) {
        match stream {
            Stream::Data => self.num_reads += 1,
            Stream::Index => self.num_idx_reads += 1,
            Stream::Var => self.num_var_reads += 1,
        }
    }

    fn record_write(&mut self, stream: Stream) {
        match stream {
            Stream::Data => self.num_writes += 1,
            Stream::Index => self.num_idx_writes += 1,
            Stream::Var => self.num_var_writes += 1,
        }
    }
}

#[derive(Debug)]
struct StreamSlots {
    device: Box<dyn PageDevice>,
    write: Vec<u8>,
    read: Vec<u8>,
    /// Physical page held in `read`.
    cached: Option<u32>,
}

/// Fixed set of page-sized slots shared by all engine operations.
#[derive(Debug)]
pub struct PageBuffer {
    page_size: usize,
    streams: [Option<StreamSlots>; 3],
    stats: IoStats,
}

impl PageBuffer {
    /// Creates a buffer over the data device and the optional index and var devices.
    pub fn new(
        page_size: usize,
        data: Box<dyn PageDevice>,
        index: Option<Box<dyn PageDevice>>,
        var: Option<Box<dyn PageDevice>>,
    ) -> Self {
        let slots = |device: Box<dyn PageDevice>| StreamSlots {
            device,
            write: vec![0u8; page_size],
            read: vec![0u8; page_size],
            cached: None,
        };
        Self {
            page_size,
            streams: [Some(slots(data)), index.map(slots), var.map(slots)],
            stats: IoStats::default(),
        }
    }

    /// Number of page slots in use.
    pub fn slot_count(&self) -> usize {
        2 * self.streams.iter().flatten().count()
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns true if `stream` has a device attached.
    pub fn has_stream(&self, stream: Stream) -> bool {
        self.streams[stream.ordinal()].is_some()
    }

    fn slots(&self, stream: Stream) -> &StreamSlots {
        match &self.streams[stream.ordinal()] {
            Some(slots) => slots,
            None => unreachable!("{stream:?} stream is not configured"),
        }
    }

    fn slots_mut(&mut self, stream: Stream) -> &mut StreamSlots {
        match &mut self.streams[stream.ordinal()] {
            Some(slots) => slots,
            None => unreachable!("{stream:?} stream is not configured"),
        }
    }

    /// Active write page of `stream`.
    pub fn write_buf(&self, stream: Stream) -> &[u8] {
        &self.slots(stream).write
    }

    /// Mutable active write page of `stream`.
    pub fn write_buf_mut(&mut self, stream: Stream) -> &mut [u8] {
        &mut self.slots_mut(stream).write
    }

    /// Contents of the read slot of `stream`.
    pub fn read_buf(&self, stream: Stream) -> &[u8] {
        &self.slots(stream).read
    }

    /// Physical page currently cached for `stream`.
    pub fn cached_page(&self, stream: Stream) -> Option<u32> {
        self.slots(stream).cached
    }

    /// Reads physical page `page` of `stream` through the read cache.
    ///
    /// A failed read leaves the slot marked empty.
    pub fn read_page(&mut self, stream: Stream, page: u32) -> Result<&[u8]> {
        let slots = match &mut self.streams[stream.ordinal()] {
            Some(slots) => slots,
            None => unreachable!("{stream:?} stream is not configured"),
        };
        if slots.cached == Some(page) {
            self.stats.buffer_hits += 1;
            return Ok(&slots.read);
        }
        slots.cached = None;
        slots.device.read_page(page, &mut slots.read)?;
        slots.cached = Some(page);
        self.stats.record_read(stream);
        Ok(&slots.read)
    }

    /// Reads physical page `page` without touching the cache or counters.
    pub fn read_uncounted(&mut self, stream: Stream, page: u32) -> Result<&[u8]> {
        let slots = self.slots_mut(stream);
        slots.cached = None;
        slots.device.read_page(page, &mut slots.read)?;
        slots.cached = Some(page);
        Ok(&slots.read)
    }

    /// Writes the write slot of `stream` to physical page `page`.
    pub fn write_page(&mut self, stream: Stream, page: u32) -> Result<()> {
        let slots = self.slots_mut(stream);
        slots.device.write_page(page, &slots.write)?;
        if slots.cached == Some(page) {
            slots.cached = None;
        }
        self.stats.record_write(stream);
        Ok(())
    }

    /// Erases physical pages `start..end` of `stream`.
    pub fn erase(&mut self, stream: Stream, start: u32, end: u32) -> Result<()> {
        let slots = self.slots_mut(stream);
        slots.device.erase(start, end)?;
        if matches!(slots.cached, Some(page) if page >= start && page < end) {
            slots.cached = None;
        }
        Ok(())
    }

    /// Discards the contents of every device.
    pub fn truncate_all(&mut self) -> Result<()> {
        for slots in self.streams.iter_mut().flatten() {
            slots.device.truncate()?;
            slots.cached = None;
        }
        Ok(())
    }

    /// Flushes every device.
    pub fn sync(&mut self) -> Result<()> {
        for slots in self.streams.iter_mut().flatten() {
            slots.device.flush()?;
        }
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> IoStats {
        self.stats
    }

    /// Clears all counters.
    pub fn reset_stats(&mut self) {
        self.stats = IoStats::default();
    }

    /// Consumes the buffer and returns its devices.
    pub fn into_devices(
        mut self,
    ) -> (
        Box<dyn PageDevice>,
        Option<Box<dyn PageDevice>>,
        Option<Box<dyn PageDevice>>,
    ) {
        let [data, index, var] = std::mem::replace(&mut self.streams, [None, None, None]);
        let data = match data {
            Some(slots) => slots.device,
            None => unreachable!("data stream is always configured"),
        };
        (data, index.map(|s| s.device), var.map(|s| s.device))
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        for (ordinal, slots) in self.streams.iter_mut().enumerate() {
            if let Some(slots) = slots {
                if let Err(e) = slots.device.flush() {
                    warn!(stream = ordinal, error = %e, "Failed to sync page device on drop");
                }
            }
        }
    }
}
