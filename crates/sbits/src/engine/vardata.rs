//! Variable-length payloads.
//!
//! Payloads are appended to their own circular log as a 4-byte length
//! followed by the bytes, and may span pages. A record stores the physical
//! byte offset of its payload. Each var page header carries the smallest
//! key whose payload is still complete, so reclaiming the oldest var pages
//! raises a single watermark below which payloads read as deleted.

use super::{Engine, PageLog};
use crate::buffer::Stream;
use crate::config::key_to_u64;
use crate::error::{DbError, Result};
use crate::page::{var_first_live_key, write_var_header, NO_VAR_DATA};
use tracing::debug;

/// Size of the length prefix in front of every payload.
const LENGTH_SIZE: usize = 4;

#[derive(Debug)]
pub(crate) struct VarState {
    pub(crate) log: PageLog,
    /// Physical byte offset of the next write.
    pub(crate) loc: u64,
    /// Payloads of smaller keys have been reclaimed.
    pub(crate) min_record_id: u64,
    /// Key of the first payload starting in the open page.
    pub(crate) page_first_key: Option<u64>,
    /// Key of the most recent payload.
    pub(crate) owner_key: u64,
}

impl VarState {
    pub(crate) fn new(log: PageLog) -> Self {
        Self {
            log,
            loc: 0,
            min_record_id: 0,
            page_first_key: None,
            owner_key: 0,
        }
    }
}

/// Result of looking up a record's variable payload.
#[derive(Debug)]
pub enum VarData {
    /// The payload, read incrementally.
    Stream(VarDataStream),
    /// The record was inserted without a payload.
    Absent,
    /// The payload was reclaimed.
    Deleted,
}

impl VarData {
    /// Returns the stream if a payload is available.
    pub fn into_stream(self) -> Option<VarDataStream> {
        match self {
            VarData::Stream(stream) => Some(stream),
            VarData::Absent | VarData::Deleted => None,
        }
    }
}

/// Cursor over one variable payload.
///
/// The stream borrows nothing from the engine; pass the engine to
/// [`VarDataStream::read`] to pull the next bytes.
#[derive(Debug, Clone)]
pub struct VarDataStream {
    key: u64,
    loc: u64,
    remaining: usize,
    total: usize,
}

impl VarDataStream {
    /// Total payload length in bytes.
    pub fn len(&self) -> usize {
        self.total
    }

    /// Returns true for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Bytes not read yet.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Reads up to `buf.len()` bytes and returns how many were read, 0 at the end.
    ///
    /// # Errors
    ///
    /// Returns `Deleted` if the payload is reclaimed while being read.
    pub fn read(&mut self, db: &mut Engine, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.remaining);
        if n == 0 {
            return Ok(0);
        }
        db.read_var_bytes(self.key, &mut self.loc, &mut buf[..n])?;
        self.remaining -= n;
        Ok(n)
    }

    /// Reads the rest of the payload into a vector.
    pub fn read_to_end(&mut self, db: &mut Engine) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.remaining];
        let mut filled = 0;
        while filled < out.len() {
            filled += self.read(db, &mut out[filled..])?;
        }
        Ok(out)
    }
}

impl Engine {
    fn var_state(&self) -> Result<&VarState> {
        self.var
            .as_ref()
            .ok_or_else(|| DbError::config("variable data is not enabled"))
    }

    fn var_state_mut(&mut self) -> Result<&mut VarState> {
        self.var
            .as_mut()
            .ok_or_else(|| DbError::config("variable data is not enabled"))
    }

    /// Inserts a record with an optional variable-length payload.
    ///
    /// # Errors
    ///
    /// Returns `Config` if variable data is not enabled, and the errors of
    /// [`Engine::put`] otherwise.
    pub fn put_var(&mut self, key: &[u8], data: &[u8], payload: Option<&[u8]>) -> Result<()> {
        self.var_state()?;
        self.check_record(key, data)?;
        self.make_room()?;
        let pointer = match payload {
            Some(payload) => self.append_var(key_to_u64(key), payload)?,
            None => NO_VAR_DATA,
        };
        self.append(key, data, pointer);
        Ok(())
    }

    /// Looks up `key`, copies its data into `out` and returns its payload.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the record is absent and `Config` if variable
    /// data is not enabled.
    pub fn get_var(&mut self, key: &[u8], out: &mut [u8]) -> Result<VarData> {
        self.var_state()?;
        let pointer = self.lookup(key, out)?;
        self.open_var(key_to_u64(key), pointer)
    }

    /// Opens the payload of the record with `key` stored at `pointer`.
    pub(crate) fn open_var(&mut self, key: u64, pointer: u32) -> Result<VarData> {
        if pointer == NO_VAR_DATA {
            return Ok(VarData::Absent);
        }
        if key < self.var_state()?.min_record_id {
            return Ok(VarData::Deleted);
        }
        let mut loc = u64::from(pointer);
        let mut length = [0u8; LENGTH_SIZE];
        match self.read_var_bytes(key, &mut loc, &mut length) {
            Ok(()) => {}
            Err(DbError::Deleted) => return Ok(VarData::Deleted),
            Err(e) => return Err(e),
        }
        let total = u32::from_le_bytes(length) as usize;
        Ok(VarData::Stream(VarDataStream {
            key,
            loc,
            remaining: total,
            total,
        }))
    }

    fn append_var(&mut self, key: u64, payload: &[u8]) -> Result<u32> {
        let length = u32::try_from(payload.len())
            .map_err(|_| DbError::config("variable payload exceeds 4 GiB"))?;
        let state = self.var_state_mut()?;
        let pointer = state.loc as u32;
        state.page_first_key.get_or_insert(key);
        state.owner_key = key;
        self.write_var_bytes(&length.to_le_bytes())?;
        self.write_var_bytes(payload)?;
        Ok(pointer)
    }

    fn write_var_bytes(&mut self, mut bytes: &[u8]) -> Result<()> {
        let page_size = self.layout.page_size as u64;
        while !bytes.is_empty() {
            let state = self.var_state_mut()?;
            let offset = (state.loc % page_size) as usize;
            let n = bytes.len().min(page_size as usize - offset);
            state.loc += n as u64;
            let page_end = state.loc % page_size == 0;
            self.buffer.write_buf_mut(Stream::Var)[offset..offset + n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            if page_end {
                self.write_var_page()?;
            }
        }
        Ok(())
    }

    /// Writes the open var page if anything was appended to it.
    pub(crate) fn flush_var_page(&mut self) -> Result<()> {
        let header = self.layout.var_header_size as u64;
        let page_size = self.layout.page_size as u64;
        let state = self.var_state()?;
        if state.loc % page_size > header {
            self.write_var_page()?;
        }
        Ok(())
    }

    fn write_var_page(&mut self) -> Result<()> {
        let key_size = self.layout.key_size;
        let state = self.var_state_mut()?;
        let id = state.log.next_id;
        let physical = state.log.physical(id);
        let first_live_key = state
            .page_first_key
            .unwrap_or_else(|| state.owner_key.saturating_add(1));
        state.log.next_id += 1;

        write_var_header(self.buffer.write_buf_mut(Stream::Var), id, first_live_key, key_size);
        self.buffer.write_page(Stream::Var, physical)?;
        self.open_var_page()
    }

    /// Reserves the slot of the next var page and points the write cursor at it.
    pub(crate) fn open_var_page(&mut self) -> Result<()> {
        let page_size = self.layout.page_size as u64;
        let header = self.layout.var_header_size as u64;
        let key_size = self.layout.key_size;

        let mut log = self.var_state()?.log;
        if let Some(old_min) = log.reserve() {
            self.erase_block(Stream::Var, log, old_min)?;
            let buf = self.buffer.read_page(Stream::Var, log.physical(log.min_id))?;
            let min_record_id = var_first_live_key(buf, key_size);
            debug!(
                erased_from = old_min,
                min_page = log.min_id,
                min_record_id,
                "Reclaimed var erase block"
            );
            self.var_state_mut()?.min_record_id = min_record_id;
        }

        self.buffer.write_buf_mut(Stream::Var).fill(0);
        let state = self.var_state_mut()?;
        state.log = log;
        state.loc = u64::from(log.physical(log.next_id)) * page_size + header;
        state.page_first_key = None;
        Ok(())
    }

    /// Reads `out.len()` payload bytes starting at `loc`, skipping page headers.
    pub(crate) fn read_var_bytes(&mut self, key: u64, loc: &mut u64, out: &mut [u8]) -> Result<()> {
        let page_size = self.layout.page_size;
        let header = self.layout.var_header_size as u64;
        let mut filled = 0;
        while filled < out.len() {
            let state = self.var_state()?;
            if key < state.min_record_id {
                return Err(DbError::Deleted);
            }
            let open_page = state.log.physical(state.log.next_id);
            let capacity = state.log.capacity;

            let page = (*loc / page_size as u64) as u32;
            let offset = (*loc % page_size as u64) as usize;
            let n = (out.len() - filled).min(page_size - offset);
            let buf = if page == open_page {
                self.buffer.write_buf(Stream::Var)
            } else {
                self.buffer.read_page(Stream::Var, page)?
            };
            out[filled..filled + n].copy_from_slice(&buf[offset..offset + n]);
            filled += n;
            *loc += n as u64;
            if *loc % page_size as u64 == 0 {
                *loc = u64::from((page + 1) % capacity) * page_size as u64 + header;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, Parameters};
    use crate::engine::Devices;

    fn create_var_engine(num_var_pages: u32) -> Engine {
        let config = EngineConfig {
            parameters: Parameters::new()
                .with(Parameters::RESET_DATA)
                .with(Parameters::USE_VDATA),
            buffer_size_in_blocks: 4,
            num_var_pages,
            erase_size_in_pages: 2,
            page_size: 64,
            ..EngineConfig::default()
        };
        Engine::open(config.clone(), Devices::in_memory(&config)).unwrap()
    }

    fn read_payload(db: &mut Engine, key: u32) -> VarData {
        let mut out = [0u8; 4];
        db.get_var(&key.to_le_bytes(), &mut out).unwrap()
    }

    #[test]
    fn test_payload_spans_pages() {
        let mut db = create_var_engine(16);
        let payload: Vec<u8> = (0..200u8).collect();
        db.put_var(&1u32.to_le_bytes(), &[1; 4], Some(&payload)).unwrap();
        db.put_var(&2u32.to_le_bytes(), &[2; 4], None).unwrap();

        let mut stream = read_payload(&mut db, 1).into_stream().unwrap();
        assert_eq!(stream.len(), 200);
        assert_eq!(stream.read_to_end(&mut db).unwrap(), payload);
        assert_eq!(stream.read(&mut db, &mut [0u8; 8]).unwrap(), 0);
        assert!(matches!(read_payload(&mut db, 2), VarData::Absent));
    }

    #[test]
    fn test_small_reads_match_whole_payload() {
        let mut db = create_var_engine(16);
        let payload = b"a payload that crosses a page boundary or two ...".repeat(3);
        db.put_var(&7u32.to_le_bytes(), &[0; 4], Some(&payload)).unwrap();
        db.flush().unwrap();

        let mut stream = read_payload(&mut db, 7).into_stream().unwrap();
        let mut collected = Vec::new();
        let mut chunk = [0u8; 5];
        loop {
            let n = stream.read(&mut db, &mut chunk).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(collected, payload);
    }

    #[test]
    fn test_reclaimed_payload_reads_deleted() {
        let mut db = create_var_engine(4);
        for key in 0..40u32 {
            db.put_var(&key.to_le_bytes(), &key.to_le_bytes(), Some(&[key as u8; 40]))
                .unwrap();
        }
        let min_record_id = db.state().min_var_record_id.unwrap();
        assert!(min_record_id > 0);
        assert!(matches!(read_payload(&mut db, 0), VarData::Deleted));

        let mut stream = read_payload(&mut db, 39).into_stream().unwrap();
        assert_eq!(stream.read_to_end(&mut db).unwrap(), vec![39u8; 40]);
    }

    #[test]
    fn test_put_var_requires_var_data() {
        let config = EngineConfig::default();
        let mut db = Engine::open(config.clone(), Devices::in_memory(&config)).unwrap();
        let err = db.put_var(&1u32.to_le_bytes(), &[0; 4], Some(b"x")).unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
    }
}
