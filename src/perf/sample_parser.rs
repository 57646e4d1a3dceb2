//! C3: decodes variable-layout perf records according to a sample-type
//! bitmask (spec §4.3). Field order within a SAMPLE record is mandated by
//! the kernel and must match `PERF_SAMPLE_*` bit order exactly.

use super::sys::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Sample,
    Mmap2,
    Comm { is_exec: bool },
    Fork { ppid: u32, pid: u32 },
    Exit { tid: u32, pid: u32 },
    Lost { count: u64 },
    Unknown(u32),
}

#[derive(Debug, Clone)]
pub struct SampleRecord<'a> {
    pub tid: u32,
    pub pid: u32,
    pub time: u64,
    pub period: u64,
    pub ip: Option<u64>,
    pub regs_abi: Option<u8>,
    pub regs: Vec<u64>,
    /// `None` if the kernel dropped the stack due to ring-buffer
    /// pressure (`dyn_size == 0`); the unwinder treats this as an
    /// incomplete-frame case rather than calling into the walker.
    pub user_stack: Option<&'a [u8]>,
    pub raw: Option<&'a [u8]>,
    /// The watcher's `PERF_EVENT_IOC_ID` value, present when
    /// `PERF_SAMPLE_ID` is in the mask. Lets the caller dispatch a
    /// record back to the specific watcher that produced it when
    /// several share one CPU's ring buffer.
    pub id: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Mmap2Record {
    pub pid: u32,
    pub tid: u32,
    pub addr: u64,
    pub len: u64,
    pub pgoff: u64,
    pub path: String,
    pub executable: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unsupported REGS_USER ABI value {0}")]
    BadRegsAbi(u64),
    #[error("RAW record inner size {inner} exceeds outer record size {outer}")]
    RawOverflow { inner: usize, outer: usize },
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        self.need(4)?;
        let v = u32::from_ne_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64, ParseError> {
        self.need(8)?;
        let v = u64::from_ne_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn need(&self, n: usize) -> Result<(), ParseError> {
        if self.remaining() < n {
            Err(ParseError::Truncated {
                need: n,
                have: self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        self.need(n)?;
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }
}

/// Parses a `PERF_RECORD_SAMPLE` body according to `sample_type`, in the
/// exact field order the kernel emits them (IP, TID, TIME, ... REGS_USER,
/// STACK_USER, ... RAW last).
pub fn parse_sample<'a>(body: &'a [u8], sample_type: u64) -> Result<SampleRecord<'a>, ParseError> {
    let mut c = Cursor::new(body);

    let mut ip = None;
    if sample_type & PERF_SAMPLE_IP != 0 {
        ip = Some(c.u64()?);
    }

    let mut tid = 0u32;
    let mut pid = 0u32;
    if sample_type & PERF_SAMPLE_TID != 0 {
        pid = c.u32()?;
        tid = c.u32()?;
    }

    let mut time = 0u64;
    if sample_type & PERF_SAMPLE_TIME != 0 {
        time = c.u64()?;
    }

    let mut id = None;
    if sample_type & PERF_SAMPLE_ID != 0 {
        id = Some(c.u64()?);
    }

    if sample_type & PERF_SAMPLE_CPU != 0 {
        let _cpu_res = c.u64()?;
    }

    let mut period = 0u64;
    if sample_type & PERF_SAMPLE_PERIOD != 0 {
        period = c.u64()?;
    }

    let mut regs_abi = None;
    let mut regs = Vec::new();
    if sample_type & PERF_SAMPLE_REGS_USER != 0 {
        let abi = c.u64()?;
        if abi != 0 {
            if abi != PERF_SAMPLE_REGS_ABI_32 && abi != PERF_SAMPLE_REGS_ABI_64 {
                return Err(ParseError::BadRegsAbi(abi));
            }
            regs_abi = Some(abi as u8);
            // The number of registers present is determined by the
            // `sample_regs_user` mask configured at open time, which the
            // caller must track; here we read until we run out of the
            // declared register count via the reg_mask popcount passed
            // in by the caller through `parse_sample_with_reg_count`.
        }
    }

    let mut user_stack = None;
    if sample_type & PERF_SAMPLE_STACK_USER != 0 {
        // Layout: u64 size, <size> bytes of stack, then (if size != 0) a
        // trailing u64 dyn_size.
        let static_size = c.u64()? as usize;
        if static_size > 0 {
            let stack_bytes = c.bytes(static_size)?;
            // dyn_size may legitimately be absent if static_size was 0,
            // which we already excluded.
            let dyn_size = if c.remaining() >= 8 { c.u64()? as usize } else { 0 };
            // Reported dyn_size exceeding the static size is treated as
            // zero (empirically observed kernel bug class, spec §4.3).
            let effective = if dyn_size > static_size { 0 } else { dyn_size };
            user_stack = if effective == 0 {
                None
            } else {
                Some(&stack_bytes[..effective])
            };
        }
    }

    let mut raw = None;
    if sample_type & PERF_SAMPLE_RAW != 0 {
        let inner_size = c.u32()? as usize;
        if inner_size > c.remaining() {
            return Err(ParseError::RawOverflow {
                inner: inner_size,
                outer: body.len(),
            });
        }
        raw = Some(c.bytes(inner_size)?);
    }

    Ok(SampleRecord {
        tid,
        pid,
        time,
        period,
        ip,
        regs_abi,
        regs,
        user_stack,
        raw,
        id,
    })
}

/// Same as [`parse_sample`] but also reads `reg_count` saved registers
/// following the ABI word, matching `sample_regs_user`'s popcount as
/// configured on the watcher that produced this record.
pub fn parse_sample_with_reg_count<'a>(
    body: &'a [u8],
    sample_type: u64,
    reg_count: u32,
) -> Result<SampleRecord<'a>, ParseError> {
    let mut c = Cursor::new(body);

    let mut ip = None;
    if sample_type & PERF_SAMPLE_IP != 0 {
        ip = Some(c.u64()?);
    }

    let mut tid = 0u32;
    let mut pid = 0u32;
    if sample_type & PERF_SAMPLE_TID != 0 {
        pid = c.u32()?;
        tid = c.u32()?;
    }

    let mut time = 0u64;
    if sample_type & PERF_SAMPLE_TIME != 0 {
        time = c.u64()?;
    }
    let mut id = None;
    if sample_type & PERF_SAMPLE_ID != 0 {
        id = Some(c.u64()?);
    }
    if sample_type & PERF_SAMPLE_CPU != 0 {
        let _ = c.u64()?;
    }
    let mut period = 0u64;
    if sample_type & PERF_SAMPLE_PERIOD != 0 {
        period = c.u64()?;
    }

    let mut regs_abi = None;
    let mut regs = Vec::new();
    if sample_type & PERF_SAMPLE_REGS_USER != 0 {
        let abi = c.u64()?;
        if abi != 0 {
            if abi != PERF_SAMPLE_REGS_ABI_32 && abi != PERF_SAMPLE_REGS_ABI_64 {
                return Err(ParseError::BadRegsAbi(abi));
            }
            regs_abi = Some(abi as u8);
            regs.reserve(reg_count as usize);
            for _ in 0..reg_count {
                regs.push(c.u64()?);
            }
        }
    }

    let mut user_stack = None;
    if sample_type & PERF_SAMPLE_STACK_USER != 0 {
        let static_size = c.u64()? as usize;
        if static_size > 0 {
            let stack_bytes = c.bytes(static_size)?;
            let dyn_size = if c.remaining() >= 8 { c.u64()? as usize } else { 0 };
            let effective = if dyn_size > static_size { 0 } else { dyn_size };
            user_stack = if effective == 0 {
                None
            } else {
                Some(&stack_bytes[..effective])
            };
        }
    }

    let mut raw = None;
    if sample_type & PERF_SAMPLE_RAW != 0 {
        let inner_size = c.u32()? as usize;
        if inner_size > c.remaining() {
            return Err(ParseError::RawOverflow {
                inner: inner_size,
                outer: body.len(),
            });
        }
        raw = Some(c.bytes(inner_size)?);
    }

    Ok(SampleRecord {
        tid,
        pid,
        time,
        period,
        ip,
        regs_abi,
        regs,
        user_stack,
        raw,
        id,
    })
}

pub fn parse_mmap2(body: &[u8]) -> Result<Mmap2Record, ParseError> {
    let mut c = Cursor::new(body);
    let pid = c.u32()?;
    let tid = c.u32()?;
    let addr = c.u64()?;
    let len = c.u64()?;
    let pgoff = c.u64()?;
    let _maj = c.u32()?;
    let _min = c.u32()?;
    let _ino = c.u64()?;
    let _ino_gen = c.u64()?;
    let prot = c.u32()?;
    let _flags = c.u32()?;
    let path_bytes = c.bytes(c.remaining())?;
    let nul = path_bytes.iter().position(|&b| b == 0).unwrap_or(path_bytes.len());
    let path = String::from_utf8_lossy(&path_bytes[..nul]).into_owned();

    Ok(Mmap2Record {
        pid,
        tid,
        addr,
        len,
        pgoff,
        path,
        executable: prot & (libc::PROT_EXEC as u32) != 0,
    })
}

/// Computes the byte offset of the `TIME` field within the trailing
/// `sample_id` struct appended to every non-SAMPLE record when
/// `PERF_ATTR_FLAG_SAMPLE_ID_ALL` is set. Field order for `sample_id`:
/// `{PID,TID}?, {TIME}?, {ID}?, {STREAM_ID}?, {CPU,RES}?, {ID}?`.
pub fn sample_id_time_offset(sample_type: u64) -> Option<usize> {
    if sample_type & PERF_SAMPLE_TIME == 0 {
        return None;
    }
    let mut offset = 0;
    if sample_type & PERF_SAMPLE_TID != 0 {
        offset += 8;
    }
    Some(offset)
}

#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub kind: u32,
    pub misc: u16,
    pub size: u16,
}

pub fn parse_header(buf: &[u8]) -> Result<RecordHeader, ParseError> {
    if buf.len() < 8 {
        return Err(ParseError::Truncated {
            need: 8,
            have: buf.len(),
        });
    }
    let kind = u32::from_ne_bytes(buf[0..4].try_into().unwrap());
    let misc = u16::from_ne_bytes(buf[4..6].try_into().unwrap());
    let size = u16::from_ne_bytes(buf[6..8].try_into().unwrap());
    Ok(RecordHeader { kind, misc, size })
}

pub fn classify(header: &RecordHeader) -> RecordKind {
    match header.kind {
        PERF_RECORD_SAMPLE => RecordKind::Sample,
        PERF_RECORD_MMAP2 | PERF_RECORD_MMAP => RecordKind::Mmap2,
        PERF_RECORD_COMM => RecordKind::Comm {
            is_exec: header.misc & PERF_RECORD_MISC_COMM_EXEC != 0,
        },
        PERF_RECORD_LOST => RecordKind::Lost { count: 0 },
        other => RecordKind::Unknown(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le_sample(pid: u32, tid: u32, time: u64, period: u64) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(&pid.to_ne_bytes());
        v.extend_from_slice(&tid.to_ne_bytes());
        v.extend_from_slice(&time.to_ne_bytes());
        v.extend_from_slice(&period.to_ne_bytes());
        v
    }

    #[test]
    fn parses_tid_time_period() {
        let mask = PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_PERIOD;
        let body = le_sample(123, 456, 999, 42);
        let sample = parse_sample(&body, mask).unwrap();
        assert_eq!(sample.pid, 123);
        assert_eq!(sample.tid, 456);
        assert_eq!(sample.time, 999);
        assert_eq!(sample.period, 42);
    }

    #[test]
    fn zero_size_stack_yields_no_stack() {
        let mask = PERF_SAMPLE_STACK_USER;
        let mut body = Vec::new();
        body.extend_from_slice(&0u64.to_ne_bytes()); // static size 0
        let sample = parse_sample(&body, mask).unwrap();
        assert!(sample.user_stack.is_none());
    }

    #[test]
    fn dyn_size_exceeding_static_treated_as_zero() {
        let mask = PERF_SAMPLE_STACK_USER;
        let mut body = Vec::new();
        body.extend_from_slice(&8u64.to_ne_bytes()); // static size
        body.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]); // stack bytes
        body.extend_from_slice(&9999u64.to_ne_bytes()); // bogus dyn_size > static
        let sample = parse_sample(&body, mask).unwrap();
        assert!(sample.user_stack.is_none());
    }

    #[test]
    fn raw_bounds_checked_against_outer_size() {
        let mask = PERF_SAMPLE_RAW;
        let mut body = Vec::new();
        body.extend_from_slice(&1000u32.to_ne_bytes()); // inner size bigger than remaining
        let err = parse_sample(&body, mask).unwrap_err();
        assert!(matches!(err, ParseError::RawOverflow { .. }));
    }

    #[test]
    fn bad_regs_abi_is_skipped_with_error() {
        let mask = PERF_SAMPLE_REGS_USER;
        let mut body = Vec::new();
        body.extend_from_slice(&7u64.to_ne_bytes()); // invalid ABI value
        let err = parse_sample(&body, mask).unwrap_err();
        assert!(matches!(err, ParseError::BadRegsAbi(7)));
    }

    #[test]
    fn reg_count_variant_reads_declared_registers() {
        let mask = PERF_SAMPLE_REGS_USER;
        let mut body = Vec::new();
        body.extend_from_slice(&PERF_SAMPLE_REGS_ABI_64.to_ne_bytes());
        body.extend_from_slice(&111u64.to_ne_bytes());
        body.extend_from_slice(&222u64.to_ne_bytes());
        body.extend_from_slice(&333u64.to_ne_bytes());
        let sample = parse_sample_with_reg_count(&body, mask, 3).unwrap();
        assert_eq!(sample.regs, vec![111, 222, 333]);
        assert_eq!(sample.regs_abi, Some(2));
    }

    #[test]
    fn sample_id_time_offset_accounts_for_tid() {
        assert_eq!(sample_id_time_offset(PERF_SAMPLE_TIME), Some(0));
        assert_eq!(
            sample_id_time_offset(PERF_SAMPLE_TID | PERF_SAMPLE_TIME),
            Some(8)
        );
        assert_eq!(sample_id_time_offset(PERF_SAMPLE_TID), None);
    }
}
