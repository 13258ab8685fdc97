//! The shared-buffer transport a background plugin's worker thread uses to
//! receive host-function replies from the parent (SPEC_FULL.md §4.3).
//!
//! There is no literal shared memory between OS threads here the way the
//! browser-hosted original has with a `SharedArrayBuffer`; the analogue is
//! an `AtomicU32` flag guarding a `Mutex<Vec<u8>>` payload area of the
//! configured capacity. The framing and flow-control rules (spanning
//! writes, bounded-timeout waits, the `End` tag) carry over unchanged.
//!
//! Section tags:
//!
//! | Tag | Value | Payload |
//! |---|---|---|
//! | `Block`   | 4 | `u32` index, `u32` length, `length` bytes |
//! | `RetI64`  | 1 | `u64` little-endian |
//! | `RetF64`  | 2 | `u64` little-endian (the float's bits) |
//! | `RetVoid` | 3 | — |
//! | `RetErr`  | 5 | `u32` length, `length` UTF-8 bytes (the host function's error message) |
//! | `End`     | 0 | — |
//!
//! A reply is zero or more `Block` sections, optionally one return-value
//! section (`RetI64`/`RetF64`/`RetVoid`/`RetErr` — at most one of these,
//! mutually exclusive), then `End`. `End = 0x00` is this crate's pick
//! between the two values spec.md leaves open (see DESIGN.md). `RetErr` is
//! this crate's own extension to the wire protocol spec.md §4.3 describes:
//! the source protocol has no section for "the host function this guest
//! call invoked failed," so a reply without one would otherwise have to
//! fabricate a successful `Void` return for a failed call (see DESIGN.md).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use wasmtime::{Val, ValType};

use crate::error::{Error, Result};

const TAG_RET_I64: u8 = 1;
const TAG_RET_F64: u8 = 2;
const TAG_RET_VOID: u8 = 3;
const TAG_BLOCK: u8 = 4;
const TAG_RET_ERR: u8 = 5;
const TAG_END: u8 = 0;

const FLAG_READY: u32 = 0;
const SPIN_SLEEP: Duration = Duration::from_micros(200);

/// A fixed-capacity single-slot mailbox: one side writes up to `capacity`
/// bytes and flips the flag; the other drains it and flips it back. A
/// payload larger than `capacity` needs several round trips — a spanning
/// write.
pub struct Ring {
    flag: AtomicU32,
    payload: Mutex<Vec<u8>>,
    capacity: usize,
}

impl Ring {
    pub fn new(capacity: usize) -> Self {
        Ring {
            flag: AtomicU32::new(FLAG_READY),
            payload: Mutex::new(vec![0u8; capacity]),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks (spinning with a bounded sleep — this crate's analogue of an
    /// `Atomics.wait`) until the flag is ready, writes `chunk`, and flips
    /// the flag to signal the reader.
    fn write_chunk(&self, chunk: &[u8], timeout: Duration) -> Result<()> {
        debug_assert!(chunk.len() <= self.capacity);
        self.wait_for_flag(FLAG_READY, timeout)?;
        {
            let mut buf = self.payload.lock().unwrap();
            buf[..chunk.len()].copy_from_slice(chunk);
        }
        self.flag.store(chunk.len() as u32, Ordering::Release);
        Ok(())
    }

    /// Blocks until data is available, copies it out, and flips the flag
    /// back to ready.
    fn read_chunk(&self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let len = loop {
            let flag = self.flag.load(Ordering::Acquire);
            if flag != FLAG_READY {
                break flag;
            }
            if Instant::now() >= deadline {
                return Err(Error::transport("timed out waiting for ring buffer data"));
            }
            std::thread::sleep(SPIN_SLEEP);
        };
        let data = {
            let buf = self.payload.lock().unwrap();
            buf[..len as usize].to_vec()
        };
        self.flag.store(FLAG_READY, Ordering::Release);
        Ok(data)
    }

    fn wait_for_flag(&self, want: u32, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.flag.load(Ordering::Acquire) == want {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::transport("timed out waiting for ring buffer flag"));
            }
            std::thread::sleep(SPIN_SLEEP);
        }
    }
}

#[derive(Debug, Clone)]
pub enum ReturnValue {
    I64(u64),
    /// The bits of an `f64`, carried as a plain integer across the wire.
    F64(u64),
    Void,
    /// The host function this guest call invoked failed; `message` is its
    /// error text, to be surfaced to whoever is waiting on the outer `call`.
    Err(String),
}

pub struct Reply {
    pub blocks: Vec<(u32, Vec<u8>)>,
    pub ret: ReturnValue,
}

/// Serializes `reply`'s sections, chunks the byte stream into
/// `ring`-capacity pieces, and flushes each in turn. Returns the number of
/// flushes performed (for spanning-write assertions in tests).
pub fn send_reply(ring: &Ring, reply: &Reply, timeout: Duration) -> Result<usize> {
    let mut bytes = Vec::new();
    for (index, data) in &reply.blocks {
        bytes.push(TAG_BLOCK);
        bytes.extend_from_slice(&index.to_le_bytes());
        bytes.extend_from_slice(&(data.len() as u32).to_le_bytes());
        bytes.extend_from_slice(data);
    }
    match &reply.ret {
        ReturnValue::I64(v) => {
            bytes.push(TAG_RET_I64);
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        ReturnValue::F64(bits) => {
            bytes.push(TAG_RET_F64);
            bytes.extend_from_slice(&bits.to_le_bytes());
        }
        ReturnValue::Void => bytes.push(TAG_RET_VOID),
        ReturnValue::Err(message) => {
            bytes.push(TAG_RET_ERR);
            let encoded = message.as_bytes();
            bytes.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            bytes.extend_from_slice(encoded);
        }
    }
    bytes.push(TAG_END);

    let capacity = ring.capacity().max(1);
    let mut flushes = 0;
    for chunk in bytes.chunks(capacity) {
        ring.write_chunk(chunk, timeout)?;
        flushes += 1;
    }
    Ok(flushes)
}

/// Reads chunks from `ring` until a complete reply (terminated by `End`)
/// has been assembled, pulling more chunks whenever a section's payload
/// isn't yet fully buffered — the reader side of a spanning write.
pub fn recv_reply(ring: &Ring, timeout: Duration) -> Result<Reply> {
    let mut buf: Vec<u8> = Vec::new();
    let mut pos = 0usize;
    let mut blocks = Vec::new();
    let mut ret = ReturnValue::Void;

    macro_rules! need {
        ($n:expr) => {
            while buf.len() - pos < $n {
                buf.extend_from_slice(&ring.read_chunk(timeout)?);
            }
        };
    }

    loop {
        need!(1);
        let tag = buf[pos];
        pos += 1;
        match tag {
            TAG_BLOCK => {
                need!(8);
                let index = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
                let len = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap()) as usize;
                pos += 8;
                need!(len);
                blocks.push((index, buf[pos..pos + len].to_vec()));
                pos += len;
            }
            TAG_RET_I64 => {
                need!(8);
                ret = ReturnValue::I64(u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap()));
                pos += 8;
            }
            TAG_RET_F64 => {
                need!(8);
                ret = ReturnValue::F64(u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap()));
                pos += 8;
            }
            TAG_RET_VOID => {}
            TAG_RET_ERR => {
                need!(4);
                let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
                pos += 4;
                need!(len);
                let message = String::from_utf8_lossy(&buf[pos..pos + len]).into_owned();
                pos += len;
                ret = ReturnValue::Err(message);
            }
            TAG_END => return Ok(Reply { blocks, ret }),
            other => return Err(Error::transport(format!("unknown ring section tag {other}"))),
        }
    }
}

pub fn scalar_to_return(values: &[Val]) -> ReturnValue {
    match values.first() {
        Some(Val::I64(v)) => ReturnValue::I64(*v as u64),
        Some(Val::I32(v)) => ReturnValue::I64(*v as u64),
        Some(Val::F64(bits)) => ReturnValue::F64(*bits),
        Some(Val::F32(bits)) => ReturnValue::F64(*bits as u64),
        _ => ReturnValue::Void,
    }
}

/// Converts a successful `ret` into Wasm scalars. Callers are expected to
/// have already intercepted `ReturnValue::Err` themselves (see
/// `background/worker.rs`'s rewired host functions) — an `Err` reaching
/// here has nothing sensible to become, so it degrades to no return values
/// rather than panicking.
pub fn return_to_vals(ret: ReturnValue, result_types: &[ValType]) -> Vec<Val> {
    match (ret, result_types.first()) {
        (ReturnValue::I64(v), Some(ValType::I32)) => vec![Val::I32(v as i32)],
        (ReturnValue::I64(v), _) => vec![Val::I64(v as i64)],
        (ReturnValue::F64(bits), Some(ValType::F32)) => vec![Val::F32(bits as u32)],
        (ReturnValue::F64(bits), _) => vec![Val::F64(bits)],
        (ReturnValue::Void, _) => vec![],
        (ReturnValue::Err(_), _) => vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn reply_round_trips_through_a_buffer_bigger_than_the_payload() {
        let ring = Arc::new(Ring::new(256));
        let reply = Reply {
            blocks: vec![(3, b"hello".to_vec())],
            ret: ReturnValue::I64(42),
        };
        let writer_ring = ring.clone();
        let handle = thread::spawn(move || send_reply(&writer_ring, &reply, Duration::from_secs(5)).unwrap());
        let got = recv_reply(&ring, Duration::from_secs(5)).unwrap();
        let flushes = handle.join().unwrap();
        assert_eq!(flushes, 1);
        assert_eq!(got.blocks, vec![(3, b"hello".to_vec())]);
        assert!(matches!(got.ret, ReturnValue::I64(42)));
    }

    #[test]
    fn spanning_write_through_a_small_buffer_reassembles_the_full_payload() {
        let ring = Arc::new(Ring::new(64));
        let big = vec![b'x'; 18_428];
        let reply = Reply {
            blocks: vec![(1, big.clone())],
            ret: ReturnValue::Void,
        };
        let writer_ring = ring.clone();
        let handle = thread::spawn(move || send_reply(&writer_ring, &reply, Duration::from_secs(10)).unwrap());
        let got = recv_reply(&ring, Duration::from_secs(10)).unwrap();
        let flushes = handle.join().unwrap();
        assert!(flushes >= 289, "expected at least 289 flushes, got {flushes}");
        assert_eq!(got.blocks.len(), 1);
        assert_eq!(got.blocks[0].0, 1);
        assert_eq!(got.blocks[0].1, big);
    }

    #[test]
    fn ret_err_round_trips_its_message_alongside_exported_blocks() {
        let ring = Arc::new(Ring::new(256));
        let reply = Reply {
            blocks: vec![(0, b"partial".to_vec())],
            ret: ReturnValue::Err("host function exploded".to_string()),
        };
        let writer_ring = ring.clone();
        let handle = thread::spawn(move || send_reply(&writer_ring, &reply, Duration::from_secs(5)).unwrap());
        let got = recv_reply(&ring, Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(got.blocks, vec![(0, b"partial".to_vec())]);
        match got.ret {
            ReturnValue::Err(message) => assert_eq!(message, "host function exploded"),
            other => panic!("expected ReturnValue::Err, got {other:?}"),
        }
    }

    #[test]
    fn read_times_out_with_a_diagnostic_error_rather_than_hanging() {
        let ring = Ring::new(16);
        let err = recv_reply(&ring, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }
}
