//! Content-defined chunking with a Rabin fingerprint over a 64 byte window.
//!
//! The rolling-hash tables depend only on the repository polynomial, so they
//! are built once into [`ChunkerTables`] and shared read-only by every
//! [`Chunker`] that splits a stream for the repository.

pub mod polynomial;

pub use polynomial::{Pol, derive_polynomial, random_polynomial};

use crate::{ChunkID, Result};
use std::io::{ErrorKind, Read};
use std::sync::Arc;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

pub const WINDOW_SIZE: usize = 64;
pub const MIN_SIZE: usize = 512 * KIB;
pub const MAX_SIZE: usize = 8 * MIB;

/// A boundary is cut where the low 20 bits of the digest are zero, which puts
/// the average chunk around 1 MiB above the minimum.
const SPLIT_MASK: u64 = (1 << 20) - 1;

const READ_BUF_SIZE: usize = 512 * KIB;

/// Precomputed lookup tables for one polynomial.
pub struct ChunkerTables {
    pol: Pol,
    pol_shift: u32,
    out: [u64; 256],
    reduce: [u64; 256],
}

impl ChunkerTables {
    pub fn new(pol: Pol) -> Result<Arc<Self>> {
        pol.validate()?;

        let mut out = [0u64; 256];
        for (b, slot) in out.iter_mut().enumerate() {
            // Hash of b followed by WINDOW_SIZE - 1 zero bytes: the term to
            // cancel when b slides out of the window.
            let mut h = append_byte(Pol::new(0), b as u8, pol);
            for _ in 0..WINDOW_SIZE - 1 {
                h = append_byte(h, 0, pol);
            }
            *slot = h.value();
        }

        let k = pol.deg() as u32;
        let mut reduce = [0u64; 256];
        for (b, slot) in reduce.iter_mut().enumerate() {
            let shifted = (b as u64) << k;
            *slot = Pol::new(shifted).modulo(pol).value() | shifted;
        }

        Ok(Arc::new(Self {
            pol,
            pol_shift: k - 8,
            out,
            reduce,
        }))
    }

    pub fn polynomial(&self) -> Pol {
        self.pol
    }

    #[inline]
    fn update(&self, digest: u64, b: u8) -> u64 {
        let index = (digest >> self.pol_shift) as usize;
        ((digest << 8) | b as u64) ^ self.reduce[index]
    }
}

fn append_byte(hash: Pol, b: u8, pol: Pol) -> Pol {
    Pol::new((hash.value() << 8) | b as u64).modulo(pol)
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub offset: u64,
    pub length: usize,
    pub data: Vec<u8>,
    /// Digest at the cut point.
    pub cut: u64,
}

impl Chunk {
    pub fn id(&self) -> ChunkID {
        ChunkID::from_data(&self.data)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Splits one byte stream into chunks. Each stream gets its own chunker;
/// the tables are shared.
pub struct Chunker<R> {
    tables: Arc<ChunkerTables>,
    reader: R,
    buf: Vec<u8>,
    bpos: usize,
    bmax: usize,
    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,
    /// Stream offset where the current chunk starts.
    start: u64,
    /// Bytes of the current chunk consumed so far.
    count: usize,
    /// Bytes still to copy before hashing starts for the current chunk.
    pre: usize,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    pub fn new(tables: Arc<ChunkerTables>, reader: R) -> Self {
        let mut chunker = Self {
            tables,
            reader,
            buf: vec![0u8; READ_BUF_SIZE],
            bpos: 0,
            bmax: 0,
            window: [0u8; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            start: 0,
            count: 0,
            pre: 0,
            eof: false,
        };
        chunker.reset_window();
        chunker
    }

    /// Restarts on a new stream, keeping the tables and read buffer.
    pub fn reset_with(&mut self, reader: R) {
        self.reader = reader;
        self.bpos = 0;
        self.bmax = 0;
        self.start = 0;
        self.eof = false;
        self.reset_window();
    }

    pub fn polynomial(&self) -> Pol {
        self.tables.polynomial()
    }

    fn reset_window(&mut self) {
        self.window = [0u8; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
        self.count = 0;
        self.pre = MIN_SIZE - WINDOW_SIZE;
        self.slide(1);
    }

    #[inline]
    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.digest ^= self.tables.out[out as usize];
        self.wpos = (self.wpos + 1) % WINDOW_SIZE;
        self.digest = self.tables.update(self.digest, b);
    }

    fn fill(&mut self) -> Result<usize> {
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn emit(&mut self, data: Vec<u8>, cut: u64) -> Chunk {
        let chunk = Chunk {
            offset: self.start,
            length: data.len(),
            data,
            cut,
        };
        self.start += chunk.length as u64;
        self.reset_window();
        chunk
    }

    /// Returns the next chunk, or `None` once the stream is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.eof {
            return Ok(None);
        }

        let mut data = Vec::with_capacity(MIN_SIZE);
        loop {
            if self.bpos >= self.bmax {
                let n = self.fill()?;
                if n == 0 {
                    self.eof = true;
                    if data.is_empty() {
                        return Ok(None);
                    }
                    let cut = self.digest;
                    return Ok(Some(self.emit(data, cut)));
                }
                self.bpos = 0;
                self.bmax = n;
            }

            if self.pre > 0 {
                let n = self.pre.min(self.bmax - self.bpos);
                data.extend_from_slice(&self.buf[self.bpos..self.bpos + n]);
                self.bpos += n;
                self.count += n;
                self.pre -= n;
                continue;
            }

            let start = self.bpos;
            for i in start..self.bmax {
                let b = self.buf[i];
                self.slide(b);
                self.count += 1;

                if self.count < MIN_SIZE {
                    continue;
                }
                if self.digest & SPLIT_MASK == 0 || self.count >= MAX_SIZE {
                    data.extend_from_slice(&self.buf[start..=i]);
                    self.bpos = i + 1;
                    let cut = self.digest;
                    return Ok(Some(self.emit(data, cut)));
                }
            }
            data.extend_from_slice(&self.buf[start..self.bmax]);
            self.bpos = self.bmax;
        }
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

/// Chunk boundaries of an in-memory buffer as `(offset, length)` pairs.
pub fn boundaries(tables: &Arc<ChunkerTables>, data: &[u8]) -> Result<Vec<(usize, usize)>> {
    Chunker::new(Arc::clone(tables), data)
        .map(|chunk| chunk.map(|c| (c.offset as usize, c.length)))
        .collect()
}
